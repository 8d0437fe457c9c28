// Reader for trace-cmd `trace.dat` files (format version 6)

pub mod bytes;
pub mod context;
pub mod cpu;
pub mod diagnostics;
pub mod error;
pub mod event;
pub mod format;
pub mod header;
pub mod merge;
pub mod page;
pub mod record;
pub mod trace;
pub mod types;

#[cfg(test)]
pub(crate) mod fixture;

// Re-export main types
pub use self::bytes::ByteSource;
pub use context::{LocationContext, ScanStatus, ScanSummary, SeekOutcome};
pub use cpu::PerCpuIterator;
pub use diagnostics::{
    CancellationFlag, CollectingDiagnostics, Diagnostic, DiagnosticKind, DiagnosticSink,
    LogDiagnostics,
};
pub use error::{FtraceError, Result};
pub use header::{probe, probe_bytes, Probe};
pub use merge::MergeIterator;
pub use page::{CpuSection, Page};
pub use trace::{FtraceTrace, TraceConfig, TraceSummary};
pub use types::{
    Endianness, EventFormat, EventLocation, FieldSpec, FieldValue, FileType, HeaderEventInfo,
    OptionKind, SymbolTable, TraceEvent, TraceHeader, TraceOption,
};
