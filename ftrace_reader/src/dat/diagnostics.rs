// Reporting of absorbed per-record errors, and scan cancellation

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::warn;

use super::error::FtraceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DiagnosticKind {
    /// A record overran its page; the rest of that CPU's stream is dropped.
    CorruptPage,
    /// A data record with no matching event format was skipped.
    UnknownEventFormat,
}

/// A recoverable decode error that iteration absorbed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub cpu: u32,
    pub kind: DiagnosticKind,
    pub message: String,
}

impl Diagnostic {
    /// Build from a per-record error; `None` for errors that are fatal at open.
    pub fn from_error(cpu: u32, err: &FtraceError) -> Option<Self> {
        let kind = match err {
            FtraceError::CorruptPage { .. } => DiagnosticKind::CorruptPage,
            FtraceError::UnknownEventFormat { .. } => DiagnosticKind::UnknownEventFormat,
            _ => return None,
        };
        Some(Self {
            cpu,
            kind,
            message: err.to_string(),
        })
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu {}: {:?}: {}", self.cpu, self.kind, self.message)
    }
}

/// Receives diagnostics from every iterator of a trace, possibly from
/// several threads at once.
pub trait DiagnosticSink: Send + Sync {
    fn report(&self, diagnostic: Diagnostic);
}

/// Logs each diagnostic as a warning.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogDiagnostics;

impl DiagnosticSink for LogDiagnostics {
    fn report(&self, diagnostic: Diagnostic) {
        warn!(
            cpu = diagnostic.cpu,
            kind = ?diagnostic.kind,
            "{}",
            diagnostic.message
        );
    }
}

/// Keeps every diagnostic for later inspection.
#[derive(Debug, Default)]
pub struct CollectingDiagnostics {
    collected: Mutex<Vec<Diagnostic>>,
}

impl CollectingDiagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.collected.lock().clone()
    }

    pub fn count(&self, kind: DiagnosticKind) -> usize {
        self.collected
            .lock()
            .iter()
            .filter(|diagnostic| diagnostic.kind == kind)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.collected.lock().is_empty()
    }
}

impl DiagnosticSink for CollectingDiagnostics {
    fn report(&self, diagnostic: Diagnostic) {
        self.collected.lock().push(diagnostic);
    }
}

/// Shared stop flag checked between events by bulk scans.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
