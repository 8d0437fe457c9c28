// Opened trace: shared header, page index and byte source

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use memmap2::Mmap;
use serde::Serialize;
use tracing::{debug, info};

use super::bytes::ByteSource;
use super::context::LocationContext;
use super::cpu::PerCpuIterator;
use super::diagnostics::{DiagnosticSink, LogDiagnostics};
use super::error::Result;
use super::header::HeaderParser;
use super::merge::MergeIterator;
use super::page::{CpuSection, Page};
use super::record::{RecordDecoder, RecordKind};
use super::types::{
    Endianness, EventFormat, FileType, OptionKind, SymbolTable, TraceHeader, TraceOption,
};

/// Library-side settings for opening a trace.
#[derive(Clone)]
pub struct TraceConfig {
    pub diagnostics: Arc<dyn DiagnosticSink>,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            diagnostics: Arc::new(LogDiagnostics),
        }
    }
}

impl fmt::Debug for TraceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TraceConfig").finish_non_exhaustive()
    }
}

impl TraceConfig {
    pub fn with_diagnostics(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.diagnostics = sink;
        self
    }
}

/// Immutable state every iterator over a trace shares.
pub(crate) struct TraceData {
    source: Box<dyn ByteSource>,
    pub(crate) header: TraceHeader,
    pub(crate) sections: Vec<CpuSection>,
    pub(crate) diagnostics: Arc<dyn DiagnosticSink>,
}

impl TraceData {
    pub(crate) fn bytes(&self) -> &[u8] {
        self.source.as_bytes()
    }
}

/// A trace-cmd data file opened for reading.
///
/// Cloning is cheap; clones share the same mapping and index, and each
/// iterator created from them keeps its own cursor.
#[derive(Clone)]
pub struct FtraceTrace {
    data: Arc<TraceData>,
    time_range: Option<(u64, u64)>,
}

impl fmt::Debug for FtraceTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FtraceTrace")
            .field("version", &self.data.header.version)
            .field("cpu_count", &self.data.header.cpu_count)
            .field("bytes", &self.data.source.len())
            .field("time_range", &self.time_range)
            .finish()
    }
}

impl FtraceTrace {
    /// Memory-map and parse the file at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with(path, TraceConfig::default())
    }

    pub fn open_with(path: &Path, config: TraceConfig) -> Result<Self> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        debug!(path = %path.display(), bytes = mmap.len(), "mapped trace file");
        Self::from_source(mmap, config)
    }

    /// Parse a trace held in any byte source.
    pub fn from_source(source: impl ByteSource + 'static, config: TraceConfig) -> Result<Self> {
        let bytes = source.as_bytes();
        let (header, ranges) = HeaderParser::new(bytes).parse()?;
        let sections: Vec<CpuSection> = ranges
            .into_iter()
            .map(|range| CpuSection::index(bytes, &header, range))
            .collect();

        let time_range = compute_time_range(bytes, &header, &sections);
        info!(
            cpus = sections.len(),
            pages = sections.iter().map(CpuSection::len).sum::<usize>(),
            formats = header.formats.len(),
            ?time_range,
            "opened trace"
        );

        let data = TraceData {
            source: Box::new(source),
            header,
            sections,
            diagnostics: config.diagnostics,
        };
        Ok(Self {
            data: Arc::new(data),
            time_range,
        })
    }

    pub fn header(&self) -> &TraceHeader {
        &self.data.header
    }

    pub fn version(&self) -> u32 {
        self.data.header.version
    }

    pub fn endianness(&self) -> Endianness {
        self.data.header.endianness
    }

    pub fn long_size(&self) -> usize {
        self.data.header.long_size
    }

    pub fn page_size(&self) -> usize {
        self.data.header.page_size
    }

    pub fn cpu_count(&self) -> u32 {
        self.data.header.cpu_count
    }

    pub fn file_type(&self) -> FileType {
        self.data.header.file_type
    }

    pub fn options(&self) -> &[TraceOption] {
        &self.data.header.options
    }

    pub fn option(&self, kind: OptionKind) -> Option<&TraceOption> {
        self.data.header.options.iter().find(|option| option.kind == kind)
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.data.header.symbols
    }

    /// printk format strings keyed by address.
    pub fn printk(&self) -> &HashMap<u64, String> {
        &self.data.header.printk
    }

    /// Saved command names keyed by pid.
    pub fn cmdlines(&self) -> &HashMap<i64, String> {
        &self.data.header.cmdlines
    }

    pub fn format(&self, id: u32) -> Option<&EventFormat> {
        self.data.header.format(id)
    }

    pub fn formats(&self) -> impl Iterator<Item = &EventFormat> {
        self.data.header.formats.values()
    }

    pub fn sections(&self) -> &[CpuSection] {
        &self.data.sections
    }

    pub fn section(&self, cpu: u32) -> Option<&CpuSection> {
        self.data.sections.iter().find(|section| section.cpu == cpu)
    }

    pub fn page_count(&self) -> usize {
        self.data.sections.iter().map(CpuSection::len).sum()
    }

    /// Timestamps of the first and last event, `None` for a trace with no
    /// decodable events. The end may lie past a corrupt record, where only a
    /// seek reaches it.
    pub fn time_range(&self) -> Option<(u64, u64)> {
        self.time_range
    }

    /// Cursor positioned on the first event.
    pub fn context(&self) -> LocationContext {
        LocationContext::new(self.merge_iter(), self.time_range.map(|(start, _)| start))
    }

    pub fn merge_iter(&self) -> MergeIterator {
        MergeIterator::new(
            (0..self.data.sections.len())
                .map(|slot| PerCpuIterator::new(Arc::clone(&self.data), slot))
                .collect(),
        )
    }

    /// Events of a single CPU in timestamp order.
    pub fn cpu_iter(&self, cpu: u32) -> Option<PerCpuIterator> {
        let slot = self.data.sections.iter().position(|section| section.cpu == cpu)?;
        Some(PerCpuIterator::new(Arc::clone(&self.data), slot))
    }

    pub fn summary(&self) -> TraceSummary {
        let header = &self.data.header;
        TraceSummary {
            version: header.version,
            endianness: header.endianness,
            long_size: header.long_size,
            page_size: header.page_size,
            cpu_count: header.cpu_count,
            file_type: header.file_type,
            formats: header.formats.len(),
            symbols: header.symbols.len(),
            printk_formats: header.printk.len(),
            cmdlines: header.cmdlines.len(),
            options: header
                .options
                .iter()
                .map(|option| (option.kind, option.as_text()))
                .collect(),
            pages: self
                .data
                .sections
                .iter()
                .map(|section| (section.cpu, section.len()))
                .collect(),
            time_range: self.time_range,
        }
    }
}

/// Header metadata in a serializable form.
#[derive(Debug, Clone, Serialize)]
pub struct TraceSummary {
    pub version: u32,
    pub endianness: Endianness,
    pub long_size: usize,
    pub page_size: usize,
    pub cpu_count: u32,
    pub file_type: FileType,
    pub formats: usize,
    pub symbols: usize,
    pub printk_formats: usize,
    pub cmdlines: usize,
    pub options: Vec<(OptionKind, String)>,
    /// (cpu, page count) per CPU section.
    pub pages: Vec<(u32, usize)>,
    pub time_range: Option<(u64, u64)>,
}

/// First and last data-record timestamps. The start follows sequential
/// iteration, so a CPU whose stream ends at a corrupt record before any
/// event contributes no start. The end looks at the last page of each CPU
/// that holds a known event, which a timestamp seek can still reach.
fn compute_time_range(data: &[u8], header: &TraceHeader, sections: &[CpuSection]) -> Option<(u64, u64)> {
    let mut start: Option<u64> = None;
    let mut end: Option<u64> = None;
    for section in sections {
        let decoder = RecordDecoder::new(data, header, section.cpu);
        let mut first = None;
        for page in section.pages() {
            let scan = page_event_times(&decoder, header, page);
            if let Some(&timestamp) = scan.times.first() {
                first = Some(timestamp);
                break;
            }
            if scan.corrupt {
                break;
            }
        }
        let last = section
            .pages()
            .iter()
            .rev()
            .find_map(|page| page_event_times(&decoder, header, page).times.last().copied());
        if let Some(first) = first {
            start = Some(start.map_or(first, |start| start.min(first)));
        }
        if let Some(last) = last {
            end = Some(end.map_or(last, |end| end.max(last)));
        }
    }
    start.zip(end)
}

struct PageTimes {
    times: Vec<u64>,
    /// Decoding stopped at a corrupt record.
    corrupt: bool,
}

/// Timestamps of a page's data records that have a known format, up to the
/// first corrupt record.
fn page_event_times(decoder: &RecordDecoder<'_>, header: &TraceHeader, page: &Page) -> PageTimes {
    let mut times = Vec::new();
    let mut offset = page.data_offset;
    let mut timestamp = page.timestamp;
    loop {
        let record = match decoder.decode(page, offset, timestamp) {
            Ok(Some(record)) => record,
            Ok(None) => return PageTimes { times, corrupt: false },
            Err(_) => return PageTimes { times, corrupt: true },
        };
        offset = record.next;
        timestamp = record.timestamp;
        if let RecordKind::Data {
            format_id: Some(id),
            ..
        } = record.kind
        {
            if header.format(id).is_some() {
                times.push(record.timestamp);
            }
        }
    }
}
