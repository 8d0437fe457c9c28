// One CPU's event stream
//
// Walks the CPU's pages in file order and yields its events in timestamp
// order. The current event is the lookahead: it is the next one `pop`
// returns. Seeks binary-search the page index and then scan a single page.

use std::sync::Arc;

use tracing::trace;

use super::diagnostics::{Diagnostic, DiagnosticKind};
use super::error::FtraceError;
use super::event::EventDecoder;
use super::record::{RecordDecoder, RecordKind};
use super::trace::TraceData;
use super::types::{EventLocation, TraceEvent};

pub struct PerCpuIterator {
    trace: Arc<TraceData>,
    slot: usize,
    cpu: u32,
    page: usize,
    offset: u64,
    timestamp: u64,
    current: Option<TraceEvent>,
    last_timestamp: Option<u64>,
    index: u64,
    exhausted: bool,
}

impl PerCpuIterator {
    pub(crate) fn new(trace: Arc<TraceData>, slot: usize) -> Self {
        let cpu = trace.sections[slot].cpu;
        let mut iter = Self {
            trace,
            slot,
            cpu,
            page: 0,
            offset: 0,
            timestamp: 0,
            current: None,
            last_timestamp: None,
            index: 0,
            exhausted: false,
        };
        iter.rewind();
        iter
    }

    pub fn cpu(&self) -> u32 {
        self.cpu
    }

    /// The event `pop` returns next.
    pub fn current(&self) -> Option<&TraceEvent> {
        self.current.as_ref()
    }

    /// Position of the current event among this CPU's events.
    pub fn location(&self) -> EventLocation {
        match &self.current {
            Some(event) => EventLocation::new(event.timestamp, self.index),
            None => EventLocation::END,
        }
    }

    /// Number of earlier events on this CPU sharing the current timestamp.
    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn is_exhausted(&self) -> bool {
        self.current.is_none()
    }

    /// Back to the first event of the section.
    pub fn rewind(&mut self) {
        self.reset_to_page(0);
        self.advance();
    }

    fn reset_to_page(&mut self, page: usize) {
        self.current = None;
        self.last_timestamp = None;
        self.index = 0;
        let section = &self.trace.sections[self.slot];
        match section.page(page) {
            Some(first) => {
                self.page = page;
                self.offset = first.data_offset;
                self.timestamp = first.timestamp;
                self.exhausted = false;
            }
            None => {
                self.page = section.len();
                self.exhausted = true;
            }
        }
    }

    /// Decode forward to the next data event. Returns false once the section
    /// is done, or a corrupt record ended it.
    pub fn advance(&mut self) -> bool {
        self.current = None;
        let trace = &self.trace;
        let section = &trace.sections[self.slot];
        let records = RecordDecoder::new(trace.bytes(), &trace.header, self.cpu);
        let events = EventDecoder::new(&trace.header);

        while !self.exhausted {
            let Some(page) = section.page(self.page) else {
                self.exhausted = true;
                break;
            };
            let record = match records.decode(page, self.offset, self.timestamp) {
                Ok(Some(record)) => record,
                Ok(None) => {
                    self.page += 1;
                    if let Some(next) = section.page(self.page) {
                        trace!(cpu = self.cpu, page = self.page, "entering page");
                        self.offset = next.data_offset;
                        self.timestamp = next.timestamp;
                    }
                    continue;
                }
                Err(err) => {
                    report(trace, self.cpu, &err);
                    self.exhausted = true;
                    break;
                }
            };

            self.offset = record.next;
            self.timestamp = record.timestamp;
            let RecordKind::Data { format_id, payload } = record.kind else {
                continue;
            };
            let Some(format_id) = format_id else {
                trace.diagnostics.report(Diagnostic {
                    cpu: self.cpu,
                    kind: DiagnosticKind::UnknownEventFormat,
                    message: format!(
                        "payload at offset {} is too short to hold an event type",
                        record.offset
                    ),
                });
                continue;
            };
            match events.decode(self.cpu, record.timestamp, format_id, &trace.bytes()[payload]) {
                Ok(event) => {
                    self.index = match self.last_timestamp {
                        Some(last) if last == event.timestamp => self.index + 1,
                        _ => 0,
                    };
                    self.last_timestamp = Some(event.timestamp);
                    self.current = Some(event);
                    return true;
                }
                Err(err) => report(trace, self.cpu, &err),
            }
        }
        false
    }

    /// Return the current event and move to the next one.
    pub fn pop(&mut self) -> Option<TraceEvent> {
        let event = self.current.take()?;
        self.advance();
        Some(event)
    }

    /// Position on the first event with timestamp >= `timestamp`. Returns
    /// false when there is none.
    pub fn seek_timestamp(&mut self, timestamp: u64) -> bool {
        let page = self.trace.sections[self.slot].seek_page(timestamp);
        self.reset_to_page(page);
        while self.advance() {
            if self.current.as_ref().is_some_and(|event| event.timestamp >= timestamp) {
                trace!(cpu = self.cpu, target = timestamp, page = self.page, "seek landed");
                return true;
            }
        }
        false
    }

    /// Position on the event `location.index` places after the first one at
    /// `location.timestamp`. A shorter run lands on the event after it.
    pub fn seek_location(&mut self, location: EventLocation) -> bool {
        if !self.seek_timestamp(location.timestamp) {
            return false;
        }
        while self.index < location.index {
            let same_run = self
                .current
                .as_ref()
                .is_some_and(|event| event.timestamp == location.timestamp);
            if !same_run || !self.advance() {
                break;
            }
            if self.index == 0 {
                break;
            }
        }
        self.current.is_some()
    }
}

fn report(trace: &TraceData, cpu: u32, err: &FtraceError) {
    if let Some(diagnostic) = Diagnostic::from_error(cpu, err) {
        trace.diagnostics.report(diagnostic);
    }
}
