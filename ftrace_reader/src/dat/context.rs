// Resumable cursor over the merged event stream
//
// The cached location always names the current event, the one the next call
// to `next_event` returns. Its index counts the events before it in merged
// order that share its timestamp, so (timestamp, index) identifies an event
// independently of how the cursor got there.

use serde::Serialize;
use tracing::debug;

use super::diagnostics::CancellationFlag;
use super::merge::MergeIterator;
use super::types::{EventLocation, TraceEvent};

/// Where a seek ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SeekOutcome {
    Positioned,
    /// The target was before the first event; the cursor is on the first one.
    ClampedToStart,
    /// The target was after the last event; the cursor is at the end.
    PastEnd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ScanStatus {
    Completed,
    Cancelled,
    LimitReached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScanSummary {
    pub events: u64,
    pub status: ScanStatus,
}

pub struct LocationContext {
    merge: MergeIterator,
    location: EventLocation,
    rank: Option<u64>,
    start: Option<u64>,
}

impl LocationContext {
    /// Wrap a freshly built merge iterator. `start` is the timestamp of the
    /// trace's first event, used to recognise seeks that clamp to it.
    pub fn new(merge: MergeIterator, start: Option<u64>) -> Self {
        let mut context = Self {
            merge,
            location: EventLocation::END,
            rank: Some(0),
            start,
        };
        context.location = context.head_location(None);
        context
    }

    /// Location of the event `next_event` returns next, or
    /// `EventLocation::END`.
    pub fn location(&self) -> EventLocation {
        self.location
    }

    pub fn current(&self) -> Option<&TraceEvent> {
        self.merge.peek()
    }

    /// Ordinal of the current event in the whole trace, when known.
    pub fn rank(&self) -> Option<u64> {
        self.rank
    }

    pub fn is_at_end(&self) -> bool {
        self.merge.is_exhausted()
    }

    /// Location of the merge head, given the timestamp and index of the
    /// event emitted just before it.
    fn head_location(&self, previous: Option<EventLocation>) -> EventLocation {
        match (self.merge.peek(), previous) {
            (Some(next), Some(previous)) if next.timestamp == previous.timestamp => {
                EventLocation::new(next.timestamp, previous.index + 1)
            }
            (Some(next), _) => EventLocation::new(next.timestamp, 0),
            (None, _) => EventLocation::END,
        }
    }

    /// Return the current event and step to the next one.
    pub fn next_event(&mut self) -> Option<TraceEvent> {
        let event = self.merge.next_event()?;
        let emitted = self.location;
        self.location = self.head_location(Some(emitted));
        self.rank = self.rank.map(|rank| rank + 1);
        Some(event)
    }

    /// Step past the current event. Returns false at the end of the trace.
    pub fn advance(&mut self) -> bool {
        self.next_event().is_some()
    }

    pub fn rewind(&mut self) {
        self.merge.rewind();
        self.location = self.head_location(None);
        self.rank = Some(0);
    }

    /// Position on the first event with timestamp >= `timestamp`.
    pub fn seek_timestamp(&mut self, timestamp: u64) -> SeekOutcome {
        self.merge.seek_timestamp(timestamp);
        self.location = self.head_location(None);

        let at_start = self.start.is_some_and(|start| timestamp <= start);
        self.rank = at_start.then_some(0);
        let outcome = if self.location.is_end() {
            SeekOutcome::PastEnd
        } else if self.start.is_some_and(|start| timestamp < start) {
            SeekOutcome::ClampedToStart
        } else {
            SeekOutcome::Positioned
        };
        debug!(timestamp, location = %self.location, ?outcome, "seek by timestamp");
        outcome
    }

    /// Restore a location previously read from `location()`. When fewer than
    /// `index + 1` events share the timestamp, the cursor lands on the first
    /// event after them.
    pub fn set_location(&mut self, location: EventLocation) -> SeekOutcome {
        if location.is_end() {
            self.merge.seek_timestamp(u64::MAX);
            self.location = EventLocation::END;
            self.rank = None;
            return SeekOutcome::PastEnd;
        }

        let outcome = self.seek_timestamp(location.timestamp);
        let mut index = 0;
        while index < location.index {
            match self.merge.peek() {
                Some(event) if event.timestamp == location.timestamp => {
                    self.merge.next_event();
                    index += 1;
                }
                _ => break,
            }
        }
        self.location = match self.merge.peek() {
            Some(event) if event.timestamp == location.timestamp => {
                EventLocation::new(event.timestamp, index)
            }
            Some(event) => EventLocation::new(event.timestamp, 0),
            None => EventLocation::END,
        };
        self.rank = self.rank.map(|rank| rank + index);
        debug!(requested = %location, landed = %self.location, "seek by location");

        if self.location.is_end() {
            SeekOutcome::PastEnd
        } else {
            outcome
        }
    }

    /// Feed events to `callback` until the trace ends, `limit` events have
    /// been delivered, or `cancel` is raised. The flag is checked before each
    /// event; a cancelled scan keeps its partial progress.
    pub fn scan_events<F>(&mut self, cancel: &CancellationFlag, limit: Option<u64>, mut callback: F) -> ScanSummary
    where
        F: FnMut(&TraceEvent),
    {
        let mut events = 0;
        let status = loop {
            if cancel.is_cancelled() {
                break ScanStatus::Cancelled;
            }
            if limit.is_some_and(|limit| events >= limit) {
                break if self.is_at_end() {
                    ScanStatus::Completed
                } else {
                    ScanStatus::LimitReached
                };
            }
            match self.next_event() {
                Some(event) => {
                    callback(&event);
                    events += 1;
                }
                None => break ScanStatus::Completed,
            }
        };
        debug!(events, ?status, "scan finished");
        ScanSummary { events, status }
    }
}

impl Iterator for LocationContext {
    type Item = TraceEvent;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_event()
    }
}
