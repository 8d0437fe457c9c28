// K-way merge of the per-CPU streams
//
// Min-heap keyed on (timestamp, cpu, per-cpu index) holding one entry per
// CPU that still has a lookahead event. Equal timestamps come out in CPU
// order, and within one CPU in file order.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use super::cpu::PerCpuIterator;
use super::types::TraceEvent;

type HeapKey = (u64, u32, u64, usize); // (timestamp, cpu, index, slot)

/// Merge-sort iterator over every CPU of a trace
pub struct MergeIterator {
    cpus: Vec<PerCpuIterator>,
    heap: BinaryHeap<Reverse<HeapKey>>,
}

impl MergeIterator {
    pub fn new(cpus: Vec<PerCpuIterator>) -> Self {
        let mut merge = Self {
            heap: BinaryHeap::with_capacity(cpus.len()),
            cpus,
        };
        merge.rebuild();
        merge
    }

    fn key(slot: usize, cpu: &PerCpuIterator) -> Option<Reverse<HeapKey>> {
        let event = cpu.current()?;
        Some(Reverse((event.timestamp, cpu.cpu(), cpu.index(), slot)))
    }

    fn rebuild(&mut self) {
        self.heap.clear();
        for (slot, cpu) in self.cpus.iter().enumerate() {
            if let Some(key) = Self::key(slot, cpu) {
                self.heap.push(key);
            }
        }
    }

    /// The event `next_event` returns next.
    pub fn peek(&self) -> Option<&TraceEvent> {
        let Reverse((.., slot)) = self.heap.peek()?;
        self.cpus[*slot].current()
    }

    /// Emit the globally next event and refill only its CPU's lookahead.
    pub fn next_event(&mut self) -> Option<TraceEvent> {
        let Reverse((.., slot)) = self.heap.pop()?;
        let event = self.cpus[slot].pop()?;
        if let Some(key) = Self::key(slot, &self.cpus[slot]) {
            self.heap.push(key);
        }
        Some(event)
    }

    /// Position every CPU on its first event at or after `timestamp`.
    pub fn seek_timestamp(&mut self, timestamp: u64) {
        for cpu in &mut self.cpus {
            cpu.seek_timestamp(timestamp);
        }
        self.rebuild();
    }

    pub fn rewind(&mut self) {
        for cpu in &mut self.cpus {
            cpu.rewind();
        }
        self.rebuild();
    }

    pub fn is_exhausted(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn cpus(&self) -> &[PerCpuIterator] {
        &self.cpus
    }
}

impl Iterator for MergeIterator {
    type Item = TraceEvent;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_event()
    }
}
