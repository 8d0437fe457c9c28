// Per-CPU page index
//
// A CPU section is a run of fixed-size ring-buffer pages. Indexing reads
// only each page's header (timestamp and commit word); records are decoded
// later, on demand.

use serde::Serialize;
use tracing::{debug, trace, warn};

use super::bytes::read_uint;
use super::header::CpuDataRange;
use super::types::{TraceHeader, COMMIT_LENGTH_MASK, COMMIT_MISSED_EVENTS, COMMIT_MISSED_STORED};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Page {
    /// File offset of the page header.
    pub offset: u64,
    /// File offset of the first record.
    pub data_offset: u64,
    /// Bytes of valid record data, clamped to the page's capacity.
    pub size: u64,
    /// Raw commit word: data length in the low bits, flags above.
    pub flags: u64,
    /// Timestamp the first record's delta is relative to.
    pub timestamp: u64,
}

impl Page {
    pub fn data_end(&self) -> u64 {
        self.data_offset + self.size
    }

    pub fn missed_events(&self) -> bool {
        self.flags & COMMIT_MISSED_EVENTS != 0
    }

    pub fn missed_count_stored(&self) -> bool {
        self.flags & COMMIT_MISSED_STORED != 0
    }
}

/// All non-empty pages of one CPU, in file order. "Next page" is the next
/// index; there are no back links.
#[derive(Debug, Clone, Serialize)]
pub struct CpuSection {
    pub cpu: u32,
    pub offset: u64,
    pub size: u64,
    pages: Vec<Page>,
}

impl CpuSection {
    pub fn new(cpu: u32, offset: u64, size: u64, pages: Vec<Page>) -> Self {
        Self {
            cpu,
            offset,
            size,
            pages,
        }
    }

    /// Read the header of every page in `range`.
    pub fn index(data: &[u8], header: &TraceHeader, range: CpuDataRange) -> Self {
        let page_size = header.page_size as u64;
        let layout = header.page_header;
        let capacity = page_size - layout.data_offset as u64;

        let full_pages = range.size / page_size;
        if range.size % page_size != 0 {
            warn!(
                cpu = range.cpu,
                size = range.size,
                page_size,
                "cpu section ends with a partial page, ignoring it"
            );
        }

        let mut pages = Vec::with_capacity(full_pages as usize);
        for i in 0..full_pages {
            let offset = range.offset + i * page_size;
            let base = offset as usize;
            let timestamp = read_uint(
                data,
                base + layout.timestamp_offset,
                layout.timestamp_size,
                header.endianness,
            );
            let commit = read_uint(
                data,
                base + layout.commit_offset,
                layout.commit_size,
                header.endianness,
            );
            let (Some(timestamp), Some(flags)) = (timestamp, commit) else {
                warn!(cpu = range.cpu, offset, "page header outside file, stopping index");
                break;
            };

            let length = flags & COMMIT_LENGTH_MASK;
            if length == 0 {
                trace!(cpu = range.cpu, offset, "skipping empty page");
                continue;
            }
            let size = if length > capacity {
                warn!(
                    cpu = range.cpu,
                    offset,
                    length,
                    capacity,
                    "commit length exceeds page capacity, clamping"
                );
                capacity
            } else {
                length
            };

            pages.push(Page {
                offset,
                data_offset: offset + layout.data_offset as u64,
                size,
                flags,
                timestamp,
            });
        }

        debug!(cpu = range.cpu, pages = pages.len(), "indexed cpu section");
        Self::new(range.cpu, range.offset, range.size, pages)
    }

    pub fn pages(&self) -> &[Page] {
        &self.pages
    }

    pub fn page(&self, index: usize) -> Option<&Page> {
        self.pages.get(index)
    }

    /// Page following `index`, if any.
    pub fn next(&self, index: usize) -> Option<&Page> {
        self.pages.get(index.checked_add(1)?)
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Index of the page to start scanning from for the first record at or
    /// after `timestamp`: the last page that starts strictly before it.
    /// Records equal to a page's start time may sit at the end of the
    /// previous page, hence the strict comparison.
    pub fn seek_page(&self, timestamp: u64) -> usize {
        self.pages
            .partition_point(|page| page.timestamp < timestamp)
            .saturating_sub(1)
    }
}
