// Ring-buffer record decoding
//
// Every record starts with a 32-bit word split into `type_len` and
// `time_delta`, widths taken from the header_event section. Which end of the
// word holds `type_len` depends on the file's endianness.

use std::ops::Range;

use tracing::trace;

use super::bytes::read_uint;
use super::error::{FtraceError, Result};
use super::page::Page;
use super::types::{Endianness, HeaderEventInfo, TraceHeader, TypeField};

const WORD: u64 = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordKind {
    Padding,
    TimeExtend,
    TimeStamp,
    Data {
        /// `None` when the payload is too short to hold the type field.
        format_id: Option<u32>,
        /// File offsets of the payload bytes.
        payload: Range<usize>,
    },
}

/// One decoded record header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub kind: RecordKind,
    /// File offset of the record's first word.
    pub offset: u64,
    /// File offset of the following record.
    pub next: u64,
    /// Running timestamp after this record is applied.
    pub timestamp: u64,
}

impl Record {
    pub fn is_data(&self) -> bool {
        matches!(self.kind, RecordKind::Data { .. })
    }
}

/// Decodes records of one CPU's pages.
#[derive(Clone, Copy)]
pub struct RecordDecoder<'a> {
    data: &'a [u8],
    cpu: u32,
    info: HeaderEventInfo,
    endianness: Endianness,
    type_field: TypeField,
}

impl<'a> RecordDecoder<'a> {
    pub fn new(data: &'a [u8], header: &TraceHeader, cpu: u32) -> Self {
        Self {
            data,
            cpu,
            info: header.event_info,
            endianness: header.endianness,
            type_field: header.type_field,
        }
    }

    fn read_u32(&self, offset: u64) -> Option<u32> {
        read_uint(self.data, offset as usize, 4, self.endianness).map(|value| value as u32)
    }

    /// Split a record header word into `(type_len, time_delta)`.
    pub fn split_word(&self, word: u32) -> (u32, u32) {
        match self.endianness {
            Endianness::Little => (
                word & self.info.type_len_mask(),
                word.checked_shr(self.info.type_len_bits).unwrap_or(0),
            ),
            Endianness::Big => (
                word.checked_shr(self.info.time_delta_bits).unwrap_or(0),
                word & self.info.time_delta_mask(),
            ),
        }
    }

    fn corrupt(&self, page: &Page, offset: u64, reason: impl Into<String>) -> FtraceError {
        FtraceError::CorruptPage {
            cpu: self.cpu,
            page_offset: page.offset,
            record_offset: offset,
            reason: reason.into(),
        }
    }

    /// Decode the record at `offset` inside `page`, given the running
    /// timestamp before it. `Ok(None)` means the page has no more records.
    pub fn decode(&self, page: &Page, offset: u64, timestamp: u64) -> Result<Option<Record>> {
        let page_end = page.data_end();
        if offset.saturating_add(WORD) > page_end {
            return Ok(None);
        }
        let word = self
            .read_u32(offset)
            .ok_or_else(|| self.corrupt(page, offset, "record header outside file"))?;
        let (type_len, delta) = self.split_word(word);
        let delta = delta as u64;
        let info = &self.info;

        let record = if type_len == info.padding_type_len {
            let next = self.padding_end(page, offset);
            trace!(cpu = self.cpu, offset, next, "padding");
            Record {
                kind: RecordKind::Padding,
                offset,
                next,
                timestamp: timestamp.saturating_add(delta),
            }
        } else if type_len == info.time_extend_type_len || type_len == info.time_stamp_type_len {
            let extra = if offset + 2 * WORD <= page_end {
                self.read_u32(offset + WORD)
            } else {
                None
            };
            let extra = extra.ok_or_else(|| {
                self.corrupt(page, offset, "time record runs past end of page")
            })?;
            let value = ((extra as u64) << info.time_delta_bits) + delta;
            let (kind, timestamp) = if type_len == info.time_extend_type_len {
                (RecordKind::TimeExtend, timestamp.saturating_add(value))
            } else {
                (RecordKind::TimeStamp, value)
            };
            Record {
                kind,
                offset,
                next: offset + 2 * WORD,
                timestamp,
            }
        } else if type_len == HeaderEventInfo::CUSTOM_LENGTH_TYPE_LEN {
            if offset + 2 * WORD > page_end {
                return Err(self.corrupt(page, offset, "length word runs past end of page"));
            }
            let length = self
                .read_u32(offset + WORD)
                .ok_or_else(|| self.corrupt(page, offset, "length word outside file"))?;
            if (length as u64) < WORD {
                return Err(self.corrupt(page, offset, format!("record length {length} too small")));
            }
            let payload_len = align(length as u64 - WORD);
            self.data_record(page, offset, offset + 2 * WORD, payload_len, timestamp.saturating_add(delta))?
        } else if type_len <= info.data_max_type_len {
            let payload_len = type_len as u64 * WORD;
            self.data_record(page, offset, offset + WORD, payload_len, timestamp.saturating_add(delta))?
        } else {
            return Err(self.corrupt(page, offset, format!("reserved type_len {type_len}")));
        };
        Ok(Some(record))
    }

    fn padding_end(&self, page: &Page, offset: u64) -> u64 {
        let page_end = page.data_end();
        let length = if offset + 2 * WORD <= page_end {
            self.read_u32(offset + WORD).unwrap_or(0)
        } else {
            0
        };
        if length == 0 {
            return page_end;
        }
        (offset + WORD + align(length as u64)).min(page_end)
    }

    fn data_record(
        &self,
        page: &Page,
        offset: u64,
        start: u64,
        payload_len: u64,
        timestamp: u64,
    ) -> Result<Record> {
        let end = start + payload_len;
        if end > page.data_end() {
            return Err(self.corrupt(
                page,
                offset,
                format!(
                    "payload of {payload_len} bytes overruns page end {}",
                    page.data_end()
                ),
            ));
        }
        let payload = start as usize..end as usize;
        let bytes = self
            .data
            .get(payload.clone())
            .ok_or_else(|| self.corrupt(page, offset, "payload outside file"))?;
        let format_id = read_uint(
            bytes,
            self.type_field.offset,
            self.type_field.size,
            self.endianness,
        )
        .map(|id| id as u32);
        Ok(Record {
            kind: RecordKind::Data { format_id, payload },
            offset,
            next: end,
            timestamp,
        })
    }
}

fn align(length: u64) -> u64 {
    (length + WORD - 1) & !(WORD - 1)
}
