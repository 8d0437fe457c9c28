// Random-access byte sources and an endian-aware cursor over them

use bytes::Bytes;
use memmap2::Mmap;

use super::error::{FtraceError, Result};
use super::types::Endianness;

/// Read-only, random-access view of a trace file's bytes.
///
/// Implementations must be immutable once handed to a trace; readers on
/// several threads slice into the same source at once.
pub trait ByteSource: Send + Sync {
    fn as_bytes(&self) -> &[u8];

    fn len(&self) -> usize {
        self.as_bytes().len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `len` bytes at `offset`, or `None` when the range leaves the source.
    fn read_at(&self, offset: usize, len: usize) -> Option<&[u8]> {
        let end = offset.checked_add(len)?;
        self.as_bytes().get(offset..end)
    }
}

impl ByteSource for Mmap {
    fn as_bytes(&self) -> &[u8] {
        self
    }
}

impl ByteSource for Bytes {
    fn as_bytes(&self) -> &[u8] {
        self
    }
}

impl ByteSource for Vec<u8> {
    fn as_bytes(&self) -> &[u8] {
        self
    }
}

/// Unsigned integer of `size` bytes (1, 2, 4 or 8) at `offset`.
pub fn read_uint(data: &[u8], offset: usize, size: usize, endianness: Endianness) -> Option<u64> {
    let raw = data.get(offset..offset.checked_add(size)?)?;
    let value = match (size, endianness) {
        (1, _) => raw[0] as u64,
        (2, Endianness::Little) => u16::from_le_bytes(raw.try_into().ok()?) as u64,
        (2, Endianness::Big) => u16::from_be_bytes(raw.try_into().ok()?) as u64,
        (4, Endianness::Little) => u32::from_le_bytes(raw.try_into().ok()?) as u64,
        (4, Endianness::Big) => u32::from_be_bytes(raw.try_into().ok()?) as u64,
        (8, Endianness::Little) => u64::from_le_bytes(raw.try_into().ok()?),
        (8, Endianness::Big) => u64::from_be_bytes(raw.try_into().ok()?),
        _ => return None,
    };
    Some(value)
}

/// Sign-extend the low `size` bytes of `value`.
pub fn sign_extend(value: u64, size: usize) -> i64 {
    match size {
        1 => value as u8 as i8 as i64,
        2 => value as u16 as i16 as i64,
        4 => value as u32 as i32 as i64,
        _ => value as i64,
    }
}

/// Sequential reader over the header sections. Every read names the section
/// it belongs to so truncation errors say where the file ran out.
pub struct ByteCursor<'a> {
    data: &'a [u8],
    pos: usize,
    endianness: Endianness,
}

impl<'a> ByteCursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            endianness: Endianness::Little,
        }
    }

    pub fn set_endianness(&mut self, endianness: Endianness) {
        self.endianness = endianness;
    }

    pub fn endianness(&self) -> Endianness {
        self.endianness
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn read_bytes(&mut self, len: usize, section: &'static str) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or(FtraceError::UnexpectedEof {
                section,
                offset: self.pos,
            })?;
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    /// Look at the next `len` bytes without consuming them.
    pub fn peek_bytes(&self, len: usize) -> Option<&'a [u8]> {
        self.data.get(self.pos..self.pos.checked_add(len)?)
    }

    pub fn read_u8(&mut self, section: &'static str) -> Result<u8> {
        Ok(self.read_bytes(1, section)?[0])
    }

    pub fn read_u16(&mut self, section: &'static str) -> Result<u16> {
        let offset = self.pos;
        self.read_uint(2, section, offset).map(|value| value as u16)
    }

    pub fn read_u32(&mut self, section: &'static str) -> Result<u32> {
        let offset = self.pos;
        self.read_uint(4, section, offset).map(|value| value as u32)
    }

    pub fn read_u64(&mut self, section: &'static str) -> Result<u64> {
        let offset = self.pos;
        self.read_uint(8, section, offset)
    }

    fn read_uint(&mut self, size: usize, section: &'static str, offset: usize) -> Result<u64> {
        let bytes = self.read_bytes(size, section)?;
        read_uint(bytes, 0, size, self.endianness)
            .ok_or(FtraceError::UnexpectedEof { section, offset })
    }

    /// NUL-terminated string; the terminator is consumed but not returned.
    pub fn read_cstring(&mut self, section: &'static str) -> Result<String> {
        let rest = &self.data[self.pos.min(self.data.len())..];
        let len = rest
            .iter()
            .position(|byte| *byte == 0)
            .ok_or(FtraceError::UnexpectedEof {
                section,
                offset: self.data.len(),
            })?;
        let text = String::from_utf8_lossy(&rest[..len]).into_owned();
        self.pos += len + 1;
        Ok(text)
    }

    /// Expect an exact byte sequence, reporting the section as malformed
    /// when something else is there.
    pub fn expect(&mut self, expected: &[u8], section: &'static str) -> Result<()> {
        let got = self.read_bytes(expected.len(), section)?;
        if got != expected {
            return Err(FtraceError::malformed(
                section,
                format!(
                    "expected label {:?}, found {:?}",
                    String::from_utf8_lossy(expected),
                    String::from_utf8_lossy(got)
                ),
            ));
        }
        Ok(())
    }

    /// Text block prefixed by a 32-bit length.
    pub fn read_text_u32(&mut self, section: &'static str) -> Result<&'a str> {
        let len = self.read_u32(section)? as usize;
        self.read_text(len, section)
    }

    /// Text block prefixed by a 64-bit length.
    pub fn read_text_u64(&mut self, section: &'static str) -> Result<&'a str> {
        let len = usize::try_from(self.read_u64(section)?).map_err(|_| {
            FtraceError::UnexpectedEof {
                section,
                offset: self.pos,
            }
        })?;
        self.read_text(len, section)
    }

    fn read_text(&mut self, len: usize, section: &'static str) -> Result<&'a str> {
        let offset = self.pos;
        let bytes = self.read_bytes(len, section)?;
        let bytes = match bytes.iter().position(|byte| *byte == 0) {
            Some(nul) => &bytes[..nul],
            None => bytes,
        };
        std::str::from_utf8(bytes).map_err(|err| {
            FtraceError::malformed(section, format!("text at offset {offset} is not UTF-8: {err}"))
        })
    }
}
