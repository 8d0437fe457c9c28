// Payload → TraceEvent decoding driven by the parsed event formats

use super::bytes::{read_uint, sign_extend};
use super::error::{FtraceError, Result};
use super::types::{
    ArrayArity, EventFormat, FieldLocation, FieldSpec, FieldValue, TraceEvent, TraceHeader,
};

/// Decodes data-record payloads against the formats of one trace.
#[derive(Clone, Copy)]
pub struct EventDecoder<'a> {
    header: &'a TraceHeader,
}

impl<'a> EventDecoder<'a> {
    pub fn new(header: &'a TraceHeader) -> Self {
        Self { header }
    }

    pub fn decode(&self, cpu: u32, timestamp: u64, format_id: u32, payload: &[u8]) -> Result<TraceEvent> {
        let format = self
            .header
            .format(format_id)
            .ok_or(FtraceError::UnknownEventFormat { format_id })?;
        Ok(self.decode_with(format, cpu, timestamp, payload))
    }

    pub fn decode_with(&self, format: &EventFormat, cpu: u32, timestamp: u64, payload: &[u8]) -> TraceEvent {
        let fields: Vec<(String, FieldValue)> = format
            .fields
            .iter()
            .filter_map(|field| {
                self.decode_field(field, payload)
                    .map(|value| (field.name.clone(), value))
            })
            .collect();

        let command = fields
            .iter()
            .find(|(name, _)| name == "common_pid")
            .and_then(|(_, value)| value.as_i64())
            .and_then(|pid| self.header.cmdlines.get(&pid))
            .cloned();

        TraceEvent {
            timestamp,
            cpu,
            format_id: format.id,
            system: format.system.clone(),
            name: format.name.clone(),
            fields,
            command,
        }
    }

    /// Value of one field, or `None` when its bytes lie outside the payload.
    pub fn decode_field(&self, field: &FieldSpec, payload: &[u8]) -> Option<FieldValue> {
        let endianness = self.header.endianness;
        match field.location {
            FieldLocation::DataLoc | FieldLocation::RelLoc => {
                let word = read_uint(payload, field.offset, 4, endianness)?;
                let mut start = (word & 0xffff) as usize;
                let len = (word >> 16) as usize;
                if field.location == FieldLocation::RelLoc {
                    start = start.checked_add(field.offset)?.checked_add(4)?;
                }
                let bytes = payload.get(start..start.checked_add(len)?)?;
                Some(bytes_value(field, bytes))
            }
            FieldLocation::Inline if field.array != ArrayArity::Scalar => {
                let bytes = if field.size == 0 && field.array == ArrayArity::Dynamic {
                    payload.get(field.offset..)?
                } else {
                    payload.get(field.offset..field.end())?
                };
                Some(bytes_value(field, bytes))
            }
            FieldLocation::Inline if field.pointer => {
                let address = read_uint(payload, field.offset, field.size, endianness)?;
                Some(match self.header.printk.get(&address) {
                    Some(text) => FieldValue::Str(text.clone()),
                    None => FieldValue::UInt(address),
                })
            }
            FieldLocation::Inline => match field.size {
                1 | 2 | 4 | 8 => {
                    let raw = read_uint(payload, field.offset, field.size, endianness)?;
                    Some(if field.signed {
                        FieldValue::Int(sign_extend(raw, field.size))
                    } else {
                        FieldValue::UInt(raw)
                    })
                }
                _ => payload
                    .get(field.offset..field.end())
                    .map(|bytes| FieldValue::Bytes(bytes.to_vec())),
            },
        }
    }
}

fn bytes_value(field: &FieldSpec, bytes: &[u8]) -> FieldValue {
    if field.is_char() {
        let text = match bytes.iter().position(|byte| *byte == 0) {
            Some(nul) => &bytes[..nul],
            None => bytes,
        };
        FieldValue::Str(String::from_utf8_lossy(text).into_owned())
    } else {
        FieldValue::Bytes(bytes.to_vec())
    }
}
