// Type definitions for the trace-cmd version 6 data file
//
// Everything here is built once at open and never mutated afterwards, so it can
// be shared between readers without locking.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::Serialize;

/// First ten bytes of every trace-cmd data file.
pub const TRACE_CMD_MAGIC: [u8; 10] = [0x17, 0x08, 0x44, b't', b'r', b'a', b'c', b'i', b'n', b'g'];

/// The only file format version this reader decodes.
pub const SUPPORTED_VERSION: u32 = 6;

// Page commit word: low bits hold the valid data length, high bits flags.
pub const COMMIT_LENGTH_MASK: u64 = (1 << 27) - 1;
pub const COMMIT_MISSED_EVENTS: u64 = 1 << 31;
pub const COMMIT_MISSED_STORED: u64 = 1 << 30;

pub const COMMON_FIELD_PREFIX: &str = "common_";
pub const INTERNAL_FIELD_PREFIX: &str = "__";
pub const COMMON_TYPE_FIELD: &str = "common_type";

/// System name given to the formats of the ftrace-internal section.
pub const FTRACE_SYSTEM: &str = "ftrace";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Endianness {
    Little,
    Big,
}

impl Endianness {
    /// Decode the endianness byte that follows the version string.
    pub fn from_flag(flag: u8) -> Self {
        if flag == 0 {
            Endianness::Little
        } else {
            Endianness::Big
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FileType {
    FlyRecord,
    Latency,
}

/// Bit layout of the ring-buffer record header, from the `header_event`
/// section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HeaderEventInfo {
    pub type_len_bits: u32,
    pub time_delta_bits: u32,
    pub padding_type_len: u32,
    pub time_extend_type_len: u32,
    pub time_stamp_type_len: u32,
    pub data_max_type_len: u32,
}

impl HeaderEventInfo {
    /// `type_len` value meaning "explicit length word follows".
    pub const CUSTOM_LENGTH_TYPE_LEN: u32 = 0;

    pub fn type_len_mask(&self) -> u32 {
        low_bits(self.type_len_bits)
    }

    pub fn time_delta_mask(&self) -> u32 {
        low_bits(self.time_delta_bits)
    }
}

fn low_bits(bits: u32) -> u32 {
    if bits >= 32 {
        u32::MAX
    } else {
        (1u32 << bits) - 1
    }
}

/// Array arity of a field declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ArrayArity {
    Scalar,
    Fixed(usize),
    /// `[]` or a length the declaration names symbolically.
    Dynamic,
}

/// Where a field's bytes live inside the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FieldLocation {
    Inline,
    /// `__data_loc`: 32-bit word, low half offset from payload start, high half length.
    DataLoc,
    /// `__rel_loc`: like `DataLoc` but the offset is relative to the end of the word.
    RelLoc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldSpec {
    pub name: String,
    /// Base type with qualifiers and markers stripped, e.g. `unsigned long`.
    pub type_name: String,
    pub offset: usize,
    pub size: usize,
    pub signed: bool,
    pub array: ArrayArity,
    pub location: FieldLocation,
    pub pointer: bool,
    pub is_const: bool,
    /// Name starts with `__`.
    pub internal: bool,
}

impl FieldSpec {
    pub fn is_common(&self) -> bool {
        self.name.starts_with(COMMON_FIELD_PREFIX)
    }

    pub fn is_char(&self) -> bool {
        let base = self.type_name.trim_start_matches("unsigned ").trim_start_matches("signed ");
        base == "char"
    }

    pub fn end(&self) -> usize {
        self.offset.saturating_add(self.size)
    }

    pub fn overlaps(&self, other: &FieldSpec) -> bool {
        self.size > 0 && other.size > 0 && self.offset < other.end() && other.offset < self.end()
    }
}

/// Schema of one event type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventFormat {
    pub id: u32,
    pub system: String,
    pub name: String,
    pub fields: Vec<FieldSpec>,
    pub print_fmt: Option<String>,
}

impl EventFormat {
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|field| field.name == name)
    }

    pub fn common_fields(&self) -> impl Iterator<Item = &FieldSpec> {
        self.fields.iter().filter(|field| field.is_common())
    }

    /// First pair of fields whose byte ranges overlap, if any.
    pub fn overlapping_fields(&self) -> Option<(&FieldSpec, &FieldSpec)> {
        for (i, a) in self.fields.iter().enumerate() {
            for b in &self.fields[i + 1..] {
                if a.overlaps(b) {
                    return Some((a, b));
                }
            }
        }
        None
    }
}

/// Layout of the fixed header at the start of every ring-buffer page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PageHeaderLayout {
    pub timestamp_offset: usize,
    pub timestamp_size: usize,
    pub commit_offset: usize,
    pub commit_size: usize,
    pub data_offset: usize,
}

impl PageHeaderLayout {
    pub fn with_long_size(long_size: usize) -> Self {
        Self {
            timestamp_offset: 0,
            timestamp_size: 8,
            commit_offset: 8,
            commit_size: long_size,
            data_offset: 8 + long_size,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OptionKind {
    Date,
    CpuStat,
    Buffer,
    TraceClock,
    Uname,
    Hook,
    Offset,
    CpuCount,
    Version,
    ProcMaps,
    TraceId,
    TimeShift,
    Guest,
    Other(u16),
}

impl From<u16> for OptionKind {
    fn from(value: u16) -> Self {
        match value {
            1 => OptionKind::Date,
            2 => OptionKind::CpuStat,
            3 => OptionKind::Buffer,
            4 => OptionKind::TraceClock,
            5 => OptionKind::Uname,
            6 => OptionKind::Hook,
            7 => OptionKind::Offset,
            8 => OptionKind::CpuCount,
            9 => OptionKind::Version,
            10 => OptionKind::ProcMaps,
            11 => OptionKind::TraceId,
            12 => OptionKind::TimeShift,
            13 => OptionKind::Guest,
            other => OptionKind::Other(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraceOption {
    pub kind: OptionKind,
    pub data: Vec<u8>,
}

impl TraceOption {
    /// Option payload as text, without trailing NULs and whitespace.
    pub fn as_text(&self) -> String {
        String::from_utf8_lossy(&self.data)
            .trim_end_matches(['\0', '\n', ' '])
            .to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Symbol {
    pub address: u64,
    pub kind: char,
    pub name: String,
    pub module: Option<String>,
}

/// Kernel address → symbol table from the kallsyms section.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    symbols: BTreeMap<u64, Symbol>,
}

impl SymbolTable {
    pub fn insert(&mut self, symbol: Symbol) {
        self.symbols.insert(symbol.address, symbol);
    }

    pub fn get(&self, address: u64) -> Option<&Symbol> {
        self.symbols.get(&address)
    }

    /// Symbol with the greatest address not above `address`.
    pub fn resolve(&self, address: u64) -> Option<&Symbol> {
        self.symbols.range(..=address).next_back().map(|(_, symbol)| symbol)
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

/// Everything decoded from the text sections in front of the CPU data.
#[derive(Debug, Clone)]
pub struct TraceHeader {
    pub version: u32,
    pub endianness: Endianness,
    pub long_size: usize,
    pub page_size: usize,
    pub page_header: PageHeaderLayout,
    pub header_page_fields: Vec<FieldSpec>,
    pub event_info: HeaderEventInfo,
    pub formats: HashMap<u32, EventFormat>,
    pub symbols: SymbolTable,
    pub printk: HashMap<u64, String>,
    pub cmdlines: HashMap<i64, String>,
    pub cpu_count: u32,
    pub options: Vec<TraceOption>,
    pub file_type: FileType,
    pub type_field: TypeField,
}

impl TraceHeader {
    pub fn format(&self, id: u32) -> Option<&EventFormat> {
        self.formats.get(&id)
    }

    pub fn find_format(&self, system: &str, name: &str) -> Option<&EventFormat> {
        self.formats
            .values()
            .find(|format| format.system == system && format.name == name)
    }
}

/// Position and width of the format id inside a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeField {
    pub offset: usize,
    pub size: usize,
}

impl TypeField {
    /// Field used to read the format id out of a payload. All formats share
    /// their common fields, so any format that declares it will do.
    pub fn from_formats(formats: &HashMap<u32, EventFormat>) -> Self {
        formats
            .values()
            .find_map(|format| format.field(COMMON_TYPE_FIELD))
            .map(|field| TypeField {
                offset: field.offset,
                size: field.size,
            })
            .unwrap_or_default()
    }
}

impl Default for TypeField {
    fn default() -> Self {
        Self { offset: 0, size: 2 }
    }
}

/// Decoded field value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Int(i64),
    UInt(u64),
    Str(String),
    Bytes(Vec<u8>),
}

impl FieldValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Int(value) => Some(*value),
            FieldValue::UInt(value) => i64::try_from(*value).ok(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            FieldValue::UInt(value) => Some(*value),
            FieldValue::Int(value) => u64::try_from(*value).ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Str(value) => Some(value),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Int(value) => write!(f, "{value}"),
            FieldValue::UInt(value) => write!(f, "{value}"),
            FieldValue::Str(value) => write!(f, "{value}"),
            FieldValue::Bytes(value) => {
                write!(f, "[")?;
                for (i, byte) in value.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{byte:02x}")?;
                }
                write!(f, "]")
            }
        }
    }
}

/// One decoded event. Common fields are merged flat with the event's own
/// fields, in declaration order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraceEvent {
    pub timestamp: u64,
    pub cpu: u32,
    pub format_id: u32,
    pub system: String,
    pub name: String,
    pub fields: Vec<(String, FieldValue)>,
    /// Command name recorded for the event's pid in the saved cmdlines.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

impl TraceEvent {
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields
            .iter()
            .find(|(field_name, _)| field_name == name)
            .map(|(_, value)| value)
    }

    pub fn int_field(&self, name: &str) -> Option<i64> {
        self.field(name).and_then(FieldValue::as_i64)
    }

    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.field(name).and_then(FieldValue::as_str)
    }

    pub fn pid(&self) -> Option<i64> {
        self.int_field("common_pid")
    }

    /// Thread-group id when the event carries one, otherwise the pid.
    pub fn tgid(&self) -> Option<i64> {
        self.int_field("tgid").or_else(|| self.pid())
    }

    pub fn comm(&self) -> Option<&str> {
        self.command.as_deref()
    }
}

impl fmt::Display for TraceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:03}] {}.{:09}: {}:",
            self.cpu,
            self.timestamp / 1_000_000_000,
            self.timestamp % 1_000_000_000,
            self.name
        )?;
        for (name, value) in &self.fields {
            if name.starts_with(COMMON_FIELD_PREFIX) {
                continue;
            }
            write!(f, " {name}={value}")?;
        }
        Ok(())
    }
}

/// Seek and resume key: a timestamp plus the number of earlier events in
/// the merged stream that share it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct EventLocation {
    pub timestamp: u64,
    pub index: u64,
}

impl EventLocation {
    /// Sentinel for a cursor with no more events.
    pub const END: EventLocation = EventLocation {
        timestamp: u64::MAX,
        index: u64::MAX,
    };

    pub fn new(timestamp: u64, index: u64) -> Self {
        Self { timestamp, index }
    }

    pub fn is_end(&self) -> bool {
        *self == Self::END
    }
}

impl fmt::Display for EventLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_end() {
            write!(f, "end")
        } else {
            write!(f, "{}:{}", self.timestamp, self.index)
        }
    }
}

impl std::str::FromStr for EventLocation {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (timestamp, index) = s.split_once(':').unwrap_or((s, "0"));
        let timestamp = timestamp
            .trim()
            .parse()
            .map_err(|err| format!("invalid timestamp {timestamp:?}: {err}"))?;
        let index = index
            .trim()
            .parse()
            .map_err(|err| format!("invalid index {index:?}: {err}"))?;
        Ok(Self { timestamp, index })
    }
}
