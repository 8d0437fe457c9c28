// Parsers for the text sections of a trace-cmd data file
//
// header_page, header_event, event formats, kallsyms, printk formats and
// saved cmdlines are all plain text embedded in the binary header. Each
// parser takes the section text and returns typed values; anything that
// does not fit the grammar is a MalformedSection error.

use std::collections::HashMap;

use super::error::{FtraceError, Result};
use super::types::{
    ArrayArity, EventFormat, FieldLocation, FieldSpec, HeaderEventInfo, PageHeaderLayout, Symbol,
    SymbolTable, INTERNAL_FIELD_PREFIX,
};

const FIELD_LABEL: &str = "field:";
const PRINT_FMT_LABEL: &str = "print fmt:";

/// Parse one `field:...;offset:N;size:N;signed:N;` line.
pub fn parse_field_line(line: &str, section: &'static str) -> Result<FieldSpec> {
    let body = line
        .trim()
        .strip_prefix(FIELD_LABEL)
        .ok_or_else(|| FtraceError::malformed(section, format!("not a field line: {line:?}")))?;

    let mut parts = body.split(';');
    let declaration = parts.next().unwrap_or_default();

    let mut offset = None;
    let mut size = None;
    let mut signed = None;
    for property in parts {
        let property = property.trim();
        if property.is_empty() {
            continue;
        }
        let (key, value) = property.split_once(':').ok_or_else(|| {
            FtraceError::malformed(section, format!("bad field property {property:?}"))
        })?;
        let value = value.trim();
        let parsed = value.parse::<usize>().map_err(|_| {
            FtraceError::malformed(section, format!("bad value for {}: {value:?}", key.trim()))
        })?;
        match key.trim() {
            "offset" => offset = Some(parsed),
            "size" => size = Some(parsed),
            "signed" => signed = Some(parsed != 0),
            _ => {}
        }
    }

    let declaration = FieldDeclaration::parse(declaration)
        .ok_or_else(|| FtraceError::malformed(section, format!("bad field declaration {line:?}")))?;
    let offset = offset
        .ok_or_else(|| FtraceError::malformed(section, format!("field {} has no offset", declaration.name)))?;
    let size = size
        .ok_or_else(|| FtraceError::malformed(section, format!("field {} has no size", declaration.name)))?;
    if offset.checked_add(size).is_none() {
        return Err(FtraceError::malformed(
            section,
            format!("field {} extends past the address space", declaration.name),
        ));
    }
    let signed = signed.unwrap_or(!declaration.pointer && !declaration.type_name.starts_with("unsigned"));

    Ok(FieldSpec {
        internal: declaration.name.starts_with(INTERNAL_FIELD_PREFIX),
        name: declaration.name,
        type_name: declaration.type_name,
        offset,
        size,
        signed,
        array: declaration.array,
        location: declaration.location,
        pointer: declaration.pointer,
        is_const: declaration.is_const,
    })
}

/// Declaration part of a field line, e.g. `__data_loc char[] name` or
/// `const char * fmt`.
struct FieldDeclaration {
    name: String,
    type_name: String,
    array: ArrayArity,
    location: FieldLocation,
    pointer: bool,
    is_const: bool,
}

impl FieldDeclaration {
    fn parse(text: &str) -> Option<Self> {
        let spaced = text.replace('*', " * ");
        let mut tokens: Vec<&str> = spaced.split_whitespace().collect();
        let identifier = tokens.pop()?;

        let (name, mut array) = split_array_suffix(identifier)?;
        if name.is_empty() {
            return None;
        }

        let mut location = FieldLocation::Inline;
        let mut pointer = false;
        let mut is_const = false;
        let mut type_tokens = Vec::new();
        for token in tokens {
            match token {
                "__data_loc" => location = FieldLocation::DataLoc,
                "__rel_loc" => location = FieldLocation::RelLoc,
                "const" => is_const = true,
                "*" => pointer = true,
                _ => {
                    let (base, arity) = split_array_suffix(token)?;
                    if arity != ArrayArity::Scalar {
                        array = arity;
                    }
                    if !base.is_empty() {
                        type_tokens.push(base);
                    }
                }
            }
        }
        if type_tokens.is_empty() {
            return None;
        }

        Some(Self {
            name: name.to_string(),
            type_name: type_tokens.join(" "),
            array,
            location,
            pointer,
            is_const,
        })
    }
}

/// Split `comm[16]` into (`comm`, Fixed(16)); `[]` and symbolic lengths
/// are dynamic.
fn split_array_suffix(token: &str) -> Option<(&str, ArrayArity)> {
    let Some(open) = token.find('[') else {
        return Some((token, ArrayArity::Scalar));
    };
    let close = token.rfind(']')?;
    if close < open {
        return None;
    }
    let length = token[open + 1..close].trim();
    let arity = match length.parse::<usize>() {
        Ok(n) => ArrayArity::Fixed(n),
        Err(_) => ArrayArity::Dynamic,
    };
    Some((&token[..open], arity))
}

/// Parse one event format block (`name:`, `ID:`, `format:` and optional
/// `print fmt:`).
pub fn parse_event_format(text: &str, system: &str) -> Result<EventFormat> {
    const SECTION: &str = "event format";

    let mut name = None;
    let mut id = None;
    let mut fields = Vec::new();
    let mut print_fmt = None;

    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed.starts_with(FIELD_LABEL) {
            fields.push(parse_field_line(trimmed, SECTION)?);
        } else if let Some(rest) = trimmed.strip_prefix(PRINT_FMT_LABEL) {
            print_fmt = Some(rest.trim().to_string());
        } else if let Some((key, value)) = trimmed.split_once(':') {
            match key.trim().to_ascii_lowercase().as_str() {
                "name" => name = Some(value.trim().to_string()),
                "id" => {
                    let value = value.trim();
                    id = Some(value.parse::<u32>().map_err(|_| {
                        FtraceError::malformed(SECTION, format!("bad format id {value:?}"))
                    })?);
                }
                _ => {}
            }
        }
    }

    let name = name.ok_or_else(|| FtraceError::malformed(SECTION, "missing name"))?;
    let id = id.ok_or_else(|| FtraceError::malformed(SECTION, format!("{name}: missing ID")))?;

    let format = EventFormat {
        id,
        system: system.to_string(),
        name,
        fields,
        print_fmt,
    };
    if let Some((a, b)) = format.overlapping_fields() {
        return Err(FtraceError::malformed(
            SECTION,
            format!(
                "{}: fields {} [{}..{}) and {} [{}..{}) overlap",
                format.name,
                a.name,
                a.offset,
                a.end(),
                b.name,
                b.offset,
                b.end()
            ),
        ));
    }
    Ok(format)
}

/// Parse the `header_page` field list and derive the page header layout
/// from it. Missing fields fall back to the layout implied by `long_size`.
pub fn parse_header_page(text: &str, long_size: usize) -> Result<(Vec<FieldSpec>, PageHeaderLayout)> {
    let mut fields = Vec::new();
    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with(FIELD_LABEL) {
            fields.push(parse_field_line(trimmed, "header_page")?);
        }
    }

    let mut layout = PageHeaderLayout::with_long_size(long_size);
    let find = |name: &str| fields.iter().find(|field| field.name == name);
    if let Some(field) = find("timestamp") {
        layout.timestamp_offset = field.offset;
        layout.timestamp_size = field.size;
    }
    if let Some(field) = find("commit") {
        layout.commit_offset = field.offset;
        layout.commit_size = field.size;
    }
    if let Some(field) = find("data") {
        layout.data_offset = field.offset;
    }

    for (name, size) in [("timestamp", layout.timestamp_size), ("commit", layout.commit_size)] {
        if !matches!(size, 4 | 8) {
            return Err(FtraceError::malformed(
                "header_page",
                format!("{name} has unsupported size {size}"),
            ));
        }
    }
    Ok((fields, layout))
}

/// Parse the `header_event` description of the record header bit layout.
///
/// ```text
///     type_len    :    5 bits
///     time_delta  :   27 bits
///     padding     : type == 29
///     time_extend : type == 30
///     time_stamp  : type == 31
///     data max type_len  == 28
/// ```
pub fn parse_header_event(text: &str) -> Result<HeaderEventInfo> {
    const SECTION: &str = "header_event";

    let mut type_len_bits = None;
    let mut time_delta_bits = None;
    let mut padding = None;
    let mut time_extend = None;
    let mut time_stamp = None;
    let mut data_max = None;

    let number = |value: &str| {
        value
            .split_whitespace()
            .next()
            .and_then(|token| token.parse::<u32>().ok())
            .ok_or_else(|| FtraceError::malformed(SECTION, format!("bad value {value:?}")))
    };

    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if let Some((label, value)) = trimmed.split_once("==") {
            let value = number(value)?;
            if label.contains("data max type_len") {
                data_max = Some(value);
            } else if label.contains("padding") {
                padding = Some(value);
            } else if label.contains("time_extend") {
                time_extend = Some(value);
            } else if label.contains("time_stamp") {
                time_stamp = Some(value);
            }
        } else if let Some((label, value)) = trimmed.split_once(':') {
            match label.trim() {
                "type_len" => type_len_bits = Some(number(value)?),
                "time_delta" => time_delta_bits = Some(number(value)?),
                _ => {}
            }
        }
    }

    let missing = |what: &str| FtraceError::malformed(SECTION, format!("missing {what}"));
    let info = HeaderEventInfo {
        type_len_bits: type_len_bits.ok_or_else(|| missing("type_len"))?,
        time_delta_bits: time_delta_bits.ok_or_else(|| missing("time_delta"))?,
        padding_type_len: padding.ok_or_else(|| missing("padding"))?,
        time_extend_type_len: time_extend.ok_or_else(|| missing("time_extend"))?,
        time_stamp_type_len: time_stamp.ok_or_else(|| missing("time_stamp"))?,
        data_max_type_len: data_max.ok_or_else(|| missing("data max type_len"))?,
    };

    if info.type_len_bits + info.time_delta_bits != 32 {
        return Err(FtraceError::malformed(
            SECTION,
            format!(
                "type_len ({}) and time_delta ({}) do not fill a 32-bit word",
                info.type_len_bits, info.time_delta_bits
            ),
        ));
    }
    let type_len_limit = info.type_len_mask();
    for value in [
        info.padding_type_len,
        info.time_extend_type_len,
        info.time_stamp_type_len,
        info.data_max_type_len,
    ] {
        if value > type_len_limit {
            return Err(FtraceError::malformed(
                SECTION,
                format!("type value {value} does not fit in {} bits", info.type_len_bits),
            ));
        }
    }
    if info.data_max_type_len >= info.padding_type_len.min(info.time_extend_type_len).min(info.time_stamp_type_len) {
        return Err(FtraceError::malformed(
            SECTION,
            format!("data max type_len {} collides with a reserved type", info.data_max_type_len),
        ));
    }
    Ok(info)
}

/// Parse `/proc/kallsyms` text: `ADDR TYPE NAME [MODULE]` per line.
pub fn parse_kallsyms(text: &str) -> Result<SymbolTable> {
    const SECTION: &str = "kallsyms";

    let mut table = SymbolTable::default();
    for line in text.lines() {
        let mut tokens = line.split_whitespace();
        let Some(address) = tokens.next() else {
            continue;
        };
        let address = u64::from_str_radix(address.trim_start_matches("0x"), 16)
            .map_err(|_| FtraceError::malformed(SECTION, format!("bad address in {line:?}")))?;
        let kind = tokens
            .next()
            .and_then(|token| token.chars().next())
            .ok_or_else(|| FtraceError::malformed(SECTION, format!("missing type in {line:?}")))?;
        let name = tokens
            .next()
            .ok_or_else(|| FtraceError::malformed(SECTION, format!("missing name in {line:?}")))?;
        let module = tokens
            .next()
            .map(|token| token.trim_start_matches('[').trim_end_matches(']').to_string());
        table.insert(Symbol {
            address,
            kind,
            name: name.to_string(),
            module,
        });
    }
    Ok(table)
}

/// Parse the printk format table: `0xADDR : "string"` per line.
pub fn parse_printk(text: &str) -> Result<HashMap<u64, String>> {
    const SECTION: &str = "printk";

    let mut table = HashMap::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let (address, value) = line
            .split_once(':')
            .ok_or_else(|| FtraceError::malformed(SECTION, format!("missing ':' in {line:?}")))?;
        let address = address.trim();
        let address = u64::from_str_radix(address.trim_start_matches("0x"), 16)
            .map_err(|_| FtraceError::malformed(SECTION, format!("bad address {address:?}")))?;
        let value = value.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|inner| inner.strip_suffix('"'))
            .unwrap_or(value);
        table.insert(address, value.to_string());
    }
    Ok(table)
}

/// Parse saved cmdlines: `PID COMM` per line.
pub fn parse_cmdlines(text: &str) -> Result<HashMap<i64, String>> {
    const SECTION: &str = "cmdlines";

    let mut table = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (pid, comm) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let pid = pid
            .parse::<i64>()
            .map_err(|_| FtraceError::malformed(SECTION, format!("bad pid in {line:?}")))?;
        table.insert(pid, comm.trim().to_string());
    }
    Ok(table)
}
