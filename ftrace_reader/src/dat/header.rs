// Binary header walk for trace-cmd version 6 files
//
// Layout, in file order:
//   magic, version string, endianness, long size, page size,
//   header_page, header_event, ftrace formats, event systems,
//   kallsyms, printk formats, saved cmdlines, cpu count,
//   then labelled sections: options, flyrecord or latency.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde::Serialize;
use tracing::{debug, warn};

use super::bytes::ByteCursor;
use super::error::{FtraceError, Result};
use super::format::{
    parse_cmdlines, parse_event_format, parse_header_event, parse_header_page, parse_kallsyms,
    parse_printk,
};
use super::types::{
    Endianness, EventFormat, FileType, OptionKind, TraceHeader, TraceOption, FTRACE_SYSTEM,
    SUPPORTED_VERSION, TRACE_CMD_MAGIC, TypeField,
};

const HEADER_PAGE_LABEL: &[u8] = b"header_page\0";
const HEADER_EVENT_LABEL: &[u8] = b"header_event\0";
const SECTION_LABEL_LEN: usize = 10;
const OPTIONS_LABEL: &[u8] = b"options  \0";
const FLYRECORD_LABEL: &[u8] = b"flyrecord\0";
const LATENCY_LABEL: &[u8] = b"latency  \0";

/// Byte range of one CPU's ring-buffer data, as listed in the flyrecord
/// section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuDataRange {
    pub cpu: u32,
    pub offset: u64,
    pub size: u64,
}

/// Parses everything in front of the CPU data. Any section that does not
/// decode is fatal; there is no partially parsed header.
pub struct HeaderParser<'a> {
    cursor: ByteCursor<'a>,
    file_len: usize,
}

impl<'a> HeaderParser<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            cursor: ByteCursor::new(data),
            file_len: data.len(),
        }
    }

    pub fn parse(mut self) -> Result<(TraceHeader, Vec<CpuDataRange>)> {
        self.read_magic()?;
        let version = self.read_version()?;

        let endianness = Endianness::from_flag(self.cursor.read_u8("file info")?);
        self.cursor.set_endianness(endianness);
        let long_size = self.cursor.read_u8("file info")? as usize;
        if !matches!(long_size, 4 | 8) {
            return Err(FtraceError::malformed(
                "file info",
                format!("unsupported long size {long_size}"),
            ));
        }
        let page_size = self.cursor.read_u32("file info")? as usize;

        self.cursor.expect(HEADER_PAGE_LABEL, "header_page")?;
        let header_page_text = self.cursor.read_text_u64("header_page")?;
        let (header_page_fields, page_header) = parse_header_page(header_page_text, long_size)?;
        if page_header.data_offset >= page_size {
            return Err(FtraceError::malformed(
                "header_page",
                format!(
                    "page data offset {} does not fit in a {page_size} byte page",
                    page_header.data_offset
                ),
            ));
        }

        self.cursor.expect(HEADER_EVENT_LABEL, "header_event")?;
        let event_info = parse_header_event(self.cursor.read_text_u64("header_event")?)?;

        let mut formats = HashMap::new();
        self.read_ftrace_formats(&mut formats)?;
        self.read_event_systems(&mut formats)?;

        let symbols = parse_kallsyms(self.cursor.read_text_u32("kallsyms")?)?;
        let printk = parse_printk(self.cursor.read_text_u32("printk")?)?;
        let cmdlines = parse_cmdlines(self.cursor.read_text_u64("cmdlines")?)?;
        let cpu_count = self.cursor.read_u32("cpus")?;

        let (options, file_type, cpu_data) = self.read_data_sections(cpu_count)?;

        debug!(
            version,
            ?endianness,
            long_size,
            page_size,
            formats = formats.len(),
            symbols = symbols.len(),
            cpu_count,
            ?file_type,
            "parsed trace header"
        );

        let type_field = TypeField::from_formats(&formats);
        let header = TraceHeader {
            version,
            endianness,
            long_size,
            page_size,
            page_header,
            header_page_fields,
            event_info,
            formats,
            symbols,
            printk,
            cmdlines,
            cpu_count,
            options,
            file_type,
            type_field,
        };
        Ok((header, cpu_data))
    }

    fn read_magic(&mut self) -> Result<()> {
        let available = self.cursor.remaining().min(TRACE_CMD_MAGIC.len());
        let got = self.cursor.peek_bytes(available).unwrap_or_default();
        if got != TRACE_CMD_MAGIC.as_slice() {
            return Err(FtraceError::InvalidMagic {
                expected: TRACE_CMD_MAGIC.to_vec(),
                got: got.to_vec(),
            });
        }
        self.cursor.read_bytes(TRACE_CMD_MAGIC.len(), "magic")?;
        Ok(())
    }

    fn read_version(&mut self) -> Result<u32> {
        let text = self.cursor.read_cstring("version")?;
        match text.trim().parse::<u32>() {
            Ok(SUPPORTED_VERSION) => Ok(SUPPORTED_VERSION),
            _ => Err(FtraceError::UnsupportedVersion(text)),
        }
    }

    fn read_ftrace_formats(&mut self, formats: &mut HashMap<u32, EventFormat>) -> Result<()> {
        let count = self.cursor.read_u32("ftrace formats")?;
        for _ in 0..count {
            let text = self.cursor.read_text_u64("ftrace formats")?;
            register(formats, parse_event_format(text, FTRACE_SYSTEM)?)?;
        }
        Ok(())
    }

    fn read_event_systems(&mut self, formats: &mut HashMap<u32, EventFormat>) -> Result<()> {
        let systems = self.cursor.read_u32("event systems")?;
        for _ in 0..systems {
            let system = self.cursor.read_cstring("event systems")?;
            let count = self.cursor.read_u32("event systems")?;
            for _ in 0..count {
                let text = self.cursor.read_text_u64("event systems")?;
                register(formats, parse_event_format(text, &system)?)?;
            }
        }
        Ok(())
    }

    fn read_data_sections(
        &mut self,
        cpu_count: u32,
    ) -> Result<(Vec<TraceOption>, FileType, Vec<CpuDataRange>)> {
        let mut options = Vec::new();
        loop {
            let label = self.cursor.read_bytes(SECTION_LABEL_LEN, "section label")?;
            match label {
                OPTIONS_LABEL => self.read_options(&mut options)?,
                FLYRECORD_LABEL => {
                    let cpu_data = self.read_flyrecord(cpu_count)?;
                    return Ok((options, FileType::FlyRecord, cpu_data));
                }
                LATENCY_LABEL => {
                    warn!("latency trace carries no per-cpu ring buffer data");
                    return Ok((options, FileType::Latency, Vec::new()));
                }
                other => {
                    return Err(FtraceError::malformed(
                        "section label",
                        format!("unknown label {:?}", String::from_utf8_lossy(other)),
                    ))
                }
            }
        }
    }

    fn read_options(&mut self, options: &mut Vec<TraceOption>) -> Result<()> {
        loop {
            let kind = self.cursor.read_u16("options")?;
            if kind == 0 {
                return Ok(());
            }
            let size = self.cursor.read_u32("options")? as usize;
            let data = self.cursor.read_bytes(size, "options")?;
            options.push(TraceOption {
                kind: OptionKind::from(kind),
                data: data.to_vec(),
            });
        }
    }

    fn read_flyrecord(&mut self, cpu_count: u32) -> Result<Vec<CpuDataRange>> {
        // 16 bytes of offset and size per cpu
        if (cpu_count as usize).saturating_mul(16) > self.cursor.remaining() {
            return Err(FtraceError::UnexpectedEof {
                section: "flyrecord",
                offset: self.cursor.position(),
            });
        }
        let mut ranges = Vec::with_capacity(cpu_count as usize);
        for cpu in 0..cpu_count {
            let offset = self.cursor.read_u64("flyrecord")?;
            let size = self.cursor.read_u64("flyrecord")?;
            let end = offset.checked_add(size);
            if end.map_or(true, |end| end > self.file_len as u64) {
                return Err(FtraceError::malformed(
                    "flyrecord",
                    format!(
                        "cpu {cpu} data [{offset}, +{size}) runs past end of file ({} bytes)",
                        self.file_len
                    ),
                ));
            }
            ranges.push(CpuDataRange { cpu, offset, size });
        }
        Ok(ranges)
    }
}

fn register(formats: &mut HashMap<u32, EventFormat>, format: EventFormat) -> Result<()> {
    if let Some(existing) = formats.get(&format.id) {
        return Err(FtraceError::malformed(
            "event format",
            format!(
                "id {} used by both {}/{} and {}/{}",
                format.id, existing.system, existing.name, format.system, format.name
            ),
        ));
    }
    formats.insert(format.id, format);
    Ok(())
}

/// What the first bytes of a file say about it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Probe {
    pub is_trace_cmd: bool,
    /// Version string following the magic, when present.
    pub version: Option<String>,
}

impl Probe {
    pub fn is_supported(&self) -> bool {
        self.is_trace_cmd
            && self
                .version
                .as_deref()
                .and_then(|version| version.parse::<u32>().ok())
                == Some(SUPPORTED_VERSION)
    }
}

/// Check the magic and version string without parsing the rest of the file.
pub fn probe(path: &Path) -> Result<Probe> {
    let mut head = Vec::with_capacity(64);
    File::open(path)?.take(64).read_to_end(&mut head)?;
    Ok(probe_bytes(&head))
}

pub fn probe_bytes(head: &[u8]) -> Probe {
    if !head.starts_with(&TRACE_CMD_MAGIC) {
        return Probe {
            is_trace_cmd: false,
            version: None,
        };
    }
    let rest = &head[TRACE_CMD_MAGIC.len()..];
    let version = rest
        .iter()
        .position(|byte| *byte == 0)
        .map(|nul| String::from_utf8_lossy(&rest[..nul]).into_owned());
    Probe {
        is_trace_cmd: true,
        version,
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]

    use super::*;
    use crate::dat::fixture::{FormatDef, TraceFileBuilder};

    fn parse(data: &[u8]) -> Result<(TraceHeader, Vec<CpuDataRange>)> {
        HeaderParser::new(data).parse()
    }

    #[test]
    fn test_header_parser__minimal_file__then_all_sections() {
        let data = TraceFileBuilder::new().cpus(2).build();
        let (header, ranges) = parse(&data).unwrap();

        assert_eq!(header.version, 6);
        assert_eq!(header.endianness, Endianness::Little);
        assert_eq!(header.long_size, 8);
        assert_eq!(header.page_size, 4096);
        assert_eq!(header.cpu_count, 2);
        assert_eq!(header.file_type, FileType::FlyRecord);
        assert_eq!(header.event_info.padding_type_len, 29);
        assert_eq!(ranges.len(), 2);
        assert!(header.format(FormatDef::SCHED_WAKEUP_ID as u32).is_some());
        assert_eq!(
            header.format(FormatDef::FUNCTION_ID as u32).unwrap().system,
            FTRACE_SYSTEM
        );
    }

    #[test]
    fn test_header_parser__every_magic_byte_mutated__then_invalid_magic() {
        let data = TraceFileBuilder::new().build();
        for i in 0..TRACE_CMD_MAGIC.len() {
            let mut mutated = data.clone();
            mutated[i] ^= 0x5a;
            let err = parse(&mutated).unwrap_err();
            assert!(
                matches!(err, FtraceError::InvalidMagic { .. }),
                "byte {i}: {err:?}"
            );
        }
    }

    #[test]
    fn test_header_parser__short_file__then_invalid_magic() {
        let err = parse(&TRACE_CMD_MAGIC[..4]).unwrap_err();
        match err {
            FtraceError::InvalidMagic { got, .. } => assert_eq!(got, TRACE_CMD_MAGIC[..4].to_vec()),
            other => panic!("expected InvalidMagic, got {other:?}"),
        }
    }

    #[test]
    fn test_header_parser__other_versions__then_unsupported() {
        for version in ["5", "7", "abc"] {
            let data = TraceFileBuilder::new().version(version).build();
            let err = parse(&data).unwrap_err();
            assert!(
                matches!(err, FtraceError::UnsupportedVersion(ref v) if v == version),
                "{version}: {err:?}"
            );
        }
    }

    #[test]
    fn test_header_parser__big_endian__then_fields_swapped() {
        let data = TraceFileBuilder::new()
            .big_endian()
            .cpus(3)
            .build();
        let (header, ranges) = parse(&data).unwrap();
        assert_eq!(header.endianness, Endianness::Big);
        assert_eq!(header.page_size, 4096);
        assert_eq!(header.cpu_count, 3);
        assert_eq!(ranges.len(), 3);
    }

    #[test]
    fn test_header_parser__options_and_tables__then_decoded() {
        let data = TraceFileBuilder::new()
            .option(5, b"Linux 6.1.0\0")
            .option(4, b"[local] global counter\0")
            .kallsyms("ffffffff81000000 T _stext\n")
            .printk("0xffffffff82000000 : \"hello\"\n")
            .cmdlines("42 bash\n")
            .build();
        let (header, _) = parse(&data).unwrap();

        assert_eq!(header.options.len(), 2);
        assert_eq!(header.options[0].kind, OptionKind::Uname);
        assert_eq!(header.options[0].as_text(), "Linux 6.1.0");
        assert_eq!(header.options[1].kind, OptionKind::TraceClock);
        assert_eq!(header.symbols.len(), 1);
        assert_eq!(header.printk.get(&0xffff_ffff_8200_0000).unwrap(), "hello");
        assert_eq!(header.cmdlines.get(&42).unwrap(), "bash");
    }

    #[test]
    fn test_header_parser__latency_label__then_no_cpu_data() {
        let data = TraceFileBuilder::new().latency().build();
        let (header, ranges) = parse(&data).unwrap();
        assert_eq!(header.file_type, FileType::Latency);
        assert!(ranges.is_empty());
    }

    #[test]
    fn test_header_parser__truncated_anywhere__then_error_not_panic() {
        let data = TraceFileBuilder::new().build();
        let header_len = TraceFileBuilder::new().header_len();
        for len in (TRACE_CMD_MAGIC.len()..header_len).step_by(7) {
            assert!(parse(&data[..len]).is_err(), "prefix of {len} bytes parsed");
        }
    }

    #[test]
    fn test_header_parser__cpu_count_beyond_file__then_unexpected_eof() {
        let builder = TraceFileBuilder::new();
        let mut data = builder.build();
        let count_at = builder.header_len() - 16 - b"flyrecord\0".len() - 4;
        assert_eq!(data[count_at..count_at + 4], 1u32.to_le_bytes());
        data[count_at..count_at + 4].copy_from_slice(&u32::MAX.to_le_bytes());

        let err = parse(&data).unwrap_err();
        assert!(matches!(
            err,
            FtraceError::UnexpectedEof {
                section: "flyrecord",
                ..
            }
        ));
    }

    #[test]
    fn test_header_parser__bad_header_event__then_malformed() {
        let data = TraceFileBuilder::new()
            .header_event("\ttype_len    :    5 bits\n\ttime_delta  :   27 bits\n")
            .build();
        let err = parse(&data).unwrap_err();
        assert!(matches!(
            err,
            FtraceError::MalformedSection {
                section: "header_event",
                ..
            }
        ));
    }

    #[test]
    fn test_probe_bytes__magic_and_version__then_supported() {
        let data = TraceFileBuilder::new().build();
        let probe = probe_bytes(&data[..32]);
        assert!(probe.is_trace_cmd);
        assert_eq!(probe.version.as_deref(), Some("6"));
        assert!(probe.is_supported());

        let other = probe_bytes(b"not a trace");
        assert!(!other.is_trace_cmd);
        assert!(!other.is_supported());
    }
}
