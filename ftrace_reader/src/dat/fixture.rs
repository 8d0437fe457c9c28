// Byte-level builder for synthetic trace-cmd version 6 files
//
// Standard library only, so integration tests can include this file with
// `#[path]` as well as the unit tests inside the crate.

#![allow(dead_code)]

use std::collections::BTreeMap;

pub const PAGE_SIZE: u32 = 4096;
pub const MAGIC: [u8; 10] = [0x17, 0x08, 0x44, b't', b'r', b'a', b'c', b'i', b'n', b'g'];

const TYPE_LEN_BITS: u32 = 5;
const TIME_DELTA_BITS: u32 = 27;
const PADDING: u32 = 29;
const TIME_EXTEND: u32 = 30;
const TIME_STAMP: u32 = 31;
const DATA_MAX_TYPE_LEN: u32 = 28;

pub const HEADER_EVENT_TEXT: &str = "# compressed entry header\n\
\ttype_len    :    5 bits\n\
\ttime_delta  :   27 bits\n\
\tarray       :   32 bits\n\
\n\
\tpadding     : type == 29\n\
\ttime_extend : type == 30\n\
\ttime_stamp : type == 31\n\
\tdata max type_len  == 28\n";

const COMMON_FIELDS: &str = "\tfield:unsigned short common_type;\toffset:0;\tsize:2;\tsigned:0;\n\
\tfield:unsigned char common_flags;\toffset:2;\tsize:1;\tsigned:0;\n\
\tfield:unsigned char common_preempt_count;\toffset:3;\tsize:1;\tsigned:0;\n\
\tfield:int common_pid;\toffset:4;\tsize:4;\tsigned:1;\n\n";

/// Event formats the default builder registers.
pub struct FormatDef;

impl FormatDef {
    pub const FUNCTION_ID: u16 = 1;
    pub const PRINT_ID: u16 = 5;
    pub const SCHED_WAKEUP_ID: u16 = 316;
    pub const SAMPLE_ID: u16 = 400;

    pub fn function() -> String {
        format!(
            "name: function\nID: {}\nformat:\n{COMMON_FIELDS}\
\tfield:unsigned long ip;\toffset:8;\tsize:8;\tsigned:0;\n\
\tfield:unsigned long parent_ip;\toffset:16;\tsize:8;\tsigned:0;\n\n\
print fmt: \" %ps <-- %ps\", (void *)REC->ip, (void *)REC->parent_ip\n",
            Self::FUNCTION_ID
        )
    }

    pub fn print() -> String {
        format!(
            "name: print\nID: {}\nformat:\n{COMMON_FIELDS}\
\tfield:unsigned long ip;\toffset:8;\tsize:8;\tsigned:0;\n\
\tfield:char buf[];\toffset:16;\tsize:0;\tsigned:1;\n\n\
print fmt: \"%ps: %s\", (void *)REC->ip, REC->buf\n",
            Self::PRINT_ID
        )
    }

    pub fn sched_wakeup() -> String {
        format!(
            "name: sched_wakeup\nID: {}\nformat:\n{COMMON_FIELDS}\
\tfield:char comm[16];\toffset:8;\tsize:16;\tsigned:1;\n\
\tfield:pid_t pid;\toffset:24;\tsize:4;\tsigned:1;\n\
\tfield:int prio;\toffset:28;\tsize:4;\tsigned:1;\n\
\tfield:int target_cpu;\toffset:32;\tsize:4;\tsigned:1;\n\n\
print fmt: \"comm=%s pid=%d prio=%d target_cpu=%03d\", REC->comm, REC->pid, REC->prio, REC->target_cpu\n",
            Self::SCHED_WAKEUP_ID
        )
    }

    /// Exercises the less common field shapes.
    pub fn sample() -> String {
        format!(
            "name: sample\nID: {}\nformat:\n{COMMON_FIELDS}\
\tfield:__data_loc char[] msg;\toffset:8;\tsize:4;\tsigned:1;\n\
\tfield:u8 raw[3];\toffset:12;\tsize:3;\tsigned:0;\n\
\tfield:s8 level;\toffset:15;\tsize:1;\tsigned:1;\n\
\tfield:const char * fmt;\toffset:16;\tsize:8;\tsigned:0;\n\
\tfield:short delta;\toffset:24;\tsize:2;\tsigned:1;\n\
\tfield:__rel_loc u8[] blob;\toffset:28;\tsize:4;\tsigned:0;\n\n\
print fmt: \"msg=%s\", __get_str(msg)\n",
            Self::SAMPLE_ID
        )
    }
}

fn put_u16(out: &mut Vec<u8>, value: u16, big_endian: bool) {
    if big_endian {
        out.extend_from_slice(&value.to_be_bytes());
    } else {
        out.extend_from_slice(&value.to_le_bytes());
    }
}

fn put_u32(out: &mut Vec<u8>, value: u32, big_endian: bool) {
    if big_endian {
        out.extend_from_slice(&value.to_be_bytes());
    } else {
        out.extend_from_slice(&value.to_le_bytes());
    }
}

fn put_u64(out: &mut Vec<u8>, value: u64, big_endian: bool) {
    if big_endian {
        out.extend_from_slice(&value.to_be_bytes());
    } else {
        out.extend_from_slice(&value.to_le_bytes());
    }
}

/// Event payload writer. Starts with the 8-byte common header.
pub struct Payload {
    bytes: Vec<u8>,
    big_endian: bool,
}

impl Payload {
    pub fn new(format_id: u16, pid: i32) -> Self {
        Self::with_endianness(format_id, pid, false)
    }

    pub fn with_endianness(format_id: u16, pid: i32, big_endian: bool) -> Self {
        let mut bytes = Vec::new();
        put_u16(&mut bytes, format_id, big_endian);
        bytes.push(0);
        bytes.push(0);
        put_u32(&mut bytes, pid as u32, big_endian);
        Self { bytes, big_endian }
    }

    pub fn u8(mut self, value: u8) -> Self {
        self.bytes.push(value);
        self
    }

    pub fn u16(mut self, value: u16) -> Self {
        put_u16(&mut self.bytes, value, self.big_endian);
        self
    }

    pub fn u32(mut self, value: u32) -> Self {
        put_u32(&mut self.bytes, value, self.big_endian);
        self
    }

    pub fn i32(self, value: i32) -> Self {
        self.u32(value as u32)
    }

    pub fn u64(mut self, value: u64) -> Self {
        put_u64(&mut self.bytes, value, self.big_endian);
        self
    }

    pub fn bytes(mut self, value: &[u8]) -> Self {
        self.bytes.extend_from_slice(value);
        self
    }

    /// NUL-padded fixed-width string.
    pub fn fixed_str(mut self, value: &str, width: usize) -> Self {
        let mut field = value.as_bytes().to_vec();
        field.resize(width, 0);
        self.bytes.extend_from_slice(&field);
        self
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn build(self) -> Vec<u8> {
        self.bytes
    }
}

pub fn function_payload(pid: i32, ip: u64, parent_ip: u64) -> Vec<u8> {
    Payload::new(FormatDef::FUNCTION_ID, pid).u64(ip).u64(parent_ip).build()
}

pub fn sched_wakeup_payload(pid: i32, comm: &str, prio: i32, target_cpu: i32) -> Vec<u8> {
    Payload::new(FormatDef::SCHED_WAKEUP_ID, pid)
        .fixed_str(comm, 16)
        .i32(pid)
        .i32(prio)
        .i32(target_cpu)
        .build()
}

enum Record {
    Data { delta: u32, payload: Vec<u8>, long_form: bool },
    TimeExtend { delta: u64 },
    TimeStamp { timestamp: u64 },
    Padding { delta: u32, length: u32 },
    Raw(Vec<u8>),
}

/// One ring-buffer page: header timestamp plus encoded records.
pub struct PageBuilder {
    timestamp: u64,
    records: Vec<Record>,
    commit_flags: u64,
    commit_override: Option<u64>,
}

impl PageBuilder {
    pub fn new(timestamp: u64) -> Self {
        Self {
            timestamp,
            records: Vec::new(),
            commit_flags: 0,
            commit_override: None,
        }
    }

    /// Data record `delta` ns after the previous record.
    pub fn event(mut self, delta: u32, payload: Vec<u8>) -> Self {
        self.records.push(Record::Data {
            delta,
            payload,
            long_form: false,
        });
        self
    }

    /// Data record with an explicit length word even when the payload is
    /// small enough for the short form.
    pub fn long_event(mut self, delta: u32, payload: Vec<u8>) -> Self {
        self.records.push(Record::Data {
            delta,
            payload,
            long_form: true,
        });
        self
    }

    pub fn time_extend(mut self, delta: u64) -> Self {
        self.records.push(Record::TimeExtend { delta });
        self
    }

    pub fn time_stamp(mut self, timestamp: u64) -> Self {
        self.records.push(Record::TimeStamp { timestamp });
        self
    }

    /// Padding record whose length word is `length` (0 means rest of page).
    pub fn padding(mut self, delta: u32, length: u32) -> Self {
        self.records.push(Record::Padding { delta, length });
        self
    }

    /// Bytes copied into the page as they are.
    pub fn raw(mut self, bytes: Vec<u8>) -> Self {
        self.records.push(Record::Raw(bytes));
        self
    }

    pub fn commit_flags(mut self, flags: u64) -> Self {
        self.commit_flags = flags;
        self
    }

    /// Commit word written as given instead of the encoded data length.
    pub fn commit(mut self, commit: u64) -> Self {
        self.commit_override = Some(commit);
        self
    }

    fn header_word(type_len: u32, delta: u32, big_endian: bool) -> u32 {
        let delta = delta & ((1 << TIME_DELTA_BITS) - 1);
        if big_endian {
            (type_len << TIME_DELTA_BITS) | delta
        } else {
            (delta << TYPE_LEN_BITS) | type_len
        }
    }

    pub fn encode_records(&self, big_endian: bool) -> Vec<u8> {
        let mut data = Vec::new();
        for record in &self.records {
            match record {
                Record::Data {
                    delta,
                    payload,
                    long_form,
                } => {
                    let aligned = (payload.len() + 3) & !3;
                    let words = (aligned / 4) as u32;
                    if !*long_form && words > 0 && words <= DATA_MAX_TYPE_LEN {
                        put_u32(&mut data, Self::header_word(words, *delta, big_endian), big_endian);
                    } else {
                        put_u32(&mut data, Self::header_word(0, *delta, big_endian), big_endian);
                        put_u32(&mut data, payload.len() as u32 + 4, big_endian);
                    }
                    data.extend_from_slice(payload);
                    data.resize(data.len() + (aligned - payload.len()), 0);
                }
                Record::TimeExtend { delta } => {
                    let low = (*delta & ((1 << TIME_DELTA_BITS) - 1)) as u32;
                    let high = (*delta >> TIME_DELTA_BITS) as u32;
                    put_u32(&mut data, Self::header_word(TIME_EXTEND, low, big_endian), big_endian);
                    put_u32(&mut data, high, big_endian);
                }
                Record::TimeStamp { timestamp } => {
                    let low = (*timestamp & ((1 << TIME_DELTA_BITS) - 1)) as u32;
                    let high = (*timestamp >> TIME_DELTA_BITS) as u32;
                    put_u32(&mut data, Self::header_word(TIME_STAMP, low, big_endian), big_endian);
                    put_u32(&mut data, high, big_endian);
                }
                Record::Padding { delta, length } => {
                    put_u32(&mut data, Self::header_word(PADDING, *delta, big_endian), big_endian);
                    put_u32(&mut data, *length, big_endian);
                    data.resize(data.len() + (*length as usize).saturating_sub(4), 0);
                }
                Record::Raw(bytes) => data.extend_from_slice(bytes),
            }
        }
        data
    }

    pub fn build(&self, page_size: usize, long_size: usize, big_endian: bool) -> Vec<u8> {
        let data = self.encode_records(big_endian);
        let mut page = Vec::with_capacity(page_size);
        put_u64(&mut page, self.timestamp, big_endian);
        let commit = self
            .commit_override
            .unwrap_or(data.len() as u64 | self.commit_flags);
        if long_size == 8 {
            put_u64(&mut page, commit, big_endian);
        } else {
            put_u32(&mut page, commit as u32, big_endian);
        }
        page.extend_from_slice(&data);
        assert!(page.len() <= page_size, "page overflow: {} bytes", page.len());
        page.resize(page_size, 0);
        page
    }
}

/// Whole-file builder. Defaults: version 6, little endian, 8-byte longs,
/// 4096-byte pages, one CPU with no data, and the formats in `FormatDef`.
pub struct TraceFileBuilder {
    version: String,
    big_endian: bool,
    long_size: u8,
    page_size: u32,
    header_page: Option<String>,
    header_event: String,
    ftrace_formats: Vec<String>,
    systems: Vec<(String, Vec<String>)>,
    kallsyms: String,
    printk: String,
    cmdlines: String,
    cpus: u32,
    options: Vec<(u16, Vec<u8>)>,
    latency: bool,
    pages: BTreeMap<u32, Vec<PageBuilder>>,
    cpu_offsets: BTreeMap<u32, u64>,
    truncate_cpu_data: BTreeMap<u32, u64>,
}

impl Default for TraceFileBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceFileBuilder {
    pub fn new() -> Self {
        Self {
            version: "6".to_string(),
            big_endian: false,
            long_size: 8,
            page_size: PAGE_SIZE,
            header_page: None,
            header_event: HEADER_EVENT_TEXT.to_string(),
            ftrace_formats: vec![FormatDef::function(), FormatDef::print()],
            systems: vec![
                ("sched".to_string(), vec![FormatDef::sched_wakeup()]),
                ("test".to_string(), vec![FormatDef::sample()]),
            ],
            kallsyms: String::new(),
            printk: String::new(),
            cmdlines: String::new(),
            cpus: 1,
            options: Vec::new(),
            latency: false,
            pages: BTreeMap::new(),
            cpu_offsets: BTreeMap::new(),
            truncate_cpu_data: BTreeMap::new(),
        }
    }

    pub fn version(mut self, version: &str) -> Self {
        self.version = version.to_string();
        self
    }

    pub fn big_endian(mut self) -> Self {
        self.big_endian = true;
        self
    }

    pub fn long_size(mut self, long_size: u8) -> Self {
        self.long_size = long_size;
        self
    }

    pub fn page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn header_page(mut self, text: &str) -> Self {
        self.header_page = Some(text.to_string());
        self
    }

    pub fn header_event(mut self, text: &str) -> Self {
        self.header_event = text.to_string();
        self
    }

    pub fn system(mut self, name: &str, formats: Vec<String>) -> Self {
        self.systems.push((name.to_string(), formats));
        self
    }

    pub fn kallsyms(mut self, text: &str) -> Self {
        self.kallsyms = text.to_string();
        self
    }

    pub fn printk(mut self, text: &str) -> Self {
        self.printk = text.to_string();
        self
    }

    pub fn cmdlines(mut self, text: &str) -> Self {
        self.cmdlines = text.to_string();
        self
    }

    pub fn cpus(mut self, cpus: u32) -> Self {
        self.cpus = cpus;
        self
    }

    pub fn option(mut self, kind: u16, data: &[u8]) -> Self {
        self.options.push((kind, data.to_vec()));
        self
    }

    pub fn latency(mut self) -> Self {
        self.latency = true;
        self
    }

    /// Append a page to `cpu`'s section, raising the CPU count if needed.
    pub fn page(mut self, cpu: u32, page: PageBuilder) -> Self {
        self.cpus = self.cpus.max(cpu + 1);
        self.pages.entry(cpu).or_default().push(page);
        self
    }

    /// Place `cpu`'s section at an absolute file offset.
    pub fn cpu_offset(mut self, cpu: u32, offset: u64) -> Self {
        self.cpu_offsets.insert(cpu, offset);
        self
    }

    /// Declare `cpu`'s section `size` bytes long regardless of its pages.
    pub fn cpu_size(mut self, cpu: u32, size: u64) -> Self {
        self.truncate_cpu_data.insert(cpu, size);
        self
    }

    fn default_header_page(&self) -> String {
        let long = self.long_size as usize;
        format!(
            "\tfield: u64 timestamp;\toffset:0;\tsize:8;\tsigned:0;\n\
\tfield: local_t commit;\toffset:8;\tsize:{long};\tsigned:1;\n\
\tfield: int overwrite;\toffset:8;\tsize:1;\tsigned:1;\n\
\tfield: char data;\toffset:{};\tsize:{};\tsigned:1;\n",
            8 + long,
            self.page_size as usize - 8 - long
        )
    }

    fn header_bytes(&self) -> Vec<u8> {
        let be = self.big_endian;
        let mut out = Vec::new();
        out.extend_from_slice(&MAGIC);
        out.extend_from_slice(self.version.as_bytes());
        out.push(0);
        out.push(u8::from(be));
        out.push(self.long_size);
        put_u32(&mut out, self.page_size, be);

        let header_page = self
            .header_page
            .clone()
            .unwrap_or_else(|| self.default_header_page());
        out.extend_from_slice(b"header_page\0");
        put_u64(&mut out, header_page.len() as u64, be);
        out.extend_from_slice(header_page.as_bytes());

        out.extend_from_slice(b"header_event\0");
        put_u64(&mut out, self.header_event.len() as u64, be);
        out.extend_from_slice(self.header_event.as_bytes());

        put_u32(&mut out, self.ftrace_formats.len() as u32, be);
        for format in &self.ftrace_formats {
            put_u64(&mut out, format.len() as u64, be);
            out.extend_from_slice(format.as_bytes());
        }

        put_u32(&mut out, self.systems.len() as u32, be);
        for (name, formats) in &self.systems {
            out.extend_from_slice(name.as_bytes());
            out.push(0);
            put_u32(&mut out, formats.len() as u32, be);
            for format in formats {
                put_u64(&mut out, format.len() as u64, be);
                out.extend_from_slice(format.as_bytes());
            }
        }

        put_u32(&mut out, self.kallsyms.len() as u32, be);
        out.extend_from_slice(self.kallsyms.as_bytes());
        put_u32(&mut out, self.printk.len() as u32, be);
        out.extend_from_slice(self.printk.as_bytes());
        put_u64(&mut out, self.cmdlines.len() as u64, be);
        out.extend_from_slice(self.cmdlines.as_bytes());

        put_u32(&mut out, self.cpus, be);

        if !self.options.is_empty() {
            out.extend_from_slice(b"options  \0");
            for (kind, data) in &self.options {
                put_u16(&mut out, *kind, be);
                put_u32(&mut out, data.len() as u32, be);
                out.extend_from_slice(data);
            }
            put_u16(&mut out, 0, be);
        }

        if self.latency {
            out.extend_from_slice(b"latency  \0");
        } else {
            out.extend_from_slice(b"flyrecord\0");
        }
        out
    }

    /// Length of everything before the first CPU's page data.
    pub fn header_len(&self) -> usize {
        let flyrecord = if self.latency { 0 } else { 16 * self.cpus as usize };
        self.header_bytes().len() + flyrecord
    }

    pub fn build(&self) -> Vec<u8> {
        let be = self.big_endian;
        let page_size = self.page_size as usize;
        let mut out = self.header_bytes();
        if self.latency {
            return out;
        }

        let mut sections = Vec::new();
        let mut next = self.header_len().div_ceil(page_size) * page_size;
        for cpu in 0..self.cpus {
            let data: Vec<u8> = self
                .pages
                .get(&cpu)
                .map(|pages| {
                    pages
                        .iter()
                        .flat_map(|page| page.build(page_size, self.long_size as usize, be))
                        .collect()
                })
                .unwrap_or_default();
            let offset = self.cpu_offsets.get(&cpu).copied().unwrap_or(next as u64);
            let size = self
                .truncate_cpu_data
                .get(&cpu)
                .copied()
                .unwrap_or(data.len() as u64);
            next = next.max(offset as usize + data.len());
            next = next.div_ceil(page_size) * page_size;
            sections.push((offset, size, data));
        }

        for (offset, size, _) in &sections {
            put_u64(&mut out, *offset, be);
            put_u64(&mut out, *size, be);
        }
        for (offset, _, data) in &sections {
            let offset = *offset as usize;
            if out.len() < offset + data.len() {
                out.resize(offset + data.len(), 0);
            }
            out[offset..offset + data.len()].copy_from_slice(data);
        }
        out
    }
}
