// Error types for opening and decoding trace-cmd data files

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FtraceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid magic bytes: expected {expected:?}, got {got:?}")]
    InvalidMagic { expected: Vec<u8>, got: Vec<u8> },

    #[error("Unsupported version: {0}")]
    UnsupportedVersion(String),

    #[error("Malformed {section} section: {reason}")]
    MalformedSection {
        section: &'static str,
        reason: String,
    },

    #[error("Unexpected end of file in {section} section at offset {offset}")]
    UnexpectedEof { section: &'static str, offset: usize },

    #[error("Corrupt page on cpu {cpu} at offset {page_offset}: record at {record_offset}: {reason}")]
    CorruptPage {
        cpu: u32,
        page_offset: u64,
        record_offset: u64,
        reason: String,
    },

    #[error("Unknown event format id: {format_id}")]
    UnknownEventFormat { format_id: u32 },
}

pub type Result<T> = std::result::Result<T, FtraceError>;

impl FtraceError {
    pub fn malformed(section: &'static str, reason: impl Into<String>) -> Self {
        Self::MalformedSection {
            section,
            reason: reason.into(),
        }
    }

    /// Errors raised before any event is produced; a trace that hits one of
    /// these cannot be opened.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            FtraceError::CorruptPage { .. } | FtraceError::UnknownEventFormat { .. }
        )
    }
}
