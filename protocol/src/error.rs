use thiserror::Error;

/// Errors raised while reading or writing the binary wire format.
///
/// Every read is bounds-checked against the buffer it is given, so malformed
/// input surfaces as one of these instead of a panic.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("buffer truncated: need {needed} bytes at offset {offset}, have {available}")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("invalid length prefix {length} at offset {offset}")]
    InvalidLength { offset: usize, length: i32 },

    #[error("string field at offset {offset} is not valid UTF-8")]
    InvalidUtf8 { offset: usize },

    #[error("corrupt object envelope: {0}")]
    Corrupt(String),

    #[error("unknown message tag {0}")]
    UnknownTag(u8),

    #[error("empty packet")]
    EmptyPacket,

    #[error("object of {0} bytes does not fit the 32-bit length prefix")]
    TooLarge(usize),
}

pub type Result<T> = std::result::Result<T, CodecError>;
