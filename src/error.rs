use thiserror::Error;

/// Raised when an append-only pool runs out of 31-bit indices.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("constant pool `{pool}` is full")]
    Exhausted { pool: &'static str },
}

/// Failure of one sampling tick. Never escapes the sampler thread.
#[derive(Error, Debug)]
pub enum SampleError {
    #[error("stack source failed: {0}")]
    Source(String),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("stack source panicked")]
    Panicked,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    #[error("stack pointer {0} does not resolve in the stack pool")]
    UnknownStack(u32),

    #[error("frame {0} does not resolve in the frame pool")]
    UnknownFrame(u32),

    #[error("string {0} does not resolve in the string pool")]
    UnknownString(u32),

    #[error("counter entry at offset {0} has no preceding literal")]
    MalformedLog(usize),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("empty input")]
    Empty,

    #[error("unsupported chunk format version {0}")]
    UnsupportedVersion(u8),

    #[error("unexpected end of input at byte {0}")]
    UnexpectedEof(usize),

    #[error("varint at byte {0} does not fit in 64 bits")]
    VarintOverflow(usize),

    #[error("string {0} is not valid UTF-8")]
    InvalidUtf8(usize),

    #[error("{table} index {index} out of range (len {len})")]
    IndexOutOfRange {
        table: &'static str,
        index: u64,
        len: usize,
    },

    #[error("malformed log entry at offset {0}")]
    MalformedLog(usize),

    #[error("chunk expands to more than {0} samples")]
    TooManySamples(usize),

    #[error("{0} trailing bytes after chunk")]
    TrailingBytes(usize),
}
