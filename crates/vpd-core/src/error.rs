use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, VpdError>;

#[derive(Debug, Error)]
pub enum VpdError {
    /// Bad argument, rejected before any I/O.
    #[error("invalid argument: {0}")]
    Invalid(String),

    /// Malformed command-line style input (key=value, pad length, base64 file).
    #[error("syntax error: {0}")]
    Syntax(String),

    #[error("out of space: {0}")]
    Overflow(String),

    /// Malformed or truncated bytes in an image or stream.
    #[error("decode error: {0}")]
    Decode(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{context} ({path}): {source}")]
    SystemIo {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("flash read failed: {0}")]
    FlashRead(String),

    #[error("flash write failed: {0}")]
    FlashWrite(String),

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),
}

impl VpdError {
    pub fn io(context: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        VpdError::SystemIo {
            context,
            path: path.into(),
            source,
        }
    }

    /// Process exit status for this error category.
    pub fn exit_code(&self) -> i32 {
        match self {
            VpdError::Invalid(_) => 2,
            VpdError::Syntax(_) => 3,
            VpdError::Overflow(_) => 4,
            VpdError::Decode(_) => 5,
            VpdError::NotFound(_) => 6,
            VpdError::SystemIo { .. } => 7,
            VpdError::FlashRead(_) => 8,
            VpdError::FlashWrite(_) => 9,
            VpdError::UnsupportedFormat(_) => 10,
        }
    }
}
