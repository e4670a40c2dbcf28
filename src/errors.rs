use std::path::PathBuf;
use thiserror::Error;

/// Everything a capture file operation can fail with.
#[derive(Debug, Error)]
pub enum CaptureFileError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("capture file {0:?} is already open for write")]
    AlreadyOpen(PathBuf),

    #[error("capture file {0:?} is not open")]
    NotOpen(PathBuf),

    #[error("capture file {0:?} is not open for write")]
    NotOpenForWrite(PathBuf),

    #[error("invalid capture file: {0}")]
    Invalid(String),

    #[error("record number {0} is out of range")]
    OutOfRange(u64),
}

pub type Result<T> = std::result::Result<T, CaptureFileError>;
