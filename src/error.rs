//! Error types for data cube operations

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for cube, pool and cropping operations
#[derive(Error, Debug)]
pub enum CubeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt file {path}: {reason}")]
    CorruptFile { path: PathBuf, reason: String },

    #[error("Unsupported file: {0}")]
    UnsupportedFile(String),

    #[error("Invalid channel: {0}")]
    InvalidChannel(String),

    #[error("Out of range: {0}")]
    OutOfRange(String),

    #[error("Empty data cube: {0}")]
    EmptyCube(String),

    #[error("Null image cannot be cropped")]
    NullImage,

    #[error("Corrupt image: {0}")]
    CorruptImage(String),

    #[error("Invalid bounds: {0}")]
    InvalidBounds(String),

    #[error("Data cube is closed")]
    Closed,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Decompression error: {0}")]
    Decompression(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Operation cancelled")]
    Cancelled,
}

/// Specialized Result type for cube operations
pub type Result<T> = std::result::Result<T, CubeError>;

#[cfg(unix)]
const TOO_MANY_OPEN_FILES: [i32; 2] = [24, 23]; // EMFILE, ENFILE
#[cfg(windows)]
const TOO_MANY_OPEN_FILES: [i32; 1] = [4]; // ERROR_TOO_MANY_OPEN_FILES
#[cfg(not(any(unix, windows)))]
const TOO_MANY_OPEN_FILES: [i32; 0] = [];

impl CubeError {
    /// Shorthand for a corrupt-source error on `path`
    pub fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        CubeError::CorruptFile {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// True if the operating system refused to hand out another file descriptor
    pub fn is_too_many_open_files(&self) -> bool {
        match self {
            CubeError::Io(err) => err
                .raw_os_error()
                .is_some_and(|code| TOO_MANY_OPEN_FILES.contains(&code)),
            _ => false,
        }
    }

    /// True for step / raster-position range errors
    pub fn is_range_error(&self) -> bool {
        matches!(self, CubeError::OutOfRange(_))
    }
}

impl From<bincode::Error> for CubeError {
    fn from(err: bincode::Error) -> Self {
        CubeError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for CubeError {
    fn from(err: serde_json::Error) -> Self {
        CubeError::Serialization(err.to_string())
    }
}
