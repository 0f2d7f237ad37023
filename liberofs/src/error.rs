use thiserror::Error;

/// Errors surfaced by the public API.
///
/// A corrupt structure aborts the one operation that hit it; the mounted
/// filesystem stays usable for unrelated lookups.
#[derive(Debug, Error)]
pub enum Error {
    #[error("device read failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt image: {0}")]
    CorruptImage(String),

    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),

    #[error("unsupported data layout {0}")]
    UnsupportedLayout(u8),

    #[error("path not found: {0}")]
    NotFound(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("not a regular file: {0}")]
    NotAFile(String),

    #[error("decompression failed: {0}")]
    DecompressionFailed(String),
}

pub type Result<T> = core::result::Result<T, Error>;
