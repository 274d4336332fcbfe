//! Error surface of the cache item engine.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CacheError>;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache io error: {0}")]
    Io(#[from] std::io::Error),

    /// Metadata file exists but cannot be read or decoded.
    #[error("corrupt metadata: {0}")]
    CorruptMetadata(#[source] anyhow::Error),

    #[error("failed to encode metadata: {0}")]
    EncodeMetadata(#[from] serde_json::Error),

    /// Operation on an item with no open backing file.
    #[error("item is not open")]
    NotOpen,

    /// The cache registry already holds a different open item for the name.
    #[error("item {name:?} already open in the cache")]
    AlreadyOpen { name: String },

    /// More closes than opens.
    #[error("item already closed")]
    AlreadyClosed,

    /// An engine invariant was violated; indicates a bug, not bad input.
    #[error("internal error: {0}")]
    Internal(String),

    #[error("downloader failed: {0}")]
    Download(#[source] anyhow::Error),

    #[error("upload failed: {0}")]
    Upload(#[source] anyhow::Error),

    #[error("remote operation failed: {0}")]
    Remote(#[source] anyhow::Error),
}
