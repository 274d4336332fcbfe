//! Cache configuration.

use std::path::PathBuf;

pub const DEFAULT_DOWNLOAD_CHUNK_SIZE: usize = 1024 * 1024; // 1MB

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Directory holding the cache's `data` and `meta` trees.
    ///
    /// Default: `vfscache` under the system cache directory via
    /// `dirs::cache_dir()`.
    pub root: PathBuf,

    /// Bytes fetched per downloader request.
    ///
    /// Larger chunks mean fewer round trips to the remote but coarser
    /// progress reporting to waiting readers.
    /// Default: 1MB.
    pub download_chunk_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let root = dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("vfscache");
        Self {
            root,
            download_chunk_size: DEFAULT_DOWNLOAD_CHUNK_SIZE,
        }
    }
}

impl CacheConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Default::default()
        }
    }

    pub fn download_chunk_size(self, download_chunk_size: usize) -> Self {
        Self {
            download_chunk_size,
            ..self
        }
    }
}
