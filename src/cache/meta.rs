//! Persisted per-item metadata record.
//!
//! One JSON file per cache item, written next to the backing file's tree.
//! The encoding is self-describing and stable: unknown fields are ignored
//! on decode so older versions can read newer files, while a missing
//! mandatory field classifies the file as corrupt.

use crate::cache::error::{CacheError, Result};
use crate::cache::ranges::RangeSet;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemMeta {
    /// Last time any operation touched the item.
    pub atime: DateTime<Utc>,
    /// Authoritative logical size of the cached file.
    pub size: u64,
    /// Which byte ranges of the backing file hold valid data.
    pub ranges: RangeSet,
    /// Fingerprint of the remote object the cached data corresponds to;
    /// empty for items created locally that were never uploaded.
    pub fingerprint: String,
}

impl ItemMeta {
    pub fn fresh() -> Self {
        Self {
            atime: Utc::now(),
            size: 0,
            ranges: RangeSet::new(),
            fingerprint: String::new(),
        }
    }
}

/// Read the metadata record at `path`.
///
/// `Ok(None)` only when the file is absent; a file that exists but cannot
/// be read or decoded is reported as [`CacheError::CorruptMetadata`].
pub(crate) async fn load(path: &Path) -> Result<Option<ItemMeta>> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(CacheError::CorruptMetadata(
                anyhow::Error::new(e).context("failed to read metadata"),
            ))
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(meta) => Ok(Some(meta)),
        Err(e) => Err(CacheError::CorruptMetadata(
            anyhow::Error::new(e).context("failed to decode metadata"),
        )),
    }
}

/// Write the metadata record to `path`, create-or-truncate. A partial
/// write left behind by a crash is caught by `load`'s corruption path.
pub(crate) async fn save(meta: &ItemMeta, path: &Path) -> Result<()> {
    let buf = serde_json::to_vec_pretty(meta)?;
    tokio::fs::write(path, buf).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ranges::ByteRange;

    fn sample() -> ItemMeta {
        let mut meta = ItemMeta::fresh();
        meta.size = 100;
        meta.ranges.insert(ByteRange::new(0, 10));
        meta.ranges.insert(ByteRange::new(50, 25));
        meta.fingerprint = "100,2024-01-01T00:00:00Z,v7".to_string();
        meta
    }

    #[tokio::test]
    async fn test_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("item.meta");
        let meta = sample();

        save(&meta, &path).await.unwrap();
        let loaded = load(&path).await.unwrap().unwrap();
        assert_eq!(loaded.size, meta.size);
        assert_eq!(loaded.ranges, meta.ranges);
        assert_eq!(loaded.fingerprint, meta.fingerprint);
        assert_eq!(loaded.atime, meta.atime);
    }

    #[tokio::test]
    async fn test_absent_is_none() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(load(&tmp.path().join("nope")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_malformed_is_corrupt() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("item.meta");
        tokio::fs::write(&path, b"{ not json").await.unwrap();
        assert!(matches!(
            load(&path).await,
            Err(CacheError::CorruptMetadata(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_fields_ignored_missing_fields_corrupt() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("item.meta");

        let with_extra = r#"{
            "atime": "2024-01-01T00:00:00Z",
            "size": 5,
            "ranges": [{"pos": 0, "len": 5}],
            "fingerprint": "",
            "generation": 3
        }"#;
        tokio::fs::write(&path, with_extra).await.unwrap();
        let meta = load(&path).await.unwrap().unwrap();
        assert_eq!(meta.size, 5);
        assert!(meta.ranges.present(ByteRange::new(0, 5)));

        let missing_size = r#"{"atime": "2024-01-01T00:00:00Z", "ranges": [], "fingerprint": ""}"#;
        tokio::fs::write(&path, missing_size).await.unwrap();
        assert!(matches!(
            load(&path).await,
            Err(CacheError::CorruptMetadata(_))
        ));
    }
}
