//! Object namespaces: the remote store the cache fronts and the local
//! cache-backing tree, behind a single trait.

pub mod localfs;
pub mod memory;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Metadata snapshot of one stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectStat {
    pub size: u64,
    pub mod_time: DateTime<Utc>,
    /// Opaque version token; changes whenever the object's content does.
    pub etag: String,
}

/// Handle to an object within a namespace at a known point in time.
///
/// The handle is a snapshot: it does not follow later mutations of the
/// object. Callers re-stat to observe a newer version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    key: String,
    stat: ObjectStat,
}

impl RemoteObject {
    pub fn new(key: impl Into<String>, stat: ObjectStat) -> Self {
        Self {
            key: key.into(),
            stat,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn size(&self) -> u64 {
        self.stat.size
    }

    pub fn mod_time(&self) -> DateTime<Utc> {
        self.stat.mod_time
    }

    pub fn etag(&self) -> &str {
        &self.stat.etag
    }
}

/// Abstract object namespace (local tree, S3-like store, in-memory mock).
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Stat an object; `None` when it does not exist.
    async fn stat(&self, key: &str) -> Result<Option<ObjectStat>>;

    /// Read a whole object; `None` when it does not exist.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Fill `buf` from `offset`, returning the number of bytes read.
    /// Short reads happen at the end of the object; a missing object reads
    /// as zero bytes.
    async fn get_range(&self, key: &str, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Create or replace an object.
    async fn put(&self, key: &str, data: &[u8]) -> Result<()>;

    /// Delete an object; deleting a missing object is not an error.
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Copy `key` from `src` into `dest` under the same key and return the
/// destination handle.
pub async fn copy_object(
    dest: &dyn ObjectStore,
    src: &dyn ObjectStore,
    key: &str,
) -> Result<RemoteObject> {
    let data = src
        .get(key)
        .await?
        .ok_or_else(|| anyhow!("source object {key:?} does not exist"))?;
    dest.put(key, &data).await?;
    let stat = dest
        .stat(key)
        .await?
        .ok_or_else(|| anyhow!("object {key:?} missing after copy"))?;
    Ok(RemoteObject::new(key, stat))
}
