//! In-memory namespace for unit tests.

use crate::store::{ObjectStat, ObjectStore};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

struct Entry {
    data: Vec<u8>,
    mod_time: DateTime<Utc>,
    version: u64,
}

/// HashMap-backed object store. Every `put` bumps a version counter that
/// becomes the etag, so rewriting an object changes its fingerprint even
/// within the same clock tick.
#[derive(Clone, Default)]
pub struct MemoryStore {
    map: Arc<RwLock<HashMap<String, Entry>>>,
    version: Arc<AtomicU64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn stat(&self, key: &str) -> Result<Option<ObjectStat>> {
        let guard = self.map.read().await;
        Ok(guard.get(key).map(|e| ObjectStat {
            size: e.data.len() as u64,
            mod_time: e.mod_time,
            etag: format!("v{}", e.version),
        }))
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let guard = self.map.read().await;
        Ok(guard.get(key).map(|e| e.data.clone()))
    }

    async fn get_range(&self, key: &str, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let guard = self.map.read().await;
        let Some(entry) = guard.get(key) else {
            return Ok(0);
        };
        let start = (offset as usize).min(entry.data.len());
        let end = (start + buf.len()).min(entry.data.len());
        buf[..end - start].copy_from_slice(&entry.data[start..end]);
        Ok(end - start)
    }

    async fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        let mut guard = self.map.write().await;
        guard.insert(
            key.to_string(),
            Entry {
                data: data.to_vec(),
                mod_time: Utc::now(),
                version: self.version.fetch_add(1, Ordering::Relaxed),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut guard = self.map.write().await;
        guard.remove(key);
        Ok(())
    }
}
