//! Cache directory: path translation for logical names, the item
//! registry, and remote-object fingerprints.
//!
//! The cache owns every [`Item`] through its registry; items hold only a
//! non-owning handle back. Cached bytes live under `<root>/data` mirroring
//! the logical paths, with the per-item metadata records under
//! `<root>/meta` in the same shape, so the trees stay human-navigable.

pub(crate) mod backing;
pub mod config;
pub(crate) mod downloader;
pub mod error;
pub mod item;
pub(crate) mod meta;
pub mod ranges;

use crate::cache::config::CacheConfig;
use crate::cache::error::{CacheError, Result};
use crate::cache::item::Item;
use crate::store::localfs::LocalFsStore;
use crate::store::{ObjectStore, RemoteObject};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::fs;
use tracing::info;

pub struct Cache {
    remote: Arc<dyn ObjectStore>,
    backing: LocalFsStore,
    config: CacheConfig,
    data_root: PathBuf,
    meta_root: PathBuf,
    registry: StdMutex<HashMap<String, Arc<Item>>>,
}

impl Cache {
    /// Create the cache trees under `config.root` against `remote`.
    pub async fn new(remote: Arc<dyn ObjectStore>, config: CacheConfig) -> Result<Arc<Cache>> {
        let data_root = config.root.join("data");
        let meta_root = config.root.join("meta");
        fs::create_dir_all(&data_root).await?;
        fs::create_dir_all(&meta_root).await?;
        info!(root = %config.root.display(), "cache directory ready");
        Ok(Arc::new(Cache {
            backing: LocalFsStore::new(&data_root),
            remote,
            config,
            data_root,
            meta_root,
            registry: StdMutex::new(HashMap::new()),
        }))
    }

    /// Absolute path of the backing data file for `name`.
    pub fn to_backing_path(&self, name: &str) -> PathBuf {
        self.data_root.join(name)
    }

    /// Absolute path of the metadata file for `name`.
    pub fn to_meta_path(&self, name: &str) -> PathBuf {
        self.meta_root.join(name)
    }

    /// Ensure the parent directories for `name` exist in both trees and
    /// return the backing path.
    pub async fn mkdir(&self, name: &str) -> Result<PathBuf> {
        let backing = self.to_backing_path(name);
        if let Some(parent) = backing.parent() {
            fs::create_dir_all(parent).await?;
        }
        if let Some(parent) = self.to_meta_path(name).parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(backing)
    }

    /// Fingerprint of a remote object. Equal fingerprints mean the cached
    /// bytes are interchangeable with the remote's.
    pub fn fingerprint_of(o: &RemoteObject) -> String {
        format!("{},{},{}", o.size(), o.mod_time().to_rfc3339(), o.etag())
    }

    /// Stat `name` in the remote namespace into an object handle.
    pub async fn new_object(&self, name: &str) -> Result<Option<RemoteObject>> {
        let stat = self.remote.stat(name).await.map_err(CacheError::Remote)?;
        Ok(stat.map(|s| RemoteObject::new(name, s)))
    }

    /// Look up or create the item for `name`.
    pub async fn item(self: &Arc<Self>, name: &str) -> Arc<Item> {
        {
            let registry = self.registry.lock().unwrap();
            if let Some(item) = registry.get(name) {
                return item.clone();
            }
        }
        let item = Item::new(self, name).await;
        let mut registry = self.registry.lock().unwrap();
        // Another caller may have won the race while we loaded from disk.
        registry
            .entry(name.to_string())
            .or_insert_with(|| item)
            .clone()
    }

    /// Swap the registry entry for `name`, returning the previous item.
    pub(crate) fn put(&self, name: &str, item: Arc<Item>) -> Option<Arc<Item>> {
        self.registry.lock().unwrap().insert(name.to_string(), item)
    }

    /// Drop `name` from the registry and wipe its cached state.
    pub async fn remove(self: &Arc<Self>, name: &str, reason: &str) -> Result<()> {
        let item = { self.registry.lock().unwrap().remove(name) };
        match item {
            Some(item) => item.remove(reason).await,
            None => Ok(()),
        }
    }

    pub(crate) fn remote_store(&self) -> &Arc<dyn ObjectStore> {
        &self.remote
    }

    pub(crate) fn backing_store(&self) -> &LocalFsStore {
        &self.backing
    }

    pub(crate) fn config(&self) -> &CacheConfig {
        &self.config
    }
}
