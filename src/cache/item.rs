//! Per-file cache item: the state machine coupling present byte ranges,
//! the sparse backing file, the on-demand downloader, and persisted
//! metadata.
//!
//! All mutable state sits behind one async mutex. The lock is dropped
//! around everything that can block for real: backing-file I/O, downloader
//! waits, downloader teardown, and the caller-supplied store callback. The
//! downloader reports progress back through [`Item::download_written`],
//! which takes the lock itself, so holding the lock while waiting on the
//! downloader would deadlock.

use crate::cache::backing::{self, BackingFile};
use crate::cache::downloader::Downloader;
use crate::cache::error::{CacheError, Result};
use crate::cache::meta::{self, ItemMeta};
use crate::cache::ranges::{ByteRange, RangeSet};
use crate::cache::Cache;
use crate::store::{copy_object, RemoteObject};
use chrono::{DateTime, Utc};
use std::io;
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tracing::{debug, error, info, trace, warn};

/// Called back with the uploaded remote object after a dirty close.
pub type StoreFn = Box<dyn FnOnce(Option<RemoteObject>) + Send>;

pub struct Item {
    /// Non-owning back-reference; the cache is the sole owner of items.
    cache: Weak<Cache>,
    state: Mutex<ItemState>,
}

struct ItemState {
    name: String,
    opens: u32,
    dirty: bool,
    fd: Option<BackingFile>,
    downloader: Option<Arc<Downloader>>,
    remote: Option<RemoteObject>,
    meta: ItemMeta,
}

enum EnsureStep {
    Present,
    Stale(Arc<Downloader>),
    Ready(Arc<Downloader>, ByteRange),
}

impl Item {
    /// Build the item for `name`, adopting on-disk state where it is
    /// consistent and wiping it where it is not.
    pub(crate) async fn new(cache: &Arc<Cache>, name: &str) -> Arc<Item> {
        let item = Arc::new(Item {
            cache: Arc::downgrade(cache),
            state: Mutex::new(ItemState {
                name: name.to_string(),
                opens: 0,
                dirty: false,
                fd: None,
                downloader: None,
                remote: None,
                meta: ItemMeta::fresh(),
            }),
        });

        let mut state = item.state.lock().await;
        let stat = tokio::fs::metadata(cache.to_backing_path(name)).await;
        match &stat {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Self::remove_meta(cache, name, "cache file doesn't exist").await;
            }
            Err(e) => {
                Self::wipe(cache, &mut state, &format!("failed to stat cache file: {e}")).await;
            }
        }

        match meta::load(&cache.to_meta_path(name)).await {
            Ok(Some(loaded)) => state.meta = loaded,
            Ok(None) => {
                Self::remove_file(cache, name, "metadata doesn't exist").await;
            }
            Err(e) => {
                Self::wipe(cache, &mut state, &format!("failed to load metadata: {e}")).await;
            }
        }

        if let Ok(fi) = &stat {
            state.meta.size = fi.len();
        }
        drop(state);
        item
    }

    fn cache(&self) -> Result<Arc<Cache>> {
        self.cache
            .upgrade()
            .ok_or_else(|| CacheError::Internal("cache dropped while item in use".into()))
    }

    /// Open the item against the remote object it caches, `None` when the
    /// file is being created locally.
    pub async fn open(self: &Arc<Self>, remote: Option<RemoteObject>) -> Result<()> {
        let cache = self.cache()?;
        let mut state = self.state.lock().await;
        debug!(name = %state.name, opens = state.opens, "opening cache item");

        state.meta.atime = Utc::now();
        state.opens += 1;

        let os_path = cache.mkdir(&state.name).await?;
        self.reconcile_with_remote(&mut state, remote).await?;
        self.truncate_to_current_size(&mut state).await?;

        if state.opens != 1 {
            return Ok(());
        }
        if state.fd.is_some() {
            return Err(CacheError::Internal(
                "opened with file handle already set".into(),
            ));
        }

        state.fd = Some(BackingFile::open(&os_path).await?);
        self.persist_locked(&state).await?;

        // Re-register: expiry may have dropped the registry entry while the
        // item had no opens. Finding a different open item there means two
        // live items for one name, which the outer layer must never do.
        if let Some(old) = cache.put(&state.name, self.clone()) {
            if !Arc::ptr_eq(&old, self) && old.opens().await != 0 {
                cache.put(&state.name, old);
                return Err(CacheError::AlreadyOpen {
                    name: state.name.clone(),
                });
            }
        }
        Ok(())
    }

    /// Compare the cached fingerprint against `remote` and keep, refresh,
    /// or wipe the cached data accordingly.
    async fn reconcile_with_remote(
        &self,
        state: &mut ItemState,
        remote: Option<RemoteObject>,
    ) -> Result<()> {
        let cache = self.cache()?;
        match &remote {
            None => {
                if !state.meta.fingerprint.is_empty() {
                    Self::wipe(&cache, state, "stale (remote deleted)").await;
                }
            }
            Some(o) => {
                let remote_fingerprint = Cache::fingerprint_of(o);
                debug!(
                    name = %state.name,
                    remote = %remote_fingerprint,
                    cached = %state.meta.fingerprint,
                    "checking remote fingerprint against cached fingerprint"
                );
                if state.meta.fingerprint.is_empty() {
                    state.meta.fingerprint = remote_fingerprint;
                } else if state.meta.fingerprint != remote_fingerprint {
                    Self::wipe(&cache, state, "stale (remote is different)").await;
                    state.meta.fingerprint = remote_fingerprint;
                }
                state.meta.size = o.size();
            }
        }
        state.remote = remote;
        Ok(())
    }

    /// Make `[offset, offset + len)` present, clamped to the item's size,
    /// downloading whatever is missing.
    pub async fn ensure(self: &Arc<Self>, offset: u64, len: u64) -> Result<()> {
        loop {
            let step = {
                let mut state = self.state.lock().await;
                let end = offset.saturating_add(len).min(state.meta.size);
                let range = ByteRange::new(offset, end.saturating_sub(offset));
                if state.meta.ranges.present(range) {
                    EnsureStep::Present
                } else if let Some(old) = state.downloader.take() {
                    EnsureStep::Stale(old)
                } else {
                    let Some(remote) = state.remote.clone() else {
                        return Err(CacheError::Internal(
                            "tried to download with no remote object".into(),
                        ));
                    };
                    let cache = self.cache()?;
                    trace!(
                        name = %state.name,
                        pos = range.pos,
                        len = range.len,
                        "range missing, starting downloader"
                    );
                    let dl = Arc::new(Downloader::new(
                        self,
                        cache.remote_store().clone(),
                        state.name.clone(),
                        remote,
                        cache.config().download_chunk_size,
                    ));
                    if !dl.running() {
                        dl.start(offset)?;
                    }
                    state.downloader = Some(dl.clone());
                    EnsureStep::Ready(dl, range)
                }
            };
            match step {
                EnsureStep::Present => return Ok(()),
                EnsureStep::Stale(old) => {
                    // A fresh downloader replaces whatever was running.
                    // Close the old one with the lock released so its
                    // callbacks can drain, then re-check.
                    if let Err(e) = old.close().await {
                        debug!("superseded downloader reported: {e}");
                    }
                }
                EnsureStep::Ready(dl, range) => return dl.ensure(range).await,
            }
        }
    }

    /// Read from the backing file, fetching missing bytes first.
    pub async fn read_at(self: &Arc<Self>, buf: &mut [u8], offset: u64) -> Result<usize> {
        let fd = {
            let state = self.state.lock().await;
            state.fd.clone().ok_or(CacheError::NotOpen)?
        };
        self.ensure(offset, buf.len() as u64).await?;
        Ok(fd.read_at(buf, offset).await?)
    }

    /// Write to the backing file and mark the range present and the item
    /// dirty.
    pub async fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize> {
        let fd = {
            let state = self.state.lock().await;
            state.fd.clone().ok_or(CacheError::NotOpen)?
        };
        let n = fd.write_at(buf, offset).await?;
        let mut state = self.state.lock().await;
        let written_to = offset + n as u64;
        if written_to > state.meta.size {
            state.meta.size = written_to;
        }
        self.mark_written_locked(&mut state, offset, n as u64).await;
        if n > 0 {
            state.dirty = true;
        }
        Ok(n)
    }

    /// Resize the item. Extending counts as newly written zeros; shrinking
    /// clips the present ranges. Both directions dirty the item.
    pub async fn truncate(&self, size: u64) -> Result<()> {
        let mut state = self.state.lock().await;
        self.truncate_locked(&mut state, size).await
    }

    async fn truncate_locked(&self, state: &mut ItemState, size: u64) -> Result<()> {
        let old_size = match self.size_on_disk(state).await {
            Ok(s) => s,
            Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };

        self.truncate_file(state, size).await?;
        state.meta.size = size;

        if size > old_size {
            // The extension reads as zeros, which counts as written data.
            self.mark_written_locked(state, old_size, size - old_size)
                .await;
            state.dirty = true;
        } else if size < old_size {
            state.meta.ranges = state.meta.ranges.intersection(ByteRange::new(0, size));
            state.dirty = true;
        } else {
            state.dirty = state.remote.is_none();
        }
        Ok(())
    }

    /// Resize without touching the dirty flag or ranges.
    async fn truncate_file(&self, state: &ItemState, size: u64) -> Result<()> {
        trace!(name = %state.name, size, "truncating backing file");
        match &state.fd {
            Some(fd) => fd.truncate(size).await?,
            None => {
                let cache = self.cache()?;
                backing::truncate_path(&cache.to_backing_path(&state.name), size).await?;
            }
        }
        Ok(())
    }

    async fn truncate_to_current_size(&self, state: &mut ItemState) -> Result<()> {
        let size = match self.size_on_disk(state).await {
            Ok(s) => s,
            // Tolerates opening a file that is being created.
            Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        self.truncate_locked(state, size).await
    }

    async fn size_on_disk(&self, state: &ItemState) -> io::Result<u64> {
        if let Some(fd) = &state.fd {
            return fd.len().await;
        }
        let cache = self.cache().map_err(io::Error::other)?;
        match tokio::fs::metadata(cache.to_backing_path(&state.name)).await {
            Ok(fi) => Ok(fi.len()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => match &state.remote {
                Some(o) => Ok(o.size()),
                None => Err(e),
            },
            Err(e) => Err(e),
        }
    }

    /// Current size of the item, from the backing file when it exists and
    /// falling back to the remote object.
    pub async fn get_size(&self) -> Result<u64> {
        let state = self.state.lock().await;
        Ok(self.size_on_disk(&state).await?)
    }

    /// Whether the backing file exists.
    pub async fn exists(&self) -> bool {
        self.get_size().await.is_ok()
    }

    /// Record `[offset, offset + len)` as present and persist metadata
    /// best-effort; the in-memory state stays authoritative for this run.
    async fn mark_written_locked(&self, state: &mut ItemState, offset: u64, len: u64) {
        trace!(name = %state.name, offset, len, "range written");
        state.meta.ranges.insert(ByteRange::new(offset, len));
        self.save_locked(state).await;
    }

    async fn save_locked(&self, state: &ItemState) {
        if let Err(e) = self.persist_locked(state).await {
            warn!(name = %state.name, "failed to save metadata: {e}");
        }
    }

    async fn persist_locked(&self, state: &ItemState) -> Result<()> {
        let cache = self.cache()?;
        meta::save(&state.meta, &cache.to_meta_path(&state.name)).await
    }

    /// Downloader callback: the bytes are on their way to the backing file
    /// before the range is recorded, so `present` never runs ahead of the
    /// data.
    pub(crate) async fn download_written(&self, offset: u64, data: &[u8]) -> Result<()> {
        let (fd, path) = {
            let state = self.state.lock().await;
            let cache = self.cache()?;
            (state.fd.clone(), cache.to_backing_path(&state.name))
        };
        match fd {
            Some(fd) => {
                fd.write_at(data, offset).await?;
            }
            None => {
                // The item closed while the chunk was in flight; the bytes
                // still land in the backing file for the next open.
                backing::write_all_at_path(&path, data, offset).await?;
            }
        }
        let mut state = self.state.lock().await;
        self.mark_written_locked(&mut state, offset, data.len() as u64)
            .await;
        Ok(())
    }

    pub(crate) async fn range_present(&self, range: ByteRange) -> bool {
        self.state.lock().await.meta.ranges.present(range)
    }

    /// Close one open of the item. On the last close the metadata is
    /// flushed, the downloader and file handle are released, and a dirty
    /// item is uploaded; `store_fn` then receives the resulting remote
    /// object.
    pub async fn close(self: &Arc<Self>, store_fn: Option<StoreFn>) -> Result<()> {
        let cache = self.cache()?;
        let mut first_err: Option<CacheError> = None;

        let mut state = self.state.lock().await;
        state.meta.atime = Utc::now();
        if state.opens == 0 {
            return Err(CacheError::AlreadyClosed);
        }
        state.opens -= 1;
        if state.opens > 0 {
            return Ok(());
        }
        debug!(name = %state.name, "closing cache item");

        // Update the size on close.
        if let Ok(size) = self.size_on_disk(&state).await {
            state.meta.size = size;
        }
        self.persist_locked(&state).await?;

        let downloader = state.downloader.take();
        let fd = state.fd.take();
        if fd.is_none() {
            first_err = Some(CacheError::Internal("closed without an open file".into()));
        }
        drop(fd);

        let name = state.name.clone();
        let remote = state.remote.clone();
        let dirty = state.dirty;
        let fully_present = state.meta.ranges.present(ByteRange::new(0, state.meta.size));
        drop(state);

        // An unmodified, complete item keeps the remote's timestamp so the
        // pairing survives restarts.
        if !dirty && fully_present {
            if let Some(o) = &remote {
                if let Err(e) = backing::set_mtime(&cache.to_backing_path(&name), o.mod_time()).await
                {
                    warn!(name = %name, "failed to set modification time of cache file: {e}");
                }
            }
        }

        if dirty && first_err.is_none() {
            match self.upload().await {
                Ok(_) => {
                    debug!(name = %name, "transferred to remote");
                    self.state.lock().await.dirty = false;
                }
                Err(e) => {
                    error!(name = %name, "{e}");
                    first_err = Some(e);
                }
            }
        }

        // The upload may have spun up its own downloader to backfill
        // missing ranges; detach that one as well.
        let late_downloader = self.state.lock().await.downloader.take();
        for dl in downloader.into_iter().chain(late_downloader) {
            if let Err(e) = dl.close().await {
                match first_err {
                    None => first_err = Some(e),
                    Some(_) => warn!(name = %name, "failed to close downloader: {e}"),
                }
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => {
                if let Some(store_fn) = store_fn {
                    let remote = self.state.lock().await.remote.clone();
                    store_fn(remote);
                }
                Ok(())
            }
        }
    }

    /// Fetch anything still missing, then copy the backing file through the
    /// cache namespace to the remote, replacing the remote object handle.
    async fn upload(self: &Arc<Self>) -> Result<RemoteObject> {
        if let Err(e) = self.ensure(0, u64::MAX).await {
            return Err(CacheError::Upload(
                anyhow::Error::new(e).context("failed to download missing parts of cache file"),
            ));
        }

        let cache = self.cache()?;
        let name = self.state.lock().await.name.clone();
        let uploaded = copy_object(cache.remote_store().as_ref(), cache.backing_store(), &name)
            .await
            .map_err(CacheError::Upload)?;

        let mut state = self.state.lock().await;
        state.meta.fingerprint = Cache::fingerprint_of(&uploaded);
        state.remote = Some(uploaded.clone());
        self.save_locked(&state).await;
        Ok(uploaded)
    }

    /// Wipe the cached state and delete both on-disk files.
    pub async fn remove(&self, reason: &str) -> Result<()> {
        let cache = self.cache()?;
        let downloader = { self.state.lock().await.downloader.take() };
        if let Some(dl) = downloader {
            if let Err(e) = dl.close().await {
                warn!("failed to close downloader for removal: {e}");
            }
        }
        let mut state = self.state.lock().await;
        Self::wipe(&cache, &mut state, reason).await;
        Ok(())
    }

    /// Retarget the item to `new_name`, migrating both on-disk files.
    pub async fn rename(&self, new_name: &str, new_remote: Option<RemoteObject>) -> Result<()> {
        let cache = self.cache()?;
        let downloader;
        {
            let mut state = self.state.lock().await;
            downloader = state.downloader.take();

            let old_name = std::mem::replace(&mut state.name, new_name.to_string());
            state.remote = new_remote;

            backing::rename(
                &cache.to_backing_path(&old_name),
                &cache.to_backing_path(new_name),
            )
            .await?;
            backing::rename(
                &cache.to_meta_path(&old_name),
                &cache.to_meta_path(new_name),
            )
            .await?;
            info!(from = %old_name, to = %new_name, "renamed cache item");
        }
        if let Some(dl) = downloader {
            if let Err(e) = dl.close().await {
                warn!("failed to close downloader for rename: {e}");
            }
        }
        Ok(())
    }

    /// Flush the backing file to stable storage. Pushing dirty data to the
    /// remote remains a close-time concern.
    pub async fn sync(&self) -> Result<()> {
        let fd = {
            let state = self.state.lock().await;
            state.fd.clone().ok_or(CacheError::NotOpen)?
        };
        Ok(fd.sync_data().await?)
    }

    /// Refresh the fingerprint from the current remote and stamp the
    /// backing file's modification time.
    pub async fn set_mod_time(&self, mod_time: DateTime<Utc>) -> Result<()> {
        let cache = self.cache()?;
        let mut state = self.state.lock().await;
        if let Some(o) = &state.remote {
            state.meta.fingerprint = Cache::fingerprint_of(o);
            debug!(name = %state.name, fingerprint = %state.meta.fingerprint, "fingerprint refreshed");
        }
        if let Err(e) = backing::set_mtime(&cache.to_backing_path(&state.name), mod_time).await {
            error!(name = %state.name, "failed to set modification time of cached file: {e}");
        }
        Ok(())
    }

    /// Whole-file presence; false while a download is still running.
    pub async fn present(&self) -> bool {
        let state = self.state.lock().await;
        if let Some(dl) = &state.downloader {
            if dl.running() {
                return false;
            }
        }
        state
            .meta
            .ranges
            .present(ByteRange::new(0, state.meta.size))
    }

    pub async fn atime(&self) -> DateTime<Utc> {
        self.state.lock().await.meta.atime
    }

    pub async fn opens(&self) -> u32 {
        self.state.lock().await.opens
    }

    pub async fn is_dirty(&self) -> bool {
        self.state.lock().await.dirty
    }

    pub async fn fingerprint(&self) -> String {
        self.state.lock().await.meta.fingerprint.clone()
    }

    pub async fn remote(&self) -> Option<RemoteObject> {
        self.state.lock().await.remote.clone()
    }

    pub async fn ranges(&self) -> RangeSet {
        self.state.lock().await.meta.ranges.clone()
    }

    fn clean(state: &mut ItemState) {
        state.meta.ranges.clear();
        state.meta.fingerprint.clear();
        state.meta.size = 0;
        state.meta.atime = Utc::now();
    }

    async fn wipe(cache: &Cache, state: &mut ItemState, reason: &str) {
        Self::clean(state);
        Self::remove_file(cache, &state.name, reason).await;
        Self::remove_meta(cache, &state.name, reason).await;
    }

    async fn remove_file(cache: &Cache, name: &str, reason: &str) {
        match backing::remove(&cache.to_backing_path(name)).await {
            Ok(true) => info!(name, "removed cache file: {reason}"),
            Ok(false) => {}
            Err(e) => error!(name, "failed to remove cache file ({reason}): {e}"),
        }
    }

    async fn remove_meta(cache: &Cache, name: &str, reason: &str) {
        match backing::remove(&cache.to_meta_path(name)).await {
            Ok(true) => info!(name, "removed metadata from cache: {reason}"),
            Ok(false) => {}
            Err(e) => error!(name, "failed to remove metadata ({reason}): {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::config::CacheConfig;
    use crate::store::memory::MemoryStore;
    use crate::store::ObjectStore;
    use futures::future::join_all;
    use std::sync::Mutex as StdMutex;

    async fn cache_with(store: Arc<MemoryStore>, root: &std::path::Path) -> Arc<Cache> {
        Cache::new(store, CacheConfig::new(root).download_chunk_size(1024))
            .await
            .unwrap()
    }

    async fn test_cache() -> (tempfile::TempDir, Arc<Cache>, Arc<MemoryStore>) {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let cache = cache_with(store.clone(), tmp.path()).await;
        (tmp, cache, store)
    }

    #[tokio::test]
    async fn test_cold_read_fetches_only_needed_tail() {
        let (_tmp, cache, store) = test_cache().await;
        store.put("a.txt", b"0123456789").await.unwrap();

        let remote = cache.new_object("a.txt").await.unwrap();
        let item = cache.item("a.txt").await;
        item.open(remote).await.unwrap();

        let mut buf = [0u8; 4];
        let n = item.read_at(&mut buf, 6).await.unwrap();
        assert_eq!(n, 4);
        assert_eq!(&buf, b"6789");

        let ranges = item.ranges().await;
        assert!(ranges.present(ByteRange::new(6, 4)));
        assert!(!ranges.present(ByteRange::new(0, 6)));

        item.close(None).await.unwrap();
    }

    #[tokio::test]
    async fn test_dirty_close_uploads() {
        let (_tmp, cache, store) = test_cache().await;

        let item = cache.item("hello.txt").await;
        item.open(None).await.unwrap();
        assert_eq!(item.write_at(b"hello", 0).await.unwrap(), 5);
        item.truncate(5).await.unwrap();
        assert!(item.is_dirty().await);

        let stored = Arc::new(StdMutex::new(None));
        let stored_in = stored.clone();
        item.close(Some(Box::new(move |o| {
            *stored_in.lock().unwrap() = o;
        })))
        .await
        .unwrap();

        assert_eq!(store.get("hello.txt").await.unwrap().unwrap(), b"hello");
        assert!(!item.is_dirty().await);

        let remote = cache.new_object("hello.txt").await.unwrap().unwrap();
        assert_eq!(remote.size(), 5);
        assert_eq!(item.fingerprint().await, Cache::fingerprint_of(&remote));

        let callback_obj = stored.lock().unwrap().take().unwrap();
        assert_eq!(callback_obj.key(), "hello.txt");
    }

    #[tokio::test]
    async fn test_stale_remote_wipes_cache() {
        let (_tmp, cache, store) = test_cache().await;
        store.put("a.txt", b"old content").await.unwrap();

        let item = cache.item("a.txt").await;
        item.open(cache.new_object("a.txt").await.unwrap())
            .await
            .unwrap();
        let mut buf = vec![0u8; 11];
        item.read_at(&mut buf, 0).await.unwrap();
        assert_eq!(&buf, b"old content");
        item.close(None).await.unwrap();

        // The remote changes behind the cache's back.
        store.put("a.txt", b"NEW!").await.unwrap();
        let fresh = cache.new_object("a.txt").await.unwrap().unwrap();
        let fresh_fingerprint = Cache::fingerprint_of(&fresh);

        let item = cache.item("a.txt").await;
        item.open(Some(fresh)).await.unwrap();
        assert_eq!(item.fingerprint().await, fresh_fingerprint);
        assert_eq!(item.get_size().await.unwrap(), 4);

        let mut buf = vec![0u8; 4];
        item.read_at(&mut buf, 0).await.unwrap();
        assert_eq!(&buf, b"NEW!");
        item.close(None).await.unwrap();
    }

    #[tokio::test]
    async fn test_extending_truncate_reads_zeros_without_remote() {
        let (_tmp, cache, _store) = test_cache().await;

        let item = cache.item("grow.bin").await;
        item.open(None).await.unwrap();
        item.write_at(b"abcd", 0).await.unwrap();
        item.truncate(10).await.unwrap();

        assert_eq!(item.get_size().await.unwrap(), 10);
        assert!(item.ranges().await.present(ByteRange::new(0, 10)));
        assert!(item.is_dirty().await);

        // No remote object exists, so this read must not need a downloader.
        let mut buf = [7u8; 6];
        assert_eq!(item.read_at(&mut buf, 4).await.unwrap(), 6);
        assert_eq!(&buf, &[0u8; 6]);

        item.close(None).await.unwrap();
    }

    #[tokio::test]
    async fn test_shrinking_truncate_clips_ranges() {
        let (_tmp, cache, _store) = test_cache().await;

        let item = cache.item("shrink.bin").await;
        item.open(None).await.unwrap();
        item.write_at(b"0123456789", 0).await.unwrap();
        item.truncate(3).await.unwrap();

        assert_eq!(item.get_size().await.unwrap(), 3);
        let ranges = item.ranges().await;
        assert!(ranges.present(ByteRange::new(0, 3)));
        assert!(!ranges.present(ByteRange::new(0, 4)));
        assert!(item.is_dirty().await);

        item.close(None).await.unwrap();
    }

    #[tokio::test]
    async fn test_corrupt_metadata_recovers_as_cold_fetch() {
        let (_tmp, cache, store) = test_cache().await;
        store.put("c.txt", b"remote bytes").await.unwrap();

        // A stale backing file next to an undecodable metadata record.
        tokio::fs::write(cache.to_backing_path("c.txt"), b"leftover")
            .await
            .unwrap();
        tokio::fs::write(cache.to_meta_path("c.txt"), b"{ not json")
            .await
            .unwrap();

        let item = cache.item("c.txt").await;
        assert!(item.ranges().await.is_empty());
        assert_eq!(item.fingerprint().await, "");
        assert!(!cache.to_backing_path("c.txt").exists());
        assert!(!cache.to_meta_path("c.txt").exists());

        item.open(cache.new_object("c.txt").await.unwrap())
            .await
            .unwrap();
        let mut buf = vec![0u8; 12];
        item.read_at(&mut buf, 0).await.unwrap();
        assert_eq!(&buf, b"remote bytes");
        item.close(None).await.unwrap();
    }

    #[tokio::test]
    async fn test_registry_collision_fails_already_open() {
        let (_tmp, cache, _store) = test_cache().await;

        let item = cache.item("x").await;
        item.open(None).await.unwrap();

        let intruder = Item::new(&cache, "x").await;
        match intruder.open(None).await {
            Err(CacheError::AlreadyOpen { name }) => assert_eq!(name, "x"),
            other => panic!("expected AlreadyOpen, got {other:?}"),
        }
        // The original registration survives.
        assert!(Arc::ptr_eq(&cache.item("x").await, &item));

        item.close(None).await.unwrap();
    }

    #[tokio::test]
    async fn test_close_counts_opens() {
        let (_tmp, cache, _store) = test_cache().await;

        let item = cache.item("y").await;
        item.open(None).await.unwrap();
        item.open(None).await.unwrap();
        assert_eq!(item.opens().await, 2);

        // First close keeps the handle alive.
        item.close(None).await.unwrap();
        item.write_at(b"z", 0).await.unwrap();

        item.close(None).await.unwrap();
        assert_eq!(item.opens().await, 0);
        let mut buf = [0u8; 1];
        assert!(matches!(
            item.read_at(&mut buf, 0).await,
            Err(CacheError::NotOpen)
        ));
        assert!(matches!(
            item.close(None).await,
            Err(CacheError::AlreadyClosed)
        ));
    }

    #[tokio::test]
    async fn test_unopened_item_rejects_io() {
        let (_tmp, cache, _store) = test_cache().await;
        let item = cache.item("z").await;

        let mut buf = [0u8; 1];
        assert!(matches!(
            item.read_at(&mut buf, 0).await,
            Err(CacheError::NotOpen)
        ));
        assert!(matches!(
            item.write_at(b"a", 0).await,
            Err(CacheError::NotOpen)
        ));
        assert!(matches!(item.sync().await, Err(CacheError::NotOpen)));
    }

    #[tokio::test]
    async fn test_state_survives_cache_restart() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());

        {
            let cache = cache_with(store.clone(), tmp.path()).await;
            let item = cache.item("keep.txt").await;
            item.open(None).await.unwrap();
            item.write_at(b"hello world", 0).await.unwrap();
            item.close(None).await.unwrap();
        }

        let cache = cache_with(store.clone(), tmp.path()).await;
        let item = cache.item("keep.txt").await;
        assert_eq!(item.get_size().await.unwrap(), 11);
        assert!(item.ranges().await.present(ByteRange::new(0, 11)));

        let remote = cache.new_object("keep.txt").await.unwrap().unwrap();
        assert_eq!(item.fingerprint().await, Cache::fingerprint_of(&remote));

        // Fingerprints match, so the open keeps the cached ranges and the
        // read never touches the downloader.
        item.open(Some(remote.clone())).await.unwrap();
        assert!(!item.is_dirty().await);
        let mut buf = vec![0u8; 11];
        item.read_at(&mut buf, 0).await.unwrap();
        assert_eq!(&buf, b"hello world");

        item.set_mod_time(remote.mod_time()).await.unwrap();
        assert_eq!(item.fingerprint().await, Cache::fingerprint_of(&remote));
        item.close(None).await.unwrap();
    }

    #[tokio::test]
    async fn test_noncontiguous_reads_restart_downloader() {
        let (_tmp, cache, store) = test_cache().await;
        let data: Vec<u8> = (0..8192u32).map(|i| (i % 251) as u8).collect();
        store.put("big.bin", &data).await.unwrap();

        let item = cache.item("big.bin").await;
        item.open(cache.new_object("big.bin").await.unwrap())
            .await
            .unwrap();

        // Tail first, then the head: the second read cannot be served by a
        // forward-only download that started near the end.
        let mut tail = vec![0u8; 100];
        item.read_at(&mut tail, 8000).await.unwrap();
        assert_eq!(&tail[..], &data[8000..8100]);

        let mut head = vec![0u8; 100];
        item.read_at(&mut head, 0).await.unwrap();
        assert_eq!(&head[..], &data[..100]);

        item.close(None).await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_readers() {
        let (_tmp, cache, store) = test_cache().await;
        let data: Vec<u8> = (0..16384u32).map(|i| (i % 239) as u8).collect();
        store.put("shared.bin", &data).await.unwrap();

        let item = cache.item("shared.bin").await;
        item.open(cache.new_object("shared.bin").await.unwrap())
            .await
            .unwrap();

        // Materialise everything first; the readers then contend only on
        // the item lock and the shared file handle.
        item.ensure(0, u64::MAX).await.unwrap();
        assert!(item.present().await);

        let mut tasks = Vec::new();
        for i in 0..8u64 {
            let item = item.clone();
            let expect = data.clone();
            tasks.push(tokio::spawn(async move {
                let offset = i * 2000;
                let mut buf = vec![0u8; 256];
                let n = item.read_at(&mut buf, offset).await.unwrap();
                let end = (offset as usize + 256).min(expect.len());
                assert_eq!(&buf[..n], &expect[offset as usize..end]);
            }));
        }
        for result in join_all(tasks).await {
            result.unwrap();
        }
        item.close(None).await.unwrap();
    }

    #[tokio::test]
    async fn test_write_truncate_sequence_matches_model() {
        let (_tmp, cache, _store) = test_cache().await;
        let item = cache.item("model.bin").await;
        let created = item.atime().await;
        item.open(None).await.unwrap();
        assert!(item.atime().await >= created);
        assert!(item.exists().await);

        let mut model = Vec::new();
        let mut apply_write = |model: &mut Vec<u8>, offset: usize, data: &[u8]| {
            if model.len() < offset + data.len() {
                model.resize(offset + data.len(), 0);
            }
            model[offset..offset + data.len()].copy_from_slice(data);
        };

        apply_write(&mut model, 0, b"aaaaaaaa");
        item.write_at(b"aaaaaaaa", 0).await.unwrap();
        apply_write(&mut model, 4, b"bbbb");
        item.write_at(b"bbbb", 4).await.unwrap();
        apply_write(&mut model, 20, b"cc");
        item.write_at(b"cc", 20).await.unwrap();

        item.truncate(16).await.unwrap();
        model.truncate(16);
        item.truncate(32).await.unwrap();
        model.resize(32, 0);

        // Every recorded range lies within the logical size, and the bytes
        // it covers match what was last written there.
        let size = item.get_size().await.unwrap();
        assert_eq!(size, 32);
        let ranges = item.ranges().await;
        for r in ranges.iter() {
            assert!(r.end() <= size);
            let mut buf = vec![0u8; r.len as usize];
            assert_eq!(item.read_at(&mut buf, r.pos).await.unwrap(), buf.len());
            assert_eq!(&buf, &model[r.pos as usize..r.end() as usize]);
        }
        // The shrink punched a hole: the middle was never rewritten.
        assert!(ranges.present(ByteRange::new(0, 8)));
        assert!(ranges.present(ByteRange::new(16, 16)));
        assert!(!ranges.present(ByteRange::new(0, 32)));

        item.sync().await.unwrap();
        item.close(None).await.unwrap();
    }

    #[tokio::test]
    async fn test_rename_migrates_files_and_uploads_under_new_name() {
        let (_tmp, cache, store) = test_cache().await;
        let item = cache.item("old.txt").await;
        item.open(None).await.unwrap();
        item.write_at(b"payload", 0).await.unwrap();

        item.rename("dir/new.txt", None).await.unwrap();
        assert!(!cache.to_backing_path("old.txt").exists());
        assert!(cache.to_backing_path("dir/new.txt").exists());
        assert!(!cache.to_meta_path("old.txt").exists());

        item.close(None).await.unwrap();
        assert_eq!(
            store.get("dir/new.txt").await.unwrap().unwrap(),
            b"payload"
        );
        assert!(store.get("old.txt").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remove_wipes_both_files() {
        let (_tmp, cache, _store) = test_cache().await;
        let item = cache.item("gone.txt").await;
        item.open(None).await.unwrap();
        item.write_at(b"bytes", 0).await.unwrap();
        item.close(None).await.unwrap();

        assert!(cache.to_backing_path("gone.txt").exists());
        item.remove("test cleanup").await.unwrap();
        assert!(!cache.to_backing_path("gone.txt").exists());
        assert!(!cache.to_meta_path("gone.txt").exists());
        assert!(item.ranges().await.is_empty());
        assert_eq!(item.fingerprint().await, "");

        // The cache-level removal also drops the registry entry.
        cache.remove("gone.txt", "test cleanup").await.unwrap();
        assert!(!Arc::ptr_eq(&cache.item("gone.txt").await, &item));
    }

    #[tokio::test]
    async fn test_open_with_deleted_remote_discards_stale_cache() {
        let (_tmp, cache, store) = test_cache().await;
        store.put("gone.txt", b"short lived").await.unwrap();

        let item = cache.item("gone.txt").await;
        item.open(cache.new_object("gone.txt").await.unwrap())
            .await
            .unwrap();
        let mut buf = vec![0u8; 11];
        item.read_at(&mut buf, 0).await.unwrap();
        item.close(None).await.unwrap();

        store.delete("gone.txt").await.unwrap();
        let item = cache.item("gone.txt").await;
        item.open(cache.new_object("gone.txt").await.unwrap())
            .await
            .unwrap();
        assert!(item.ranges().await.is_empty());
        assert_eq!(item.fingerprint().await, "");
        assert_eq!(item.get_size().await.unwrap(), 0);

        // Opening with no remote means creating the file, so the close
        // uploads the (empty) replacement.
        item.close(None).await.unwrap();
        assert_eq!(store.get("gone.txt").await.unwrap().unwrap(), b"");
    }
}
