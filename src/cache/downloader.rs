//! On-demand downloader: one background task per item that materialises
//! missing byte ranges from the remote object.
//!
//! The task fetches sequential chunks starting at the requested offset and
//! reports each one back through the item's written-range bookkeeping.
//! Waiters follow along over a watch channel; the item lock is never held
//! while talking to the downloader, so its callbacks can always make
//! progress.

use crate::cache::error::{CacheError, Result};
use crate::cache::item::Item;
use crate::cache::ranges::ByteRange;
use crate::store::{ObjectStore, RemoteObject};
use anyhow::anyhow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Default)]
struct Progress {
    fetched_to: u64,
    done: bool,
    failed: Option<String>,
}

pub(crate) struct Downloader {
    item: Weak<Item>,
    store: Arc<dyn ObjectStore>,
    name: String,
    remote: RemoteObject,
    chunk_size: usize,
    stop: Arc<AtomicBool>,
    progress: watch::Sender<Progress>,
    task: StdMutex<Option<JoinHandle<()>>>,
}

impl Downloader {
    pub(crate) fn new(
        item: &Arc<Item>,
        store: Arc<dyn ObjectStore>,
        name: String,
        remote: RemoteObject,
        chunk_size: usize,
    ) -> Self {
        let (progress, _) = watch::channel(Progress::default());
        Self {
            item: Arc::downgrade(item),
            store,
            name,
            remote,
            chunk_size: chunk_size.max(1),
            stop: Arc::new(AtomicBool::new(false)),
            progress,
            task: StdMutex::new(None),
        }
    }

    /// Begin fetching from `offset` forward. Idempotent while running.
    pub(crate) fn start(&self, offset: u64) -> Result<()> {
        let mut task = self.task.lock().unwrap();
        if task.is_some() {
            return Ok(());
        }
        if self.stop.load(Ordering::Acquire) {
            return Err(CacheError::Download(anyhow!(
                "downloader already closed"
            )));
        }
        let Some(item) = self.item.upgrade() else {
            return Err(CacheError::Download(anyhow!("item went away")));
        };
        debug!(name = %self.name, offset, "starting downloader");
        *task = Some(tokio::spawn(run(
            item,
            self.store.clone(),
            self.name.clone(),
            self.remote.clone(),
            self.chunk_size,
            self.stop.clone(),
            self.progress.clone(),
            offset,
        )));
        Ok(())
    }

    /// Block until every byte of `range` has been reported written, or the
    /// download fails.
    pub(crate) async fn ensure(&self, range: ByteRange) -> Result<()> {
        let Some(item) = self.item.upgrade() else {
            return Err(CacheError::Download(anyhow!("item went away")));
        };
        let mut rx = self.progress.subscribe();
        loop {
            if item.range_present(range).await {
                return Ok(());
            }
            let progress = rx.borrow_and_update().clone();
            if let Some(msg) = progress.failed {
                return Err(CacheError::Download(anyhow!(msg)));
            }
            if progress.done {
                return Err(CacheError::Download(anyhow!(
                    "download finished without range [{}, {})",
                    range.pos,
                    range.end()
                )));
            }
            trace!(name = %self.name, fetched_to = progress.fetched_to, "waiting for range");
            if rx.changed().await.is_err() {
                return Err(CacheError::Download(anyhow!("downloader went away")));
            }
        }
    }

    pub(crate) fn running(&self) -> bool {
        self.task.lock().unwrap().is_some() && !self.progress.borrow().done
    }

    /// Stop the task and wait for it to wind down. Surfaces any failure the
    /// download hit along the way.
    pub(crate) async fn close(&self) -> Result<()> {
        self.stop.store(true, Ordering::Release);
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    return Err(CacheError::Download(anyhow!(
                        "downloader task panicked: {e}"
                    )));
                }
            }
        }
        let progress = self.progress.borrow().clone();
        if let Some(msg) = progress.failed {
            return Err(CacheError::Download(anyhow!(msg)));
        }
        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
async fn run(
    item: Arc<Item>,
    store: Arc<dyn ObjectStore>,
    name: String,
    remote: RemoteObject,
    chunk_size: usize,
    stop: Arc<AtomicBool>,
    progress: watch::Sender<Progress>,
    offset: u64,
) {
    let end = remote.size();
    let mut pos = offset;
    let mut failed = None;

    while pos < end && !stop.load(Ordering::Acquire) {
        let want = chunk_size.min((end - pos) as usize);
        let mut buf = vec![0u8; want];
        let n = match store.get_range(remote.key(), pos, &mut buf).await {
            Ok(n) => n,
            Err(e) => {
                failed = Some(format!("remote read at offset {pos} failed: {e:#}"));
                break;
            }
        };
        if n == 0 {
            failed = Some(format!("unexpected end of remote object at offset {pos}"));
            break;
        }
        if let Err(e) = item.download_written(pos, &buf[..n]).await {
            failed = Some(format!("cache write at offset {pos} failed: {e}"));
            break;
        }
        pos += n as u64;
        progress.send_modify(|p| p.fetched_to = pos);
    }

    match &failed {
        Some(msg) => warn!(name = %name, "download stopped: {msg}"),
        None => trace!(name = %name, fetched_to = pos, "download finished"),
    }
    progress.send_modify(|p| {
        p.done = true;
        p.failed = failed;
    });
}
