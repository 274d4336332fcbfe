//! Local filesystem namespace. Backs the cache's data tree and doubles as
//! a mock remote in tests.

#[cfg(unix)]
use std::os::unix::fs::FileExt;

#[cfg(windows)]
use std::os::windows::fs::FileExt;

use crate::store::{ObjectStat, ObjectStore};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::{fs, io::AsyncWriteExt};

#[derive(Clone)]
pub struct LocalFsStore {
    root: PathBuf,
    created_dirs: Arc<DashSet<PathBuf>>,
}

impl LocalFsStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            created_dirs: Arc::new(DashSet::new()),
        }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    async fn ensure_dir(&self, dir: &Path) -> Result<()> {
        if self.created_dirs.contains(dir) {
            return Ok(());
        }

        fs::create_dir_all(dir).await?;
        self.created_dirs.insert(dir.to_path_buf());
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for LocalFsStore {
    async fn stat(&self, key: &str) -> Result<Option<ObjectStat>> {
        let path = self.path_for(key);

        match fs::metadata(path).await {
            Ok(metadata) => {
                let modified = metadata.modified()?;
                let mod_time: DateTime<Utc> = modified.into();
                Ok(Some(ObjectStat {
                    size: metadata.len(),
                    mod_time,
                    etag: format!("{:?}-{}", modified, metadata.len()),
                }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key);

        match fs::read(path).await {
            Ok(buf) => Ok(Some(buf)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    #[tracing::instrument(
        name = "LocalFsStore.get_range",
        level = "trace",
        skip(self, buf),
        fields(len = buf.len())
    )]
    async fn get_range(&self, key: &str, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let path = self.path_for(key);
        let len = buf.len();

        let read = tokio::task::spawn_blocking(move || -> Result<Option<Vec<u8>>> {
            let file = match std::fs::File::open(&path) {
                Ok(file) => file,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(e.into()),
            };
            let mut local = vec![0u8; len];
            let mut read = 0usize;
            while read < len {
                let n = read_at(&file, &mut local[read..], offset + read as u64)?;
                if n == 0 {
                    break;
                }
                read += n;
            }
            local.truncate(read);
            Ok(Some(local))
        })
        .await
        .map_err(|e| anyhow::anyhow!("blocking get_range failed: {e}"))??;

        match read {
            Some(data) => {
                let n = data.len();
                buf[..n].copy_from_slice(&data);
                Ok(n)
            }
            None => Ok(0),
        }
    }

    async fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        let path = self.path_for(key);

        if let Some(dir) = path.parent() {
            self.ensure_dir(dir).await?;
        }

        let mut f = fs::File::create(path).await?;
        f.write_all(data).await?;
        f.flush().await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);

        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(unix)]
fn read_at(file: &std::fs::File, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
    file.read_at(buf, offset)
}

#[cfg(windows)]
fn read_at(file: &std::fs::File, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
    file.seek_read(buf, offset)
}
