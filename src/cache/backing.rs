//! Sparse local backing file: positional I/O off the item lock.
//!
//! The handle wraps a `std::fs::File` shared through an `Arc`, so clones
//! taken under the item lock can read and write on the blocking pool while
//! the lock is free. Extending the file produces a zero-filled hole.

#[cfg(unix)]
use std::os::unix::fs::{FileExt, OpenOptionsExt};

#[cfg(windows)]
use std::os::windows::fs::FileExt;

use chrono::{DateTime, Utc};
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::task;
use tracing::debug;

#[derive(Debug, Clone)]
pub(crate) struct BackingFile {
    file: Arc<File>,
    path: PathBuf,
}

impl BackingFile {
    /// Create-or-open read/write with mode `0600` and the sparse hint
    /// applied. A failed hint is logged, never fatal.
    pub(crate) async fn open(path: &Path) -> io::Result<BackingFile> {
        let path = path.to_path_buf();
        let file = {
            let path = path.clone();
            task::spawn_blocking(move || open_rw(&path))
                .await
                .map_err(io::Error::other)??
        };
        let backing = BackingFile {
            file: Arc::new(file),
            path,
        };
        if let Err(e) = set_sparse(&backing.file) {
            debug!(path = %backing.path.display(), "failed to set as a sparse file: {e}");
        }
        Ok(backing)
    }

    /// Resize to `size`; growing leaves a hole that reads as zeros.
    pub(crate) async fn truncate(&self, size: u64) -> io::Result<()> {
        let file = self.file.clone();
        task::spawn_blocking(move || file.set_len(size))
            .await
            .map_err(io::Error::other)?
    }

    pub(crate) async fn len(&self) -> io::Result<u64> {
        let file = self.file.clone();
        task::spawn_blocking(move || file.metadata().map(|m| m.len()))
            .await
            .map_err(io::Error::other)?
    }

    /// Positional read; short only at end of file.
    pub(crate) async fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let file = self.file.clone();
        let len = buf.len();
        let data = task::spawn_blocking(move || -> io::Result<Vec<u8>> {
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
            Ok(local)
        })
        .await
        .map_err(io::Error::other)??;
        let n = data.len();
        buf[..n].copy_from_slice(&data);
        Ok(n)
    }

    /// Positional write of the whole buffer.
    pub(crate) async fn write_at(&self, data: &[u8], offset: u64) -> io::Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let file = self.file.clone();
        let owned = data.to_vec();
        task::spawn_blocking(move || -> io::Result<usize> {
            write_all_at(&file, &owned, offset)?;
            Ok(owned.len())
        })
        .await
        .map_err(io::Error::other)?
    }

    pub(crate) async fn sync_data(&self) -> io::Result<()> {
        let file = self.file.clone();
        task::spawn_blocking(move || file.sync_data())
            .await
            .map_err(io::Error::other)?
    }
}

fn open_rw(path: &Path) -> io::Result<File> {
    let mut opts = OpenOptions::new();
    opts.read(true).write(true).create(true);
    #[cfg(unix)]
    opts.mode(0o600);
    opts.open(path)
}

#[cfg(unix)]
fn set_sparse(_file: &File) -> io::Result<()> {
    // Unix filesystems punch holes on their own; nothing to hint.
    Ok(())
}

#[cfg(not(unix))]
fn set_sparse(_file: &File) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "no sparse attribute on this platform",
    ))
}

#[cfg(unix)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    file.read_at(buf, offset)
}

#[cfg(windows)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    file.seek_read(buf, offset)
}

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    while !buf.is_empty() {
        let n = file.seek_write(buf, offset)?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "write zero"));
        }
        buf = &buf[n..];
        offset += n as u64;
    }
    Ok(())
}

/// Resize the file at `path` without keeping a handle, creating it first
/// if necessary.
pub(crate) async fn truncate_path(path: &Path, size: u64) -> io::Result<()> {
    let path = path.to_path_buf();
    task::spawn_blocking(move || {
        let file = open_rw(&path)?;
        if let Err(e) = set_sparse(&file) {
            debug!(path = %path.display(), "failed to set as a sparse file: {e}");
        }
        file.set_len(size)
    })
    .await
    .map_err(io::Error::other)?
}

/// Positional write through a fresh handle, for writers that outlive the
/// item's own file descriptor.
pub(crate) async fn write_all_at_path(path: &Path, data: &[u8], offset: u64) -> io::Result<()> {
    let path = path.to_path_buf();
    let owned = data.to_vec();
    task::spawn_blocking(move || {
        let file = open_rw(&path)?;
        write_all_at(&file, &owned, offset)
    })
    .await
    .map_err(io::Error::other)?
}

/// Stamp the file's modification time.
pub(crate) async fn set_mtime(path: &Path, mod_time: DateTime<Utc>) -> io::Result<()> {
    let path = path.to_path_buf();
    let mtime: SystemTime = mod_time.into();
    task::spawn_blocking(move || {
        let file = OpenOptions::new().write(true).open(&path)?;
        file.set_modified(mtime)
    })
    .await
    .map_err(io::Error::other)?
}

/// Delete the file; `Ok(false)` when it was already absent.
pub(crate) async fn remove(path: &Path) -> io::Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Rename `old` to `new`, creating the destination's parent directory.
/// A missing source is tolerated.
pub(crate) async fn rename(old: &Path, new: &Path) -> io::Result<()> {
    if let Some(parent) = new.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    match tokio::fs::rename(old, new).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
