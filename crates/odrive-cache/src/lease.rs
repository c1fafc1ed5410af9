//! Reader leases: a per-id count that keeps the walker away from open files.
//!
//! A reader takes a lease before opening the file. The walker and `remove`
//! only unlink while holding the lease table lock and only when the count
//! is zero, so a file can't disappear between "lease taken" and "opened".
//! The unlinks run on the blocking pool, never on a runtime worker.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use odrive_core::ObjectId;
use tokio::io::{AsyncRead, AsyncSeek, ReadBuf};

use crate::partition::CacheState;

#[derive(Debug, Default)]
pub struct Leases {
    counts: Mutex<HashMap<ObjectId, usize>>,
}

impl Leases {
    pub fn acquire(self: &Arc<Self>, id: ObjectId) -> Lease {
        let mut counts = self.counts.lock().expect("lease table poisoned");
        *counts.entry(id).or_insert(0) += 1;
        Lease {
            table: Arc::clone(self),
            id,
        }
    }

    pub fn count(&self, id: &ObjectId) -> usize {
        let counts = self.counts.lock().expect("lease table poisoned");
        counts.get(id).copied().unwrap_or(0)
    }

    /// Unlink `paths` if nobody holds a lease on `id`.
    ///
    /// Returns `Ok(None)` when leased, otherwise the number of bytes removed.
    pub async fn unlink_if_idle(
        self: &Arc<Self>,
        id: ObjectId,
        paths: Vec<PathBuf>,
    ) -> io::Result<Option<u64>> {
        let table = Arc::clone(self);
        tokio::task::spawn_blocking(move || table.unlink_locked(&id, &paths))
            .await
            .map_err(io::Error::other)?
    }

    fn unlink_locked(&self, id: &ObjectId, paths: &[PathBuf]) -> io::Result<Option<u64>> {
        let counts = self.counts.lock().expect("lease table poisoned");
        if counts.get(id).copied().unwrap_or(0) > 0 {
            return Ok(None);
        }
        let mut freed = 0;
        for path in paths {
            let len = match std::fs::metadata(path) {
                Ok(m) => m.len(),
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            };
            match std::fs::remove_file(path) {
                Ok(()) => freed += len,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        drop(counts);
        Ok(Some(freed))
    }

    fn release(&self, id: &ObjectId) {
        let mut counts = self.counts.lock().expect("lease table poisoned");
        if let Some(n) = counts.get_mut(id) {
            *n -= 1;
            if *n == 0 {
                counts.remove(id);
            }
        }
    }
}

/// Drop releases the count.
#[derive(Debug)]
pub struct Lease {
    table: Arc<Leases>,
    id: ObjectId,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.table.release(&self.id);
    }
}

/// An open, leased ciphertext file.
///
/// Reads and seeks go straight to the file. The file stays on disk until
/// the handle is dropped.
#[derive(Debug)]
pub struct CachedHandle {
    file: tokio::fs::File,
    size: u64,
    state: CacheState,
    _lease: Lease,
}

impl CachedHandle {
    pub(crate) fn new(file: tokio::fs::File, size: u64, state: CacheState, lease: Lease) -> Self {
        Self {
            file,
            size,
            state,
            _lease: lease,
        }
    }

    /// Ciphertext length in bytes (equal to plaintext length under CTR).
    pub fn size(&self) -> u64 {
        self.size
    }

    /// State the file was in when it was opened.
    pub fn state(&self) -> CacheState {
        self.state
    }
}

impl AsyncRead for CachedHandle {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.file).poll_read(cx, buf)
    }
}

impl AsyncSeek for CachedHandle {
    fn start_seek(mut self: Pin<&mut Self>, position: io::SeekFrom) -> io::Result<()> {
        Pin::new(&mut self.file).start_seek(position)
    }

    fn poll_complete(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        Pin::new(&mut self.file).poll_complete(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "current_thread")]
    async fn leased_files_survive_unlink() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("f");
        std::fs::write(&path, b"12345").unwrap();

        let leases = Arc::new(Leases::default());
        let id = ObjectId::random();
        let a = leases.acquire(id);
        let b = leases.acquire(id);
        assert_eq!(leases.count(&id), 2);
        let paths = || vec![path.clone()];
        assert_eq!(leases.unlink_if_idle(id, paths()).await.unwrap(), None);
        drop(a);
        assert_eq!(leases.unlink_if_idle(id, paths()).await.unwrap(), None);
        drop(b);
        assert_eq!(leases.count(&id), 0);
        assert_eq!(leases.unlink_if_idle(id, paths()).await.unwrap(), Some(5));
        assert!(!path.exists());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn idle_unlink_skips_missing_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let present = tmp.path().join("present");
        std::fs::write(&present, b"abc").unwrap();

        let leases = Arc::new(Leases::default());
        let freed = leases
            .unlink_if_idle(ObjectId::random(), vec![tmp.path().join("absent"), present.clone()])
            .await
            .unwrap();
        assert_eq!(freed, Some(3));
        assert!(!present.exists());
    }
}
