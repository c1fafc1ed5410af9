//! Drain workers: push `.uploaded` files to the blob backend.
//!
//! A worker retries with exponential backoff until the upload is verified,
//! then renames the file to `.cached`. When attempts run out the file is
//! parked as `.orphaned` and an alert event goes out. Cancellation, or a
//! rename the filesystem refuses, leaves the file as `.uploaded` for the
//! next start to requeue.

use std::io;
use std::sync::Arc;

use odrive_core::{Event, ObjectId};
use odrive_storage::{retry, upload_file, Backoff};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::cache::Inner;
use crate::error::{CacheError, CacheResult};
use crate::partition::CacheState;
use crate::reporter::{JobKind, Outcome};

/// How one drain ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    Drained { bytes: u64, attempts: u32 },
    Orphaned { attempts: u32 },
    /// A rename failed and the file is still `.uploaded`.
    Stranded { attempts: u32 },
    /// The staged file disappeared (expunged) before or during the upload.
    Gone,
    Cancelled,
}

pub(crate) async fn run_worker(
    inner: Arc<Inner>,
    rx: Arc<Mutex<mpsc::Receiver<ObjectId>>>,
    cancel: CancellationToken,
    worker: usize,
) {
    debug!(worker, "drain worker started");
    loop {
        let next = tokio::select! {
            id = async { rx.lock().await.recv().await } => id,
            _ = cancel.cancelled() => None,
        };
        let Some(id) = next else { break };
        let outcome = drain_one(&inner, id, &cancel).await;
        inner.drain_done();
        debug!(worker, id = %id, ?outcome, "drain finished");
        if outcome == DrainOutcome::Cancelled {
            break;
        }
    }
    debug!(worker, "drain worker stopped");
}

pub(crate) async fn drain_one(inner: &Inner, id: ObjectId, cancel: &CancellationToken) -> DrainOutcome {
    let path = inner.partition.path(&id, CacheState::Uploaded);
    let bytes = match tokio::fs::metadata(&path).await {
        Ok(m) => m.len(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(id = %id, "nothing staged; skipping drain");
            return DrainOutcome::Gone;
        }
        Err(e) => {
            error!(id = %id, "stat before drain: {e}");
            return park(inner, id, 0, &CacheError::Io(e)).await;
        }
    };

    inner.reporter.begin(JobKind::Drain);
    let backoff = Backoff::from_drain(&inner.opts.drain);
    let attempt = retry(
        &backoff,
        "drain",
        CacheError::is_retryable,
        |_| upload_verified(inner, &id, &path),
    );
    let result = tokio::select! {
        r = attempt => r,
        _ = cancel.cancelled() => {
            inner.reporter.end(JobKind::Drain, Outcome::Cancelled, 0);
            info!(id = %id, "drain cancelled; left staged");
            return DrainOutcome::Cancelled;
        }
    };

    match result {
        Ok((etag, attempts)) => {
            match inner
                .partition
                .transition(&id, CacheState::Uploaded, CacheState::Cached)
                .await
            {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    inner.reporter.end(JobKind::Drain, Outcome::Ok, bytes);
                    debug!(id = %id, "uploaded file removed during drain");
                    return DrainOutcome::Gone;
                }
                Err(e) => {
                    // The blob is safe; a later restart requeues and re-uploads.
                    error!(id = %id, "renaming drained file: {e}");
                    inner.reporter.end(JobKind::Drain, Outcome::Failed, 0);
                    return DrainOutcome::Stranded { attempts };
                }
            }
            inner.metrics.drained.inc();
            inner.reporter.end(JobKind::Drain, Outcome::Ok, bytes);
            inner.events.emit(Event::Drained {
                object_id: id,
                bytes,
                attempts,
                timestamp: Event::now(),
            });
            info!(id = %id, bytes, attempts, etag = %etag, "drained");
            DrainOutcome::Drained { bytes, attempts }
        }
        Err((CacheError::Io(e), _)) if e.kind() == io::ErrorKind::NotFound => {
            inner.reporter.end(JobKind::Drain, Outcome::Ok, 0);
            debug!(id = %id, "staged file removed during drain");
            DrainOutcome::Gone
        }
        Err((e, attempts)) => {
            inner.reporter.end(JobKind::Drain, Outcome::Failed, 0);
            park(inner, id, attempts, &e).await
        }
    }
}

/// One upload attempt, checked for visibility afterwards.
async fn upload_verified(
    inner: &Inner,
    id: &ObjectId,
    path: &std::path::Path,
) -> CacheResult<String> {
    let upload = upload_file(inner.backend.as_ref(), id, path, &inner.opts.blob);
    let etag = match tokio::time::timeout(inner.opts.blob.stream_timeout(), upload).await {
        Ok(r) => r?,
        Err(_) => return Err(CacheError::Timeout { op: "drain upload" }),
    };
    if !inner.backend.exists(id).await? {
        return Err(CacheError::Unverified(*id));
    }
    Ok(etag)
}

async fn park(inner: &Inner, id: ObjectId, attempts: u32, cause: &CacheError) -> DrainOutcome {
    match inner
        .partition
        .transition(&id, CacheState::Uploaded, CacheState::Orphaned)
        .await
    {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => return DrainOutcome::Gone,
        Err(e) => {
            error!(id = %id, attempts, error = %cause, "drain gave up and the orphan could not be parked: {e}");
            return DrainOutcome::Stranded { attempts };
        }
    }
    inner.metrics.orphaned.inc();
    error!(id = %id, attempts, error = %cause, "drain gave up; ciphertext orphaned");
    inner.events.emit(Event::Orphaned {
        object_id: id,
        attempts,
        reason: cause.to_string(),
        timestamp: Event::now(),
    });
    DrainOutcome::Orphaned { attempts }
}
