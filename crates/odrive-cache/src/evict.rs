//! Eviction walker.
//!
//! Only `.cached` files are candidates: they are durable in the blob
//! backend, so removing the local copy loses nothing. Candidates must be
//! idle for at least `evict_age` and unleased. Larger, older files go first
//! (score = age / size, highest first) until usage drops under the low
//! watermark.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use odrive_core::{Event, ObjectId};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{CiphertextCache, Inner};
use crate::error::CacheResult;
use crate::partition::CacheState;
use crate::reporter::{JobKind, Outcome};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EvictReport {
    pub before: u64,
    pub after: u64,
    pub freed: u64,
    pub evicted: usize,
    /// Candidates skipped because a reader held them
    pub skipped_leased: usize,
}

#[derive(Debug)]
struct Candidate {
    id: ObjectId,
    size: u64,
    score: f64,
}

impl Inner {
    /// Eviction candidates, best first. The access map is only read, never
    /// held across I/O.
    async fn candidates(&self) -> CacheResult<(Vec<Candidate>, u64)> {
        let entries = self.partition.scan().await?;
        let used: u64 = entries.iter().map(|e| e.size).sum();
        let access: HashMap<ObjectId, SystemTime> =
            self.access.lock().expect("access map poisoned").clone();
        let now = self.clock.now();
        let min_age = self.opts.cache.evict_age();

        let mut out: Vec<Candidate> = entries
            .into_iter()
            .filter(|e| e.state == CacheState::Cached)
            .filter_map(|e| {
                let last = access.get(&e.id).copied().unwrap_or(e.modified);
                let age = now.duration_since(last).unwrap_or(Duration::ZERO);
                (age >= min_age).then(|| Candidate {
                    id: e.id,
                    size: e.size,
                    score: age.as_secs_f64() / e.size.max(1) as f64,
                })
            })
            .collect();
        out.sort_by(|a, b| b.score.total_cmp(&a.score));
        Ok((out, used))
    }

    /// Bytes the walker could free right now, ignoring watermarks.
    pub(crate) async fn evictable_bytes(&self) -> CacheResult<u64> {
        let (candidates, _) = self.candidates().await?;
        Ok(candidates
            .iter()
            .filter(|c| self.leases.count(&c.id) == 0)
            .map(|c| c.size)
            .sum())
    }

    pub(crate) async fn sweep(&self) -> CacheResult<EvictReport> {
        let (candidates, used) = self.candidates().await?;
        self.set_used(used);
        let mut report = EvictReport {
            before: used,
            after: used,
            ..Default::default()
        };
        let low = self.opts.cache.low_watermark;
        if self.used_fraction(used) < low {
            return Ok(report);
        }

        self.reporter.begin(JobKind::Evict);
        for c in candidates {
            if self.used_fraction(report.after) < low {
                break;
            }
            let path = self.partition.path(&c.id, CacheState::Cached);
            match self.leases.unlink_if_idle(c.id, vec![path]).await {
                Ok(None) => {
                    report.skipped_leased += 1;
                    continue;
                }
                Ok(Some(0)) => continue,
                Ok(Some(freed)) => {
                    report.after = report
                        .after
                        .checked_sub(freed)
                        .expect("evicted more bytes than the scan counted");
                    report.freed += freed;
                    report.evicted += 1;
                    self.forget(&c.id);
                    self.metrics.evicted_bytes.inc_by(freed);
                    self.events.emit(Event::Evicted {
                        object_id: c.id,
                        bytes: freed,
                        timestamp: Event::now(),
                    });
                    debug!(id = %c.id, bytes = freed, score = c.score, "evicted");
                }
                Err(e) => warn!(id = %c.id, size = c.size, "evicting: {e}"),
            }
        }
        self.set_used(report.after);
        self.reporter
            .end(JobKind::Evict, Outcome::Ok, report.freed);
        info!(
            before = report.before,
            after = report.after,
            evicted = report.evicted,
            skipped_leased = report.skipped_leased,
            "eviction pass"
        );
        Ok(report)
    }
}

pub(crate) async fn run_walker(inner: Arc<Inner>, cancel: CancellationToken) {
    let every = inner.opts.cache.walk_sleep();
    debug!(every = ?every, "eviction walker started");
    loop {
        tokio::select! {
            _ = tokio::time::sleep(every) => {}
            _ = inner.wake_walker.notified() => {}
            _ = cancel.cancelled() => break,
        }
        if let Err(e) = inner.sweep().await {
            warn!("eviction pass failed: {e}");
        }
    }
    debug!("eviction walker stopped");
}

impl CiphertextCache {
    /// Run one eviction pass now.
    pub async fn evict_once(&self) -> CacheResult<EvictReport> {
        let report = self.inner.sweep().await?;
        debug_assert_eq!(report.after, self.inner.used.load(Ordering::Relaxed));
        Ok(report)
    }
}
