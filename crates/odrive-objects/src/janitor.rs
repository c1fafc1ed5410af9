//! Collects ciphertext that no live object references.
//!
//! Such ciphertext comes from uploads whose metadata commit failed, from
//! replaced content versions, and from expunges whose cleanup could not
//! finish. An id is deleted once it has been unreferenced for the grace
//! window: measured from its local file time, or from when this janitor
//! first saw it in the blob store.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use odrive_cache::{CacheError, CiphertextCache, Clock, SystemClock};
use odrive_core::ObjectId;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ObjectResult;
use crate::model::ObjectState;
use crate::store::MetadataStore;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JanitorReport {
    pub local_removed: usize,
    pub remote_removed: usize,
    /// Unreferenced, still inside the grace window
    pub pending: usize,
}

pub struct Janitor {
    store: Arc<dyn MetadataStore>,
    cache: CiphertextCache,
    grace: Duration,
    clock: Arc<dyn Clock>,
    first_seen: Mutex<HashMap<ObjectId, SystemTime>>,
}

impl Janitor {
    pub fn new(store: Arc<dyn MetadataStore>, cache: CiphertextCache, grace: Duration) -> Self {
        Janitor {
            store,
            cache,
            grace,
            clock: Arc::new(SystemClock),
            first_seen: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Content ids referenced by objects that are not expunged.
    async fn referenced(&self) -> ObjectResult<HashSet<ObjectId>> {
        let mut live = HashSet::new();
        for id in self.store.object_ids().await? {
            if let Some(record) = self.store.get_object(&id).await? {
                if record.state != ObjectState::Expunged {
                    live.extend(record.content_id);
                }
            }
        }
        Ok(live)
    }

    /// One pass over the local partition and the blob store.
    pub async fn sweep(&self) -> ObjectResult<JanitorReport> {
        let now = self.clock.now();
        let live = self.referenced().await?;
        let mut report = JanitorReport::default();

        // Oldest evidence of each unreferenced id.
        let mut local: HashMap<ObjectId, SystemTime> = HashMap::new();
        for entry in self.cache.partition().scan().await.map_err(CacheError::from)? {
            if entry.state.is_temp() || live.contains(&entry.id) {
                continue;
            }
            local
                .entry(entry.id)
                .and_modify(|t| *t = (*t).min(entry.modified))
                .or_insert(entry.modified);
        }
        let remote: HashSet<ObjectId> = match self.cache.backend().list().await {
            Ok(ids) => ids.into_iter().filter(|id| !live.contains(id)).collect(),
            Err(e) => {
                warn!("janitor: listing blob store failed: {e}");
                HashSet::new()
            }
        };

        let candidates: HashSet<ObjectId> = local.keys().chain(remote.iter()).copied().collect();
        let expired: Vec<ObjectId> = {
            let mut seen = self.first_seen.lock().expect("janitor lock poisoned");
            seen.retain(|id, _| candidates.contains(id));
            candidates
                .iter()
                .filter(|id| {
                    let first = *seen.entry(**id).or_insert(now);
                    let since = local.get(*id).map_or(first, |m| first.min(*m));
                    let expired = now.duration_since(since).unwrap_or_default() >= self.grace;
                    if !expired {
                        report.pending += 1;
                    }
                    expired
                })
                .copied()
                .collect()
        };

        for id in expired {
            if local.contains_key(&id) {
                match self.cache.remove(&id).await {
                    Ok(()) => report.local_removed += 1,
                    Err(e) => {
                        debug!(id = %id, "janitor: local copy kept: {e}");
                        report.pending += 1;
                        continue;
                    }
                }
            }
            if remote.contains(&id) {
                match self.cache.backend().delete(&id).await {
                    Ok(()) => report.remote_removed += 1,
                    Err(e) if e.is_not_found() => {}
                    Err(e) => {
                        warn!(id = %id, "janitor: remote delete failed: {e}");
                        report.pending += 1;
                        continue;
                    }
                }
            }
            self.first_seen
                .lock()
                .expect("janitor lock poisoned")
                .remove(&id);
            info!(id = %id, "janitor: unreferenced ciphertext removed");
        }

        if report != JanitorReport::default() {
            info!(
                local_removed = report.local_removed,
                remote_removed = report.remote_removed,
                pending = report.pending,
                "janitor sweep"
            );
        }
        Ok(report)
    }

    /// Sweep every `interval` until `cancel`.
    pub fn spawn(self: Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = cancel.cancelled() => break,
                }
                if let Err(e) = self.sweep().await {
                    warn!("janitor sweep failed: {e}");
                }
            }
            debug!("janitor stopped");
        })
    }
}
