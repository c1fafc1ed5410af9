//! The ciphertext cache: one partition directory, a blob backend behind it,
//! and optionally peers behind that.

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime};

use futures::FutureExt;
use odrive_core::config::{BlobConfig, CacheConfig, DrainConfig};
use odrive_core::events::{FetchSource, LogSink};
use odrive_core::{ByteRange, Event, EventSink, ObjectId};
use odrive_storage::{BlobBackend, BlobReader};
use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{CacheError, CacheResult};
use crate::flight::{FlightFuture, FlightResult, FlightTicket, Flights, Joined};
use crate::lease::{CachedHandle, Leases};
use crate::metrics::CacheMetrics;
use crate::partition::{CacheState, Partition};
use crate::peer::PeerSource;
use crate::reporter::{JobKind, JobReport, Outcome, Reporter};

/// Attempts `open` makes before giving up on a file that keeps vanishing.
const MAX_OPEN_ROUNDS: usize = 4;

/// Everything the cache needs from configuration.
#[derive(Debug, Clone)]
pub struct CacheOptions {
    pub cache: CacheConfig,
    pub blob: BlobConfig,
    pub drain: DrainConfig,
    /// Capacity the watermarks are measured against
    pub capacity_bytes: u64,
    /// Upper bound for one peer fetch attempt
    pub peer_timeout: Duration,
}

impl CacheOptions {
    pub fn new(cache: CacheConfig, blob: BlobConfig, drain: DrainConfig) -> Self {
        let capacity_bytes = cache.capacity_bytes();
        Self {
            cache,
            blob,
            drain,
            capacity_bytes,
            peer_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_capacity(mut self, bytes: u64) -> Self {
        self.capacity_bytes = bytes;
        self
    }

    pub fn with_peer_timeout(mut self, timeout: Duration) -> Self {
        self.peer_timeout = timeout;
        self
    }
}

/// Per-state file counts and byte usage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub uploading: usize,
    pub uploaded: usize,
    pub caching: usize,
    pub cached: usize,
    pub orphaned: usize,
    pub used_bytes: u64,
    pub capacity_bytes: u64,
    pub drain_pending: usize,
}

pub(crate) struct Inner {
    pub(crate) opts: CacheOptions,
    pub(crate) partition: Partition,
    pub(crate) backend: Arc<dyn BlobBackend>,
    pub(crate) peers: Option<Arc<dyn PeerSource>>,
    pub(crate) events: Arc<dyn EventSink>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) leases: Arc<Leases>,
    pub(crate) flights: Arc<Flights>,
    /// Last read per id; file mtime stands in when absent.
    pub(crate) access: Mutex<HashMap<ObjectId, SystemTime>>,
    pub(crate) used: AtomicU64,
    pub(crate) drain_tx: mpsc::Sender<ObjectId>,
    drain_rx: Mutex<Option<mpsc::Receiver<ObjectId>>>,
    pub(crate) drain_pending: AtomicUsize,
    recovered: Mutex<Vec<ObjectId>>,
    pub(crate) wake_walker: Notify,
    pub(crate) metrics: CacheMetrics,
    pub(crate) reporter: Reporter,
}

impl Inner {
    pub(crate) fn touch(&self, id: ObjectId) {
        let now = self.clock.now();
        self.access
            .lock()
            .expect("access map poisoned")
            .insert(id, now);
    }

    pub(crate) fn forget(&self, id: &ObjectId) {
        self.access.lock().expect("access map poisoned").remove(id);
    }

    pub(crate) fn add_used(&self, bytes: u64) {
        let now = self.used.fetch_add(bytes, Ordering::Relaxed) + bytes;
        self.metrics.used_bytes.set(now as i64);
    }

    pub(crate) fn sub_used(&self, bytes: u64) {
        let prev = self
            .used
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |u| {
                Some(u.saturating_sub(bytes))
            })
            .unwrap_or(0);
        self.metrics
            .used_bytes
            .set(prev.saturating_sub(bytes) as i64);
    }

    pub(crate) fn set_used(&self, bytes: u64) {
        self.used.store(bytes, Ordering::Relaxed);
        self.metrics.used_bytes.set(bytes as i64);
    }

    pub(crate) fn used_fraction(&self, used: u64) -> f64 {
        let cap = self.opts.capacity_bytes;
        if cap == 0 {
            return if used == 0 { 0.0 } else { f64::INFINITY };
        }
        used as f64 / cap as f64
    }

    pub(crate) fn drain_done(&self) {
        let prev = self
            .drain_pending
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(1))
            })
            .unwrap_or(0);
        self.metrics
            .drain_queue_depth
            .set(prev.saturating_sub(1) as i64);
    }

    /// Miss path: blob backend first, then peers. Runs inside a flight.
    async fn materialize(
        self: Arc<Self>,
        mut ticket: FlightTicket,
        cancel: CancellationToken,
        deadline: Option<Instant>,
    ) -> FlightResult {
        let id = ticket.id();
        let temp = self.partition.path(&id, CacheState::Caching);
        ticket.guard_temp(temp.clone());
        self.reporter.begin(JobKind::Materialize);

        let result = async {
            let (bytes, source) = self.fetch_into(&id, &temp, &cancel, deadline).await?;
            self.partition
                .transition(&id, CacheState::Caching, CacheState::Cached)
                .await?;
            Ok::<_, CacheError>((bytes, source))
        }
        .await;

        match result {
            Ok((bytes, source)) => {
                ticket.disarm();
                self.add_used(bytes);
                self.touch(id);
                match source {
                    FetchSource::Blob => self.metrics.blob_fetches.inc(),
                    FetchSource::Peer => self.metrics.peer_fetches.inc(),
                };
                self.events.emit(Event::Materialized {
                    object_id: id,
                    source,
                    bytes,
                    timestamp: Event::now(),
                });
                self.reporter.end(JobKind::Materialize, Outcome::Ok, bytes);
                info!(id = %id, bytes, source = ?source, "materialized");
                if self.used_fraction(self.used.load(Ordering::Relaxed))
                    >= self.opts.cache.high_watermark
                {
                    self.wake_walker.notify_one();
                }
                Ok(())
            }
            Err(e) => {
                let outcome = if e.is_cancelled() {
                    Outcome::Cancelled
                } else {
                    Outcome::Failed
                };
                self.reporter.end(JobKind::Materialize, outcome, 0);
                debug!(id = %id, error = %e, "materialization failed");
                Err(Arc::new(e))
            }
        }
    }

    async fn fetch_into(
        &self,
        id: &ObjectId,
        temp: &std::path::Path,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> CacheResult<(u64, FetchSource)> {
        let blob_err = match self.copy_from_blob(id, temp, cancel).await {
            Ok(n) => return Ok((n, FetchSource::Blob)),
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => e,
        };
        if !blob_err.is_not_found() {
            warn!(id = %id, error = %blob_err, "blob fetch failed; trying peers");
        }

        if let Some(peers) = &self.peers {
            for peer in peers.candidates(id).await {
                let Some(budget) = peer_budget(self.opts.peer_timeout, deadline, Instant::now())
                else {
                    warn!(id = %id, "caller deadline passed; no more peers tried");
                    break;
                };
                let attempt = self.copy_from_peer(peers.as_ref(), &peer, id, temp, cancel);
                match tokio::time::timeout(budget, attempt).await {
                    Ok(Ok(n)) => return Ok((n, FetchSource::Peer)),
                    Ok(Err(e)) if e.is_cancelled() => return Err(e),
                    Ok(Err(e)) => debug!(id = %id, peer = %peer, error = %e, "peer fetch failed"),
                    Err(_) => warn!(id = %id, peer = %peer, "peer fetch timed out"),
                }
            }
        }

        if blob_err.is_not_found() {
            Err(CacheError::NotFound(*id))
        } else {
            Err(blob_err)
        }
    }

    async fn copy_from_blob(
        &self,
        id: &ObjectId,
        temp: &std::path::Path,
        cancel: &CancellationToken,
    ) -> CacheResult<u64> {
        let fetch = async {
            let reader = self.backend.get(id, ByteRange::full()).await?;
            write_temp(temp, reader, None, cancel).await
        };
        match tokio::time::timeout(self.opts.blob.stream_timeout(), fetch).await {
            Ok(r) => r,
            Err(_) => Err(CacheError::Timeout { op: "blob fetch" }),
        }
    }

    async fn copy_from_peer(
        &self,
        peers: &dyn PeerSource,
        peer: &str,
        id: &ObjectId,
        temp: &std::path::Path,
        cancel: &CancellationToken,
    ) -> CacheResult<u64> {
        let (reader, len) = peers.open(peer, id).await?;
        write_temp(temp, reader, len, cancel).await
    }
}

/// Time allowed for one peer attempt: half of what is left before
/// `deadline`, never more than `cap`. `None` once the deadline has passed.
pub(crate) fn peer_budget(cap: Duration, deadline: Option<Instant>, now: Instant) -> Option<Duration> {
    let Some(deadline) = deadline else {
        return Some(cap);
    };
    let remaining = deadline.checked_duration_since(now).filter(|d| !d.is_zero())?;
    Some(cap.min(remaining / 2))
}

/// Resolves at `deadline`, or never.
async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

/// Stream `reader` into a fresh `temp` file, honoring cancellation.
async fn write_temp(
    temp: &std::path::Path,
    mut reader: BlobReader,
    expected: Option<u64>,
    cancel: &CancellationToken,
) -> CacheResult<u64> {
    let mut file = tokio::fs::File::create(temp).await?;
    let copied = tokio::select! {
        r = tokio::io::copy(&mut reader, &mut file) => r?,
        _ = cancel.cancelled() => return Err(CacheError::Cancelled),
    };
    file.sync_all().await?;
    if let Some(expected) = expected {
        if copied != expected {
            return Err(CacheError::Peer(format!(
                "body ended at {copied} of {expected} bytes"
            )));
        }
    }
    Ok(copied)
}

/// Builder for [`CiphertextCache`].
pub struct CacheBuilder {
    opts: CacheOptions,
    backend: Arc<dyn BlobBackend>,
    peers: Option<Arc<dyn PeerSource>>,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    metrics: CacheMetrics,
}

impl CacheBuilder {
    pub fn new(opts: CacheOptions, backend: Arc<dyn BlobBackend>) -> Self {
        Self {
            opts,
            backend,
            peers: None,
            events: Arc::new(LogSink),
            clock: Arc::new(SystemClock),
            metrics: CacheMetrics::default(),
        }
    }

    pub fn peers(mut self, peers: Arc<dyn PeerSource>) -> Self {
        self.peers = Some(peers);
        self
    }

    pub fn events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn metrics(mut self, metrics: CacheMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Recover the partition and return a cache ready for
    /// [`spawn_background`](CiphertextCache::spawn_background).
    pub async fn open(self) -> CacheResult<CiphertextCache> {
        let partition = Partition::new(self.opts.cache.partition_dir());
        let report = partition.recover().await?;

        if let Err(e) = self
            .backend
            .ensure_partition(self.backend.partition())
            .await
        {
            warn!(backend = self.backend.name(), error = %e, "could not ensure blob partition");
        }

        let (drain_tx, drain_rx) = mpsc::channel(self.opts.cache.drain_queue.max(1));
        let inner = Inner {
            partition,
            backend: self.backend,
            peers: self.peers,
            events: self.events,
            clock: self.clock,
            leases: Arc::new(Leases::default()),
            flights: Arc::new(Flights::default()),
            access: Mutex::new(HashMap::new()),
            used: AtomicU64::new(0),
            drain_tx,
            drain_rx: Mutex::new(Some(drain_rx)),
            drain_pending: AtomicUsize::new(0),
            recovered: Mutex::new(report.requeue),
            wake_walker: Notify::new(),
            metrics: self.metrics,
            reporter: Reporter::spawn(),
            opts: self.opts,
        };
        inner.set_used(report.used_bytes);
        Ok(CiphertextCache {
            inner: Arc::new(inner),
        })
    }
}

#[derive(Clone)]
pub struct CiphertextCache {
    pub(crate) inner: Arc<Inner>,
}

impl CiphertextCache {
    /// Start the drain workers and the eviction walker, and requeue
    /// everything recovery found in `.uploaded`.
    pub fn spawn_background(&self, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        let rx = self
            .inner
            .drain_rx
            .lock()
            .expect("drain receiver poisoned")
            .take();
        if let Some(rx) = rx {
            let rx = Arc::new(tokio::sync::Mutex::new(rx));
            for worker in 0..self.inner.opts.cache.drain_workers.max(1) {
                handles.push(tokio::spawn(crate::drain::run_worker(
                    Arc::clone(&self.inner),
                    Arc::clone(&rx),
                    cancel.clone(),
                    worker,
                )));
            }
        } else {
            warn!("background tasks already running");
            return handles;
        }

        handles.push(tokio::spawn(crate::evict::run_walker(
            Arc::clone(&self.inner),
            cancel.clone(),
        )));

        let recovered = std::mem::take(&mut *self.inner.recovered.lock().expect("recovered poisoned"));
        if !recovered.is_empty() {
            let cache = self.clone();
            handles.push(tokio::spawn(async move {
                for id in recovered {
                    if cache.enqueue_drain(id).await.is_err() {
                        break;
                    }
                }
            }));
        }
        handles
    }

    pub fn partition(&self) -> &Partition {
        &self.inner.partition
    }

    pub fn backend(&self) -> Arc<dyn BlobBackend> {
        Arc::clone(&self.inner.backend)
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.inner.metrics
    }

    pub fn used_bytes(&self) -> u64 {
        self.inner.used.load(Ordering::Relaxed)
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.inner.opts.capacity_bytes
    }

    /// Ids enqueued for drain and not yet finished.
    pub fn drain_pending(&self) -> usize {
        self.inner.drain_pending.load(Ordering::Relaxed)
    }

    pub async fn report(&self) -> JobReport {
        self.inner.reporter.report().await
    }

    /// Put `id` on the drain queue. Waits while the queue is full.
    pub async fn enqueue_drain(&self, id: ObjectId) -> CacheResult<()> {
        let depth = self.inner.drain_pending.fetch_add(1, Ordering::Relaxed) + 1;
        self.inner.metrics.drain_queue_depth.set(depth as i64);
        if self.inner.drain_tx.send(id).await.is_err() {
            self.inner.drain_done();
            return Err(CacheError::Cancelled);
        }
        debug!(id = %id, depth, "queued for drain");
        Ok(())
    }

    /// Reject new ingests when above the high watermark with nothing to evict.
    pub async fn admission(&self) -> CacheResult<()> {
        let used = self.used_bytes();
        if self.inner.used_fraction(used) < self.inner.opts.cache.high_watermark {
            return Ok(());
        }
        self.inner.wake_walker.notify_one();
        if self.inner.evictable_bytes().await? > 0 {
            return Ok(());
        }
        warn!(used, capacity = self.capacity_bytes(), "cache full");
        Err(CacheError::CacheFull {
            used,
            capacity: self.capacity_bytes(),
        })
    }

    /// Start writing the ciphertext for a new id into `<id>.uploading`.
    pub async fn begin_ingest(&self, id: ObjectId) -> CacheResult<IngestWriter> {
        self.admission().await?;

        let path = self.inner.partition.path(&id, CacheState::Uploading);
        let mut slot: Option<(FlightTicket, oneshot::Sender<FlightResult>)> = None;
        let partition = &self.inner.partition;
        let joined = self.inner.flights.join_or_start(
            id,
            || partition.settled_state_sync(&id).is_none(),
            |mut ticket| {
                ticket.guard_temp(path.clone());
                let (tx, rx) = oneshot::channel();
                slot = Some((ticket, tx));
                async move {
                    rx.await
                        .unwrap_or_else(|_| Err(Arc::new(CacheError::Cancelled)))
                }
                .boxed()
            },
        );
        let flight = match joined {
            Joined::Lead(f) => f,
            Joined::Wait(_) => {
                return Err(CacheError::WrongState {
                    id,
                    state: "in flight",
                    expected: "absent",
                })
            }
            Joined::Settled => {
                return Err(CacheError::WrongState {
                    id,
                    state: "present",
                    expected: "absent",
                })
            }
        };
        let (ticket, done) = slot.expect("flight started without a ticket");

        let file = tokio::fs::File::create(&path).await?;
        self.inner.reporter.begin(JobKind::Ingest);
        debug!(id = %id, "ingest started");
        Ok(IngestWriter {
            inner: Arc::clone(&self.inner),
            id,
            file: Some(file),
            written: 0,
            ticket: Some(ticket),
            done: Some(done),
            _flight: flight,
        })
    }

    /// A leased handle on a local settled file, without touching the miss path.
    pub async fn open_local(&self, id: &ObjectId) -> CacheResult<Option<CachedHandle>> {
        let lease = self.inner.leases.acquire(*id);
        for state in [CacheState::Cached, CacheState::Uploaded, CacheState::Orphaned] {
            match tokio::fs::File::open(self.inner.partition.path(id, state)).await {
                Ok(file) => {
                    let size = file.metadata().await?.len();
                    self.inner.touch(*id);
                    return Ok(Some(CachedHandle::new(file, size, state, lease)));
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }

    /// Open `id` for reading, materializing it on a miss.
    ///
    /// Concurrent callers for the same id share one materialization. If the
    /// caller that started it is cancelled, the others start over.
    pub async fn open(
        &self,
        id: &ObjectId,
        cancel: &CancellationToken,
    ) -> CacheResult<CachedHandle> {
        self.open_until(id, None, cancel).await
    }

    /// [`open`](Self::open) bounded by the caller's `deadline`. Peer attempts
    /// on the miss path get a share of the time that remains.
    pub async fn open_until(
        &self,
        id: &ObjectId,
        deadline: Option<Instant>,
        cancel: &CancellationToken,
    ) -> CacheResult<CachedHandle> {
        for _ in 0..MAX_OPEN_ROUNDS {
            if cancel.is_cancelled() {
                return Err(CacheError::Cancelled);
            }
            if let Some(handle) = self.open_local(id).await? {
                self.inner.metrics.hits.inc();
                return Ok(handle);
            }

            let partition = &self.inner.partition;
            let inner = Arc::clone(&self.inner);
            let token = cancel.clone();
            let joined = self.inner.flights.join_or_start(
                *id,
                || partition.settled_state_sync(id).is_none(),
                move |ticket| inner.materialize(ticket, token, deadline).boxed(),
            );
            let flight = match joined {
                Joined::Settled => continue,
                Joined::Lead(f) => {
                    self.inner.metrics.misses.inc();
                    f
                }
                Joined::Wait(f) => f,
            };

            tokio::select! {
                r = flight => match r {
                    Ok(()) => continue,
                    Err(e) if e.is_cancelled() && !cancel.is_cancelled() => continue,
                    Err(e) => return Err(CacheError::Shared(e)),
                },
                _ = cancel.cancelled() => return Err(CacheError::Cancelled),
                _ = expire(deadline) => return Err(CacheError::Timeout { op: "open" }),
            }
        }
        Err(CacheError::NotFound(*id))
    }

    /// The settled state of `id`, if it has a local file.
    pub fn state_of(&self, id: &ObjectId) -> Option<CacheState> {
        self.inner.partition.settled_state_sync(id)
    }

    /// Delete every local file for `id`. Fails with `Busy` while leased or in flight.
    pub async fn remove(&self, id: &ObjectId) -> CacheResult<()> {
        if self.inner.flights.in_flight(id) {
            return Err(CacheError::Busy(*id));
        }
        let p = &self.inner.partition;
        let paths = vec![
            p.path(id, CacheState::Cached),
            p.path(id, CacheState::Uploaded),
            p.path(id, CacheState::Orphaned),
        ];
        match self.inner.leases.unlink_if_idle(*id, paths).await? {
            None => Err(CacheError::Busy(*id)),
            Some(freed) => {
                self.inner.sub_used(freed);
                self.inner.forget(id);
                debug!(id = %id, freed, "removed local ciphertext");
                Ok(())
            }
        }
    }

    /// Move an orphan back to `.uploaded` and queue it for another drain.
    pub async fn requeue_orphan(&self, id: &ObjectId) -> CacheResult<()> {
        match self
            .inner
            .partition
            .transition(id, CacheState::Orphaned, CacheState::Uploaded)
            .await
        {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(CacheError::WrongState {
                    id: *id,
                    state: self.state_of(id).map(|s| s.suffix()).unwrap_or("absent"),
                    expected: "orphaned",
                })
            }
            Err(e) => return Err(e.into()),
        }
        info!(id = %id, "orphan requeued");
        self.enqueue_drain(*id).await
    }

    pub async fn stats(&self) -> CacheResult<CacheStats> {
        let mut stats = CacheStats {
            capacity_bytes: self.capacity_bytes(),
            drain_pending: self.drain_pending(),
            ..Default::default()
        };
        for entry in self.inner.partition.scan().await? {
            stats.used_bytes += entry.size;
            match entry.state {
                CacheState::Uploading => stats.uploading += 1,
                CacheState::Uploaded => stats.uploaded += 1,
                CacheState::Caching => stats.caching += 1,
                CacheState::Cached => stats.cached += 1,
                CacheState::Orphaned => stats.orphaned += 1,
            }
        }
        Ok(stats)
    }
}

/// Writer for `<id>.uploading`.
///
/// [`finalize`](Self::finalize) renames to `.uploaded`. Dropping the writer
/// without finalizing deletes the temp file and fails anyone waiting on
/// the id.
pub struct IngestWriter {
    inner: Arc<Inner>,
    id: ObjectId,
    file: Option<tokio::fs::File>,
    written: u64,
    ticket: Option<FlightTicket>,
    done: Option<oneshot::Sender<FlightResult>>,
    _flight: FlightFuture,
}

impl IngestWriter {
    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    /// Flush, fsync and rename to `.uploaded`. Returns the byte count.
    pub async fn finalize(mut self) -> CacheResult<u64> {
        let mut file = self.file.take().expect("ingest writer already finalized");
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        self.inner
            .partition
            .transition(&self.id, CacheState::Uploading, CacheState::Uploaded)
            .await?;
        if let Some(ticket) = self.ticket.as_mut() {
            ticket.disarm();
        }
        self.inner.add_used(self.written);
        self.inner.touch(self.id);
        if let Some(done) = self.done.take() {
            let _ = done.send(Ok(()));
        }
        self.inner
            .reporter
            .end(JobKind::Ingest, Outcome::Ok, self.written);
        debug!(id = %self.id, bytes = self.written, "ingest finalized");
        // Ticket drops with self, releasing the flight entry.
        Ok(self.written)
    }
}

impl Drop for IngestWriter {
    fn drop(&mut self) {
        if let Some(done) = self.done.take() {
            let _ = done.send(Err(Arc::new(CacheError::Cancelled)));
            self.inner
                .reporter
                .end(JobKind::Ingest, Outcome::Cancelled, 0);
            debug!(id = %self.id, "ingest abandoned");
        }
        // Close the file before the ticket unlinks it.
        self.file.take();
        self.ticket.take();
    }
}

impl AsyncWrite for IngestWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        let Some(file) = this.file.as_mut() else {
            return Poll::Ready(Err(io::Error::other("ingest writer finalized")));
        };
        let n = futures::ready!(Pin::new(file).poll_write(cx, buf))?;
        this.written += n as u64;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.file.as_mut() {
            Some(file) => Pin::new(file).poll_flush(cx),
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.file.as_mut() {
            Some(file) => Pin::new(file).poll_shutdown(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}
