#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use odrive_cache::{
    CacheBuilder, CacheError, CacheOptions, CacheResult, CiphertextCache, Clock, PeerSource,
};
use odrive_core::config::{BlobConfig, CacheConfig, DrainConfig};
use odrive_core::events::ChannelSink;
use odrive_core::{ByteRange, Event, ObjectId};
use odrive_storage::{BlobBackend, BlobError, BlobReader, BlobResult, FsBackend};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::UnboundedReceiver;

/// Filesystem backend that counts gets and can be told to fail uploads.
pub struct TestBackend {
    inner: FsBackend,
    pub gets: AtomicUsize,
    pub puts: AtomicUsize,
    pub fail_puts: AtomicBool,
    pub get_delay: Duration,
}

impl TestBackend {
    pub fn new(root: &std::path::Path) -> Self {
        Self {
            inner: FsBackend::new(root, "blobs"),
            gets: AtomicUsize::new(0),
            puts: AtomicUsize::new(0),
            fail_puts: AtomicBool::new(false),
            get_delay: Duration::ZERO,
        }
    }

    pub fn with_get_delay(mut self, delay: Duration) -> Self {
        self.get_delay = delay;
        self
    }

    /// Store `body` directly, bypassing the cache.
    pub async fn seed(&self, id: &ObjectId, body: &[u8]) {
        self.inner.ensure_partition("blobs").await.unwrap();
        let reader: BlobReader = Box::pin(std::io::Cursor::new(body.to_vec()));
        self.inner.put(id, reader, body.len() as u64).await.unwrap();
    }

    fn check_put(&self) -> BlobResult<()> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(BlobError::Timeout {
                op: "put",
                secs: 0,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl BlobBackend for TestBackend {
    fn name(&self) -> &'static str {
        "test"
    }

    fn partition(&self) -> &str {
        self.inner.partition()
    }

    async fn ensure_partition(&self, partition: &str) -> BlobResult<()> {
        self.inner.ensure_partition(partition).await
    }

    async fn put(&self, id: &ObjectId, body: BlobReader, len: u64) -> BlobResult<String> {
        self.check_put()?;
        self.inner.put(id, body, len).await
    }

    async fn put_multipart(
        &self,
        id: &ObjectId,
        body: BlobReader,
        len: u64,
        part_size: u64,
    ) -> BlobResult<String> {
        self.check_put()?;
        self.inner.put_multipart(id, body, len, part_size).await
    }

    async fn get(&self, id: &ObjectId, range: ByteRange) -> BlobResult<BlobReader> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        if !self.get_delay.is_zero() {
            tokio::time::sleep(self.get_delay).await;
        }
        self.inner.get(id, range).await
    }

    async fn size(&self, id: &ObjectId) -> BlobResult<u64> {
        self.inner.size(id).await
    }

    async fn exists(&self, id: &ObjectId) -> BlobResult<bool> {
        self.inner.exists(id).await
    }

    async fn delete(&self, id: &ObjectId) -> BlobResult<()> {
        self.inner.delete(id).await
    }

    async fn list(&self) -> BlobResult<Vec<ObjectId>> {
        self.inner.list().await
    }
}

/// In-memory peers keyed by address.
#[derive(Default)]
pub struct MapPeers {
    pub stores: Mutex<HashMap<String, HashMap<ObjectId, Vec<u8>>>>,
    pub opened: AtomicUsize,
}

impl MapPeers {
    pub fn insert(&self, peer: &str, id: ObjectId, body: &[u8]) {
        self.stores
            .lock()
            .unwrap()
            .entry(peer.to_string())
            .or_default()
            .insert(id, body.to_vec());
    }
}

#[async_trait]
impl PeerSource for MapPeers {
    async fn candidates(&self, _id: &ObjectId) -> Vec<String> {
        let mut peers: Vec<String> = self.stores.lock().unwrap().keys().cloned().collect();
        peers.sort();
        peers
    }

    async fn open(&self, peer: &str, id: &ObjectId) -> CacheResult<(BlobReader, Option<u64>)> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        let body = self
            .stores
            .lock()
            .unwrap()
            .get(peer)
            .and_then(|m| m.get(id).cloned())
            .ok_or_else(|| CacheError::Peer(format!("{peer} does not have {id}")))?;
        let len = body.len() as u64;
        Ok((Box::pin(std::io::Cursor::new(body)), Some(len)))
    }
}

/// One peer that accepts the request and never sends a byte.
pub struct StalledPeer;

#[async_trait]
impl PeerSource for StalledPeer {
    async fn candidates(&self, _id: &ObjectId) -> Vec<String> {
        vec!["https://stalled".to_string()]
    }

    async fn open(&self, _peer: &str, _id: &ObjectId) -> CacheResult<(BlobReader, Option<u64>)> {
        std::future::pending().await
    }
}

pub fn fast_drain() -> DrainConfig {
    DrainConfig {
        initial_backoff_ms: 1,
        factor: 2,
        max_backoff_secs: 0,
        max_attempts: 3,
    }
}

pub fn options(root: &std::path::Path) -> CacheOptions {
    let cache = CacheConfig {
        root: root.to_path_buf(),
        partition: "part".into(),
        evict_age_secs: 60,
        walk_sleep_secs: 3600,
        drain_workers: 2,
        ..Default::default()
    };
    CacheOptions::new(cache, BlobConfig::default(), fast_drain())
}

pub struct Harness {
    pub tmp: tempfile::TempDir,
    pub backend: Arc<TestBackend>,
    pub cache: CiphertextCache,
    pub events: UnboundedReceiver<Event>,
}

pub async fn harness(
    tmp: tempfile::TempDir,
    backend: TestBackend,
    opts: CacheOptions,
    clock: Option<Arc<dyn Clock>>,
    peers: Option<Arc<dyn PeerSource>>,
) -> Harness {
    let backend = Arc::new(backend);
    let (sink, events) = ChannelSink::new();
    let mut builder =
        CacheBuilder::new(opts, Arc::clone(&backend) as Arc<dyn BlobBackend>).events(Arc::new(sink));
    if let Some(clock) = clock {
        builder = builder.clock(clock);
    }
    if let Some(peers) = peers {
        builder = builder.peers(peers);
    }
    let cache = builder.open().await.unwrap();
    Harness {
        tmp,
        backend,
        cache,
        events,
    }
}

pub async fn ingest(cache: &CiphertextCache, id: ObjectId, body: &[u8]) {
    let mut w = cache.begin_ingest(id).await.unwrap();
    w.write_all(body).await.unwrap();
    w.finalize().await.unwrap();
}

/// Next event matching `pred`, or panic after `secs`.
pub async fn wait_for_event<F>(rx: &mut UnboundedReceiver<Event>, secs: u64, pred: F) -> Event
where
    F: Fn(&Event) -> bool,
{
    tokio::time::timeout(Duration::from_secs(secs), async {
        loop {
            let ev = rx.recv().await.expect("event channel closed");
            if pred(&ev) {
                return ev;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}
