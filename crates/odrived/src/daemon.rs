//! Node lifecycle: startup checks, background tasks, peer endpoint, shutdown

use anyhow::{bail, Context, Result};
use odrive_cache::{CacheBuilder, CacheMetrics, CacheOptions, CacheState, CiphertextCache, Partition};
use odrive_core::config::{BlobBackendKind, OdriveConfig};
use odrive_core::events::LogSink;
use odrive_core::EventSink;
use odrive_crypto::{KeyRing, MasterKey};
use odrive_objects::{Janitor, JsonMetadataStore, MetadataStore, ObjectService};
use odrive_peer::{Discovery, HttpsPeerClient, PeerLocator, StaticDiscovery, TlsFiles};
use odrive_storage::{BlobBackend, FsBackend, S3Backend};
use prometheus_client::registry::Registry;
use secrecy::SecretString;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::keys;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

pub async fn run(config: OdriveConfig) -> Result<()> {
    info!("daemon starting");

    // ── Master key ───────────────────────────────────────────────────────
    let ring = keys::resolve(&config.keys, master_key_env())?;

    let node_id = node_id(&config);
    let cancel = CancellationToken::new();
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    // ── Blob backend ─────────────────────────────────────────────────────
    let backend = build_backend(&config)?;
    if let Err(e) = backend.ensure_partition(&config.blob.prefix).await {
        warn!(backend = backend.name(), "ensuring blob partition: {e}");
    }
    match odrive_storage::check_health(backend.as_ref()).await {
        Ok(()) => info!(backend = backend.name(), "blob backend: connected"),
        // Drain workers retry; the node can still serve its partition.
        Err(e) => warn!(backend = backend.name(), "blob backend: {e}"),
    }

    // ── Events and discovery ─────────────────────────────────────────────
    let (events, discovery) = events_and_discovery(&config, &node_id, &cancel, &mut tasks).await?;

    // ── Cache ────────────────────────────────────────────────────────────
    let mut registry = Registry::default();
    let metrics = CacheMetrics::default();
    metrics.register(&mut registry);

    let opts = CacheOptions::new(config.cache.clone(), config.blob.clone(), config.drain.clone())
        .with_peer_timeout(config.peers.fetch_timeout());
    let mut builder = CacheBuilder::new(opts, backend.clone())
        .events(events.clone())
        .metrics(metrics);
    if let Some(peers) = peer_client(&config, discovery)? {
        builder = builder.peers(Arc::new(peers));
    }
    let cache = builder
        .open()
        .await
        .with_context(|| format!("opening cache partition {}", config.cache.partition_dir().display()))?;
    info!(
        partition = %config.cache.partition_dir().display(),
        capacity_bytes = cache.capacity_bytes(),
        used_bytes = cache.used_bytes(),
        "cache open"
    );

    // ── Metadata ─────────────────────────────────────────────────────────
    let store = open_store(&config).await?;
    check_master_key(store.as_ref(), &ring).await?;

    tasks.extend(cache.spawn_background(cancel.clone()));

    let janitor = Arc::new(Janitor::new(
        store.clone(),
        cache.clone(),
        config.objects.orphan_grace(),
    ));
    tasks.push(janitor.spawn(
        Duration::from_secs(config.objects.janitor_interval_secs.max(1)),
        cancel.clone(),
    ));

    // ── Peer endpoint ────────────────────────────────────────────────────
    if let Some(listen) = config.peers.listen.clone() {
        let tls = odrive_peer::load_server_config(&tls_files(&config)?)?;
        let listener = tokio::net::TcpListener::bind(&listen)
            .await
            .with_context(|| format!("peer endpoint bind {listen}"))?;
        let app = odrive_peer::router(cache.clone());
        let token = cancel.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = odrive_peer::serve_mtls(listener, tls, app, token).await {
                error!("peer endpoint failed: {e:#}");
            }
        }));
    }

    // ── Metrics ──────────────────────────────────────────────────────────
    if let Some(addr) = config.daemon.metrics_addr.clone() {
        let state = crate::metrics::HealthState {
            registry: Arc::new(registry),
            backend: backend.clone(),
        };
        let token = cancel.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = crate::metrics::serve(addr, state, token).await {
                error!("metrics server failed: {e:#}");
            }
        }));
    }

    info!(node = %node_id, "node ready");
    notify_ready();

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown requested");
    cancel.cancel();

    let drain_pending = cache.drain_pending();
    if drain_pending > 0 {
        // Still `.uploaded` on disk; restart recovery requeues them.
        warn!(drain_pending, "stopping with drains outstanding");
    }
    let joined = tokio::time::timeout(SHUTDOWN_GRACE, join_all(tasks)).await;
    if joined.is_err() {
        warn!("background tasks did not stop within {SHUTDOWN_GRACE:?}");
    }
    info!("daemon stopped");
    Ok(())
}

/// Per-state counts of the local partition. Reads the directory only, so
/// it is safe next to a running node.
pub async fn print_stats(config: OdriveConfig) -> Result<()> {
    let partition = Partition::new(config.cache.partition_dir());
    let entries = partition
        .scan()
        .await
        .with_context(|| format!("scanning {}", partition.dir().display()))?;

    let mut counts = serde_json::Map::new();
    let mut used = 0u64;
    for state in [
        CacheState::Uploading,
        CacheState::Uploaded,
        CacheState::Caching,
        CacheState::Cached,
        CacheState::Orphaned,
    ] {
        let n = entries.iter().filter(|e| e.state == state).count();
        counts.insert(state.suffix().to_string(), n.into());
    }
    for e in &entries {
        used += e.size;
    }
    let report = serde_json::json!({
        "partition": partition.dir(),
        "states": counts,
        "used_bytes": used,
        "capacity_bytes": config.cache.capacity_bytes(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Migrate every permission row to the key in `new_key_file`. Run while the
/// node is stopped; afterwards configure the new key as current and the
/// old one as previous until every node has restarted.
pub async fn rotate_key(config: OdriveConfig, new_key_file: &Path) -> Result<()> {
    let ring = keys::resolve(&config.keys, master_key_env())?;
    let contents = std::fs::read_to_string(new_key_file)
        .with_context(|| format!("reading {}", new_key_file.display()))?;
    let new = MasterKey::from_hex(&SecretString::from(contents))
        .with_context(|| format!("parsing {}", new_key_file.display()))?;
    if config.objects.metadata_path.is_none() {
        bail!("objects.metadata_path is not set; nothing to rotate");
    }

    let store = open_store(&config).await?;
    let cache = open_cache_offline(&config).await?;
    let service = ObjectService::new(store, cache, ring);
    let report = service.rotate_master_key(new).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if report.failed > 0 {
        bail!("{} permission rows validated under neither key", report.failed);
    }
    Ok(())
}

fn master_key_env() -> Option<SecretString> {
    std::env::var(keys::MASTER_KEY_ENV).ok().map(SecretString::from)
}

fn node_id(config: &OdriveConfig) -> String {
    config
        .daemon
        .node_id
        .clone()
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| "odrive".to_string())
}

/// Blob keys live under `blob.prefix`, not the local partition name, so any
/// node can read what another node drained.
fn build_backend(config: &OdriveConfig) -> Result<Arc<dyn BlobBackend>> {
    let partition = config.blob.prefix.clone();
    Ok(match config.blob.backend {
        BlobBackendKind::S3 => {
            let op = odrive_storage::build_from_core_config(&config.blob)?;
            Arc::new(S3Backend::new(op, partition, &config.blob))
        }
        BlobBackendKind::Fs => Arc::new(FsBackend::new(&config.blob.root, partition)),
    })
}

async fn open_store(config: &OdriveConfig) -> Result<Arc<dyn MetadataStore>> {
    Ok(match &config.objects.metadata_path {
        Some(path) => Arc::new(
            JsonMetadataStore::open(path)
                .await
                .with_context(|| format!("opening metadata store {}", path.display()))?,
        ),
        None => {
            warn!("objects.metadata_path not set; metadata lives in memory only");
            Arc::new(JsonMetadataStore::in_memory())
        }
    })
}

async fn open_cache_offline(config: &OdriveConfig) -> Result<CiphertextCache> {
    let opts = CacheOptions::new(config.cache.clone(), config.blob.clone(), config.drain.clone());
    CacheBuilder::new(opts, build_backend(config)?)
        .open()
        .await
        .context("opening cache")
}

/// Refuse to start when stored rows exist but none validates under the
/// configured keys: the wrong master key would deny every caller.
async fn check_master_key(store: &dyn MetadataStore, ring: &KeyRing) -> Result<()> {
    let mut rows = 0usize;
    for id in store.object_ids().await? {
        for row in store.rows_for(&id).await? {
            if odrive_perms::validating_key(ring, &row).is_some() {
                return Ok(());
            }
            rows += 1;
        }
    }
    if rows > 0 {
        bail!("master key validates none of {rows} stored permission rows");
    }
    Ok(())
}

fn tls_files(config: &OdriveConfig) -> Result<TlsFiles<'_>> {
    let p = &config.peers;
    match (&p.cert, &p.key, &p.ca) {
        (Some(cert), Some(key), Some(ca)) => Ok(TlsFiles { cert, key, ca }),
        _ => bail!("peers.cert, peers.key and peers.ca are required for peer traffic"),
    }
}

fn peer_client(
    config: &OdriveConfig,
    discovery: Option<Arc<dyn Discovery>>,
) -> Result<Option<HttpsPeerClient>> {
    let Some(discovery) = discovery else {
        return Ok(None);
    };
    let locator = PeerLocator::new(discovery, config.peers.self_address.as_deref())?;
    let client =
        HttpsPeerClient::from_pem_files(&tls_files(config)?, locator, config.peers.fetch_timeout())?;
    Ok(Some(client))
}

/// Event sink plus the peer discovery source, if any peers are configured.
#[cfg(feature = "nats")]
async fn events_and_discovery(
    config: &OdriveConfig,
    node_id: &str,
    cancel: &CancellationToken,
    tasks: &mut Vec<JoinHandle<()>>,
) -> Result<(Arc<dyn EventSink>, Option<Arc<dyn Discovery>>)> {
    use odrive_peer::nats::{self, NatsDiscovery, NatsEventSink};
    use odrive_peer::Announcement;

    let Some(url) = config.peers.nats_url.as_deref() else {
        return Ok((Arc::new(LogSink), static_discovery(config)?));
    };
    let js = nats::connect(url).await?;
    let (sink, publisher) = NatsEventSink::start(js.clone(), node_id.to_string()).await?;
    tasks.push(publisher);

    let discovery =
        NatsDiscovery::open(&js, &config.peers.announce_path, nats::DEFAULT_ANNOUNCE_TTL).await?;
    if let Some(addr) = &config.peers.self_address {
        let me = Announcement::from_address(node_id, addr)?;
        discovery.announce(&me).await?;
        tasks.push(discovery.spawn_heartbeat(me, cancel.clone()));
        info!(node = %node_id, address = %addr, "announced on NATS");
    }
    Ok((Arc::new(sink), Some(Arc::new(discovery))))
}

#[cfg(not(feature = "nats"))]
async fn events_and_discovery(
    config: &OdriveConfig,
    _node_id: &str,
    _cancel: &CancellationToken,
    _tasks: &mut Vec<JoinHandle<()>>,
) -> Result<(Arc<dyn EventSink>, Option<Arc<dyn Discovery>>)> {
    if config.peers.nats_url.is_some() {
        warn!("peers.nats_url is set but odrived was built without the nats feature");
    }
    Ok((Arc::new(LogSink), static_discovery(config)?))
}

fn static_discovery(config: &OdriveConfig) -> Result<Option<Arc<dyn Discovery>>> {
    if config.peers.peers.is_empty() {
        return Ok(None);
    }
    let d = StaticDiscovery::from_addresses(config.peers.peers.iter().map(String::as_str))?;
    Ok(Some(Arc::new(d)))
}

async fn join_all(tasks: Vec<JoinHandle<()>>) {
    for t in tasks {
        let _ = t.await;
    }
}

fn notify_ready() {
    // Send sd_notify(READY=1) to systemd if running as a service
    // Uses $NOTIFY_SOCKET env var; no-op if not set
    if let Ok(socket) = std::env::var("NOTIFY_SOCKET") {
        use std::os::unix::net::UnixDatagram;
        if let Ok(sock) = UnixDatagram::unbound() {
            let _ = sock.send_to(b"READY=1\n", &socket);
            tracing::debug!(notify_socket = %socket, "sent systemd READY=1");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use odrive_core::config::PeersConfig;
    use odrive_core::{Acm, Flags, ObjectId, PermissionRow};
    use odrive_objects::{ObjectRecord, ObjectState, Tx};

    fn config_in(root: &Path) -> OdriveConfig {
        let mut config = OdriveConfig::default();
        config.cache.root = root.join("cache");
        config.blob.backend = BlobBackendKind::Fs;
        config.blob.root = root.join("blobs");
        config
    }

    fn record(id: ObjectId) -> ObjectRecord {
        ObjectRecord {
            id,
            name: "docs".into(),
            content_type: "application/octet-stream".into(),
            parent_id: None,
            owner: "cn=alice".into(),
            acm: Acm::parse(r#"{"classif":"U"}"#).unwrap(),
            acm_parts: vec![],
            content_id: None,
            content_iv: None,
            content_hash: None,
            size: 0,
            change_token: "t0".into(),
            state: ObjectState::Active,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn peers_need_tls_material() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = config_in(tmp.path());
        config.peers = PeersConfig {
            peers: vec!["10.0.0.2:8443".into()],
            ..Default::default()
        };
        let discovery = static_discovery(&config).unwrap();
        assert!(discovery.is_some());
        let Err(err) = peer_client(&config, discovery) else {
            panic!("expected peer_client to fail without TLS material");
        };
        assert!(err.to_string().contains("peers.cert"));
    }

    #[tokio::test]
    async fn nodes_share_blob_keys_across_partitions() {
        let tmp = tempfile::tempdir().unwrap();
        let mut a = config_in(tmp.path());
        a.cache.partition = "node-a".into();
        let mut b = config_in(tmp.path());
        b.cache.partition = "node-b".into();

        let writer = build_backend(&a).unwrap();
        let reader = build_backend(&b).unwrap();
        assert_eq!(writer.partition(), "objects");
        assert_eq!(reader.partition(), writer.partition());

        writer.ensure_partition(&a.blob.prefix).await.unwrap();
        let id = ObjectId::random();
        let body: odrive_storage::BlobReader = Box::pin(std::io::Cursor::new(b"drained".to_vec()));
        writer.put(&id, body, 7).await.unwrap();
        assert!(reader.exists(&id).await.unwrap());
    }

    #[test]
    fn no_peers_no_client() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config_in(tmp.path());
        assert!(static_discovery(&config).unwrap().is_none());
        assert!(peer_client(&config, None).unwrap().is_none());
    }

    #[tokio::test]
    async fn wrong_master_key_is_fatal() {
        let store = JsonMetadataStore::in_memory();
        let id = ObjectId::random();
        let good = KeyRing::new(MasterKey::from_bytes([1; 32]));
        let row: PermissionRow = odrive_perms::seal_row(
            good.current(),
            id,
            "cn=alice",
            Flags::ALL,
            &odrive_crypto::generate_key(),
        )
        .unwrap();
        store
            .commit(Tx::create(id).put_object(record(id)).set_rows(vec![row]))
            .await
            .unwrap();

        check_master_key(&store, &good).await.unwrap();
        let wrong = KeyRing::new(MasterKey::from_bytes([2; 32]));
        let err = check_master_key(&store, &wrong).await.unwrap_err();
        assert!(err.to_string().contains("validates none"));
        // Rotation window: the old key as previous is enough.
        check_master_key(&store, &wrong.with_previous(MasterKey::from_bytes([1; 32])))
            .await
            .unwrap();
    }
}
