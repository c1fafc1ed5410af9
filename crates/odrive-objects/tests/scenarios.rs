//! End-to-end object scenarios: create, ranged reads, sharing, drain and
//! eviction, peer fallback, tamper detection, and the mutation rules.

use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use odrive_cache::{CacheBuilder, CacheOptions, CacheState, CiphertextCache, ManualClock, PeerSource};
use odrive_core::config::{BlobConfig, CacheConfig, DrainConfig};
use odrive_core::events::ChannelSink;
use odrive_core::{Classify, ErrorKind, Event, Flags, Identity, ObjectId, PermissionRow};
use odrive_crypto::{KeyRing, MasterKey};
use odrive_objects::{
    parse_range, Janitor, JsonMetadataStore, MetadataStore, NewObject, ObjectError, ObjectProperties,
    ObjectRecord, ObjectResult, ObjectService, ObjectState, PropertiesPatch, StoreResult, Tx,
};
use odrive_peer::{router, HttpsPeerClient, PeerLocator, StaticDiscovery};
use odrive_storage::{BlobBackend, FsBackend};
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

struct Node {
    svc: Arc<ObjectService>,
    cache: CiphertextCache,
    clock: Arc<ManualClock>,
    cancel: CancellationToken,
}

impl Drop for Node {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn ring() -> KeyRing {
    KeyRing::new(MasterKey::from_bytes([7u8; 32]))
}

fn options(root: &std::path::Path) -> CacheOptions {
    let cache = CacheConfig {
        root: root.to_path_buf(),
        partition: "part".into(),
        walk_sleep_secs: 3600,
        drain_workers: 2,
        ..Default::default()
    };
    let drain = DrainConfig {
        initial_backoff_ms: 1,
        factor: 2,
        max_backoff_secs: 0,
        max_attempts: 3,
    };
    CacheOptions::new(cache, BlobConfig::default(), drain)
}

struct NodeSetup {
    opts: CacheOptions,
    store: Arc<dyn MetadataStore>,
    background: bool,
    peers: Option<Arc<dyn PeerSource>>,
}

impl NodeSetup {
    fn new(root: &std::path::Path) -> Self {
        NodeSetup {
            opts: options(root),
            store: Arc::new(JsonMetadataStore::in_memory()),
            background: true,
            peers: None,
        }
    }
}

async fn start(root: &std::path::Path, setup: NodeSetup) -> Node {
    let clock = Arc::new(ManualClock::default());
    let backend: Arc<dyn BlobBackend> = Arc::new(FsBackend::new(root.join("remote"), "blobs"));
    let mut builder = CacheBuilder::new(setup.opts, backend).clock(clock.clone());
    if let Some(peers) = setup.peers {
        builder = builder.peers(peers);
    }
    let cache = builder.open().await.unwrap();
    let cancel = CancellationToken::new();
    if setup.background {
        cache.spawn_background(cancel.clone());
    }
    let svc = Arc::new(ObjectService::new(setup.store, cache.clone(), ring()));
    Node {
        svc,
        cache,
        clock,
        cancel,
    }
}

async fn node(root: &std::path::Path) -> Node {
    start(root, NodeSetup::new(root)).await
}

fn alice() -> Identity {
    Identity::new("CN=Alice, O=Example")
}

fn bob() -> Identity {
    Identity::new("cn=bob,o=example")
}

fn carol() -> Identity {
    Identity::new("cn=carol,o=example")
}

fn meta(name: &str) -> NewObject {
    NewObject {
        name: name.into(),
        content_type: Some("text/plain".into()),
        parent_id: None,
        acm: Some(json!({"classif": "U"})),
    }
}

async fn upload(svc: &ObjectService, who: &Identity, name: &str, body: &[u8]) -> ObjectProperties {
    let mut src = Cursor::new(body.to_vec());
    svc.create(who, meta(name), Some(&mut src), &CancellationToken::new())
        .await
        .unwrap()
}

async fn read(
    svc: &ObjectService,
    who: &Identity,
    id: &ObjectId,
    range: Option<&str>,
) -> ObjectResult<Vec<u8>> {
    let range = parse_range(range)?;
    let mut out = Vec::new();
    svc.stream(who, id, range, &mut out, &CancellationToken::new())
        .await?;
    Ok(out)
}

async fn wait_drained(cache: &CiphertextCache) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let stats = cache.stats().await.unwrap();
            if stats.uploaded == 0 && cache.drain_pending() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("drain did not finish");
}

#[tokio::test]
async fn create_then_read() {
    let tmp = tempfile::tempdir().unwrap();
    let (sink, mut events) = ChannelSink::new();
    let n = node(tmp.path()).await;
    let svc = ObjectService::new(Arc::new(JsonMetadataStore::in_memory()), n.cache.clone(), ring())
        .with_events(Arc::new(sink));

    let props = upload(&svc, &alice(), "greeting.txt", b"hello").await;
    assert_eq!(
        props.content_hash.as_deref(),
        Some("2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824")
    );
    assert_eq!(props.size, 5);
    assert_eq!(props.change_token.len(), 64);
    assert_eq!(props.owner, "cn=alice,o=example");
    assert_eq!(props.permissions.len(), 1);
    assert_eq!(props.permissions[0].flags, "cruds");

    assert_eq!(read(&svc, &alice(), &props.id, None).await.unwrap(), b"hello");
    assert_eq!(svc.properties(&alice(), &props.id).await.unwrap(), props);

    match events.recv().await.unwrap() {
        Event::ObjectCreated { object_id, size, .. } => {
            assert_eq!(object_id, props.id);
            assert_eq!(size, 5);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn ranged_reads() {
    let tmp = tempfile::tempdir().unwrap();
    let n = node(tmp.path()).await;
    let ramp: Vec<u8> = (0..1024u32).map(|i| i as u8).collect();
    let props = upload(&n.svc, &alice(), "ramp.bin", &ramp).await;

    let part = read(&n.svc, &alice(), &props.id, Some("bytes=500-509")).await.unwrap();
    assert_eq!(part, &ramp[500..=509]);
    let tail = read(&n.svc, &alice(), &props.id, Some("bytes=1020-")).await.unwrap();
    assert_eq!(tail, &ramp[1020..]);

    let err = read(&n.svc, &alice(), &props.id, Some("bytes=1024-")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RangeOutOfBounds);
    let err = read(&n.svc, &alice(), &props.id, Some("bytes=0-1,5-6")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RangeNotSatisfiable);
}

#[tokio::test]
async fn share_then_clear_flags() {
    let tmp = tempfile::tempdir().unwrap();
    let n = node(tmp.path()).await;
    let props = upload(&n.svc, &alice(), "shared.txt", b"for bob").await;

    let err = read(&n.svc, &bob(), &props.id, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Auth);

    let shared = n
        .svc
        .share(&alice(), &props.id, &props.change_token, "CN=Bob, O=Example", Flags::READ)
        .await
        .unwrap();
    assert_ne!(shared.change_token, props.change_token);
    assert_eq!(read(&n.svc, &bob(), &props.id, None).await.unwrap(), b"for bob");

    // bob holds no share flag.
    let err = n
        .svc
        .share(&bob(), &props.id, &shared.change_token, "cn=carol,o=example", Flags::READ)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Auth);

    n.svc
        .set_permission_flags(&props.id, "cn=bob,o=example", Flags::NONE)
        .await
        .unwrap();
    let err = read(&n.svc, &bob(), &props.id, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Auth);
    assert_eq!(read(&n.svc, &alice(), &props.id, None).await.unwrap(), b"for bob");
}

#[tokio::test]
async fn drain_evict_then_read_through() {
    let tmp = tempfile::tempdir().unwrap();
    let mut setup = NodeSetup::new(tmp.path());
    setup.opts.cache.low_watermark = 0.10;
    setup.opts = setup.opts.with_capacity(200_000);
    let n = start(tmp.path(), setup).await;

    let body = vec![0x5au8; 10 * 1024];
    let mut ids = Vec::new();
    for i in 0..10 {
        ids.push(upload(&n.svc, &alice(), &format!("blob-{i}"), &body).await.id);
    }
    wait_drained(&n.cache).await;
    assert_eq!(n.cache.stats().await.unwrap().cached, 10);

    n.clock.advance(Duration::from_secs(600));
    let report = n.cache.evict_once().await.unwrap();
    assert!(report.evicted >= 9, "{report:?}");
    assert!((n.cache.used_bytes() as f64) < 0.10 * 200_000.0);

    for id in &ids {
        assert_eq!(read(&n.svc, &alice(), id, None).await.unwrap(), body);
    }
}

#[tokio::test]
async fn peer_fallback_before_drain() {
    let a_dir = tempfile::tempdir().unwrap();
    let b_dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn MetadataStore> = Arc::new(JsonMetadataStore::in_memory());

    // A never drains, so X exists only in A's partition.
    let mut a_setup = NodeSetup::new(a_dir.path());
    a_setup.store = store.clone();
    a_setup.background = false;
    let a = start(a_dir.path(), a_setup).await;
    let props = upload(&a.svc, &alice(), "x.txt", b"only on node A").await;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let a_addr = listener.local_addr().unwrap().to_string();
    let app = router(a.cache.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let locator = PeerLocator::new(
        Arc::new(StaticDiscovery::from_addresses([a_addr.as_str()]).unwrap()),
        None,
    )
    .unwrap()
    .with_scheme("http");
    let mut b_setup = NodeSetup::new(b_dir.path());
    b_setup.store = store;
    b_setup.peers = Some(Arc::new(HttpsPeerClient::with_client(reqwest::Client::new(), locator)));
    let b = start(b_dir.path(), b_setup).await;

    assert_eq!(read(&b.svc, &alice(), &props.id, None).await.unwrap(), b"only on node A");
}

#[tokio::test]
async fn tampered_row_is_inert_for_its_grantee_only() {
    let tmp = tempfile::tempdir().unwrap();
    let n = node(tmp.path()).await;
    let p = upload(&n.svc, &alice(), "t.txt", b"tamper target").await;
    let p = n
        .svc
        .share(&alice(), &p.id, &p.change_token, "cn=bob,o=example", Flags::READ)
        .await
        .unwrap();
    let p = n
        .svc
        .share(&alice(), &p.id, &p.change_token, "cn=carol,o=example", Flags::READ)
        .await
        .unwrap();

    let store = n.svc.store();
    let mut rows = store.rows_for(&p.id).await.unwrap();
    let bob_row = rows.iter_mut().find(|r| r.grantee == "cn=bob,o=example").unwrap();
    bob_row.wrapped_key[3] ^= 0x01;
    store
        .commit(Tx::guarded(p.id, p.change_token.clone()).set_rows(rows))
        .await
        .unwrap();

    let err = read(&n.svc, &bob(), &p.id, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Auth);
    assert_eq!(err.to_string(), "access denied");
    assert_eq!(read(&n.svc, &carol(), &p.id, None).await.unwrap(), b"tamper target");
    assert_eq!(read(&n.svc, &alice(), &p.id, None).await.unwrap(), b"tamper target");

    // A tampered row cannot be repaired by an admin flag change.
    let err = n
        .svc
        .set_permission_flags(&p.id, "cn=bob,o=example", Flags::ALL)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Auth);
}

#[tokio::test]
async fn stale_tokens_conflict() {
    let tmp = tempfile::tempdir().unwrap();
    let n = node(tmp.path()).await;
    let p = upload(&n.svc, &alice(), "a.txt", b"a").await;

    let renamed = n
        .svc
        .update_properties(
            &alice(),
            &p.id,
            &p.change_token,
            PropertiesPatch {
                name: Some("b.txt".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(renamed.name, "b.txt");

    let err = n
        .svc
        .update_properties(&alice(), &p.id, &p.change_token, PropertiesPatch::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ObjectError::StaleToken(_)));
    assert_eq!(err.kind(), ErrorKind::Conflict);

    let err = n
        .svc
        .update_properties(
            &alice(),
            &p.id,
            &renamed.change_token,
            PropertiesPatch {
                acm: Some(json!(["not", "an", "object"])),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Input);
}

#[tokio::test]
async fn trash_untrash_expunge() {
    let tmp = tempfile::tempdir().unwrap();
    let n = node(tmp.path()).await;
    let p = upload(&n.svc, &alice(), "gone.txt", b"short lived").await;
    wait_drained(&n.cache).await;
    let content_id = {
        let record = n.svc.store().get_object(&p.id).await.unwrap().unwrap();
        record.content_id.unwrap()
    };

    let t = n.svc.trash(&alice(), &p.id, &p.change_token).await.unwrap();
    assert_eq!(t.state, ObjectState::Trashed);
    // Trashed stays readable but frozen.
    assert_eq!(read(&n.svc, &alice(), &p.id, None).await.unwrap(), b"short lived");
    let err = n
        .svc
        .move_to(&alice(), &p.id, &t.change_token, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    let u = n.svc.untrash(&alice(), &p.id, &t.change_token).await.unwrap();
    assert_eq!(u.state, ObjectState::Active);
    let t = n.svc.trash(&alice(), &p.id, &u.change_token).await.unwrap();

    n.svc.expunge(&alice(), &p.id, &t.change_token).await.unwrap();
    let err = n.svc.properties(&alice(), &p.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(n.cache.state_of(&content_id), None);
    assert!(!n.cache.backend().exists(&content_id).await.unwrap());
}

#[tokio::test]
async fn content_update_rewraps_every_grant() {
    let tmp = tempfile::tempdir().unwrap();
    let n = node(tmp.path()).await;
    let p = upload(&n.svc, &alice(), "v.txt", b"version one").await;
    let p = n
        .svc
        .share(&alice(), &p.id, &p.change_token, "cn=bob,o=example", Flags::READ)
        .await
        .unwrap();
    wait_drained(&n.cache).await;
    let old_content = n.svc.store().get_object(&p.id).await.unwrap().unwrap().content_id.unwrap();

    let mut src = Cursor::new(b"version two!".to_vec());
    let v2 = n
        .svc
        .update_content(&alice(), &p.id, &p.change_token, &mut src, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(v2.size, 12);
    assert_ne!(v2.content_hash, p.content_hash);

    assert_eq!(read(&n.svc, &bob(), &p.id, None).await.unwrap(), b"version two!");
    assert_eq!(n.cache.state_of(&old_content), None);
    assert!(!n.cache.backend().exists(&old_content).await.unwrap());
}

#[tokio::test]
async fn folders_and_moves() {
    let tmp = tempfile::tempdir().unwrap();
    let n = node(tmp.path()).await;
    let cancel = CancellationToken::new();
    let folder = n.svc.create(&alice(), meta("docs"), None, &cancel).await.unwrap();
    assert_eq!(folder.size, 0);
    assert!(folder.content_hash.is_none());
    assert!(read(&n.svc, &alice(), &folder.id, None).await.unwrap().is_empty());

    let file = upload(&n.svc, &alice(), "in-root.txt", b"x").await;
    let moved = n
        .svc
        .move_to(&alice(), &file.id, &file.change_token, Some(folder.id))
        .await
        .unwrap();
    assert_eq!(moved.parent_id, Some(folder.id));

    // Files cannot parent other objects.
    let err = n
        .svc
        .move_to(&alice(), &folder.id, &folder.change_token, Some(file.id))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Input);

    let mut missing_acm = meta("no-acm");
    missing_acm.acm = None;
    let err = n.svc.create(&alice(), missing_acm, None, &cancel).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Input);
}

#[tokio::test]
async fn revoke_removes_access_but_never_the_owner() {
    let tmp = tempfile::tempdir().unwrap();
    let n = node(tmp.path()).await;
    let p = upload(&n.svc, &alice(), "r.txt", b"revocable").await;
    let p = n
        .svc
        .share(&alice(), &p.id, &p.change_token, "cn=bob,o=example", Flags::READ)
        .await
        .unwrap();
    let p = n
        .svc
        .revoke(&alice(), &p.id, &p.change_token, "CN=Bob,O=Example")
        .await
        .unwrap();
    assert_eq!(read(&n.svc, &bob(), &p.id, None).await.unwrap_err().kind(), ErrorKind::Auth);

    let err = n
        .svc
        .revoke(&alice(), &p.id, &p.change_token, "cn=alice,o=example")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Input);
}

#[tokio::test]
async fn master_key_rotation_keeps_access() {
    let tmp = tempfile::tempdir().unwrap();
    let n = node(tmp.path()).await;
    let p = upload(&n.svc, &alice(), "k.txt", b"rotate me").await;
    n.svc
        .share(&alice(), &p.id, &p.change_token, "cn=bob,o=example", Flags::READ)
        .await
        .unwrap();

    let report = n
        .svc
        .rotate_master_key(MasterKey::from_bytes([8u8; 32]))
        .await
        .unwrap();
    assert_eq!(report.migrated, 2);
    assert_eq!(report.failed, 0);

    n.svc.finish_rotation();
    assert_eq!(read(&n.svc, &bob(), &p.id, None).await.unwrap(), b"rotate me");
    assert_eq!(read(&n.svc, &alice(), &p.id, None).await.unwrap(), b"rotate me");

    let again = n
        .svc
        .rotate_master_key(MasterKey::from_bytes([8u8; 32]))
        .await
        .unwrap();
    assert_eq!(again.migrated, 0);
    assert_eq!(again.skipped, 2);
}

/// In-memory store that can hold one `rows_for` caller after it has read.
struct HeldStore {
    inner: JsonMetadataStore,
    armed: AtomicBool,
    reached: Notify,
    release: Notify,
}

impl HeldStore {
    fn new() -> Self {
        HeldStore {
            inner: JsonMetadataStore::in_memory(),
            armed: AtomicBool::new(false),
            reached: Notify::new(),
            release: Notify::new(),
        }
    }
}

#[async_trait]
impl MetadataStore for HeldStore {
    async fn get_object(&self, id: &ObjectId) -> StoreResult<Option<ObjectRecord>> {
        self.inner.get_object(id).await
    }

    async fn rows_for(&self, id: &ObjectId) -> StoreResult<Vec<PermissionRow>> {
        let rows = self.inner.rows_for(id).await?;
        if self.armed.swap(false, Ordering::SeqCst) {
            self.reached.notify_one();
            self.release.notified().await;
        }
        Ok(rows)
    }

    async fn commit(&self, tx: Tx) -> StoreResult<()> {
        self.inner.commit(tx).await
    }

    async fn object_ids(&self) -> StoreResult<Vec<ObjectId>> {
        self.inner.object_ids().await
    }
}

#[tokio::test]
async fn share_racing_rotation_cannot_write_back_old_rows() {
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(HeldStore::new());
    let mut setup = NodeSetup::new(tmp.path());
    setup.store = store.clone();
    let n = start(tmp.path(), setup).await;
    let p = upload(&n.svc, &alice(), "race.txt", b"rotating").await;

    // Share reads the owner row under the old key, then waits.
    store.armed.store(true, Ordering::SeqCst);
    let svc = n.svc.clone();
    let (id, token) = (p.id, p.change_token.clone());
    let share = tokio::spawn(async move {
        svc.share(&alice(), &id, &token, "cn=bob,o=example", Flags::READ)
            .await
    });
    tokio::time::timeout(Duration::from_secs(5), store.reached.notified())
        .await
        .unwrap();

    let report = n
        .svc
        .rotate_master_key(MasterKey::from_bytes([8u8; 32]))
        .await
        .unwrap();
    assert_eq!(report.migrated, 1);

    store.release.notify_one();
    let err = share.await.unwrap().unwrap_err();
    assert!(matches!(err, ObjectError::StaleToken(_)), "{err}");
    assert_eq!(err.kind(), ErrorKind::Conflict);

    n.svc.finish_rotation();
    assert_eq!(read(&n.svc, &alice(), &p.id, None).await.unwrap(), b"rotating");
    let denied = read(&n.svc, &bob(), &p.id, None).await.unwrap_err();
    assert_eq!(denied.kind(), ErrorKind::Auth);

    // Retrying against the migrated rows works under the new key alone.
    let fresh = n.svc.properties(&alice(), &p.id).await.unwrap();
    assert_ne!(fresh.change_token, p.change_token);
    n.svc
        .share(&alice(), &p.id, &fresh.change_token, "cn=bob,o=example", Flags::READ)
        .await
        .unwrap();
    assert_eq!(read(&n.svc, &bob(), &p.id, None).await.unwrap(), b"rotating");
    assert_eq!(read(&n.svc, &alice(), &p.id, None).await.unwrap(), b"rotating");
}

#[tokio::test]
async fn janitor_collects_unreferenced_ciphertext_after_grace() {
    let tmp = tempfile::tempdir().unwrap();
    let n = node(tmp.path()).await;
    let kept = upload(&n.svc, &alice(), "kept.txt", b"referenced").await;

    // Staged ciphertext whose metadata never landed.
    let stray = ObjectId::random();
    let mut w = n.cache.begin_ingest(stray).await.unwrap();
    w.write_all(b"no metadata").await.unwrap();
    w.finalize().await.unwrap();

    let janitor = Janitor::new(
        n.svc.store().clone(),
        n.cache.clone(),
        Duration::from_secs(3600),
    )
    .with_clock(n.clock.clone());

    let first = janitor.sweep().await.unwrap();
    assert_eq!(first.local_removed, 0);
    assert_eq!(first.pending, 1);
    assert_eq!(n.cache.state_of(&stray), Some(CacheState::Uploaded));

    n.clock.advance(Duration::from_secs(3601));
    let second = janitor.sweep().await.unwrap();
    assert_eq!(second.local_removed, 1);
    assert_eq!(n.cache.state_of(&stray), None);
    assert_eq!(read(&n.svc, &alice(), &kept.id, None).await.unwrap(), b"referenced");
}
