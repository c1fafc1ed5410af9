//! Object operations: encrypted ingest, ranged egress, and every mutation.
//!
//! Upload flow:
//!   1. Validate metadata and the ACM; generate the object key and IV
//!   2. Stream-encrypt into `<content_id>.uploading`, hashing the plaintext
//!   3. Rename to `.uploaded`
//!   4. Commit object row and the owner's sealed permission row in one Tx
//!   5. Enqueue the drain
//!
//! A failure after step 3 leaves `.uploaded` with no metadata; the
//! [`Janitor`](crate::Janitor) collects it after the grace window.
//!
//! Every mutation echoes the caller's change token, derives the next one,
//! and commits behind a compare-and-swap on the old token.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use odrive_cache::CiphertextCache;
use odrive_core::{Acm, ByteRange, Event, EventSink, Flags, Identity, ObjectId, PermissionRow};
use odrive_crypto::{
    decrypt_stream, derive_change_token, encrypt_stream, generate_iv, generate_key, tokens_match,
    ContentCipher, ContentIv, ContentKey, CryptoError, EncryptSummary, KeyRing, MasterKey,
};
use odrive_perms::{
    authorize, canonical_grantee, effective_flags, grant, open_row, rotate_row, seal_row,
    update_flags, PermError, RotationReport, RowRotation,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ObjectError, ObjectResult, StoreError};
use crate::model::{
    NewObject, ObjectProperties, ObjectRecord, ObjectState, PropertiesPatch, TokenFields,
};
use crate::policy::{AccessPolicy, PermitAll};
use crate::store::{MetadataStore, Tx};

/// Plaintext source for an upload.
pub type Upload<'a> = &'a mut (dyn AsyncRead + Unpin + Send);

/// Result of a download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamInfo {
    /// First byte written
    pub start: u64,
    /// Bytes written
    pub written: u64,
    /// Full object size
    pub size: u64,
}

const ROTATE_ATTEMPTS: usize = 3;

pub struct ObjectService {
    store: Arc<dyn MetadataStore>,
    cache: CiphertextCache,
    ring: RwLock<KeyRing>,
    policy: Arc<dyn AccessPolicy>,
    events: Arc<dyn EventSink>,
    read_timeout: Option<Duration>,
}

impl ObjectService {
    pub fn new(store: Arc<dyn MetadataStore>, cache: CiphertextCache, ring: KeyRing) -> Self {
        ObjectService {
            store,
            cache,
            ring: RwLock::new(ring),
            policy: Arc::new(PermitAll),
            events: Arc::new(odrive_core::events::LogSink),
            read_timeout: None,
        }
    }

    pub fn with_policy(mut self, policy: Arc<dyn AccessPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Bound how long `stream` waits for ciphertext; peer fetches on a miss get a share
    /// of whatever is left of it.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    pub fn cache(&self) -> &CiphertextCache {
        &self.cache
    }

    pub fn store(&self) -> &Arc<dyn MetadataStore> {
        &self.store
    }

    fn ring(&self) -> KeyRing {
        self.ring.read().expect("key ring lock poisoned").clone()
    }

    // ── Create / read ─────────────────────────────────────────────────────────

    /// Create an object owned by `identity`. `content` is `None` for folders.
    pub async fn create(
        &self,
        identity: &Identity,
        meta: NewObject,
        content: Option<Upload<'_>>,
        cancel: &CancellationToken,
    ) -> ObjectResult<ObjectProperties> {
        if meta.name.trim().is_empty() {
            return Err(ObjectError::Invalid("name is required".into()));
        }
        let acm = Acm::from_value(
            meta.acm
                .ok_or_else(|| ObjectError::Invalid("acm is required".into()))?,
        )?;
        if !self.policy.permits(identity, &acm) {
            return Err(ObjectError::Denied);
        }
        if let Some(parent) = meta.parent_id {
            self.require_parent(parent, None).await?;
        }

        let ring = self.ring();
        let id = ObjectId::random();
        let key = generate_key();
        let iv = generate_iv();

        let ingested = match content {
            Some(reader) => Some(self.ingest(&key, iv, reader, cancel).await?),
            None => None,
        };

        let now = Event::now();
        let mut record = ObjectRecord {
            id,
            name: meta.name,
            content_type: meta
                .content_type
                .unwrap_or_else(|| "application/octet-stream".into()),
            parent_id: meta.parent_id,
            owner: identity.dn().to_string(),
            acm_parts: acm.parts(),
            acm,
            content_id: ingested.map(|(cid, _)| cid),
            content_iv: ingested.map(|_| hex::encode(iv.as_bytes())),
            content_hash: ingested.map(|(_, s)| s.content_hash_hex()),
            size: ingested.map(|(_, s)| s.size).unwrap_or(0),
            change_token: String::new(),
            state: ObjectState::Active,
            created_at: now,
            updated_at: now,
        };
        let rows = vec![seal_row(ring.current(), id, identity.dn(), Flags::ALL, &key)?];
        record.change_token =
            derive_change_token(ring.current(), &id, "", &TokenFields::of(&record, &rows));

        let props = ObjectProperties::new(&record, &rows);
        let tx = Tx::create(id).put_object(record).set_rows(rows);
        if let Err(e) = self.store.commit(tx).await {
            if let Some((cid, _)) = ingested {
                warn!(id = %id, content_id = %cid, "metadata commit failed; ciphertext left for the janitor");
            }
            return Err(e.into());
        }
        if let Some((cid, _)) = ingested {
            self.enqueue_drain(cid).await;
        }

        info!(id = %id, owner = %props.owner, size = props.size, "object created");
        self.events.emit(Event::ObjectCreated {
            object_id: id,
            owner: props.owner.clone(),
            size: props.size,
            timestamp: now,
        });
        Ok(props)
    }

    pub async fn properties(&self, identity: &Identity, id: &ObjectId) -> ObjectResult<ObjectProperties> {
        let (record, rows) = self.load(id).await?;
        self.check(identity, &record, &rows, Flags::READ)?;
        Ok(ObjectProperties::new(&record, &rows))
    }

    /// Decrypt `range` of the object's content into `writer`.
    ///
    /// The cache lease is held until the last byte is written, so the
    /// ciphertext cannot be evicted mid-stream.
    pub async fn stream<W>(
        &self,
        identity: &Identity,
        id: &ObjectId,
        range: ByteRange,
        writer: &mut W,
        cancel: &CancellationToken,
    ) -> ObjectResult<StreamInfo>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let (record, rows) = self.load(id).await?;
        let key = self.check(identity, &record, &rows, Flags::READ)?;

        let size = record.size;
        let (start, _) = range.resolve(size).ok_or(CryptoError::RangeOutOfBounds {
            start: range.start,
            stop: range.stop,
            size,
        })?;
        let (Some(content_id), Some(iv)) = (record.content_id, record.content_iv.as_deref()) else {
            // Folder: only the empty full range resolves.
            return Ok(StreamInfo {
                start: 0,
                written: 0,
                size: 0,
            });
        };
        let iv = decode_iv(iv)?;
        let cipher = ContentCipher::aes(key, iv);

        let deadline = self.read_timeout.map(|t| tokio::time::Instant::now() + t);
        let mut handle = self.cache.open_until(&content_id, deadline, cancel).await?;
        let written = tokio::select! {
            r = decrypt_stream(&cipher, &mut handle, size, range, writer) => r?,
            _ = cancel.cancelled() => return Err(ObjectError::Cancelled),
        };
        debug!(id = %id, range = %range, written, "object streamed");
        Ok(StreamInfo {
            start,
            written,
            size,
        })
    }

    // ── Mutations ─────────────────────────────────────────────────────────────

    pub async fn update_properties(
        &self,
        identity: &Identity,
        id: &ObjectId,
        token: &str,
        patch: PropertiesPatch,
    ) -> ObjectResult<ObjectProperties> {
        let (mut record, rows) = self.load(id).await?;
        self.check(identity, &record, &rows, Flags::UPDATE)?;
        require_state(&record, ObjectState::Active, "update")?;
        require_token(&record, token)?;

        if let Some(name) = patch.name {
            if name.trim().is_empty() {
                return Err(ObjectError::Invalid("name must not be empty".into()));
            }
            record.name = name;
        }
        if let Some(content_type) = patch.content_type {
            record.content_type = content_type;
        }
        if let Some(raw) = patch.acm {
            let acm = Acm::from_value(raw)?;
            if !self.policy.permits(identity, &acm) {
                return Err(ObjectError::Denied);
            }
            record.acm_parts = acm.parts();
            record.acm = acm;
        }
        self.advance_and_commit(record, rows, token).await
    }

    /// Replace the content with a fresh key and IV, re-wrapping every valid
    /// grant for the new key. The previous ciphertext is discarded.
    pub async fn update_content(
        &self,
        identity: &Identity,
        id: &ObjectId,
        token: &str,
        content: Upload<'_>,
        cancel: &CancellationToken,
    ) -> ObjectResult<ObjectProperties> {
        let (mut record, rows) = self.load(id).await?;
        self.check(identity, &record, &rows, Flags::UPDATE)?;
        require_state(&record, ObjectState::Active, "update")?;
        require_token(&record, token)?;

        let ring = self.ring();
        let key = generate_key();
        let iv = generate_iv();
        let (content_id, summary) = self.ingest(&key, iv, content, cancel).await?;

        let mut resealed = Vec::with_capacity(rows.len());
        for row in &rows {
            if open_row(&ring, row)?.is_none() {
                warn!(id = %id, grantee = %row.grantee, "dropping invalid row on content update");
                continue;
            }
            resealed.push(seal_row(ring.current(), *id, &row.grantee, row.flags, &key)?);
        }

        let previous = record.content_id;
        record.content_id = Some(content_id);
        record.content_iv = Some(hex::encode(iv.as_bytes()));
        record.content_hash = Some(summary.content_hash_hex());
        record.size = summary.size;

        let props = self.advance_and_commit(record, resealed, token).await?;
        self.enqueue_drain(content_id).await;
        if let Some(old) = previous {
            self.discard_content(&old).await;
        }
        Ok(props)
    }

    /// Move under `parent` (`None` for the root).
    pub async fn move_to(
        &self,
        identity: &Identity,
        id: &ObjectId,
        token: &str,
        parent: Option<ObjectId>,
    ) -> ObjectResult<ObjectProperties> {
        let (mut record, rows) = self.load(id).await?;
        self.check(identity, &record, &rows, Flags::UPDATE)?;
        require_state(&record, ObjectState::Active, "move")?;
        require_token(&record, token)?;
        if let Some(p) = parent {
            self.require_parent(p, Some(*id)).await?;
        }
        record.parent_id = parent;
        self.advance_and_commit(record, rows, token).await
    }

    pub async fn trash(&self, identity: &Identity, id: &ObjectId, token: &str) -> ObjectResult<ObjectProperties> {
        let props = self
            .transition(identity, id, token, ObjectState::Active, ObjectState::Trashed, "trash")
            .await?;
        self.events.emit(Event::ObjectTrashed {
            object_id: *id,
            timestamp: props.updated_at,
        });
        Ok(props)
    }

    pub async fn untrash(&self, identity: &Identity, id: &ObjectId, token: &str) -> ObjectResult<ObjectProperties> {
        self.transition(identity, id, token, ObjectState::Trashed, ObjectState::Active, "untrash")
            .await
    }

    /// Terminal delete: rows are dropped and the ciphertext is removed
    /// locally and remotely. Later operations see `NotFound`.
    pub async fn expunge(&self, identity: &Identity, id: &ObjectId, token: &str) -> ObjectResult<()> {
        let (mut record, rows) = self.load(id).await?;
        self.check(identity, &record, &rows, Flags::DELETE)?;
        require_token(&record, token)?;

        record.state = ObjectState::Expunged;
        let content = record.content_id;
        self.advance_and_commit(record, Vec::new(), token).await?;
        if let Some(cid) = content {
            self.discard_content(&cid).await;
        }
        info!(id = %id, "object expunged");
        self.events.emit(Event::ObjectExpunged {
            object_id: *id,
            timestamp: Event::now(),
        });
        Ok(())
    }

    /// Grant `flags` to `grantee`, replacing any grant it already has.
    /// The caller needs the share flag and may not hand out flags it lacks.
    pub async fn share(
        &self,
        identity: &Identity,
        id: &ObjectId,
        token: &str,
        grantee: &str,
        flags: Flags,
    ) -> ObjectResult<ObjectProperties> {
        let (record, rows) = self.load(id).await?;
        self.check(identity, &record, &rows, Flags::SHARE)?;
        require_state(&record, ObjectState::Active, "share")?;
        require_token(&record, token)?;

        let ring = self.ring();
        if !effective_flags(&ring, &rows, identity).covers(flags) {
            return Err(ObjectError::Denied);
        }
        let row = grant(&ring, &rows, identity, grantee, flags).map_err(deny)?;
        let mut next: Vec<PermissionRow> =
            rows.into_iter().filter(|r| r.grantee != row.grantee).collect();
        debug!(id = %id, grantee = %row.grantee, flags = %flags, "sharing");
        next.push(row);
        self.advance_and_commit(record, next, token).await
    }

    /// Administrative flag change on `grantee`'s rows, re-MACed under the
    /// current master key. Needs no caller identity and no echoed token.
    pub async fn set_permission_flags(
        &self,
        id: &ObjectId,
        grantee: &str,
        flags: Flags,
    ) -> ObjectResult<ObjectProperties> {
        let (record, rows) = self.load(id).await?;
        let grantee = canonical_grantee(grantee)?;
        let ring = self.ring();

        let mut touched = 0usize;
        let mut next = Vec::with_capacity(rows.len());
        for row in rows {
            if row.grantee == grantee {
                next.push(update_flags(&ring, &row, flags)?);
                touched += 1;
            } else {
                next.push(row);
            }
        }
        if touched == 0 {
            return Err(ObjectError::Invalid(format!("no grant for {grantee}")));
        }
        info!(id = %id, grantee = %grantee, flags = %flags, rows = touched, "permission flags set");
        let token = record.change_token.clone();
        self.advance_and_commit(record, next, &token).await
    }

    /// Remove every row for `grantee`. The owner cannot be revoked.
    pub async fn revoke(
        &self,
        identity: &Identity,
        id: &ObjectId,
        token: &str,
        grantee: &str,
    ) -> ObjectResult<ObjectProperties> {
        let (record, rows) = self.load(id).await?;
        self.check(identity, &record, &rows, Flags::SHARE)?;
        require_state(&record, ObjectState::Active, "revoke")?;
        require_token(&record, token)?;

        let grantee = canonical_grantee(grantee)?;
        if grantee == record.owner {
            return Err(ObjectError::Invalid("cannot revoke the owner".into()));
        }
        let before = rows.len();
        let next: Vec<PermissionRow> = rows.into_iter().filter(|r| r.grantee != grantee).collect();
        if next.len() == before {
            return Err(ObjectError::Invalid(format!("no grant for {grantee}")));
        }
        self.advance_and_commit(record, next, token).await
    }

    // ── Master key rotation ───────────────────────────────────────────────────

    /// Make `new` the current master key and migrate every row to it.
    ///
    /// The old key stays accepted until [`finish_rotation`](Self::finish_rotation),
    /// so readers never see a gap. Each migrated object gets a new change
    /// token, so a mutation that read the old rows fails its CAS instead of
    /// writing them back.
    pub async fn rotate_master_key(&self, new: MasterKey) -> ObjectResult<RotationReport> {
        let ring = {
            let mut guard = self.ring.write().expect("key ring lock poisoned");
            let next = KeyRing::new(new).with_previous(guard.current().clone());
            *guard = next.clone();
            next
        };

        let mut report = RotationReport::default();
        for id in self.store.object_ids().await? {
            for attempt in 1..=ROTATE_ATTEMPTS {
                match self.rotate_object(&ring, &id, &mut report).await {
                    Ok(()) => break,
                    Err(ObjectError::StaleToken(_)) if attempt < ROTATE_ATTEMPTS => {
                        debug!(id = %id, attempt, "object changed during rotation; retrying");
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        info!(
            migrated = report.migrated,
            skipped = report.skipped,
            failed = report.failed,
            "master key rotation pass complete"
        );
        Ok(report)
    }

    /// Stop accepting the previous master key.
    pub fn finish_rotation(&self) {
        let mut guard = self.ring.write().expect("key ring lock poisoned");
        *guard = KeyRing::new(guard.current().clone());
        info!("previous master key retired");
    }

    async fn rotate_object(
        &self,
        ring: &KeyRing,
        id: &ObjectId,
        report: &mut RotationReport,
    ) -> ObjectResult<()> {
        let Some(record) = self.store.get_object(id).await? else {
            return Ok(());
        };
        if record.state == ObjectState::Expunged {
            return Ok(());
        }
        let rows = self.store.rows_for(id).await?;
        let mut local = RotationReport::default();
        let mut next = Vec::with_capacity(rows.len());
        for row in rows {
            match rotate_row(ring, &row)? {
                RowRotation::Migrated(r) => {
                    local.migrated += 1;
                    next.push(r);
                }
                RowRotation::Skipped => {
                    local.skipped += 1;
                    next.push(row);
                }
                RowRotation::Failed => {
                    local.failed += 1;
                    next.push(row);
                }
            }
        }
        if local.migrated > 0 {
            let expected = record.change_token.clone();
            self.advance_and_commit(record, next, &expected).await?;
        }
        report.migrated += local.migrated;
        report.skipped += local.skipped;
        report.failed += local.failed;
        Ok(())
    }

    // ── Helpers ───────────────────────────────────────────────────────────────

    /// Load a live (not expunged) object and its rows.
    async fn load(&self, id: &ObjectId) -> ObjectResult<(ObjectRecord, Vec<PermissionRow>)> {
        let record = self
            .store
            .get_object(id)
            .await?
            .filter(|r| r.state != ObjectState::Expunged)
            .ok_or(ObjectError::NotFound(*id))?;
        let rows = self.store.rows_for(id).await?;
        Ok((record, rows))
    }

    /// ACM first, then the permission rows; either refusal is `Denied`.
    fn check(
        &self,
        identity: &Identity,
        record: &ObjectRecord,
        rows: &[PermissionRow],
        need: Flags,
    ) -> ObjectResult<ContentKey> {
        if !self.policy.permits(identity, &record.acm) {
            return Err(ObjectError::Denied);
        }
        authorize(&self.ring(), rows, identity, need).map_err(deny)
    }

    async fn require_parent(&self, parent: ObjectId, child: Option<ObjectId>) -> ObjectResult<()> {
        if Some(parent) == child {
            return Err(ObjectError::Invalid("an object cannot be its own parent".into()));
        }
        let record = self
            .store
            .get_object(&parent)
            .await?
            .filter(|r| r.state == ObjectState::Active)
            .ok_or_else(|| ObjectError::Invalid(format!("parent {parent} does not exist")))?;
        if !record.is_folder() {
            return Err(ObjectError::Invalid(format!("parent {parent} is not a folder")));
        }
        Ok(())
    }

    async fn transition(
        &self,
        identity: &Identity,
        id: &ObjectId,
        token: &str,
        from: ObjectState,
        to: ObjectState,
        op: &'static str,
    ) -> ObjectResult<ObjectProperties> {
        let (mut record, rows) = self.load(id).await?;
        self.check(identity, &record, &rows, Flags::DELETE)?;
        require_state(&record, from, op)?;
        require_token(&record, token)?;
        record.state = to;
        self.advance_and_commit(record, rows, token).await
    }

    /// Derive the next token from `expected`, commit behind a CAS on it,
    /// and announce the update.
    async fn advance_and_commit(
        &self,
        mut record: ObjectRecord,
        rows: Vec<PermissionRow>,
        expected: &str,
    ) -> ObjectResult<ObjectProperties> {
        let ring = self.ring();
        record.change_token =
            derive_change_token(ring.current(), &record.id, expected, &TokenFields::of(&record, &rows));
        record.updated_at = Event::now();

        let props = ObjectProperties::new(&record, &rows);
        let id = record.id;
        self.store
            .commit(Tx::guarded(id, expected).put_object(record).set_rows(rows))
            .await
            .map_err(|e| match e {
                StoreError::Conflict(id) => ObjectError::StaleToken(id),
                other => other.into(),
            })?;
        self.events.emit(Event::ObjectUpdated {
            object_id: id,
            change_token: props.change_token.clone(),
            timestamp: props.updated_at,
        });
        Ok(props)
    }

    /// Encrypt `reader` into a fresh content id staged as `.uploaded`.
    async fn ingest(
        &self,
        key: &ContentKey,
        iv: ContentIv,
        reader: Upload<'_>,
        cancel: &CancellationToken,
    ) -> ObjectResult<(ObjectId, EncryptSummary)> {
        let content_id = ObjectId::random();
        let mut writer = self.cache.begin_ingest(content_id).await?;
        let cipher = ContentCipher::aes(key.clone(), iv);
        // Dropping the writer on any early return removes `.uploading`.
        let summary = tokio::select! {
            r = encrypt_stream(&cipher, reader, &mut writer, None) => r?,
            _ = cancel.cancelled() => return Err(ObjectError::Cancelled),
        };
        writer.finalize().await?;
        debug!(content_id = %content_id, size = summary.size, "content staged");
        Ok((content_id, summary))
    }

    async fn enqueue_drain(&self, content_id: ObjectId) {
        // Restart recovery requeues anything left `.uploaded`.
        if let Err(e) = self.cache.enqueue_drain(content_id).await {
            warn!(content_id = %content_id, "could not enqueue drain: {e}");
        }
    }

    /// Best-effort removal of a content version nothing references anymore.
    /// Whatever survives (a leased file, an unreachable backend) is left
    /// for the janitor.
    async fn discard_content(&self, content_id: &ObjectId) {
        if let Err(e) = self.cache.remove(content_id).await {
            debug!(content_id = %content_id, "local ciphertext kept for now: {e}");
        }
        match self.cache.backend().delete(content_id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(content_id = %content_id, "remote ciphertext not deleted: {e}"),
        }
    }
}

fn require_state(record: &ObjectRecord, want: ObjectState, op: &'static str) -> ObjectResult<()> {
    if record.state != want {
        return Err(ObjectError::WrongState {
            id: record.id,
            state: record.state,
            op,
        });
    }
    Ok(())
}

fn require_token(record: &ObjectRecord, token: &str) -> ObjectResult<()> {
    if !tokens_match(&record.change_token, token) {
        return Err(ObjectError::StaleToken(record.id));
    }
    Ok(())
}

fn decode_iv(hex_iv: &str) -> ObjectResult<ContentIv> {
    let bytes = hex::decode(hex_iv).map_err(|e| CryptoError::InvalidKey(format!("stored IV: {e}")))?;
    Ok(ContentIv::from_slice(&bytes)?)
}

fn deny(e: PermError) -> ObjectError {
    match e {
        PermError::Denied => ObjectError::Denied,
        other => ObjectError::Perm(other),
    }
}
