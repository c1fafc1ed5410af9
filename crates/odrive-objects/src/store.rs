//! Metadata store: object rows and permission rows.
//!
//! Every write goes through [`MetadataStore::commit`] with a [`Tx`] that
//! names one object and carries a compare-and-swap guard on its change
//! token. A transaction is applied whole or not at all.
//!
//! [`JsonMetadataStore`] keeps everything in memory and, when given a path,
//! flushes the full snapshot after each commit via temp+rename.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use odrive_core::{ObjectId, PermissionRow};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::StoreError;
use crate::model::ObjectRecord;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone)]
pub enum Mutation {
    /// Insert or replace the object row.
    PutObject(ObjectRecord),
    /// Replace every permission row of the object.
    SetRows(Vec<PermissionRow>),
}

/// An atomic change to one object.
#[derive(Debug, Clone)]
pub struct Tx {
    pub object_id: ObjectId,
    /// `None`: the object must not exist yet. `Some(t)`: its stored change
    /// token must equal `t`.
    pub expect_token: Option<String>,
    pub mutations: Vec<Mutation>,
}

impl Tx {
    pub fn create(object_id: ObjectId) -> Self {
        Tx {
            object_id,
            expect_token: None,
            mutations: Vec::new(),
        }
    }

    pub fn guarded(object_id: ObjectId, token: impl Into<String>) -> Self {
        Tx {
            object_id,
            expect_token: Some(token.into()),
            mutations: Vec::new(),
        }
    }

    pub fn put_object(mut self, record: ObjectRecord) -> Self {
        debug_assert_eq!(record.id, self.object_id);
        self.mutations.push(Mutation::PutObject(record));
        self
    }

    pub fn set_rows(mut self, rows: Vec<PermissionRow>) -> Self {
        debug_assert!(rows.iter().all(|r| r.object_id == self.object_id));
        self.mutations.push(Mutation::SetRows(rows));
        self
    }
}

#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn get_object(&self, id: &ObjectId) -> StoreResult<Option<ObjectRecord>>;

    /// Permission rows of `id` in stored order.
    async fn rows_for(&self, id: &ObjectId) -> StoreResult<Vec<PermissionRow>>;

    async fn commit(&self, tx: Tx) -> StoreResult<()>;

    /// Every object id, expunged ones included.
    async fn object_ids(&self) -> StoreResult<Vec<ObjectId>>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Snapshot {
    objects: BTreeMap<ObjectId, ObjectRecord>,
    permissions: BTreeMap<ObjectId, Vec<PermissionRow>>,
}

impl Snapshot {
    fn check(&self, tx: &Tx) -> StoreResult<()> {
        let current = self.objects.get(&tx.object_id).map(|o| o.change_token.as_str());
        match (&tx.expect_token, current) {
            (None, None) => Ok(()),
            (None, Some(_)) => Err(StoreError::Exists(tx.object_id)),
            (Some(want), Some(have)) if odrive_crypto::tokens_match(want, have) => Ok(()),
            (Some(_), _) => Err(StoreError::Conflict(tx.object_id)),
        }
    }

    fn apply(&mut self, tx: Tx) {
        for m in tx.mutations {
            match m {
                Mutation::PutObject(record) => {
                    self.objects.insert(record.id, record);
                }
                Mutation::SetRows(rows) if rows.is_empty() => {
                    self.permissions.remove(&tx.object_id);
                }
                Mutation::SetRows(rows) => {
                    self.permissions.insert(tx.object_id, rows);
                }
            }
        }
    }
}

pub struct JsonMetadataStore {
    path: Option<PathBuf>,
    state: Mutex<Snapshot>,
}

impl JsonMetadataStore {
    pub fn in_memory() -> Self {
        JsonMetadataStore {
            path: None,
            state: Mutex::new(Snapshot::default()),
        }
    }

    /// Load `path`, or start empty if it does not exist yet.
    pub async fn open(path: &Path) -> StoreResult<Self> {
        let snapshot = match tokio::fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Snapshot::default(),
            Err(e) => return Err(e.into()),
        };
        debug!(
            path = %path.display(),
            objects = snapshot.objects.len(),
            "metadata store opened"
        );
        Ok(JsonMetadataStore {
            path: Some(path.to_path_buf()),
            state: Mutex::new(snapshot),
        })
    }

    async fn flush(&self, snapshot: &Snapshot) -> StoreResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(snapshot)?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for JsonMetadataStore {
    async fn get_object(&self, id: &ObjectId) -> StoreResult<Option<ObjectRecord>> {
        Ok(self.state.lock().await.objects.get(id).cloned())
    }

    async fn rows_for(&self, id: &ObjectId) -> StoreResult<Vec<PermissionRow>> {
        Ok(self
            .state
            .lock()
            .await
            .permissions
            .get(id)
            .cloned()
            .unwrap_or_default())
    }

    async fn commit(&self, tx: Tx) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.check(&tx)?;
        let id = tx.object_id;
        let mut next = state.clone();
        next.apply(tx);
        // Disk first: a failed flush leaves memory untouched.
        self.flush(&next).await?;
        *state = next;
        debug!(id = %id, "metadata committed");
        Ok(())
    }

    async fn object_ids(&self) -> StoreResult<Vec<ObjectId>> {
        Ok(self.state.lock().await.objects.keys().copied().collect())
    }
}
