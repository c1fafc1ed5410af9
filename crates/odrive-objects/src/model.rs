//! Object records and the request/response shapes around them.

use odrive_core::{Acm, AcmPart, ObjectId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectState {
    Active,
    Trashed,
    Expunged,
}

impl std::fmt::Display for ObjectState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ObjectState::Active => "active",
            ObjectState::Trashed => "trashed",
            ObjectState::Expunged => "expunged",
        })
    }
}

/// Stored object row.
///
/// `content_id` names the ciphertext in the cache and blob store. It changes
/// with every content version, so an old version's ciphertext can be
/// collected without touching the new one. Folders have no content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRecord {
    pub id: ObjectId,
    pub name: String,
    pub content_type: String,
    pub parent_id: Option<ObjectId>,
    pub owner: String,
    pub acm: Acm,
    pub acm_parts: Vec<AcmPart>,
    pub content_id: Option<ObjectId>,
    /// CTR IV for the current content version (hex)
    pub content_iv: Option<String>,
    /// SHA-256 of the plaintext (hex)
    pub content_hash: Option<String>,
    pub size: u64,
    pub change_token: String,
    pub state: ObjectState,
    pub created_at: u64,
    pub updated_at: u64,
}

impl ObjectRecord {
    pub fn is_folder(&self) -> bool {
        self.content_id.is_none()
    }
}

/// Fields folded into the change token. Timestamps are left out so a token
/// only moves when something a caller could observe changes.
#[derive(Serialize)]
pub(crate) struct TokenFields<'a> {
    name: &'a str,
    content_type: &'a str,
    parent_id: Option<ObjectId>,
    acm: &'a Acm,
    content_id: Option<ObjectId>,
    content_hash: Option<&'a str>,
    size: u64,
    state: ObjectState,
    grants: Vec<(&'a str, String)>,
}

impl<'a> TokenFields<'a> {
    pub(crate) fn of(record: &'a ObjectRecord, grants: &'a [odrive_core::PermissionRow]) -> Self {
        TokenFields {
            name: &record.name,
            content_type: &record.content_type,
            parent_id: record.parent_id,
            acm: &record.acm,
            content_id: record.content_id,
            content_hash: record.content_hash.as_deref(),
            size: record.size,
            state: record.state,
            grants: grants
                .iter()
                .map(|r| (r.grantee.as_str(), r.flags.csv()))
                .collect(),
        }
    }
}

/// Metadata supplied with an upload.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewObject {
    pub name: String,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub parent_id: Option<ObjectId>,
    /// Required; must be a JSON object
    pub acm: Option<serde_json::Value>,
}

impl NewObject {
    /// Parse the JSON metadata part of an upload.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

/// A partial update of an object's properties. `None` leaves a field alone.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertiesPatch {
    pub name: Option<String>,
    pub content_type: Option<String>,
    pub acm: Option<serde_json::Value>,
}

/// What callers see of an object.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectProperties {
    pub id: ObjectId,
    pub name: String,
    pub content_type: String,
    pub parent_id: Option<ObjectId>,
    pub owner: String,
    pub acm: Acm,
    pub content_hash: Option<String>,
    pub size: u64,
    pub change_token: String,
    pub state: ObjectState,
    pub created_at: u64,
    pub updated_at: u64,
    pub permissions: Vec<GrantView>,
}

/// A grant as shown to callers: no key material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GrantView {
    pub grantee: String,
    pub flags: String,
}

impl ObjectProperties {
    pub(crate) fn new(record: &ObjectRecord, rows: &[odrive_core::PermissionRow]) -> Self {
        ObjectProperties {
            id: record.id,
            name: record.name.clone(),
            content_type: record.content_type.clone(),
            parent_id: record.parent_id,
            owner: record.owner.clone(),
            acm: record.acm.clone(),
            content_hash: record.content_hash.clone(),
            size: record.size,
            change_token: record.change_token.clone(),
            state: record.state,
            created_at: record.created_at,
            updated_at: record.updated_at,
            permissions: rows
                .iter()
                .map(|r| GrantView {
                    grantee: r.grantee.clone(),
                    flags: r.flags.to_string(),
                })
                .collect(),
        }
    }
}
