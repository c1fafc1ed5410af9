//! Sealing and opening single permission rows.

use odrive_core::types::canonical_dn;
use odrive_core::{Flags, ObjectId, PermissionRow};
use odrive_crypto::{
    generate_permission_iv, permission_mac, unwrap_key, verify_mac, wrap_key, ContentKey, KeyRing,
    MasterKey,
};
use tracing::debug;
use zeroize::Zeroize;

use crate::error::{PermError, PermResult};

/// Canonical form of a grantee. DNs are canonicalized; group names are
/// kept as given apart from surrounding whitespace.
pub fn canonical_grantee(grantee: &str) -> PermResult<String> {
    let trimmed = grantee.trim();
    if trimmed.is_empty() || trimmed.contains(':') {
        // ':' separates MAC fields.
        return Err(PermError::InvalidGrantee(grantee.to_string()));
    }
    if trimmed.contains('=') {
        Ok(canonical_dn(trimmed))
    } else {
        Ok(trimmed.to_string())
    }
}

/// Build a row for `grantee` holding `key`, wrapped and MACed under `master`
/// with a fresh permission IV.
pub fn seal_row(
    master: &MasterKey,
    object_id: ObjectId,
    grantee: &str,
    flags: Flags,
    key: &ContentKey,
) -> PermResult<PermissionRow> {
    let grantee = canonical_grantee(grantee)?;
    let permission_iv = generate_permission_iv().to_vec();
    let wrapped_key = wrap_key(master, &permission_iv, key.as_bytes())?;
    let mac = permission_mac(master, &grantee, flags, &wrapped_key).to_vec();
    Ok(PermissionRow {
        object_id,
        grantee,
        flags,
        permission_iv,
        wrapped_key,
        mac,
    })
}

/// Whether the row's MAC validates under `master`.
pub fn verify_row(master: &MasterKey, row: &PermissionRow) -> bool {
    verify_mac(master, &row.grantee, row.flags, &row.wrapped_key, &row.mac)
}

/// The first key in `ring` under which the row validates.
pub fn validating_key<'a>(ring: &'a KeyRing, row: &PermissionRow) -> Option<&'a MasterKey> {
    ring.keys().find(|master| verify_row(master, row))
}

/// Recover the object key from a row, if its MAC validates under any key
/// in the ring. Rows that fail are inert and yield `None`.
pub fn open_row(ring: &KeyRing, row: &PermissionRow) -> PermResult<Option<ContentKey>> {
    let Some(master) = validating_key(ring, row) else {
        debug!(object_id = %row.object_id, grantee = %row.grantee, "permission row failed MAC check");
        return Ok(None);
    };
    let mut raw = unwrap_key(master, &row.permission_iv, &row.wrapped_key)?;
    let key = ContentKey::from_slice(&raw);
    raw.zeroize();
    Ok(Some(key?))
}

/// Re-seal `row` with new flags under the ring's current key.
///
/// The row must validate; a tampered row cannot be repaired by resealing.
pub fn update_flags(ring: &KeyRing, row: &PermissionRow, flags: Flags) -> PermResult<PermissionRow> {
    let key = open_row(ring, row)?.ok_or(PermError::Denied)?;
    let current = ring.current();
    if verify_row(current, row) {
        // Same wrap, new MAC.
        let mac = permission_mac(current, &row.grantee, flags, &row.wrapped_key).to_vec();
        return Ok(PermissionRow {
            flags,
            mac,
            ..row.clone()
        });
    }
    seal_row(current, row.object_id, &row.grantee, flags, &key)
}
