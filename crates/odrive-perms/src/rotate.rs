//! Online master key rotation for permission rows.
//!
//! Rotation flow:
//!   1. Build a ring with the new key as `current` and the old as `previous`
//!   2. For each row, skip it if it already validates under the new key
//!   3. Otherwise unwrap under the old key and re-seal under the new one
//!   4. Persist migrated rows one by one; readers accept both keys meanwhile
//!
//! Rows that validate under neither key are left as they are and counted as
//! failed. They were already inert.

use odrive_core::PermissionRow;
use odrive_crypto::{KeyRing, MasterKey};
use serde::Serialize;
use tracing::{info, warn};

use crate::error::PermResult;
use crate::row::{open_row, seal_row, verify_row};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RotationReport {
    pub migrated: usize,
    /// Already valid under the new key
    pub skipped: usize,
    /// Valid under no key in the ring
    pub failed: usize,
}

/// The outcome for one row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowRotation {
    Migrated(PermissionRow),
    Skipped,
    Failed,
}

/// Re-seal a single row under `ring.current()`.
pub fn rotate_row(ring: &KeyRing, row: &PermissionRow) -> PermResult<RowRotation> {
    if verify_row(ring.current(), row) {
        return Ok(RowRotation::Skipped);
    }
    match open_row(ring, row)? {
        Some(key) => Ok(RowRotation::Migrated(seal_row(
            ring.current(),
            row.object_id,
            &row.grantee,
            row.flags,
            &key,
        )?)),
        None => {
            warn!(object_id = %row.object_id, grantee = %row.grantee, "row valid under no key; not migrated");
            Ok(RowRotation::Failed)
        }
    }
}

/// Migrate `rows` from `old` to `new`. Returns the replacement rows (in
/// input order, failed rows unchanged) and the counts.
pub fn rotate(
    old: &MasterKey,
    new: &MasterKey,
    rows: &[PermissionRow],
) -> PermResult<(Vec<PermissionRow>, RotationReport)> {
    let ring = KeyRing::new(new.clone()).with_previous(old.clone());
    let mut report = RotationReport::default();
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        match rotate_row(&ring, row)? {
            RowRotation::Migrated(r) => {
                report.migrated += 1;
                out.push(r);
            }
            RowRotation::Skipped => {
                report.skipped += 1;
                out.push(row.clone());
            }
            RowRotation::Failed => {
                report.failed += 1;
                out.push(row.clone());
            }
        }
    }
    info!(
        migrated = report.migrated,
        skipped = report.skipped,
        failed = report.failed,
        "permission rows rotated"
    );
    Ok((out, report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::authorize;
    use odrive_core::{Flags, Identity, ObjectId};
    use odrive_crypto::generate_key;

    #[test]
    fn rotation_is_idempotent_and_keeps_access() {
        let old = MasterKey::from_bytes([1u8; 32]);
        let new = MasterKey::from_bytes([2u8; 32]);
        let key = generate_key();
        let id = ObjectId::random();
        let mut tampered = seal_row(&old, id, "cn=mallory", Flags::ALL, &key).unwrap();
        tampered.flags = Flags::NONE;
        let rows = vec![
            seal_row(&old, id, "cn=alice", Flags::ALL, &key).unwrap(),
            seal_row(&new, id, "cn=bob", Flags::READ, &key).unwrap(),
            tampered,
        ];

        let (rotated, report) = rotate(&old, &new, &rows).unwrap();
        assert_eq!(
            report,
            RotationReport {
                migrated: 1,
                skipped: 1,
                failed: 1
            }
        );
        assert!(verify_row(&new, &rotated[0]));
        assert_eq!(rotated[1], rows[1]);

        // After the window closes only the new key is accepted.
        let ring = KeyRing::new(new.clone());
        let alice = Identity::new("cn=alice");
        assert_eq!(authorize(&ring, &rotated, &alice, Flags::READ).unwrap(), key);
        assert!(authorize(&ring, &rows, &alice, Flags::READ).is_err());

        let (_, again) = rotate(&old, &new, &rotated).unwrap();
        assert_eq!(again.migrated, 0);
        assert_eq!(again.skipped, 2);
    }

    #[test]
    fn both_keys_verify_during_the_window() {
        let old = MasterKey::from_bytes([1u8; 32]);
        let new = MasterKey::from_bytes([2u8; 32]);
        let key = generate_key();
        let row = seal_row(&old, ObjectId::random(), "cn=alice", Flags::READ, &key).unwrap();
        let ring = KeyRing::new(new).with_previous(old);
        let alice = Identity::new("cn=alice");
        assert_eq!(authorize(&ring, &[row], &alice, Flags::READ).unwrap(), key);
    }
}
