//! Access decisions over an object's permission rows, and new grants.

use odrive_core::{Flags, Identity, PermissionRow};
use odrive_crypto::{ContentKey, KeyRing};
use tracing::{debug, warn};

use crate::error::{PermError, PermResult};
use crate::row::{open_row, seal_row};

/// Recover the object key for `identity` if it holds `need`.
///
/// Rows are tried in stored order. The first row whose grantee is one of
/// the identity's principals, whose MAC validates, and whose flags cover
/// `need` wins. Rows failing any check are skipped as if absent.
pub fn authorize(
    ring: &KeyRing,
    rows: &[PermissionRow],
    identity: &Identity,
    need: Flags,
) -> PermResult<ContentKey> {
    for row in rows {
        if !identity.principals().any(|p| p == row.grantee) {
            continue;
        }
        if !row.flags.covers(need) {
            continue;
        }
        if let Some(key) = open_row(ring, row)? {
            debug!(object_id = %row.object_id, grantee = %row.grantee, need = %need, "access granted");
            return Ok(key);
        }
        warn!(
            object_id = %row.object_id,
            grantee = %row.grantee,
            "ignoring permission row with invalid MAC"
        );
    }
    Err(PermError::Denied)
}

/// The flags `identity` effectively holds: the union over every valid row
/// matching one of its principals.
pub fn effective_flags(ring: &KeyRing, rows: &[PermissionRow], identity: &Identity) -> Flags {
    rows.iter()
        .filter(|row| identity.principals().any(|p| p == row.grantee))
        .filter(|row| matches!(open_row(ring, row), Ok(Some(_))))
        .fold(Flags::NONE, |acc, row| Flags {
            c: acc.c || row.flags.c,
            r: acc.r || row.flags.r,
            u: acc.u || row.flags.u,
            d: acc.d || row.flags.d,
            s: acc.s || row.flags.s,
        })
}

/// Create a row for `grantee` using the key recovered from the granter's
/// own row. The granter needs the share flag.
pub fn grant(
    ring: &KeyRing,
    rows: &[PermissionRow],
    granter: &Identity,
    grantee: &str,
    flags: Flags,
) -> PermResult<PermissionRow> {
    let key = authorize(ring, rows, granter, Flags::SHARE)?;
    let object_id = rows.first().map(|r| r.object_id).ok_or(PermError::Denied)?;
    let row = seal_row(ring.current(), object_id, grantee, flags, &key)?;
    debug!(object_id = %object_id, granter = granter.dn(), grantee = %row.grantee, flags = %flags, "granted");
    Ok(row)
}

/// Check that every valid row of one object unwraps to the same key.
pub fn check_consistent(ring: &KeyRing, rows: &[PermissionRow]) -> PermResult<()> {
    let mut first: Option<ContentKey> = None;
    for row in rows {
        let Some(key) = open_row(ring, row)? else {
            continue;
        };
        match &first {
            None => first = Some(key),
            Some(k) if *k == key => {}
            Some(_) => return Err(PermError::Inconsistent(row.object_id)),
        }
    }
    Ok(())
}
