//! Change tokens for optimistic concurrency.
//!
//! A token is `hex(HMAC-SHA256(master, object_id ":" previous ":" fields))`
//! where `fields` is the canonical JSON of the object's mutable fields
//! (object keys sorted). Keying under the master key means a client cannot
//! forge the next token, and a token minted for one object never validates
//! for another.

use hmac::{Hmac, Mac};
use odrive_core::ObjectId;
use serde::Serialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::keys::MasterKey;

type HmacSha256 = Hmac<Sha256>;

/// Derive the token that replaces `previous` after a mutation.
///
/// `previous` is empty for a freshly created object.
pub fn derive_change_token<F: Serialize + ?Sized>(
    master: &MasterKey,
    object_id: &ObjectId,
    previous: &str,
    fields: &F,
) -> String {
    // serde_json's default map is ordered, so re-serializing through Value
    // yields sorted keys regardless of struct field order.
    let canonical = serde_json::to_value(fields)
        .and_then(|v| serde_json::to_string(&v))
        .unwrap_or_default();

    let mut mac = <HmacSha256 as Mac>::new_from_slice(master.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(object_id.to_hex().as_bytes());
    mac.update(b":");
    mac.update(previous.as_bytes());
    mac.update(b":");
    mac.update(canonical.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time token comparison.
pub fn tokens_match(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}
