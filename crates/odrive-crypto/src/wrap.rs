//! Per-grantee key wrapping and the permission MAC.
//!
//! Wrapping is a one-time pad keyed by `SHA-256(master || ":" || hex(permission_iv))`,
//! so each permission row needs its own IV. The MAC binds grantee, flags and
//! wrapped key together under the master key; a row whose MAC does not
//! recompute bit-equal is treated as absent.

use odrive_core::Flags;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

use crate::error::{CryptoError, CryptoResult};
use crate::keys::MasterKey;
use crate::KEY_SIZE;

fn wrap_pad(master: &MasterKey, permission_iv: &[u8]) -> [u8; KEY_SIZE] {
    let mut hasher = Sha256::new();
    hasher.update(master.as_bytes());
    hasher.update(b":");
    hasher.update(hex::encode(permission_iv).as_bytes());
    hasher.finalize().into()
}

/// XOR `raw` with the first `raw.len()` bytes of the wrap pad.
///
/// Fails with [`CryptoError::KeyTooLong`] if `raw` is longer than 32 bytes.
pub fn wrap_key(master: &MasterKey, permission_iv: &[u8], raw: &[u8]) -> CryptoResult<Vec<u8>> {
    if raw.len() > KEY_SIZE {
        return Err(CryptoError::KeyTooLong { len: raw.len() });
    }
    let mut pad = wrap_pad(master, permission_iv);
    let out = raw.iter().zip(pad.iter()).map(|(a, b)| a ^ b).collect();
    pad.zeroize();
    Ok(out)
}

/// Inverse of [`wrap_key`]. XOR is its own inverse.
pub fn unwrap_key(
    master: &MasterKey,
    permission_iv: &[u8],
    wrapped: &[u8],
) -> CryptoResult<Vec<u8>> {
    wrap_key(master, permission_iv, wrapped)
}

/// `SHA-256(master || ":" || grantee || ":" || csv(flags) || ":" || hex(wrapped))`.
///
/// The hex form is lowercase with no separators; verifiers must rebuild the
/// exact same string.
pub fn permission_mac(master: &MasterKey, grantee: &str, flags: Flags, wrapped: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(master.as_bytes());
    hasher.update(b":");
    hasher.update(grantee.as_bytes());
    hasher.update(b":");
    hasher.update(flags.csv().as_bytes());
    hasher.update(b":");
    hasher.update(hex::encode(wrapped).as_bytes());
    hasher.finalize().into()
}

/// Recompute the MAC and compare it to `expected` in constant time.
pub fn verify_mac(
    master: &MasterKey,
    grantee: &str,
    flags: Flags,
    wrapped: &[u8],
    expected: &[u8],
) -> bool {
    let actual = permission_mac(master, grantee, flags, wrapped);
    actual.ct_eq(expected).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{generate_key, generate_permission_iv};
    use proptest::prelude::*;

    fn master(b: u8) -> MasterKey {
        MasterKey::from_bytes([b; KEY_SIZE])
    }

    #[test]
    fn test_wrap_changes_key_and_inverts() {
        let m = master(3);
        let iv = generate_permission_iv();
        let raw = generate_key();
        let wrapped = wrap_key(&m, &iv, raw.as_bytes()).unwrap();
        assert_ne!(&wrapped[..], &raw.as_bytes()[..]);
        let back = unwrap_key(&m, &iv, &wrapped).unwrap();
        assert_eq!(&back[..], &raw.as_bytes()[..]);
    }

    #[test]
    fn test_wrap_rejects_long_key() {
        let err = wrap_key(&master(1), &[0u8; 32], &[0u8; 33]).unwrap_err();
        assert!(matches!(err, CryptoError::KeyTooLong { len: 33 }));
    }

    #[test]
    fn test_wrong_master_does_not_unwrap() {
        let iv = generate_permission_iv();
        let raw = [5u8; 32];
        let wrapped = wrap_key(&master(1), &iv, &raw).unwrap();
        assert_ne!(unwrap_key(&master(2), &iv, &wrapped).unwrap(), raw.to_vec());
    }

    #[test]
    fn test_pad_uses_hex_of_iv() {
        // Pad derivation is normative: SHA-256(master ":" lowercase-hex(iv)).
        let m = master(0);
        let iv = [0xabu8; 2];
        let mut expect = Sha256::new();
        expect.update([0u8; 32]);
        expect.update(b":abab");
        let pad: [u8; 32] = expect.finalize().into();
        let wrapped = wrap_key(&m, &iv, &[0u8; 4]).unwrap();
        assert_eq!(&wrapped[..], &pad[..4]);
    }

    #[test]
    fn test_mac_verifies_and_rejects_other_master() {
        let wrapped = [1u8; 32];
        let mac = permission_mac(&master(1), "cn=bob", Flags::READ, &wrapped);
        assert!(verify_mac(&master(1), "cn=bob", Flags::READ, &wrapped, &mac));
        assert!(!verify_mac(&master(2), "cn=bob", Flags::READ, &wrapped, &mac));
        assert!(!verify_mac(&master(1), "cn=bob", Flags::READ, &wrapped, &mac[..31]));
    }

    proptest! {
        #[test]
        fn prop_wrap_inversion(
            m in any::<[u8; 32]>(),
            iv in any::<[u8; 32]>(),
            raw in proptest::collection::vec(any::<u8>(), 0..=32),
        ) {
            let m = MasterKey::from_bytes(m);
            let wrapped = wrap_key(&m, &iv, &raw).unwrap();
            prop_assert_eq!(wrapped.len(), raw.len());
            prop_assert_eq!(unwrap_key(&m, &iv, &wrapped).unwrap(), raw);
        }

        #[test]
        fn prop_mac_detects_single_field_tamper(
            wrapped in any::<[u8; 32]>(),
            byte in 0usize..32,
            bit in 0u8..8,
            flag in 0usize..5,
        ) {
            let m = master(9);
            let flags = Flags::parse("r").unwrap();
            let mac = permission_mac(&m, "cn=carol", flags, &wrapped);
            prop_assert!(verify_mac(&m, "cn=carol", flags, &wrapped, &mac));

            let mut bad = wrapped;
            bad[byte] ^= 1 << bit;
            prop_assert!(!verify_mac(&m, "cn=carol", flags, &bad, &mac));

            prop_assert!(!verify_mac(&m, "cn=caro1", flags, &wrapped, &mac));

            let mut toggled = flags;
            match flag {
                0 => toggled.c = !toggled.c,
                1 => toggled.r = !toggled.r,
                2 => toggled.u = !toggled.u,
                3 => toggled.d = !toggled.d,
                _ => toggled.s = !toggled.s,
            }
            prop_assert!(!verify_mac(&m, "cn=carol", toggled, &wrapped, &mac));
        }
    }
}
