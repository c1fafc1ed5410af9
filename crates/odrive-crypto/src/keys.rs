//! Key material: per-object content keys and IVs, the process master key

use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use zeroize::Zeroize;

use crate::error::{CryptoError, CryptoResult};
use crate::{IV_SIZE, KEY_SIZE, PERMISSION_IV_SIZE};

/// A per-object 256-bit content key. Zeroized on drop.
///
/// Never persisted in clear; only per-grantee wrapped copies exist.
#[derive(Clone)]
pub struct ContentKey {
    bytes: [u8; KEY_SIZE],
}

impl ContentKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn from_slice(bytes: &[u8]) -> CryptoResult<Self> {
        let arr: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidKey(format!(
                "content key must be {KEY_SIZE} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self::from_bytes(arr))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for ContentKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl PartialEq for ContentKey {
    fn eq(&self, other: &Self) -> bool {
        use subtle::ConstantTimeEq;
        self.bytes.ct_eq(&other.bytes).into()
    }
}

impl std::fmt::Debug for ContentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// A 128-bit CTR IV. Not secret; stored on the object row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentIv([u8; IV_SIZE]);

impl ContentIv {
    pub fn from_bytes(bytes: [u8; IV_SIZE]) -> Self {
        ContentIv(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> CryptoResult<Self> {
        let arr: [u8; IV_SIZE] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidKey(format!("IV must be {IV_SIZE} bytes, got {}", bytes.len()))
        })?;
        Ok(ContentIv(arr))
    }

    pub fn as_bytes(&self) -> &[u8; IV_SIZE] {
        &self.0
    }
}

/// Generate a random 256-bit content key.
pub fn generate_key() -> ContentKey {
    let mut bytes = [0u8; KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut bytes);
    ContentKey::from_bytes(bytes)
}

/// Generate a random IV with the last four bytes zeroed.
///
/// The zero tail is counter headroom: random-access reads never carry into
/// the random prefix for objects up to 2^32 blocks (~68 GiB).
pub fn generate_iv() -> ContentIv {
    let mut bytes = [0u8; IV_SIZE];
    rand::thread_rng().fill_bytes(&mut bytes[..IV_SIZE - 4]);
    ContentIv(bytes)
}

/// Generate a fresh per-row permission IV.
pub fn generate_permission_iv() -> [u8; PERMISSION_IV_SIZE] {
    let mut bytes = [0u8; PERMISSION_IV_SIZE];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// The process-wide 256-bit master key. Zeroized on drop, never logged.
#[derive(Clone)]
pub struct MasterKey {
    bytes: [u8; KEY_SIZE],
}

impl MasterKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Parse a hex-encoded key (surrounding whitespace ignored).
    pub fn from_hex(hex_key: &SecretString) -> CryptoResult<Self> {
        let mut raw = hex::decode(hex_key.expose_secret().trim())
            .map_err(|e| CryptoError::InvalidKey(format!("master key is not hex: {e}")))?;
        if raw.len() != KEY_SIZE {
            let len = raw.len();
            raw.zeroize();
            return Err(CryptoError::InvalidKey(format!(
                "master key must be {KEY_SIZE} bytes, got {len}"
            )));
        }
        let mut bytes = [0u8; KEY_SIZE];
        bytes.copy_from_slice(&raw);
        raw.zeroize();
        Ok(Self::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for MasterKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Master keys accepted for verification.
///
/// New material is always produced under `current`. During a rolling
/// rotation `previous` still verifies rows that have not been migrated.
#[derive(Debug, Clone)]
pub struct KeyRing {
    current: MasterKey,
    previous: Option<MasterKey>,
}

impl KeyRing {
    pub fn new(current: MasterKey) -> Self {
        KeyRing {
            current,
            previous: None,
        }
    }

    pub fn with_previous(mut self, previous: MasterKey) -> Self {
        self.previous = Some(previous);
        self
    }

    pub fn current(&self) -> &MasterKey {
        &self.current
    }

    pub fn previous(&self) -> Option<&MasterKey> {
        self.previous.as_ref()
    }

    /// Current key first, then the previous one if any.
    pub fn keys(&self) -> impl Iterator<Item = &MasterKey> {
        std::iter::once(&self.current).chain(self.previous.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_generation_random() {
        let k1 = generate_key();
        let k2 = generate_key();
        assert_ne!(k1.as_bytes(), k2.as_bytes(), "random keys must differ");
    }

    #[test]
    fn test_iv_tail_zeroed() {
        for _ in 0..32 {
            let iv = generate_iv();
            assert_eq!(&iv.as_bytes()[12..], &[0u8; 4]);
        }
        assert_ne!(generate_iv(), generate_iv());
    }

    #[test]
    fn test_master_key_from_hex() {
        let hex_key = SecretString::from(format!("{}\n", "ab".repeat(32)));
        let key = MasterKey::from_hex(&hex_key).unwrap();
        assert_eq!(key.as_bytes(), &[0xab; 32]);

        let short = SecretString::from("abcd".to_string());
        assert!(MasterKey::from_hex(&short).is_err());
        let bogus = SecretString::from("zz".repeat(32));
        assert!(MasterKey::from_hex(&bogus).is_err());
    }

    #[test]
    fn test_debug_redacts() {
        let key = MasterKey::from_bytes([7u8; KEY_SIZE]);
        let shown = format!("{key:?}");
        assert!(shown.contains("REDACTED"));
        assert!(!shown.contains('7'));
    }

    #[test]
    fn test_keyring_order() {
        let ring = KeyRing::new(MasterKey::from_bytes([1; KEY_SIZE]))
            .with_previous(MasterKey::from_bytes([2; KEY_SIZE]));
        let firsts: Vec<u8> = ring.keys().map(|k| k.as_bytes()[0]).collect();
        assert_eq!(firsts, vec![1, 2]);
    }
}
