//! odrive-crypto: at-rest encryption for object content
//!
//! Each object gets a random 256-bit content key and a 128-bit IV whose last
//! four bytes are zero. Content is encrypted with AES-256-CTR in a single
//! pass that also hashes the plaintext with SHA-256.
//!
//! Key hierarchy:
//! ```text
//! Master Key (256-bit, process-wide, loaded at startup)
//!   ├── Permission row: wrapped_key = content_key XOR SHA-256(master ":" hex(permission_iv))
//!   ├── Permission MAC: SHA-256(master ":" grantee ":" csv(flags) ":" hex(wrapped_key))
//!   └── Change token:   HMAC-SHA256(master, object_id ":" previous ":" fields)
//! ```

pub mod error;
pub mod keys;
pub mod stream;
pub mod token;
pub mod wrap;

pub use error::{CryptoError, CryptoResult};
pub use keys::{
    generate_iv, generate_key, generate_permission_iv, ContentIv, ContentKey, KeyRing, MasterKey,
};
pub use stream::{
    decrypt_range_bytes, decrypt_stream, encrypt_bytes, encrypt_stream, ContentCipher,
    EncryptSummary,
};
pub use token::{derive_change_token, tokens_match};
pub use wrap::{permission_mac, unwrap_key, verify_mac, wrap_key};

/// Size of content and master keys in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of an AES-CTR IV (128-bit)
pub const IV_SIZE: usize = 16;

/// Size of a permission IV
pub const PERMISSION_IV_SIZE: usize = 32;

/// AES block size; CTR seeks are computed in these units
pub const BLOCK_SIZE: usize = 16;
