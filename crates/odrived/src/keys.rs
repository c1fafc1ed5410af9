//! Master key resolution.
//!
//! Precedence: `ODRIVE_MASTER_KEY`, then `keys.master_key_hex`, then
//! `keys.master_key_file`. No key means the node refuses to start.

use std::path::Path;

use anyhow::{bail, Context, Result};
use odrive_core::config::KeysConfig;
use odrive_crypto::{generate_key, KeyRing, MasterKey};
use secrecy::SecretString;

pub const MASTER_KEY_ENV: &str = "ODRIVE_MASTER_KEY";

/// Build the key ring from `env` (the value of [`MASTER_KEY_ENV`]) and config.
pub fn resolve(keys: &KeysConfig, env: Option<SecretString>) -> Result<KeyRing> {
    let (current, source) = if let Some(hex) = env {
        (MasterKey::from_hex(&hex).context(MASTER_KEY_ENV)?, MASTER_KEY_ENV.to_string())
    } else if let Some(hex) = &keys.master_key_hex {
        let hex = SecretString::from(hex.clone());
        (
            MasterKey::from_hex(&hex).context("keys.master_key_hex")?,
            "keys.master_key_hex".to_string(),
        )
    } else if let Some(path) = &keys.master_key_file {
        (read_key_file(path)?, path.display().to_string())
    } else {
        bail!(
            "no master key: set {MASTER_KEY_ENV}, keys.master_key_hex or keys.master_key_file"
        );
    };
    tracing::info!(source = %source, "master key loaded");

    let mut ring = KeyRing::new(current);
    if let Some(path) = &keys.previous_master_key_file {
        ring = ring.with_previous(read_key_file(path)?);
        tracing::info!(path = %path.display(), "previous master key accepted for rotation");
    }
    Ok(ring)
}

fn read_key_file(path: &Path) -> Result<MasterKey> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading master key file {}", path.display()))?;
    MasterKey::from_hex(&SecretString::from(contents))
        .with_context(|| format!("parsing master key file {}", path.display()))
}

/// Fresh random key, hex encoded.
pub fn generate_hex() -> String {
    hex::encode(generate_key().as_bytes())
}
