//! OpenDAL Operator factory for the S3 blob backend

use std::time::Duration;

use anyhow::{Context, Result};
use odrive_core::config::BlobConfig;
use opendal::Operator;

/// Minimal config needed to build an operator
/// (full config lives in odrive-core's BlobConfig)
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub endpoint: String,
    pub region: String,
    pub bucket: String,
    /// `None` leaves credential loading to the environment
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub retries: usize,
    pub op_timeout: Duration,
}

/// Build an OpenDAL Operator for any S3-compatible endpoint
///
/// Uses path-style addressing (default in opendal 0.55), which MinIO and
/// SeaweedFS require.
pub fn build_operator(cfg: &StorageConfig) -> Result<Operator> {
    // opendal 0.55: S3 builder uses consuming pattern (methods take `self`, return `Self`)
    let mut builder = opendal::services::S3::default()
        .endpoint(&cfg.endpoint)
        .region(&cfg.region)
        .bucket(&cfg.bucket);
    if let (Some(id), Some(secret)) = (&cfg.access_key_id, &cfg.secret_access_key) {
        builder = builder.access_key_id(id).secret_access_key(secret);
    }

    let op = Operator::new(builder)
        .context("creating OpenDAL S3 operator")?
        .layer(opendal::layers::LoggingLayer::default())
        .layer(
            opendal::layers::TimeoutLayer::new()
                .with_timeout(cfg.op_timeout)
                .with_io_timeout(cfg.op_timeout),
        )
        // Retry sits outside the timeout so each attempt gets its own deadline;
        // multipart writes are retried per part.
        .layer(
            opendal::layers::RetryLayer::new()
                .with_max_times(cfg.retries)
                .with_jitter(),
        )
        .finish();

    Ok(op)
}

/// Build an operator from odrive-core config.
///
/// If `enforce_tls` is true and the endpoint uses HTTP, this returns an error.
/// Otherwise, a warning is logged for non-HTTPS endpoints.
pub fn build_from_core_config(blob: &BlobConfig) -> Result<Operator> {
    if blob.endpoint.starts_with("http://") {
        if blob.enforce_tls {
            anyhow::bail!(
                "S3 endpoint uses plaintext HTTP ({}), but enforce_tls is enabled. \
                 Use an HTTPS endpoint or set blob.enforce_tls = false for local development.",
                blob.endpoint
            );
        }
        tracing::warn!(
            endpoint = %blob.endpoint,
            "S3 endpoint uses plaintext HTTP; credentials and ciphertext travel unencrypted"
        );
    }

    build_operator(&StorageConfig {
        endpoint: blob.endpoint.clone(),
        region: blob.region.clone(),
        bucket: blob.bucket.clone(),
        access_key_id: blob.access_key_id.clone(),
        secret_access_key: blob.secret_access_key.clone(),
        retries: blob.retries,
        op_timeout: blob.op_timeout(),
    })
}

/// An in-memory operator with the same layers, for tests and dry runs.
pub fn build_memory_operator() -> Result<Operator> {
    let op = Operator::new(opendal::services::Memory::default())
        .context("creating OpenDAL memory operator")?
        .layer(opendal::layers::LoggingLayer::default())
        .finish();
    Ok(op)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_operator_valid() {
        let cfg = StorageConfig {
            endpoint: "http://localhost:9000".to_string(),
            region: "us-east-1".to_string(),
            bucket: "test-bucket".to_string(),
            access_key_id: Some("test-key".to_string()),
            secret_access_key: Some("test-secret".to_string()),
            retries: 3,
            op_timeout: Duration::from_secs(5),
        };
        let op = build_operator(&cfg);
        assert!(op.is_ok(), "operator construction should succeed");
    }

    #[test]
    fn test_build_from_core_config_http_warning() {
        let blob = BlobConfig {
            endpoint: "http://localhost:9000".into(),
            enforce_tls: false,
            ..Default::default()
        };
        assert!(build_from_core_config(&blob).is_ok());
    }

    #[test]
    fn test_build_from_core_config_http_enforce_tls() {
        let blob = BlobConfig {
            endpoint: "http://insecure:9000".into(),
            enforce_tls: true,
            ..Default::default()
        };
        let result = build_from_core_config(&blob);
        assert!(result.is_err(), "HTTP + enforce_tls must fail");
        assert!(
            result.unwrap_err().to_string().contains("enforce_tls"),
            "error message should mention enforce_tls"
        );
    }

    #[test]
    fn test_build_from_core_config_https() {
        let blob = BlobConfig {
            endpoint: "https://s3.example.com".into(),
            enforce_tls: true,
            ..Default::default()
        };
        assert!(build_from_core_config(&blob).is_ok());
    }
}
