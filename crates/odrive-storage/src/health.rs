//! Blob backend health check

use anyhow::Result;

use crate::backend::BlobBackend;

/// Verify the backend is reachable by listing the partition
pub async fn check_health(backend: &dyn BlobBackend) -> Result<()> {
    backend
        .list()
        .await
        .map(|_| ())
        .map_err(|e| anyhow::anyhow!("{} backend health check failed: {e}", backend.name()))
}

/// Returns true if the backend is reachable, false otherwise (non-panicking)
pub async fn is_healthy(backend: &dyn BlobBackend) -> bool {
    check_health(backend).await.is_ok()
}
