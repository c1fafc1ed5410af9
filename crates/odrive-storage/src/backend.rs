//! The blob backend capability and the upload policy on top of it.

use std::path::Path;
use std::pin::Pin;

use async_trait::async_trait;
use odrive_core::config::BlobConfig;
use odrive_core::{ByteRange, ObjectId};
use tokio::io::AsyncRead;
use tracing::debug;

use crate::error::BlobResult;

/// A streaming body returned by [`BlobBackend::get`].
pub type BlobReader = Pin<Box<dyn AsyncRead + Send>>;

/// Capability interface over a remote ciphertext store.
///
/// Every operation is scoped to the partition the backend was built for;
/// `id` maps to `<partition>/<hex id>`.
#[async_trait]
pub trait BlobBackend: Send + Sync {
    /// Short label for logs and metrics (`fs`, `s3`).
    fn name(&self) -> &'static str;

    /// The partition this backend reads and writes.
    fn partition(&self) -> &str;

    /// Make sure the partition prefix exists. Idempotent.
    async fn ensure_partition(&self, partition: &str) -> BlobResult<()>;

    /// Store `len` bytes from `body` in one request. Returns the ETag.
    async fn put(&self, id: &ObjectId, body: BlobReader, len: u64) -> BlobResult<String>;

    /// Store `len` bytes from `body` as parts of `part_size` bytes.
    ///
    /// Implementations compute per-part MD5s and fail with
    /// [`BlobError::IntegrityMismatch`](crate::BlobError::IntegrityMismatch)
    /// when the backend reports a different ETag.
    async fn put_multipart(
        &self,
        id: &ObjectId,
        body: BlobReader,
        len: u64,
        part_size: u64,
    ) -> BlobResult<String>;

    /// Open `range` of a stored blob. Fails with `NotFound` when absent.
    async fn get(&self, id: &ObjectId, range: ByteRange) -> BlobResult<BlobReader>;

    /// Size of a stored blob, or `NotFound`.
    async fn size(&self, id: &ObjectId) -> BlobResult<u64>;

    async fn exists(&self, id: &ObjectId) -> BlobResult<bool>;

    /// Delete a blob. Returns `Ok(())` even if it didn't exist.
    async fn delete(&self, id: &ObjectId) -> BlobResult<()>;

    /// Ids stored under the partition. Non-id keys are skipped.
    async fn list(&self) -> BlobResult<Vec<ObjectId>>;
}

/// Upload a local ciphertext file, choosing single or multipart by size.
pub async fn upload_file(
    backend: &dyn BlobBackend,
    id: &ObjectId,
    path: &Path,
    cfg: &BlobConfig,
) -> BlobResult<String> {
    let file = tokio::fs::File::open(path).await?;
    let len = file.metadata().await?.len();
    let body: BlobReader = Box::pin(file);

    if len > cfg.multipart_threshold() {
        debug!(id = %id, len, part_size = cfg.part_size(), backend = backend.name(), "multipart upload");
        backend.put_multipart(id, body, len, cfg.part_size()).await
    } else {
        debug!(id = %id, len, backend = backend.name(), "single upload");
        backend.put(id, body, len).await
    }
}

/// Read up to `buf.len()` bytes, stopping early only at EOF.
pub(crate) async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    use tokio::io::AsyncReadExt;
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
