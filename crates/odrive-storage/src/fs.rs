//! Filesystem blob backend.
//!
//! Layout: `{root}/{partition}/{hex id}`. Writes go to a `.part` sibling and
//! are renamed into place so a reader never sees a torn blob.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use odrive_core::{ByteRange, ObjectId};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::backend::{read_full, BlobBackend, BlobReader};
use crate::error::{BlobError, BlobResult};
use crate::etag::EtagBuilder;

const COPY_BUF: usize = 64 * 1024;

pub struct FsBackend {
    root: PathBuf,
    partition: String,
}

impl FsBackend {
    pub fn new(root: impl AsRef<Path>, partition: impl Into<String>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            partition: partition.into(),
        }
    }

    fn blob_path(&self, id: &ObjectId) -> PathBuf {
        self.root.join(&self.partition).join(id.to_hex())
    }

    fn temp_path(&self, id: &ObjectId) -> PathBuf {
        self.root
            .join(&self.partition)
            .join(format!("{}.part", id.to_hex()))
    }

    /// Copy `body` to the blob path in `chunk`-sized pieces, feeding each
    /// piece to the ETag builder.
    async fn write_blob(
        &self,
        id: &ObjectId,
        mut body: BlobReader,
        len: u64,
        chunk: usize,
    ) -> BlobResult<EtagBuilder> {
        let tmp = self.temp_path(id);
        let mut file = fs::File::create(&tmp).await?;
        let mut etag = EtagBuilder::new();
        let mut buf = vec![0u8; chunk];
        let mut written = 0u64;

        let result: BlobResult<()> = async {
            loop {
                let n = read_full(&mut body, &mut buf).await?;
                if n == 0 {
                    break;
                }
                etag.push_part(&buf[..n]);
                file.write_all(&buf[..n]).await?;
                written += n as u64;
            }
            file.sync_all().await?;
            if written != len {
                return Err(BlobError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("body ended at {written} of {len} bytes"),
                )));
            }
            Ok(())
        }
        .await;

        if let Err(e) = result {
            let _ = fs::remove_file(&tmp).await;
            return Err(e);
        }
        fs::rename(&tmp, self.blob_path(id)).await?;
        Ok(etag)
    }
}

#[async_trait]
impl BlobBackend for FsBackend {
    fn name(&self) -> &'static str {
        "fs"
    }

    fn partition(&self) -> &str {
        &self.partition
    }

    async fn ensure_partition(&self, partition: &str) -> BlobResult<()> {
        fs::create_dir_all(self.root.join(partition)).await?;
        Ok(())
    }

    async fn put(&self, id: &ObjectId, body: BlobReader, len: u64) -> BlobResult<String> {
        let etag = self.write_blob(id, body, len, COPY_BUF).await?;
        Ok(etag.single())
    }

    async fn put_multipart(
        &self,
        id: &ObjectId,
        body: BlobReader,
        len: u64,
        part_size: u64,
    ) -> BlobResult<String> {
        let etag = self.write_blob(id, body, len, part_size as usize).await?;
        Ok(etag.multipart())
    }

    async fn get(&self, id: &ObjectId, range: ByteRange) -> BlobResult<BlobReader> {
        let path = self.blob_path(id);
        let mut file = match fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BlobError::NotFound(id.to_hex()))
            }
            Err(e) => return Err(e.into()),
        };
        let size = file.metadata().await?.len();
        let (start, end) = range.resolve(size).ok_or(BlobError::RangeOutOfBounds {
            start: range.start,
            stop: range.stop,
            size,
        })?;
        file.seek(SeekFrom::Start(start)).await?;
        Ok(Box::pin(file.take(end - start)))
    }

    async fn size(&self, id: &ObjectId) -> BlobResult<u64> {
        match fs::metadata(self.blob_path(id)).await {
            Ok(m) => Ok(m.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BlobError::NotFound(id.to_hex()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, id: &ObjectId) -> BlobResult<bool> {
        Ok(fs::try_exists(self.blob_path(id)).await?)
    }

    async fn delete(&self, id: &ObjectId) -> BlobResult<()> {
        match fs::remove_file(self.blob_path(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> BlobResult<Vec<ObjectId>> {
        let dir = self.root.join(&self.partition);
        let mut ids = Vec::new();
        let mut entries = match fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if let Some(id) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<ObjectId>().ok())
            {
                ids.push(id);
            }
        }
        Ok(ids)
    }
}
