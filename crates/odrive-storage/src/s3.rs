//! S3-compatible blob backend over an OpenDAL operator.
//!
//! Keys are `{partition}/{hex id}` inside the operator's bucket. Multipart
//! uploads hand OpenDAL exactly `part_size` bytes per write so our MD5
//! boundaries line up with the parts it sends.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use odrive_core::config::BlobConfig;
use odrive_core::{ByteRange, ObjectId};
use opendal::Operator;
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

use crate::backend::{read_full, BlobBackend, BlobReader};
use crate::error::{BlobError, BlobResult};
use crate::etag::{normalize, EtagBuilder};

pub struct S3Backend {
    op: Operator,
    partition: String,
    concurrency: usize,
    stream_timeout: Duration,
}

impl S3Backend {
    pub fn new(op: Operator, partition: impl Into<String>, cfg: &BlobConfig) -> Self {
        Self {
            op,
            partition: partition.into(),
            concurrency: cfg.concurrency.max(1),
            stream_timeout: cfg.stream_timeout(),
        }
    }

    fn key(&self, id: &ObjectId) -> String {
        format!("{}/{}", self.partition, id.to_hex())
    }

    fn not_found_or(&self, id: &ObjectId, e: opendal::Error) -> BlobError {
        if e.kind() == opendal::ErrorKind::NotFound {
            BlobError::NotFound(self.key(id))
        } else {
            BlobError::Store(e)
        }
    }

    async fn with_deadline<T, F>(&self, op: &'static str, fut: F) -> BlobResult<T>
    where
        F: std::future::Future<Output = BlobResult<T>>,
    {
        match tokio::time::timeout(self.stream_timeout, fut).await {
            Ok(r) => r,
            Err(_) => Err(BlobError::Timeout {
                op,
                secs: self.stream_timeout.as_secs(),
            }),
        }
    }

    /// Compare the ETag the backend returned (if any) against ours.
    fn check_etag(&self, id: &ObjectId, expected: String, meta: &opendal::Metadata) -> BlobResult<String> {
        match meta.etag() {
            Some(actual) if normalize(actual) != expected => Err(BlobError::IntegrityMismatch {
                id: self.key(id),
                expected,
                actual: actual.to_string(),
            }),
            Some(_) => Ok(expected),
            None => {
                debug!(key = %self.key(id), "backend returned no etag; skipping integrity check");
                Ok(expected)
            }
        }
    }
}

#[async_trait]
impl BlobBackend for S3Backend {
    fn name(&self) -> &'static str {
        "s3"
    }

    fn partition(&self) -> &str {
        &self.partition
    }

    async fn ensure_partition(&self, partition: &str) -> BlobResult<()> {
        // S3 prefixes are implicit; only services with real directories need one.
        if self.op.info().full_capability().create_dir {
            self.op.create_dir(&format!("{partition}/")).await?;
        }
        Ok(())
    }

    async fn put(&self, id: &ObjectId, mut body: BlobReader, len: u64) -> BlobResult<String> {
        let mut buf = vec![0u8; len as usize];
        let n = read_full(&mut body, &mut buf).await?;
        if n as u64 != len {
            return Err(BlobError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("body ended at {n} of {len} bytes"),
            )));
        }
        let mut etag = EtagBuilder::new();
        etag.push_part(&buf);
        let expected = etag.single();

        let key = self.key(id);
        let meta = self
            .with_deadline("put", async {
                Ok(self.op.write(&key, Bytes::from(buf)).await?)
            })
            .await?;
        self.check_etag(id, expected, &meta)
    }

    async fn put_multipart(
        &self,
        id: &ObjectId,
        mut body: BlobReader,
        len: u64,
        part_size: u64,
    ) -> BlobResult<String> {
        let key = self.key(id);
        let part_size = part_size.max(1) as usize;

        let upload = async {
            let mut writer = self
                .op
                .writer_with(&key)
                .chunk(part_size)
                .concurrent(self.concurrency)
                .await?;
            let mut etag = EtagBuilder::new();
            let mut sent = 0u64;
            loop {
                let mut part = vec![0u8; part_size];
                let n = match read_full(&mut body, &mut part).await {
                    Ok(n) => n,
                    Err(e) => {
                        let _ = writer.abort().await;
                        return Err(e.into());
                    }
                };
                if n == 0 {
                    break;
                }
                part.truncate(n);
                etag.push_part(&part);
                sent += n as u64;
                if let Err(e) = writer.write(Bytes::from(part)).await {
                    let _ = writer.abort().await;
                    return Err(e.into());
                }
            }
            if sent != len {
                let _ = writer.abort().await;
                return Err(BlobError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("body ended at {sent} of {len} bytes"),
                )));
            }
            let parts = etag.parts();
            let meta = writer.close().await?;
            debug!(key = %key, parts, bytes = sent, "multipart upload complete");
            Ok((etag, meta))
        };

        let (etag, meta) = self.with_deadline("put_multipart", upload).await?;
        // A single-part "multipart" upload is reported with the plain MD5 by most stores.
        let expected = if etag.parts() <= 1 {
            etag.single()
        } else {
            etag.multipart()
        };
        self.check_etag(id, expected, &meta)
    }

    async fn get(&self, id: &ObjectId, range: ByteRange) -> BlobResult<BlobReader> {
        let key = self.key(id);
        let meta = self
            .op
            .stat(&key)
            .await
            .map_err(|e| self.not_found_or(id, e))?;
        let size = meta.content_length();
        let (start, end) = range.resolve(size).ok_or(BlobError::RangeOutOfBounds {
            start: range.start,
            stop: range.stop,
            size,
        })?;

        let reader = self
            .op
            .reader(&key)
            .await
            .map_err(|e| self.not_found_or(id, e))?;
        let stream = reader.into_bytes_stream(start..end).await?;
        Ok(Box::pin(StreamReader::new(stream)))
    }

    async fn size(&self, id: &ObjectId) -> BlobResult<u64> {
        let meta = self
            .op
            .stat(&self.key(id))
            .await
            .map_err(|e| self.not_found_or(id, e))?;
        Ok(meta.content_length())
    }

    async fn exists(&self, id: &ObjectId) -> BlobResult<bool> {
        Ok(self.op.exists(&self.key(id)).await?)
    }

    async fn delete(&self, id: &ObjectId) -> BlobResult<()> {
        self.op.delete(&self.key(id)).await?;
        Ok(())
    }

    async fn list(&self) -> BlobResult<Vec<ObjectId>> {
        let entries = match self.op.list(&format!("{}/", self.partition)).await {
            Ok(e) => e,
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut ids = Vec::with_capacity(entries.len());
        for entry in entries {
            match entry.name().parse::<ObjectId>() {
                Ok(id) => ids.push(id),
                Err(_) => {
                    if !entry.metadata().is_dir() {
                        warn!(key = entry.path(), "skipping non-id key in partition");
                    }
                }
            }
        }
        Ok(ids)
    }
}
