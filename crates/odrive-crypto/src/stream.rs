//! Streaming content pipeline: AES-256-CTR (or identity) plus SHA-256 of the plaintext.
//!
//! One pass over the source produces ciphertext, the plaintext hash, and the
//! length. The hash is always over plaintext so every grantee observes the
//! same content hash.
//!
//! Range reads position the counter at `start / 16` and drop the first
//! `start % 16` keystream bytes, so any `[start, stop]` can be decrypted
//! without touching earlier ciphertext.

use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher};
use odrive_core::ByteRange;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt, AsyncWrite, AsyncWriteExt};

use crate::error::{CryptoError, CryptoResult};
use crate::keys::{ContentIv, ContentKey};
use crate::{BLOCK_SIZE, IV_SIZE};

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

const BUF_SIZE: usize = 64 * 1024;

/// The cipher applied to object content.
///
/// `Identity` leaves bytes untouched but still goes through the same
/// hashing pipeline.
#[derive(Debug, Clone)]
pub enum ContentCipher {
    Aes256Ctr { key: ContentKey, iv: ContentIv },
    Identity,
}

impl ContentCipher {
    pub fn aes(key: ContentKey, iv: ContentIv) -> Self {
        ContentCipher::Aes256Ctr { key, iv }
    }

    /// A keystream positioned at byte `offset` of the object.
    fn keystream_at(&self, offset: u64) -> Keystream {
        match self {
            ContentCipher::Identity => Keystream::Identity,
            ContentCipher::Aes256Ctr { key, iv } => {
                let block = offset / BLOCK_SIZE as u64;
                let skip = (offset % BLOCK_SIZE as u64) as usize;
                let counter = u128::from_be_bytes(*iv.as_bytes()).wrapping_add(block as u128);
                let counter_iv: [u8; IV_SIZE] = counter.to_be_bytes();
                let mut cipher = Aes256Ctr::new(key.as_bytes().into(), (&counter_iv).into());
                if skip > 0 {
                    let mut discard = [0u8; BLOCK_SIZE];
                    cipher.apply_keystream(&mut discard[..skip]);
                }
                Keystream::Ctr(Box::new(cipher))
            }
        }
    }
}

enum Keystream {
    Ctr(Box<Aes256Ctr>),
    Identity,
}

impl Keystream {
    fn apply(&mut self, buf: &mut [u8]) {
        if let Keystream::Ctr(cipher) = self {
            cipher.apply_keystream(buf);
        }
    }
}

/// Outcome of encrypting one object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncryptSummary {
    /// SHA-256 of the plaintext
    pub content_hash: [u8; 32],
    /// Bytes written (CTR preserves length)
    pub size: u64,
}

impl EncryptSummary {
    pub fn content_hash_hex(&self) -> String {
        hex::encode(self.content_hash)
    }
}

/// Encrypt `reader` into `writer` in one pass.
///
/// When `expected_len` is given, a source that ends early fails with
/// [`CryptoError::ShortRead`]; the partial output must then be discarded.
pub async fn encrypt_stream<R, W>(
    cipher: &ContentCipher,
    reader: &mut R,
    writer: &mut W,
    expected_len: Option<u64>,
) -> CryptoResult<EncryptSummary>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut keystream = cipher.keystream_at(0);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; BUF_SIZE];
    let mut total: u64 = 0;

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        keystream.apply(&mut buf[..n]);
        writer.write_all(&buf[..n]).await?;
        total += n as u64;
    }
    writer.flush().await?;

    if let Some(expected) = expected_len {
        if total < expected {
            return Err(CryptoError::ShortRead {
                expected,
                got: total,
            });
        }
    }

    Ok(EncryptSummary {
        content_hash: hasher.finalize().into(),
        size: total,
    })
}

/// Decrypt `range` of a ciphertext of `size` bytes from a seekable reader.
///
/// Returns the number of plaintext bytes written.
pub async fn decrypt_stream<R, W>(
    cipher: &ContentCipher,
    reader: &mut R,
    size: u64,
    range: ByteRange,
    writer: &mut W,
) -> CryptoResult<u64>
where
    R: AsyncRead + AsyncSeek + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let (start, end) = range.resolve(size).ok_or(CryptoError::RangeOutOfBounds {
        start: range.start,
        stop: range.stop,
        size,
    })?;

    reader.seek(std::io::SeekFrom::Start(start)).await?;
    let mut keystream = cipher.keystream_at(start);
    let mut buf = vec![0u8; BUF_SIZE];
    let mut remaining = end - start;

    while remaining > 0 {
        let want = remaining.min(BUF_SIZE as u64) as usize;
        let n = reader.read(&mut buf[..want]).await?;
        if n == 0 {
            // CTR has no authentication; a truncated file is the only content failure.
            return Err(CryptoError::ShortRead {
                expected: end - start,
                got: end - start - remaining,
            });
        }
        keystream.apply(&mut buf[..n]);
        writer.write_all(&buf[..n]).await?;
        remaining -= n as u64;
    }
    writer.flush().await?;

    Ok(end - start)
}

/// In-memory encryption. Returns ciphertext and the plaintext summary.
pub fn encrypt_bytes(cipher: &ContentCipher, plaintext: &[u8]) -> (Vec<u8>, EncryptSummary) {
    let mut out = plaintext.to_vec();
    cipher.keystream_at(0).apply(&mut out);
    let summary = EncryptSummary {
        content_hash: Sha256::digest(plaintext).into(),
        size: plaintext.len() as u64,
    };
    (out, summary)
}

/// In-memory range decryption over a full ciphertext.
pub fn decrypt_range_bytes(
    cipher: &ContentCipher,
    ciphertext: &[u8],
    range: ByteRange,
) -> CryptoResult<Vec<u8>> {
    let size = ciphertext.len() as u64;
    let (start, end) = range.resolve(size).ok_or(CryptoError::RangeOutOfBounds {
        start: range.start,
        stop: range.stop,
        size,
    })?;
    let mut out = ciphertext[start as usize..end as usize].to_vec();
    cipher.keystream_at(start).apply(&mut out);
    Ok(out)
}
