//! S3-style ETag computation.
//!
//! A single PUT's ETag is the hex MD5 of the body. A multipart upload's ETag
//! is the hex MD5 of the concatenated binary part MD5s, suffixed `-<parts>`.

use md5::{Digest, Md5};

/// Accumulates per-part MD5s while a body is streamed.
#[derive(Debug, Default)]
pub struct EtagBuilder {
    part_digests: Vec<[u8; 16]>,
    whole: Md5,
}

impl EtagBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one part exactly as it was handed to the backend.
    pub fn push_part(&mut self, part: &[u8]) {
        self.part_digests.push(Md5::digest(part).into());
        self.whole.update(part);
    }

    pub fn parts(&self) -> usize {
        self.part_digests.len()
    }

    /// ETag for a single PUT of everything pushed so far.
    pub fn single(self) -> String {
        hex::encode(self.whole.finalize())
    }

    /// ETag for a multipart upload of the pushed parts.
    pub fn multipart(self) -> String {
        let mut outer = Md5::new();
        for d in &self.part_digests {
            outer.update(d);
        }
        format!("{}-{}", hex::encode(outer.finalize()), self.part_digests.len())
    }
}

/// Strip the quotes S3 puts around ETags and lowercase for comparison.
pub fn normalize(etag: &str) -> String {
    etag.trim().trim_matches('"').to_ascii_lowercase()
}
