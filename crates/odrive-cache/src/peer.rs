//! The seam through which the miss path reaches other nodes.
//!
//! The cache doesn't know about TLS or discovery; it asks a [`PeerSource`]
//! for candidates and opens them one at a time until a body streams in full.

use async_trait::async_trait;
use odrive_core::ObjectId;
use odrive_storage::BlobReader;

use crate::error::CacheResult;

#[async_trait]
pub trait PeerSource: Send + Sync {
    /// Peers to try for `id`, best first. Never includes this node.
    async fn candidates(&self, id: &ObjectId) -> Vec<String>;

    /// Open the raw ciphertext of `id` on `peer`, with its length if known.
    async fn open(&self, peer: &str, id: &ObjectId) -> CacheResult<(BlobReader, Option<u64>)>;
}
