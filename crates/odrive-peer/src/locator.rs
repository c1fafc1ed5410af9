//! Ranked peer list for one object id.
//!
//! Ranking is rendezvous hashing: each peer scores
//! `SHA-256(id || address)` and the highest score goes first. Every node
//! computes the same order for the same id, and ids spread evenly over peers.

use std::sync::Arc;

use odrive_core::ObjectId;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::announce::Announcement;
use crate::discovery::Discovery;
use crate::error::PeerResult;

#[derive(Clone)]
pub struct PeerLocator {
    discovery: Arc<dyn Discovery>,
    self_addr: Option<(String, u16)>,
    scheme: &'static str,
}

impl PeerLocator {
    /// `self_address` (`host:port`) is excluded from every result.
    pub fn new(discovery: Arc<dyn Discovery>, self_address: Option<&str>) -> PeerResult<Self> {
        let self_addr = self_address
            .map(|a| Announcement::from_address("self", a).map(|a| (a.host, a.port)))
            .transpose()?;
        Ok(Self {
            discovery,
            self_addr,
            scheme: "https",
        })
    }

    /// Use `scheme` in returned base URLs. Only plain-HTTP test rigs need this.
    pub fn with_scheme(mut self, scheme: &'static str) -> Self {
        self.scheme = scheme;
        self
    }

    fn is_self(&self, a: &Announcement) -> bool {
        self.self_addr
            .as_ref()
            .is_some_and(|(host, port)| a.host.eq_ignore_ascii_case(host) && a.port == *port)
    }

    /// Live peers other than this node, as base URLs, best first.
    pub async fn candidates(&self, id: &ObjectId) -> PeerResult<Vec<String>> {
        let announcements = self.discovery.announcements().await?;
        let mut ranked: Vec<(u64, String)> = announcements
            .iter()
            .filter(|a| a.is_alive() && !self.is_self(a))
            .map(|a| {
                let url = format!("{}://{}:{}", self.scheme, a.host, a.port);
                (score(id, &url), url)
            })
            .collect();
        ranked.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        ranked.dedup_by(|a, b| a.1 == b.1);
        debug!(id = %id, peers = ranked.len(), "peer candidates");
        Ok(ranked.into_iter().map(|(_, url)| url).collect())
    }
}

fn score(id: &ObjectId, address: &str) -> u64 {
    let digest = Sha256::new()
        .chain_update(id.as_bytes())
        .chain_update(address.as_bytes())
        .finalize();
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(head)
}
