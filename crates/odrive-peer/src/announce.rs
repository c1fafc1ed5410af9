//! Announcement records: what each live instance publishes about itself.

use serde::{Deserialize, Serialize};

use crate::error::{PeerError, PeerResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerStatus {
    Alive,
    Draining,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    pub node: String,
    pub host: String,
    pub port: u16,
    pub status: PeerStatus,
}

impl Announcement {
    pub fn alive(node: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            node: node.into(),
            host: host.into(),
            port,
            status: PeerStatus::Alive,
        }
    }

    /// Parse `host:port` or `https://host:port[/]`.
    pub fn from_address(node: impl Into<String>, address: &str) -> PeerResult<Self> {
        let rest = address
            .trim()
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .trim_end_matches('/');
        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| PeerError::Address(address.to_string()))?;
        let port = port
            .parse()
            .map_err(|_| PeerError::Address(address.to_string()))?;
        if host.is_empty() {
            return Err(PeerError::Address(address.to_string()));
        }
        Ok(Self::alive(node, host, port))
    }

    pub fn is_alive(&self) -> bool {
        self.status == PeerStatus::Alive
    }

    /// Base URL the peer endpoint is reached at.
    pub fn base_url(&self) -> String {
        format!("https://{}:{}", self.host, self.port)
    }

    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(data: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(data)
    }
}
