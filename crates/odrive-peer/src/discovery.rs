//! Where announcements come from.

use async_trait::async_trait;

use crate::announce::Announcement;
use crate::error::PeerResult;

#[async_trait]
pub trait Discovery: Send + Sync {
    /// Every current announcement, live or not.
    async fn announcements(&self) -> PeerResult<Vec<Announcement>>;
}

/// A fixed peer list from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    peers: Vec<Announcement>,
}

impl StaticDiscovery {
    pub fn new(peers: Vec<Announcement>) -> Self {
        Self { peers }
    }

    /// Build from `host:port` / `https://host:port` strings. Node names are
    /// the addresses themselves.
    pub fn from_addresses<I, S>(addresses: I) -> PeerResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let peers = addresses
            .into_iter()
            .map(|a| Announcement::from_address(a.as_ref(), a.as_ref()))
            .collect::<PeerResult<Vec<_>>>()?;
        Ok(Self { peers })
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn announcements(&self) -> PeerResult<Vec<Announcement>> {
        Ok(self.peers.clone())
    }
}
