//! odrive-peer: read-through fallback to other live nodes.
//!
//! A node that misses both its partition and the blob store asks its peers.
//! Peers are found through a [`Discovery`] source, ranked per object id by
//! [`PeerLocator`], and fetched over mutual TLS by [`HttpsPeerClient`]. The
//! serving side is [`server::router`] behind [`server::serve_mtls`].

pub mod announce;
pub mod client;
pub mod discovery;
pub mod error;
pub mod locator;
pub mod nats;
pub mod server;

pub use announce::{Announcement, PeerStatus};
pub use client::{HttpsPeerClient, TlsFiles};
pub use discovery::{Discovery, StaticDiscovery};
pub use error::{PeerError, PeerResult};
pub use locator::PeerLocator;
pub use server::{load_server_config, router, serve_mtls};
