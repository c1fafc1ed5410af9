//! Mutual-TLS client for other nodes' `GET /ciphertext/{id}`.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use odrive_cache::{CacheError, CacheResult, PeerSource};
use odrive_core::ObjectId;
use odrive_storage::BlobReader;
use tokio_util::io::StreamReader;
use tracing::debug;

use crate::error::{PeerError, PeerResult};
use crate::locator::PeerLocator;

/// PEM material identifying this node to its peers.
#[derive(Debug, Clone)]
pub struct TlsFiles<'a> {
    pub cert: &'a Path,
    pub key: &'a Path,
    pub ca: &'a Path,
}

#[derive(Clone)]
pub struct HttpsPeerClient {
    http: reqwest::Client,
    locator: PeerLocator,
}

impl HttpsPeerClient {
    /// Present `cert`/`key` to peers and trust only `ca` for their certificates.
    pub fn from_pem_files(
        tls: &TlsFiles<'_>,
        locator: PeerLocator,
        timeout: Duration,
    ) -> PeerResult<Self> {
        let read = |p: &Path| {
            std::fs::read(p).map_err(|e| PeerError::Tls(format!("reading {}: {e}", p.display())))
        };
        let mut identity_pem = read(tls.cert)?;
        identity_pem.push(b'\n');
        identity_pem.extend_from_slice(&read(tls.key)?);
        let ca_pem = read(tls.ca)?;

        let identity = reqwest::Identity::from_pem(&identity_pem)
            .map_err(|e| PeerError::Tls(format!("client identity: {e}")))?;
        let ca = reqwest::Certificate::from_pem(&ca_pem)
            .map_err(|e| PeerError::Tls(format!("service CA: {e}")))?;
        let http = reqwest::Client::builder()
            .use_rustls_tls()
            .tls_built_in_root_certs(false)
            .add_root_certificate(ca)
            .identity(identity)
            .timeout(timeout)
            .build()?;
        Ok(Self::with_client(http, locator))
    }

    /// Wrap an already configured client.
    pub fn with_client(http: reqwest::Client, locator: PeerLocator) -> Self {
        Self { http, locator }
    }

    pub fn locator(&self) -> &PeerLocator {
        &self.locator
    }

    /// Fetch the raw ciphertext of `id` from `peer` (a base URL).
    pub async fn fetch(&self, peer: &str, id: &ObjectId) -> PeerResult<(BlobReader, Option<u64>)> {
        let url = format!("{}/ciphertext/{}", peer.trim_end_matches('/'), id);
        let resp = self.http.get(&url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(PeerError::Status {
                peer: peer.to_string(),
                status: status.as_u16(),
            });
        }
        let len = resp.content_length();
        debug!(id = %id, peer, len, "peer fetch streaming");
        let body = resp.bytes_stream().map_err(std::io::Error::other);
        let reader: BlobReader = Box::pin(StreamReader::new(body));
        Ok((reader, len))
    }
}

#[async_trait]
impl PeerSource for HttpsPeerClient {
    async fn candidates(&self, id: &ObjectId) -> Vec<String> {
        match self.locator.candidates(id).await {
            Ok(peers) => peers,
            Err(e) => {
                tracing::warn!(id = %id, "peer discovery failed: {e}");
                Vec::new()
            }
        }
    }

    async fn open(&self, peer: &str, id: &ObjectId) -> CacheResult<(BlobReader, Option<u64>)> {
        self.fetch(peer, id)
            .await
            .map_err(|e| CacheError::Peer(e.to_string()))
    }
}
