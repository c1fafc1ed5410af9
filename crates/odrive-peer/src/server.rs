//! Peer endpoint: `GET /ciphertext/{id}` over mutual TLS.
//!
//! Only serves what is already on local disk (`cached`, `uploaded`, or
//! `orphaned`); a peer request never triggers a miss path of its own, so
//! two nodes missing the same id cannot bounce requests between each other.

use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::{Path as UrlPath, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use odrive_cache::CiphertextCache;
use odrive_core::ObjectId;
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::TlsFiles;

pub fn router(cache: CiphertextCache) -> Router {
    Router::new()
        .route("/ciphertext/{id}", get(ciphertext_handler))
        .with_state(cache)
}

async fn ciphertext_handler(
    State(cache): State<CiphertextCache>,
    UrlPath(id): UrlPath<String>,
) -> Response {
    let Ok(id) = id.parse::<ObjectId>() else {
        return (StatusCode::BAD_REQUEST, "invalid id").into_response();
    };
    match cache.open_local(&id).await {
        Ok(Some(handle)) => {
            let len = handle.size();
            debug!(id = %id, len, state = %handle.state(), "serving ciphertext to peer");
            (
                StatusCode::OK,
                [
                    (header::CONTENT_TYPE, "application/octet-stream".to_string()),
                    (header::CONTENT_LENGTH, len.to_string()),
                ],
                Body::from_stream(ReaderStream::new(handle)),
            )
                .into_response()
        }
        Ok(None) => (StatusCode::NOT_FOUND, "not found").into_response(),
        Err(e) => {
            warn!(id = %id, "peer read failed: {e}");
            (StatusCode::SERVICE_UNAVAILABLE, "unavailable").into_response()
        }
    }
}

/// Server config that requires a client certificate chaining to `ca`.
pub fn load_server_config(tls: &TlsFiles<'_>) -> Result<Arc<ServerConfig>> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let certs = read_certs(tls.cert)?;
    let key = {
        let mut rd = BufReader::new(
            std::fs::File::open(tls.key).with_context(|| format!("opening {}", tls.key.display()))?,
        );
        rustls_pemfile::private_key(&mut rd)
            .with_context(|| format!("parsing {}", tls.key.display()))?
            .with_context(|| format!("no private key in {}", tls.key.display()))?
    };

    let mut roots = RootCertStore::empty();
    for ca in read_certs(tls.ca)? {
        roots.add(ca).context("adding service CA")?;
    }
    let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone())
        .build()
        .context("building client verifier")?;

    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .context("TLS protocol versions")?
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .context("server certificate")?;
    Ok(Arc::new(config))
}

fn read_certs(path: &Path) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let mut rd = BufReader::new(
        std::fs::File::open(path).with_context(|| format!("opening {}", path.display()))?,
    );
    let certs = rustls_pemfile::certs(&mut rd)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("parsing {}", path.display()))?;
    if certs.is_empty() {
        anyhow::bail!("no certificates in {}", path.display());
    }
    Ok(certs)
}

/// Accept TLS connections on `listener` and serve `app` until `cancel`.
///
/// Handshake failures (including callers without a valid client
/// certificate) are logged and dropped.
pub async fn serve_mtls(
    listener: TcpListener,
    tls: Arc<ServerConfig>,
    app: Router,
    cancel: CancellationToken,
) -> Result<()> {
    let acceptor = TlsAcceptor::from(tls);
    info!(addr = ?listener.local_addr().ok(), "peer endpoint listening");
    loop {
        let (tcp, remote) = tokio::select! {
            r = listener.accept() => r.context("accepting peer connection")?,
            _ = cancel.cancelled() => break,
        };
        let acceptor = acceptor.clone();
        let app = app.clone();
        tokio::spawn(async move {
            let stream = match acceptor.accept(tcp).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(%remote, "peer TLS handshake rejected: {e}");
                    return;
                }
            };
            let service = TowerToHyperService::new(app);
            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                debug!(%remote, "peer connection ended: {e}");
            }
        });
    }
    info!("peer endpoint stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use odrive_cache::{CacheBuilder, CacheOptions};
    use odrive_core::config::{BlobConfig, CacheConfig, DrainConfig};
    use odrive_storage::FsBackend;
    use tokio::io::AsyncWriteExt;
    use tower::ServiceExt;

    async fn cache(tmp: &tempfile::TempDir) -> CiphertextCache {
        let cfg = CacheConfig {
            root: tmp.path().to_path_buf(),
            ..Default::default()
        };
        CacheBuilder::new(
            CacheOptions::new(cfg, BlobConfig::default(), DrainConfig::default()),
            Arc::new(FsBackend::new(tmp.path().join("blobs"), "cache")),
        )
        .open()
        .await
        .unwrap()
    }

    async fn get(app: Router, uri: &str) -> Response {
        app.oneshot(
            axum::http::Request::builder()
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn serves_local_ciphertext_with_length() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = cache(&tmp).await;
        let id = ObjectId::random();
        let mut w = cache.begin_ingest(id).await.unwrap();
        w.write_all(b"raw ciphertext").await.unwrap();
        w.finalize().await.unwrap();

        let resp = get(router(cache), &format!("/ciphertext/{id}")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_LENGTH], "14");
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"raw ciphertext");
    }

    #[tokio::test]
    async fn missing_and_malformed_ids() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = cache(&tmp).await;
        let app = router(cache);
        let resp = get(app.clone(), &format!("/ciphertext/{}", ObjectId::random())).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let resp = get(app, "/ciphertext/not-an-id").await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn missing_tls_files_are_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let p = tmp.path().join("absent.pem");
        let err = load_server_config(&TlsFiles {
            cert: &p,
            key: &p,
            ca: &p,
        })
        .unwrap_err();
        assert!(err.to_string().contains("absent.pem"));
    }
}
