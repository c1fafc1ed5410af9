//! NATS JetStream announcements and event publication.
//!
//! Provides:
//! - `NatsDiscovery`: a KV bucket per announce path; each live node keeps
//!   its own key fresh, and the bucket's max-age drops nodes that stop
//! - `NatsEventSink`: publishes core events on `ODRIVE.{node}.{event_type}`
//!
//! Requires feature `nats` (async-nats optional dep).

#[cfg(feature = "nats")]
pub use inner::*;

#[cfg(feature = "nats")]
mod inner {
    use std::time::Duration;

    use anyhow::Result;
    use async_nats::jetstream::{self, kv, stream};
    use async_trait::async_trait;
    use futures::StreamExt;
    use odrive_core::{Event, EventSink};
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;
    use tokio_util::sync::CancellationToken;
    use tracing::{debug, info, warn};

    use crate::announce::{Announcement, PeerStatus};
    use crate::discovery::Discovery;
    use crate::error::{PeerError, PeerResult};

    // ── Names ─────────────────────────────────────────────────────────────────

    pub const STREAM_EVENTS: &str = "ODRIVE_EVENTS";
    pub const DEFAULT_ANNOUNCE_TTL: Duration = Duration::from_secs(30);

    /// KV bucket name for an announce path: `/services/odrive` → `ANNOUNCE_services_odrive`.
    pub fn bucket_name(announce_path: &str) -> String {
        let body: String = announce_path
            .trim_matches('/')
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        format!("ANNOUNCE_{body}")
    }

    /// KV keys allow `[-/_=.a-zA-Z0-9]`; anything else becomes `_`.
    pub fn node_key(node: &str) -> String {
        node.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || "-_=.".contains(c) {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }

    pub async fn connect(url: &str) -> Result<jetstream::Context> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| anyhow::anyhow!("connecting to NATS at {url}: {e}"))?;
        info!("NATS: connected to {url}");
        Ok(jetstream::new(client))
    }

    // ── Discovery ─────────────────────────────────────────────────────────────

    #[derive(Clone)]
    pub struct NatsDiscovery {
        store: kv::Store,
        ttl: Duration,
    }

    impl NatsDiscovery {
        /// Open (creating if needed) the bucket for `announce_path`.
        pub async fn open(js: &jetstream::Context, announce_path: &str, ttl: Duration) -> Result<Self> {
            let bucket = bucket_name(announce_path);
            let store = match js.get_key_value(&bucket).await {
                Ok(store) => store,
                Err(_) => js
                    .create_key_value(kv::Config {
                        bucket: bucket.clone(),
                        history: 1,
                        max_age: ttl,
                        ..Default::default()
                    })
                    .await
                    .map_err(|e| anyhow::anyhow!("creating KV bucket {bucket}: {e}"))?,
            };
            debug!(bucket, "NATS: announcement bucket ready");
            Ok(Self { store, ttl })
        }

        /// Write (or refresh) this node's announcement.
        pub async fn announce(&self, a: &Announcement) -> Result<()> {
            let payload = a
                .to_bytes()
                .map_err(|e| anyhow::anyhow!("serializing announcement: {e}"))?;
            self.store
                .put(node_key(&a.node), payload.into())
                .await
                .map_err(|e| anyhow::anyhow!("writing announcement for {}: {e}", a.node))?;
            Ok(())
        }

        /// Re-announce at a third of the TTL until `cancel`, then publish
        /// `draining` so peers stop picking this node before the key expires.
        pub fn spawn_heartbeat(&self, me: Announcement, cancel: CancellationToken) -> JoinHandle<()> {
            let this = self.clone();
            let period = (this.ttl / 3).max(Duration::from_secs(1));
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(period);
                loop {
                    tokio::select! {
                        _ = tick.tick() => {
                            if let Err(e) = this.announce(&me).await {
                                warn!("NATS: heartbeat failed: {e}");
                            }
                        }
                        _ = cancel.cancelled() => break,
                    }
                }
                let leaving = Announcement {
                    status: PeerStatus::Draining,
                    ..me
                };
                if let Err(e) = this.announce(&leaving).await {
                    warn!("NATS: draining announcement failed: {e}");
                }
                info!(node = %leaving.node, "NATS: announcement withdrawn");
            })
        }
    }

    #[async_trait]
    impl Discovery for NatsDiscovery {
        async fn announcements(&self) -> PeerResult<Vec<Announcement>> {
            let mut keys = self
                .store
                .keys()
                .await
                .map_err(|e| PeerError::Discovery(format!("listing announcements: {e}")))?;
            let mut out = Vec::new();
            while let Some(key) = keys.next().await {
                let key = key.map_err(|e| PeerError::Discovery(format!("reading key: {e}")))?;
                let Some(value) = self
                    .store
                    .get(&key)
                    .await
                    .map_err(|e| PeerError::Discovery(format!("reading {key}: {e}")))?
                else {
                    continue;
                };
                match Announcement::from_bytes(&value) {
                    Ok(a) => out.push(a),
                    Err(e) => warn!(key, "NATS: skipping malformed announcement: {e}"),
                }
            }
            Ok(out)
        }
    }

    // ── Event sink ────────────────────────────────────────────────────────────

    /// Queues events and publishes them from a background task, so `emit`
    /// never waits on the network.
    pub struct NatsEventSink {
        tx: mpsc::UnboundedSender<Event>,
    }

    impl NatsEventSink {
        pub fn subject(node: &str, event: &Event) -> String {
            format!("ODRIVE.{}.{}", node_key(node), event.event_type())
        }

        /// Ensure the event stream exists and start the publisher.
        pub async fn start(js: jetstream::Context, node: String) -> Result<(Self, JoinHandle<()>)> {
            js.get_or_create_stream(stream::Config {
                name: STREAM_EVENTS.to_string(),
                subjects: vec!["ODRIVE.>".to_string()],
                max_messages: 500_000,
                max_age: Duration::from_secs(7 * 24 * 3600),
                retention: stream::RetentionPolicy::Limits,
                storage: stream::StorageType::File,
                ..Default::default()
            })
            .await
            .map_err(|e| anyhow::anyhow!("ensuring {STREAM_EVENTS} stream: {e}"))?;

            let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
            let handle = tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    let subject = Self::subject(&node, &event);
                    let payload = match event.to_bytes() {
                        Ok(p) => p,
                        Err(e) => {
                            warn!("NATS: serializing event: {e}");
                            continue;
                        }
                    };
                    let ack = match js.publish(subject.clone(), payload.into()).await {
                        Ok(ack) => ack,
                        Err(e) => {
                            warn!(subject, "NATS: publishing event: {e}");
                            continue;
                        }
                    };
                    if let Err(e) = ack.await {
                        warn!(subject, "NATS: awaiting event ack: {e}");
                    }
                }
                debug!("NATS: event publisher stopped");
            });
            Ok((Self { tx }, handle))
        }
    }

    impl EventSink for NatsEventSink {
        fn emit(&self, event: Event) {
            if self.tx.send(event).is_err() {
                warn!("NATS: event publisher gone, dropping event");
            }
        }
    }

}
