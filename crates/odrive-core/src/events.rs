//! Abstract events emitted by the cache and the object pipeline.
//!
//! Publication to a message bus is an external concern; components only see
//! an [`EventSink`]. The daemon chooses the sink (log, NATS, fan-out).

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::types::ObjectId;

/// Where a cache miss was satisfied from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchSource {
    Blob,
    Peer,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    ObjectCreated {
        object_id: ObjectId,
        owner: String,
        size: u64,
        timestamp: u64,
    },
    ObjectUpdated {
        object_id: ObjectId,
        change_token: String,
        timestamp: u64,
    },
    ObjectTrashed {
        object_id: ObjectId,
        timestamp: u64,
    },
    ObjectExpunged {
        object_id: ObjectId,
        timestamp: u64,
    },
    /// A staged ciphertext reached the blob backend.
    Drained {
        object_id: ObjectId,
        bytes: u64,
        attempts: u32,
        timestamp: u64,
    },
    /// Drain gave up; the file was parked as `.orphaned`. Needs an operator.
    Orphaned {
        object_id: ObjectId,
        attempts: u32,
        reason: String,
        timestamp: u64,
    },
    Evicted {
        object_id: ObjectId,
        bytes: u64,
        timestamp: u64,
    },
    Materialized {
        object_id: ObjectId,
        source: FetchSource,
        bytes: u64,
        timestamp: u64,
    },
}

impl Event {
    pub fn object_id(&self) -> ObjectId {
        match self {
            Event::ObjectCreated { object_id, .. }
            | Event::ObjectUpdated { object_id, .. }
            | Event::ObjectTrashed { object_id, .. }
            | Event::ObjectExpunged { object_id, .. }
            | Event::Drained { object_id, .. }
            | Event::Orphaned { object_id, .. }
            | Event::Evicted { object_id, .. }
            | Event::Materialized { object_id, .. } => *object_id,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Event::ObjectCreated { .. } => "object_created",
            Event::ObjectUpdated { .. } => "object_updated",
            Event::ObjectTrashed { .. } => "object_trashed",
            Event::ObjectExpunged { .. } => "object_expunged",
            Event::Drained { .. } => "drained",
            Event::Orphaned { .. } => "orphaned",
            Event::Evicted { .. } => "evicted",
            Event::Materialized { .. } => "materialized",
        }
    }

    /// Whether an operator should be paged for this event.
    pub fn is_alert(&self) -> bool {
        matches!(self, Event::Orphaned { .. })
    }

    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(data: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(data)
    }

    /// Current unix timestamp in seconds.
    pub fn now() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }
}

/// Receives events. Implementations must not block the caller.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

/// Writes events to the tracing log. Alerts go out at `warn`.
#[derive(Debug, Default, Clone)]
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: Event) {
        let id = event.object_id();
        if event.is_alert() {
            warn!(object_id = %id, event = event.event_type(), detail = ?event, "alert");
        } else {
            info!(object_id = %id, event = event.event_type(), "event");
        }
    }
}

/// Forwards events into an unbounded channel. Used by tests and by sinks
/// that publish from their own task.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Event>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ChannelSink { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: Event) {
        // A dropped receiver means nobody is listening anymore.
        let _ = self.tx.send(event);
    }
}

/// Sends each event to every inner sink.
#[derive(Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        FanoutSink { sinks }
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: Event) {
        for sink in &self.sinks {
            sink.emit(event.clone());
        }
    }
}
