use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{CoreError, CoreResult};

const MIB: u64 = 1024 * 1024;

/// Top-level daemon configuration (loaded from odrive.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OdriveConfig {
    pub daemon: DaemonConfig,
    pub cache: CacheConfig,
    pub blob: BlobConfig,
    pub drain: DrainConfig,
    pub keys: KeysConfig,
    pub peers: PeersConfig,
    pub objects: ObjectsConfig,
}

impl OdriveConfig {
    /// Load from a TOML file; a missing file yields defaults.
    pub fn load(path: &Path) -> CoreResult<Self> {
        if !path.exists() {
            tracing::warn!(path = %path.display(), "config file not found (using defaults)");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: OdriveConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make the cache or drain misbehave.
    pub fn validate(&self) -> CoreResult<()> {
        let c = &self.cache;
        if !(0.0 < c.low_watermark && c.low_watermark < c.high_watermark && c.high_watermark <= 1.0)
        {
            return Err(CoreError::Config(format!(
                "watermarks must satisfy 0 < low ({}) < high ({}) <= 1",
                c.low_watermark, c.high_watermark
            )));
        }
        if c.partition.is_empty() || c.partition.contains('/') {
            return Err(CoreError::Config(format!(
                "cache.partition must be a single path component, got {:?}",
                c.partition
            )));
        }
        if self.blob.prefix.is_empty() || self.blob.prefix.contains('/') {
            return Err(CoreError::Config(format!(
                "blob.prefix must be a single path component, got {:?}",
                self.blob.prefix
            )));
        }
        if c.drain_workers == 0 || c.drain_queue == 0 {
            return Err(CoreError::Config(
                "cache.drain_workers and cache.drain_queue must be positive".into(),
            ));
        }
        if self.blob.part_size_mb < 5 && self.blob.backend == BlobBackendKind::S3 {
            return Err(CoreError::Config(
                "blob.part_size_mb must be at least 5 for S3 multipart uploads".into(),
            ));
        }
        if self.drain.max_attempts == 0 {
            return Err(CoreError::Config("drain.max_attempts must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Node name used in events and logs (defaults to hostname-ish peer address)
    pub node_id: Option<String>,
    /// Prometheus metrics + health endpoint (default: 127.0.0.1:9100)
    pub metrics_addr: Option<String>,
    /// Log level (default: info)
    pub log_level: String,
    /// Log format: "json" or "text"
    pub log_format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Parent directory containing partitions
    pub root: PathBuf,
    /// Partition name; must be unique per instance
    pub partition: String,
    #[serde(alias = "lowWatermark")]
    pub low_watermark: f64,
    #[serde(alias = "highWatermark")]
    pub high_watermark: f64,
    /// Minimum idle time before a cached file may be evicted
    pub evict_age_secs: u64,
    /// Eviction walker cadence
    pub walk_sleep_secs: u64,
    /// Partition capacity the watermarks are measured against
    pub max_mb: u64,
    /// Drain worker pool size
    pub drain_workers: usize,
    /// Drain queue bound; enqueue blocks when full
    pub drain_queue: usize,
}

impl CacheConfig {
    pub fn partition_dir(&self) -> PathBuf {
        self.root.join(&self.partition)
    }

    pub fn evict_age(&self) -> Duration {
        Duration::from_secs(self.evict_age_secs)
    }

    pub fn walk_sleep(&self) -> Duration {
        Duration::from_secs(self.walk_sleep_secs)
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.max_mb.saturating_mul(MIB)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlobBackendKind {
    S3,
    Fs,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BlobConfig {
    pub backend: BlobBackendKind,
    /// S3-compatible endpoint
    pub endpoint: String,
    pub bucket: String,
    pub region: String,
    /// Key prefix for ciphertext; shared by every node of the cluster
    pub prefix: String,
    /// Static credentials; when unset, AWS_ACCESS_KEY_ID / AWS_SECRET_ACCESS_KEY are used
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    /// Refuse plaintext HTTP endpoints
    pub enforce_tls: bool,
    /// Root directory for the filesystem backend
    pub root: PathBuf,
    /// Objects above this size go through multipart upload
    pub multipart_threshold_mb: u64,
    pub part_size_mb: u64,
    /// Parallel part uploads
    pub concurrency: usize,
    /// Per-part retry attempts
    pub retries: usize,
    /// Per-attempt deadline for small operations
    pub op_timeout_secs: u64,
    /// Per-attempt deadline for streaming reads and writes
    pub stream_timeout_secs: u64,
}

impl BlobConfig {
    pub fn multipart_threshold(&self) -> u64 {
        self.multipart_threshold_mb.saturating_mul(MIB)
    }

    pub fn part_size(&self) -> u64 {
        self.part_size_mb.saturating_mul(MIB)
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_secs(self.op_timeout_secs)
    }

    pub fn stream_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_timeout_secs)
    }
}

/// Drain retry policy: exponential backoff with jitter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DrainConfig {
    pub initial_backoff_ms: u64,
    pub factor: u32,
    pub max_backoff_secs: u64,
    pub max_attempts: u32,
}

impl DrainConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KeysConfig {
    /// Hex-encoded 256-bit master key (prefer master_key_file or ODRIVE_MASTER_KEY)
    pub master_key_hex: Option<String>,
    /// File containing the hex master key
    pub master_key_file: Option<PathBuf>,
    /// Previous master key, accepted while a rotation is in progress
    pub previous_master_key_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeersConfig {
    /// Announcement path for this service
    pub announce_path: String,
    /// host:port other peers use to reach this node
    pub self_address: Option<String>,
    /// Listen address for the peer ciphertext endpoint
    pub listen: Option<String>,
    /// Statically configured peers (host:port)
    pub peers: Vec<String>,
    /// NATS server for announcements (feature `nats`)
    pub nats_url: Option<String>,
    /// Service identity certificate (PEM)
    pub cert: Option<PathBuf>,
    /// Service identity private key (PEM)
    pub key: Option<PathBuf>,
    /// Service trust root (PEM)
    pub ca: Option<PathBuf>,
    pub fetch_timeout_secs: u64,
}

impl PeersConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectsConfig {
    /// JSON metadata store path (in-memory when unset)
    pub metadata_path: Option<PathBuf>,
    /// Ciphertext with no metadata is deleted after this grace window
    pub orphan_grace_secs: u64,
    /// Janitor cadence
    pub janitor_interval_secs: u64,
}

impl ObjectsConfig {
    pub fn orphan_grace(&self) -> Duration {
        Duration::from_secs(self.orphan_grace_secs)
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            metrics_addr: Some("127.0.0.1:9100".into()),
            log_level: "info".into(),
            log_format: "json".into(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            partition: "cache".into(),
            low_watermark: 0.50,
            high_watermark: 0.75,
            evict_age_secs: 300,
            walk_sleep_secs: 30,
            max_mb: 10240,
            drain_workers: 4,
            drain_queue: 1024,
        }
    }
}

impl Default for BlobConfig {
    fn default() -> Self {
        Self {
            backend: BlobBackendKind::S3,
            endpoint: "http://localhost:9000".into(),
            bucket: "odrive".into(),
            region: "us-east-1".into(),
            prefix: "objects".into(),
            access_key_id: None,
            secret_access_key: None,
            enforce_tls: false,
            root: PathBuf::from("./blobs"),
            multipart_threshold_mb: 16,
            part_size_mb: 10,
            concurrency: 5,
            retries: 10,
            op_timeout_secs: 30,
            stream_timeout_secs: 600,
        }
    }
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 1000,
            factor: 2,
            max_backoff_secs: 60,
            max_attempts: 10,
        }
    }
}

impl Default for PeersConfig {
    fn default() -> Self {
        Self {
            announce_path: "/services/odrive".into(),
            self_address: None,
            listen: None,
            peers: Vec::new(),
            nats_url: None,
            cert: None,
            key: None,
            ca: None,
            fetch_timeout_secs: 60,
        }
    }
}

impl Default for ObjectsConfig {
    fn default() -> Self {
        Self {
            metadata_path: None,
            orphan_grace_secs: 3600,
            janitor_interval_secs: 600,
        }
    }
}
