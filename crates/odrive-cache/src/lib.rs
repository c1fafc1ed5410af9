//! odrive-cache: the local ciphertext partition.
//!
//! Every file in a partition is named `<hex id>.<state>`:
//!
//! ```text
//! uploading -> uploaded -> cached        (ingest, then drain)
//!                     \-> orphaned       (drain retries exhausted)
//! caching   -> cached                    (materialized on a miss)
//! ```
//!
//! `uploading` and `caching` are temporary and are deleted on startup.
//! Background drain workers push `uploaded` files to the blob backend and
//! the eviction walker removes idle `cached` files when usage passes the
//! low watermark. Readers hold leases, and the walker never removes a
//! leased file.

pub mod cache;
pub mod clock;
pub mod drain;
pub mod error;
pub mod evict;
pub mod flight;
pub mod lease;
pub mod metrics;
pub mod partition;
pub mod peer;
pub mod reporter;

pub use cache::{CacheBuilder, CacheOptions, CacheStats, CiphertextCache, IngestWriter};
pub use clock::{Clock, ManualClock, SystemClock};
pub use drain::DrainOutcome;
pub use error::{CacheError, CacheResult};
pub use evict::EvictReport;
pub use lease::CachedHandle;
pub use metrics::CacheMetrics;
pub use partition::{CacheState, Partition, PartitionEntry, RecoveryReport};
pub use peer::PeerSource;
pub use reporter::{JobKind, JobReport, JobStats, Outcome};
