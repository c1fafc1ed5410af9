//! odrive-storage: remote blob backends for staged ciphertext
//!
//! Two variants sit behind [`BlobBackend`]: a local filesystem tree and an
//! S3-compatible bucket reached through OpenDAL. Both map an object id to
//! `<partition>/<hex id>` and both surface [`BlobError::NotFound`] so the
//! cache can tell "fetch from a peer" apart from other failures.

pub mod backend;
pub mod error;
pub mod etag;
pub mod fs;
pub mod health;
pub mod operator;
pub mod retry;
pub mod s3;

pub use backend::{upload_file, BlobBackend, BlobReader};
pub use error::{BlobError, BlobResult};
pub use fs::FsBackend;
pub use health::{check_health, is_healthy};
pub use operator::{build_from_core_config, build_memory_operator, build_operator, StorageConfig};
pub use retry::{retry, Backoff};
pub use s3::S3Backend;
