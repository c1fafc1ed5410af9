//! odrive-core: types shared by every odrive crate.
//!
//! Nothing in here performs I/O beyond loading the config file; the crate
//! exists so the crypto, cache, permission and object layers agree on ids,
//! flags, ranges, the error taxonomy, and the event vocabulary.

pub mod config;
pub mod error;
pub mod events;
pub mod types;

pub use error::{Classify, CoreError, CoreResult, ErrorKind, Failure};
pub use events::{Event, EventSink};
pub use types::{Acm, AcmPart, ByteRange, Flags, Identity, ObjectId, PermissionRow};
