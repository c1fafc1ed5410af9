//! odrive-objects: the object lifecycle on top of the ciphertext cache.
//!
//! [`ObjectService`] turns uploads into staged ciphertext plus metadata,
//! serves decrypted byte ranges, and applies every mutation behind the
//! object's change token. Metadata lives behind [`MetadataStore`]; ACM
//! evaluation behind [`AccessPolicy`]. [`Janitor`] collects ciphertext no
//! object references anymore.

pub mod error;
pub mod janitor;
pub mod model;
pub mod policy;
pub mod range;
pub mod service;
pub mod store;

pub use error::{ObjectError, ObjectResult, StoreError};
pub use janitor::{Janitor, JanitorReport};
pub use model::{GrantView, NewObject, ObjectProperties, ObjectRecord, ObjectState, PropertiesPatch};
pub use policy::{AccessPolicy, PermitAll};
pub use range::parse_range;
pub use service::{ObjectService, StreamInfo, Upload};
pub use store::{JsonMetadataStore, MetadataStore, Mutation, StoreResult, Tx};
