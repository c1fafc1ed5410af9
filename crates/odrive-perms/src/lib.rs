//! odrive-perms: permission rows bound to the object key
//!
//! A row carries the object key wrapped for one grantee and a MAC over
//! `(grantee, flags, wrapped key)` under the master key. Editing any of
//! those fields without the master key makes the row inert: it is skipped
//! exactly as if it did not exist. So access can only be narrowed by
//! tampering, never widened.

pub mod access;
pub mod error;
pub mod rotate;
pub mod row;

pub use access::{authorize, check_consistent, effective_flags, grant};
pub use error::{PermError, PermResult};
pub use rotate::{rotate, rotate_row, RotationReport, RowRotation};
pub use row::{canonical_grantee, open_row, seal_row, update_flags, validating_key, verify_row};
