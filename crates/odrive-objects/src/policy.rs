//! The ACM decision point. Evaluation lives outside odrive; this is the seam.

use odrive_core::{Acm, Identity};

pub trait AccessPolicy: Send + Sync {
    /// Whether `identity` may see objects marked with `acm`.
    fn permits(&self, identity: &Identity, acm: &Acm) -> bool;
}

/// Accepts every marking. For deployments that evaluate ACMs upstream.
#[derive(Debug, Default, Clone, Copy)]
pub struct PermitAll;

impl AccessPolicy for PermitAll {
    fn permits(&self, _identity: &Identity, _acm: &Acm) -> bool {
        true
    }
}
