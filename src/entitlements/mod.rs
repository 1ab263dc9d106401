//! Entitlement resolution: which voices, languages, quality tiers and
//! features a plan may use.

mod capability;
mod resolver;

pub use capability::{Capability, CapabilityRegistry, QualityTier};
pub use resolver::{EntitlementResolver, PlanEntitlements};

use thiserror::Error;

use crate::plans::PlanLevel;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Capability {capability} is not available on the {current} plan")]
pub struct EntitlementDenied {
    pub capability: Capability,
    /// Minimum level that unlocks the capability, if any level does.
    pub required: Option<PlanLevel>,
    pub current: PlanLevel,
}
