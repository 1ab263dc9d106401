//! Plan-level entitlement checks.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;

use super::capability::{Capability, CapabilityRegistry, QualityTier};
use super::EntitlementDenied;
use crate::plans::{PlanCatalog, PlanLevel};
use crate::types::PlanId;

/// Everything a plan unlocks, for display.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PlanEntitlements {
    pub voices: BTreeSet<String>,
    pub languages: BTreeSet<String>,
    pub qualities: BTreeSet<QualityTier>,
    pub voice_cloning: bool,
}

impl PlanEntitlements {
    pub fn contains(&self, capability: &Capability) -> bool {
        match capability {
            Capability::Voice(id) => self.voices.contains(id),
            Capability::Language(code) => self.languages.contains(code),
            Capability::Quality(tier) => self.qualities.contains(tier),
            Capability::VoiceCloning => self.voice_cloning,
        }
    }
}

/// Resolves whether a plan may use a capability.
///
/// A plan at level L is entitled to every capability whose minimum level is
/// at or below L, so entitlements grow monotonically along the hierarchy.
#[derive(Clone)]
pub struct EntitlementResolver {
    catalog: Arc<PlanCatalog>,
    registry: Arc<CapabilityRegistry>,
}

impl EntitlementResolver {
    pub fn new(catalog: Arc<PlanCatalog>, registry: CapabilityRegistry) -> Self {
        Self {
            catalog,
            registry: Arc::new(registry),
        }
    }

    pub fn catalog(&self) -> &PlanCatalog {
        &self.catalog
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    /// Level of a known plan. Unknown plans resolve to the free level.
    pub fn level_of(&self, plan: &PlanId) -> PlanLevel {
        self.catalog
            .get(plan)
            .map(|p| p.level)
            .unwrap_or(PlanLevel::Free)
    }

    pub fn is_allowed(&self, plan: &PlanId, capability: &Capability) -> bool {
        match self.registry.required_level(capability) {
            Some(required) => self.level_of(plan) >= required,
            None => false,
        }
    }

    /// String-keyed form; malformed capability ids are denied.
    pub fn is_allowed_id(&self, plan: &PlanId, capability_id: &str) -> bool {
        capability_id
            .parse::<Capability>()
            .map(|c| self.is_allowed(plan, &c))
            .unwrap_or(false)
    }

    pub fn check(&self, plan: &PlanId, capability: &Capability) -> Result<(), EntitlementDenied> {
        if self.is_allowed(plan, capability) {
            return Ok(());
        }
        Err(EntitlementDenied {
            capability: capability.clone(),
            required: self.registry.required_level(capability),
            current: self.level_of(plan),
        })
    }

    pub fn entitlements_for(&self, plan: &PlanId) -> PlanEntitlements {
        let level = self.level_of(plan);
        let mut out = PlanEntitlements::default();
        for (capability, required) in self.registry.iter() {
            if required > level {
                continue;
            }
            match capability {
                Capability::Voice(id) => {
                    out.voices.insert(id.clone());
                }
                Capability::Language(code) => {
                    out.languages.insert(code.clone());
                }
                Capability::Quality(tier) => {
                    out.qualities.insert(*tier);
                }
                Capability::VoiceCloning => out.voice_cloning = true,
            }
        }
        out
    }
}

impl std::fmt::Debug for EntitlementResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntitlementResolver")
            .field("plans", &self.catalog.len())
            .field("capabilities", &self.registry.len())
            .finish()
    }
}
