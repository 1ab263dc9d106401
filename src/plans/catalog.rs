//! Plan catalog: the near-static table of subscription tiers.

use std::collections::HashMap;

use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use super::plan::{BillingCycle, Plan, PlanLevel};
use super::{CatalogError, CatalogResult};
use crate::types::{PlanId, Tokens};

/// Monthly token allotment per builtin tier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenAllotments {
    pub free: Tokens,
    pub starter: Tokens,
    pub pro: Tokens,
    pub premium: Tokens,
    pub enterprise: Tokens,
}

impl Default for TokenAllotments {
    fn default() -> Self {
        Self {
            free: 25,
            starter: 100,
            pro: 250,
            premium: 500,
            enterprise: 1000,
        }
    }
}

impl TokenAllotments {
    pub fn for_level(&self, level: PlanLevel) -> Tokens {
        match level {
            PlanLevel::Free => self.free,
            PlanLevel::Starter => self.starter,
            PlanLevel::Pro => self.pro,
            PlanLevel::Premium => self.premium,
            PlanLevel::Enterprise => self.enterprise,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlanCatalog {
    plans: HashMap<PlanId, Plan>,
    by_price_ref: HashMap<String, PlanId>,
    free: PlanId,
}

impl PlanCatalog {
    pub fn builder() -> PlanCatalogBuilder {
        PlanCatalogBuilder::new()
    }

    /// Index plans that already passed [`validate`].
    fn index(plans: Vec<Plan>) -> Self {
        let mut by_price_ref = HashMap::new();
        for plan in &plans {
            for price_ref in [&plan.price_ref_monthly, &plan.price_ref_yearly]
                .into_iter()
                .flatten()
            {
                by_price_ref.insert(price_ref.clone(), plan.id.clone());
            }
        }
        Self {
            plans: plans.into_iter().map(|p| (p.id.clone(), p)).collect(),
            by_price_ref,
            free: PlanId::free(),
        }
    }

    /// Builtin five-tier catalog with the given allotments.
    pub fn builtin(allotments: TokenAllotments) -> CatalogResult<Self> {
        PlanCatalogBuilder::new()
            .with_defaults()
            .allotments(allotments)
            .build()
    }

    pub fn get(&self, id: &PlanId) -> Option<&Plan> {
        self.plans.get(id)
    }

    pub fn require(&self, id: &PlanId) -> CatalogResult<&Plan> {
        self.get(id).ok_or_else(|| CatalogError::UnknownPlan {
            id: id.to_string(),
        })
    }

    /// The default plan every tenant without a live subscription is on.
    pub fn free(&self) -> &Plan {
        // Every constructor goes through validated plans, so the free plan is present.
        &self.plans[&self.free]
    }

    /// Resolve an external billing price reference to a plan and the cycle
    /// (monthly or yearly) it bills on.
    pub fn by_price_ref(&self, price_ref: &str) -> Option<(&Plan, BillingCycle)> {
        let id = self.by_price_ref.get(price_ref)?;
        let plan = self.plans.get(id)?;
        plan.cycle_for_price(price_ref).map(|cycle| (plan, cycle))
    }

    pub fn allotment(&self, id: &PlanId) -> Option<Tokens> {
        self.get(id).map(|p| p.tokens_per_month)
    }

    /// Active plans, cheapest tier first.
    pub fn list(&self) -> Vec<&Plan> {
        let mut plans: Vec<&Plan> = self.plans.values().filter(|p| p.active).collect();
        plans.sort_by_key(|p| (p.level, p.price_monthly));
        plans
    }

    pub fn len(&self) -> usize {
        self.plans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }
}

impl Default for PlanCatalog {
    fn default() -> Self {
        Self::index(PlanCatalogBuilder::new().with_defaults().plans)
    }
}

#[derive(Debug, Default)]
pub struct PlanCatalogBuilder {
    plans: Vec<Plan>,
    allotments: Option<TokenAllotments>,
}

impl PlanCatalogBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults(mut self) -> Self {
        let allot = TokenAllotments::default();
        self.plans.extend([
            Plan::new("free", "Free", PlanLevel::Free, allot.free)
                .with_features(["Text to speech", "Speech to text", "Standard quality"]),
            Plan::new("starter", "Starter", PlanLevel::Starter, allot.starter)
                .with_prices(dec!(9.99), dec!(99.99))
                .with_price_refs("price_starter_monthly", "price_starter_yearly")
                .with_features(["High quality audio", "Extended voice library"]),
            Plan::new("pro", "Pro", PlanLevel::Pro, allot.pro)
                .with_prices(dec!(19.99), dec!(199.99))
                .with_price_refs("price_pro_monthly", "price_pro_yearly")
                .with_features(["Voice cloning", "All languages"]),
            Plan::new("premium", "Premium", PlanLevel::Premium, allot.premium)
                .with_prices(dec!(49.99), dec!(499.99))
                .with_price_refs("price_premium_monthly", "price_premium_yearly")
                .with_features(["Premium voices", "Priority processing"]),
            Plan::new("enterprise", "Enterprise", PlanLevel::Enterprise, allot.enterprise)
                .with_prices(dec!(99.99), dec!(999.99))
                .with_price_refs("price_enterprise_monthly", "price_enterprise_yearly")
                .with_features(["Custom voices", "Dedicated support"]),
        ]);
        self
    }

    /// Add or replace a plan.
    pub fn plan(mut self, plan: Plan) -> Self {
        self.plans.retain(|p| p.id != plan.id);
        self.plans.push(plan);
        self
    }

    /// Override the allotments of the builtin tiers, matched by level.
    pub fn allotments(mut self, allotments: TokenAllotments) -> Self {
        self.allotments = Some(allotments);
        self
    }

    pub fn build(self) -> CatalogResult<PlanCatalog> {
        let mut plans = self.plans;
        if let Some(allot) = &self.allotments {
            for plan in &mut plans {
                if PlanLevel::ALL
                    .iter()
                    .any(|l| l.as_str() == plan.id.as_str() && *l == plan.level)
                {
                    plan.tokens_per_month = allot.for_level(plan.level);
                }
            }
        }
        validate(&plans)?;
        Ok(PlanCatalog::index(plans))
    }
}

/// Allotments are non-zero, price references are unique and a free plan
/// sits at the free level.
fn validate(plans: &[Plan]) -> CatalogResult<()> {
    let mut owners: HashMap<&str, &PlanId> = HashMap::new();
    for plan in plans {
        if plan.tokens_per_month == 0 {
            return Err(CatalogError::Invalid {
                message: format!("plan {} has a zero token allotment", plan.id),
            });
        }
        for price_ref in [&plan.price_ref_monthly, &plan.price_ref_yearly]
            .into_iter()
            .flatten()
        {
            if let Some(existing) = owners.insert(price_ref.as_str(), &plan.id) {
                return Err(CatalogError::Invalid {
                    message: format!(
                        "price reference {} is shared by plans {} and {}",
                        price_ref, existing, plan.id
                    ),
                });
            }
        }
    }

    let free = PlanId::free();
    if !plans.iter().any(|p| p.id == free && p.level == PlanLevel::Free) {
        return Err(CatalogError::Invalid {
            message: "catalog must contain a free plan at the free level".into(),
        });
    }
    Ok(())
}
