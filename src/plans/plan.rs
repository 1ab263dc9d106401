//! Subscription tiers.

use std::str::FromStr;

use chrono::Duration;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::{PlanId, Tokens};

/// Ordered plan hierarchy. Each level includes every entitlement of the
/// levels below it.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanLevel {
    Free,
    Starter,
    Pro,
    Premium,
    Enterprise,
}

impl PlanLevel {
    pub const ALL: [PlanLevel; 5] = [
        Self::Free,
        Self::Starter,
        Self::Pro,
        Self::Premium,
        Self::Enterprise,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Starter => "starter",
            Self::Pro => "pro",
            Self::Premium => "premium",
            Self::Enterprise => "enterprise",
        }
    }

    pub fn rank(&self) -> u8 {
        *self as u8
    }
}

impl std::fmt::Display for PlanLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlanLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "free" => Ok(Self::Free),
            "starter" => Ok(Self::Starter),
            "pro" => Ok(Self::Pro),
            "premium" => Ok(Self::Premium),
            "enterprise" => Ok(Self::Enterprise),
            other => Err(format!("unknown plan level: {}", other)),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingCycle {
    #[default]
    Monthly,
    Yearly,
}

impl BillingCycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Monthly => "monthly",
            Self::Yearly => "yearly",
        }
    }

    /// Nominal period length, used only when the billing processor did not
    /// report period boundaries.
    pub fn nominal_period(&self) -> Duration {
        match self {
            Self::Monthly => Duration::days(30),
            Self::Yearly => Duration::days(365),
        }
    }
}

impl FromStr for BillingCycle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "monthly" | "month" => Ok(Self::Monthly),
            "yearly" | "year" | "annual" => Ok(Self::Yearly),
            other => Err(format!("unknown billing cycle: {}", other)),
        }
    }
}

/// A subscription tier. Looked up by identifier, never copied per tenant.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: PlanId,
    pub name: String,
    pub level: PlanLevel,
    pub tokens_per_month: Tokens,
    pub price_monthly: Decimal,
    pub price_yearly: Decimal,
    pub price_ref_monthly: Option<String>,
    pub price_ref_yearly: Option<String>,
    #[serde(default)]
    pub features: Vec<String>,
    pub active: bool,
}

impl Plan {
    pub fn new(
        id: impl Into<PlanId>,
        name: impl Into<String>,
        level: PlanLevel,
        tokens_per_month: Tokens,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            level,
            tokens_per_month,
            price_monthly: Decimal::ZERO,
            price_yearly: Decimal::ZERO,
            price_ref_monthly: None,
            price_ref_yearly: None,
            features: Vec::new(),
            active: true,
        }
    }

    pub fn with_prices(mut self, monthly: Decimal, yearly: Decimal) -> Self {
        self.price_monthly = monthly;
        self.price_yearly = yearly;
        self
    }

    pub fn with_price_refs(
        mut self,
        monthly: impl Into<String>,
        yearly: impl Into<String>,
    ) -> Self {
        self.price_ref_monthly = Some(monthly.into());
        self.price_ref_yearly = Some(yearly.into());
        self
    }

    pub fn with_features(mut self, features: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.features = features.into_iter().map(Into::into).collect();
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }

    /// Which billing cycle, if any, the external price reference belongs to.
    pub fn cycle_for_price(&self, price_ref: &str) -> Option<BillingCycle> {
        if self.price_ref_monthly.as_deref() == Some(price_ref) {
            Some(BillingCycle::Monthly)
        } else if self.price_ref_yearly.as_deref() == Some(price_ref) {
            Some(BillingCycle::Yearly)
        } else {
            None
        }
    }

    pub fn price_ref(&self, cycle: BillingCycle) -> Option<&str> {
        match cycle {
            BillingCycle::Monthly => self.price_ref_monthly.as_deref(),
            BillingCycle::Yearly => self.price_ref_yearly.as_deref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_level_ordering() {
        assert!(PlanLevel::Free < PlanLevel::Starter);
        assert!(PlanLevel::Starter < PlanLevel::Pro);
        assert!(PlanLevel::Pro < PlanLevel::Premium);
        assert!(PlanLevel::Premium < PlanLevel::Enterprise);
        assert_eq!(PlanLevel::Enterprise.rank(), 4);
    }

    #[test]
    fn test_plan_level_parse() {
        assert_eq!("Premium".parse::<PlanLevel>(), Ok(PlanLevel::Premium));
        assert!("gold".parse::<PlanLevel>().is_err());
    }

    #[test]
    fn test_cycle_for_price() {
        let plan = Plan::new("pro", "Pro", PlanLevel::Pro, 250)
            .with_price_refs("price_pro_m", "price_pro_y");

        assert_eq!(plan.cycle_for_price("price_pro_m"), Some(BillingCycle::Monthly));
        assert_eq!(plan.cycle_for_price("price_pro_y"), Some(BillingCycle::Yearly));
        assert_eq!(plan.cycle_for_price("price_other"), None);
        assert_eq!(plan.price_ref(BillingCycle::Yearly), Some("price_pro_y"));
    }

    #[test]
    fn test_nominal_period() {
        assert_eq!(BillingCycle::Monthly.nominal_period(), Duration::days(30));
        assert_eq!("annual".parse::<BillingCycle>(), Ok(BillingCycle::Yearly));
    }
}
