//! Tenant subscriptions as mirrored from the billing processor.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::plans::BillingCycle;
use crate::types::{PlanId, TenantId};

#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trialing,
    Active,
    PastDue,
    Canceled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trialing => "trialing",
            Self::Active => "active",
            Self::PastDue => "past_due",
            Self::Canceled => "canceled",
        }
    }

    /// Whether a subscription in this status still grants its plan.
    pub fn grants_plan(&self) -> bool {
        !matches!(self, Self::Canceled)
    }

    /// Map a processor status string. Statuses with no local meaning
    /// (`incomplete`, `paused`, ...) are treated as not granting a plan.
    pub fn from_external(s: &str) -> Self {
        match s {
            "trialing" => Self::Trialing,
            "active" => Self::Active,
            "past_due" | "unpaid" => Self::PastDue,
            _ => Self::Canceled,
        }
    }
}

impl FromStr for SubscriptionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trialing" => Ok(Self::Trialing),
            "active" => Ok(Self::Active),
            "past_due" => Ok(Self::PastDue),
            "canceled" => Ok(Self::Canceled),
            other => Err(format!("unknown subscription status: {}", other)),
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub plan_id: PlanId,
    pub status: SubscriptionStatus,
    pub cycle: BillingCycle,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    /// Unique per subscription.
    pub external_subscription_id: String,
    pub external_customer_id: Option<String>,
    pub cancel_at_period_end: bool,
    /// The period was assumed locally because the processor reported none.
    /// The first period the processor does report replaces it without a
    /// ledger reset.
    #[serde(default)]
    pub period_synthesized: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// A new `active` subscription over `[period_start, period_end)`.
    pub fn new(
        tenant_id: TenantId,
        plan_id: PlanId,
        external_subscription_id: impl Into<String>,
        cycle: BillingCycle,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            plan_id,
            status: SubscriptionStatus::Active,
            cycle,
            current_period_start: period_start,
            current_period_end: period_end,
            external_subscription_id: external_subscription_id.into(),
            external_customer_id: None,
            cancel_at_period_end: false,
            period_synthesized: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_status(mut self, status: SubscriptionStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_customer(mut self, customer_id: Option<String>) -> Self {
        self.external_customer_id = customer_id;
        self
    }

    pub fn grants_plan(&self) -> bool {
        self.status.grants_plan()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(SubscriptionStatus::from_external("unpaid"), SubscriptionStatus::PastDue);
        assert_eq!(
            SubscriptionStatus::from_external("incomplete_expired"),
            SubscriptionStatus::Canceled
        );
        assert!(SubscriptionStatus::PastDue.grants_plan());
        assert!(!SubscriptionStatus::Canceled.grants_plan());
        assert_eq!("past_due".parse(), Ok(SubscriptionStatus::PastDue));
    }
}
