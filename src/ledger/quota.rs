//! Quota ledger service.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use super::LedgerEntry;
use crate::plans::{Plan, PlanCatalog};
use crate::store::{
    ConsumeOutcome, ConsumeRequest, RefundRequest, RetryPolicy, Store, StoreResult, with_retry,
};
use crate::types::{OperationClass, SharedClock, TenantId, Tokens};
use crate::usage::UsageRecord;

pub const DEFAULT_RESET_PERIOD_DAYS: i64 = 30;

/// Per-tenant, per-operation-class token counters with lazy creation and
/// lazy reset of expired rows.
#[derive(Clone)]
pub struct QuotaLedger {
    store: Arc<dyn Store>,
    catalog: Arc<PlanCatalog>,
    clock: SharedClock,
    reset_period: Duration,
}

impl QuotaLedger {
    pub fn new(store: Arc<dyn Store>, catalog: Arc<PlanCatalog>, clock: SharedClock) -> Self {
        Self {
            store,
            catalog,
            clock,
            reset_period: Duration::days(DEFAULT_RESET_PERIOD_DAYS),
        }
    }

    pub fn with_reset_period(mut self, period: Duration) -> Self {
        self.reset_period = period;
        self
    }

    pub fn reset_period(&self) -> Duration {
        self.reset_period
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn next_reset(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + self.reset_period
    }

    /// Reset date a ledger reset performed now would carry.
    pub fn next_reset_date(&self) -> DateTime<Utc> {
        self.next_reset(self.now())
    }

    /// The plan currently granted to the tenant: that of its live
    /// subscription, else the free plan.
    pub async fn current_plan(&self, tenant: &TenantId) -> StoreResult<Plan> {
        let Some(subscription) = self.store.current_subscription(tenant).await? else {
            return Ok(self.catalog.free().clone());
        };
        match self.catalog.get(&subscription.plan_id) {
            Some(plan) => Ok(plan.clone()),
            None => {
                warn!(
                    tenant_id = %tenant,
                    plan_id = %subscription.plan_id,
                    "Subscription references a plan missing from the catalog; using free plan"
                );
                Ok(self.catalog.free().clone())
            }
        }
    }

    /// Current row for (tenant, operation), created or reset to the tenant's
    /// plan allotment if missing or expired.
    pub async fn get(&self, tenant: &TenantId, operation: OperationClass) -> StoreResult<LedgerEntry> {
        let plan = self.current_plan(tenant).await?;
        let now = self.now();
        self.store
            .ensure_entry(tenant, operation, plan.tokens_per_month, self.next_reset(now), now)
            .await
    }

    /// All three rows for the tenant.
    pub async fn snapshot(&self, tenant: &TenantId) -> StoreResult<Vec<LedgerEntry>> {
        let plan = self.current_plan(tenant).await?;
        let now = self.now();
        let mut entries = Vec::with_capacity(OperationClass::ALL.len());
        for operation in OperationClass::ALL {
            entries.push(
                self.store
                    .ensure_entry(tenant, operation, plan.tokens_per_month, self.next_reset(now), now)
                    .await?,
            );
        }
        Ok(entries)
    }

    /// Atomic conditional decrement. `usage` is appended only on success.
    pub async fn decrement(
        &self,
        tenant: &TenantId,
        operation: OperationClass,
        cost: Tokens,
        allotment: Tokens,
        usage: UsageRecord,
    ) -> StoreResult<ConsumeOutcome> {
        let now = self.now();
        let outcome = self
            .store
            .try_consume(ConsumeRequest {
                tenant_id: tenant.clone(),
                operation,
                cost,
                allotment,
                next_reset: self.next_reset(now),
                now,
                usage,
            })
            .await?;
        if let ConsumeOutcome::Granted { entry } = &outcome {
            debug!(
                tenant_id = %tenant,
                operation = %operation,
                cost,
                remaining = entry.tokens_remaining,
                "Tokens consumed"
            );
        }
        Ok(outcome)
    }

    /// Refund path. Credits the row only while it is still in `cycle`.
    pub async fn increment(
        &self,
        tenant: &TenantId,
        operation: OperationClass,
        amount: Tokens,
        cycle: DateTime<Utc>,
        usage_id: crate::types::UsageId,
    ) -> StoreResult<bool> {
        let credited = self
            .store
            .refund(RefundRequest {
                tenant_id: tenant.clone(),
                operation,
                amount,
                cycle,
                usage_id,
                now: self.now(),
            })
            .await?;
        if !credited {
            info!(
                tenant_id = %tenant,
                operation = %operation,
                amount,
                "Refund skipped: ledger was reset since the reservation"
            );
        }
        Ok(credited)
    }

    /// Set every row of the tenant to `{used: 0, remaining: allotment}` with
    /// a fresh reset date. Not additive: repeating it yields the same state.
    pub async fn reset_all(&self, tenant: &TenantId, allotment: Tokens) -> StoreResult<Vec<LedgerEntry>> {
        let reset_date = self.next_reset_date();
        let entries = with_retry(RetryPolicy::default(), || {
            self.store.reset_all(tenant, allotment, reset_date)
        })
        .await?;
        info!(tenant_id = %tenant, allotment, %reset_date, "Quota reset");
        Ok(entries)
    }
}

impl std::fmt::Debug for QuotaLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaLedger")
            .field("store", &self.store.name())
            .field("reset_period", &self.reset_period)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::{Subscription, SubscriptionStatus};
    use crate::store::MemoryStore;
    use crate::store::SubscriptionRepository;
    use crate::types::{Clock, ManualClock};

    fn ledger() -> (QuotaLedger, Arc<MemoryStore>, ManualClock) {
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::new(Utc::now());
        let ledger = QuotaLedger::new(
            store.clone(),
            Arc::new(PlanCatalog::default()),
            Arc::new(clock.clone()),
        );
        (ledger, store, clock)
    }

    fn usage(tenant: &TenantId) -> UsageRecord {
        UsageRecord::new(tenant.clone(), OperationClass::Tts, 1, "hello", Utc::now())
    }

    #[tokio::test]
    async fn test_get_lazily_creates_with_free_allotment() {
        let (ledger, _, _) = ledger();
        let tenant = TenantId::from("t1");

        let entry = ledger.get(&tenant, OperationClass::Stt).await.unwrap();
        assert_eq!((entry.tokens_used, entry.tokens_remaining), (0, 25));
        assert_eq!(ledger.snapshot(&tenant).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_current_plan_follows_live_subscription() {
        let (ledger, store, clock) = ledger();
        let tenant = TenantId::from("t1");
        let now = clock.now();
        store
            .save_subscription(&Subscription {
                id: uuid::Uuid::new_v4(),
                tenant_id: tenant.clone(),
                plan_id: "pro".into(),
                status: SubscriptionStatus::PastDue,
                cycle: Default::default(),
                current_period_start: now,
                current_period_end: now + Duration::days(30),
                external_subscription_id: "sub_1".into(),
                external_customer_id: None,
                cancel_at_period_end: false,
                period_synthesized: false,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();

        assert_eq!(ledger.current_plan(&tenant).await.unwrap().id.as_str(), "pro");
        assert_eq!(
            ledger.current_plan(&TenantId::from("t2")).await.unwrap().id.as_str(),
            "free"
        );
    }

    #[tokio::test]
    async fn test_reset_all_is_idempotent() {
        let (ledger, _, _) = ledger();
        let tenant = TenantId::from("t1");
        ledger
            .decrement(&tenant, OperationClass::Tts, 1, 25, usage(&tenant))
            .await
            .unwrap();

        let once = ledger.reset_all(&tenant, 250).await.unwrap();
        let twice = ledger.reset_all(&tenant, 250).await.unwrap();
        assert_eq!(once, twice);
        for entry in ledger.snapshot(&tenant).await.unwrap() {
            assert_eq!((entry.tokens_used, entry.tokens_remaining), (0, 250));
        }
    }

    #[tokio::test]
    async fn test_expired_row_self_heals() {
        let (ledger, _, clock) = ledger();
        let tenant = TenantId::from("t1");
        for _ in 0..25 {
            ledger
                .decrement(&tenant, OperationClass::Tts, 1, 25, usage(&tenant))
                .await
                .unwrap();
        }
        let exhausted = ledger
            .decrement(&tenant, OperationClass::Tts, 1, 25, usage(&tenant))
            .await
            .unwrap();
        assert!(matches!(exhausted, ConsumeOutcome::Insufficient { .. }));

        clock.advance(Duration::days(31));
        let healed = ledger
            .decrement(&tenant, OperationClass::Tts, 1, 25, usage(&tenant))
            .await
            .unwrap();
        let ConsumeOutcome::Granted { entry } = healed else {
            panic!("expected grant after lazy reset");
        };
        assert_eq!((entry.tokens_used, entry.tokens_remaining), (1, 24));
    }

    #[tokio::test]
    async fn test_refund_restores_exact_state() {
        let (ledger, _, _) = ledger();
        let tenant = TenantId::from("t1");
        let before = ledger.get(&tenant, OperationClass::Tts).await.unwrap();

        let record = usage(&tenant);
        let id = record.id;
        let ConsumeOutcome::Granted { entry } = ledger
            .decrement(&tenant, OperationClass::Tts, 1, 25, record)
            .await
            .unwrap()
        else {
            panic!("expected grant");
        };

        assert!(ledger
            .increment(&tenant, OperationClass::Tts, 1, entry.reset_date, id)
            .await
            .unwrap());
        assert_eq!(ledger.get(&tenant, OperationClass::Tts).await.unwrap(), before);
    }
}
