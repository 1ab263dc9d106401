//! Repository traits over the transactional store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::StoreResult;
use crate::billing::Subscription;
use crate::ledger::LedgerEntry;
use crate::types::{OperationClass, TenantId, Tokens, UsageId};
use crate::usage::{UsageOutcome, UsageRecord};
use crate::voices::{TrainingStatus, VoiceClone};

/// A reservation attempt against one ledger row.
#[derive(Debug, Clone)]
pub struct ConsumeRequest {
    pub tenant_id: TenantId,
    pub operation: OperationClass,
    pub cost: Tokens,
    /// Allotment used when the row is missing or expired.
    pub allotment: Tokens,
    /// Reset date given to a row created or reset by this call.
    pub next_reset: DateTime<Utc>,
    pub now: DateTime<Utc>,
    /// Appended in the same transaction as a successful decrement.
    pub usage: UsageRecord,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumeOutcome {
    Granted { entry: LedgerEntry },
    Insufficient { entry: LedgerEntry },
}

#[derive(Debug, Clone)]
pub struct RefundRequest {
    pub tenant_id: TenantId,
    pub operation: OperationClass,
    pub amount: Tokens,
    /// Reset date of the cycle the tokens were taken from.
    pub cycle: DateTime<Utc>,
    pub usage_id: UsageId,
    pub now: DateTime<Utc>,
}

#[async_trait]
pub trait LedgerRepository: Send + Sync {
    async fn get_entry(
        &self,
        tenant: &TenantId,
        operation: OperationClass,
    ) -> StoreResult<Option<LedgerEntry>>;

    async fn list_entries(&self, tenant: &TenantId) -> StoreResult<Vec<LedgerEntry>>;

    /// Create the row if missing and reset it if expired, without consuming.
    async fn ensure_entry(
        &self,
        tenant: &TenantId,
        operation: OperationClass,
        allotment: Tokens,
        next_reset: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<LedgerEntry>;

    /// Single atomic read-modify-write: lazily create or reset the row, then
    /// decrement only if `tokens_remaining >= cost`, appending the usage row
    /// on success. Two concurrent calls can never both take the last tokens.
    async fn try_consume(&self, request: ConsumeRequest) -> StoreResult<ConsumeOutcome>;

    /// Settle a `reserved` usage row as refunded and return its tokens to
    /// the ledger row if that row is still in the cycle they came from.
    /// Returns whether the ledger was credited; an already settled usage row
    /// is never credited twice.
    async fn refund(&self, request: RefundRequest) -> StoreResult<bool>;

    /// Set every operation-class row of the tenant to
    /// `{used: 0, remaining: allotment, reset_date}`.
    async fn reset_all(
        &self,
        tenant: &TenantId,
        allotment: Tokens,
        reset_date: DateTime<Utc>,
    ) -> StoreResult<Vec<LedgerEntry>>;
}

#[async_trait]
pub trait UsageRepository: Send + Sync {
    async fn append_usage(&self, record: UsageRecord) -> StoreResult<()>;

    /// Move a `reserved` row to a terminal outcome. Returns false if the row
    /// is missing or already terminal.
    async fn complete_usage(
        &self,
        tenant: &TenantId,
        id: UsageId,
        outcome: UsageOutcome,
        output_ref: Option<String>,
        at: DateTime<Utc>,
    ) -> StoreResult<bool>;

    async fn get_usage(&self, tenant: &TenantId, id: UsageId) -> StoreResult<Option<UsageRecord>>;

    /// Rows created at or after `since`, oldest first.
    async fn list_usage(
        &self,
        tenant: &TenantId,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> StoreResult<Vec<UsageRecord>>;

    async fn delete_usage_for_tenant(&self, tenant: &TenantId) -> StoreResult<u64>;
}

#[async_trait]
pub trait SubscriptionRepository: Send + Sync {
    async fn subscription_by_external_id(
        &self,
        external_id: &str,
    ) -> StoreResult<Option<Subscription>>;

    /// The subscription currently granting the tenant a plan, if any.
    async fn current_subscription(&self, tenant: &TenantId) -> StoreResult<Option<Subscription>>;

    async fn list_subscriptions(&self, tenant: &TenantId) -> StoreResult<Vec<Subscription>>;

    /// Upsert keyed by external subscription id. When the saved row grants a
    /// plan, every other plan-granting row of the tenant is canceled in the
    /// same transaction.
    async fn save_subscription(&self, subscription: &Subscription) -> StoreResult<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedEvent {
    pub event_id: String,
    pub event_type: String,
    pub processed_at: DateTime<Utc>,
}

/// Ledger reset written together with a subscription change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerReset {
    pub allotment: Tokens,
    pub reset_date: DateTime<Utc>,
}

/// A subscription write computed from a previously read row.
#[derive(Debug, Clone)]
pub struct SubscriptionChange {
    /// The row as read before the change was decided; `None` for a
    /// subscription not yet stored.
    pub expected: Option<Subscription>,
    pub subscription: Subscription,
    /// Applied to every ledger row of the subscription's tenant.
    pub reset: Option<LedgerReset>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    /// The event id was already recorded. Nothing was written.
    Duplicate,
    /// The stored subscription no longer matches `expected`. Nothing was
    /// written.
    Conflict,
}

#[async_trait]
pub trait EventRepository: Send + Sync {
    async fn is_event_processed(&self, event_id: &str) -> StoreResult<bool>;

    /// Record the event id, write the change and reset the ledger in one
    /// transaction. Either all of it lands or none of it does, so two
    /// instances handling the same delivery or racing on the same row can
    /// never both apply a reset.
    async fn commit_event(
        &self,
        event: ProcessedEvent,
        change: Option<&SubscriptionChange>,
    ) -> StoreResult<CommitOutcome>;
}

#[async_trait]
pub trait VoiceCloneRepository: Send + Sync {
    async fn insert_clone(&self, clone: &VoiceClone) -> StoreResult<()>;

    async fn get_clone(&self, tenant: &TenantId, id: Uuid) -> StoreResult<Option<VoiceClone>>;

    async fn clone_by_provider_voice(
        &self,
        tenant: &TenantId,
        provider_voice_id: &str,
    ) -> StoreResult<Option<VoiceClone>>;

    /// Newest first.
    async fn list_clones(&self, tenant: &TenantId) -> StoreResult<Vec<VoiceClone>>;

    async fn set_clone_status(
        &self,
        tenant: &TenantId,
        id: Uuid,
        status: TrainingStatus,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<VoiceClone>>;

    async fn delete_clone(&self, tenant: &TenantId, id: Uuid) -> StoreResult<bool>;
}

/// A complete storage backend.
#[async_trait]
pub trait Store:
    LedgerRepository
    + UsageRepository
    + SubscriptionRepository
    + EventRepository
    + VoiceCloneRepository
{
    fn name(&self) -> &str;

    /// Release connections. Called once at shutdown.
    async fn close(&self) {}
}
