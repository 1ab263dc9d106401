//! In-memory store for tests and single-instance deployments.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::repository::{
    CommitOutcome, ConsumeOutcome, ConsumeRequest, EventRepository, LedgerRepository,
    ProcessedEvent, RefundRequest, Store, SubscriptionChange, SubscriptionRepository,
    UsageRepository, VoiceCloneRepository,
};
use super::{StoreError, StoreResult};
use crate::billing::{Subscription, SubscriptionStatus};
use crate::ledger::LedgerEntry;
use crate::types::{OperationClass, TenantId, Tokens, UsageId};
use crate::usage::{UsageOutcome, UsageRecord};
use crate::voices::{TrainingStatus, VoiceClone};

#[derive(Debug, Default)]
pub struct MemoryStore {
    ledger: DashMap<(TenantId, OperationClass), LedgerEntry>,
    usage: DashMap<UsageId, UsageRecord>,
    subscriptions: DashMap<String, Subscription>,
    // Serializes subscription writes and event commits.
    billing_writes: Mutex<()>,
    events: DashMap<String, ProcessedEvent>,
    clones: DashMap<Uuid, VoiceClone>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a ledger row as-is. Test fixture for expired or skewed rows.
    pub fn put_entry(&self, entry: LedgerEntry) {
        self.ledger
            .insert((entry.tenant_id.clone(), entry.operation), entry);
    }

    pub fn usage_count(&self) -> usize {
        self.usage.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    fn upsert_subscription(&self, subscription: &Subscription) {
        if subscription.grants_plan() {
            for mut other in self.subscriptions.iter_mut() {
                if other.tenant_id == subscription.tenant_id
                    && other.external_subscription_id != subscription.external_subscription_id
                    && other.grants_plan()
                {
                    other.status = SubscriptionStatus::Canceled;
                    other.updated_at = subscription.updated_at;
                }
            }
        }

        let mut row = subscription.clone();
        if let Some(existing) = self
            .subscriptions
            .get(&subscription.external_subscription_id)
        {
            row.id = existing.id;
            row.created_at = existing.created_at;
        }
        self.subscriptions
            .insert(row.external_subscription_id.clone(), row);
    }

    fn reset_rows(
        &self,
        tenant: &TenantId,
        allotment: Tokens,
        reset_date: DateTime<Utc>,
    ) -> Vec<LedgerEntry> {
        let mut out = Vec::with_capacity(OperationClass::ALL.len());
        for operation in OperationClass::ALL {
            let entry = LedgerEntry::fresh(tenant.clone(), operation, allotment, reset_date);
            self.ledger
                .insert((tenant.clone(), operation), entry.clone());
            out.push(entry);
        }
        out
    }
}

#[async_trait]
impl LedgerRepository for MemoryStore {
    async fn get_entry(
        &self,
        tenant: &TenantId,
        operation: OperationClass,
    ) -> StoreResult<Option<LedgerEntry>> {
        Ok(self
            .ledger
            .get(&(tenant.clone(), operation))
            .map(|e| e.value().clone()))
    }

    async fn list_entries(&self, tenant: &TenantId) -> StoreResult<Vec<LedgerEntry>> {
        let mut entries: Vec<LedgerEntry> = self
            .ledger
            .iter()
            .filter(|e| &e.key().0 == tenant)
            .map(|e| e.value().clone())
            .collect();
        entries.sort_by_key(|e| e.operation);
        Ok(entries)
    }

    async fn ensure_entry(
        &self,
        tenant: &TenantId,
        operation: OperationClass,
        allotment: Tokens,
        next_reset: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<LedgerEntry> {
        let mut row = self
            .ledger
            .entry((tenant.clone(), operation))
            .or_insert_with(|| LedgerEntry::fresh(tenant.clone(), operation, allotment, next_reset));
        if row.is_expired(now) {
            row.reset(allotment, next_reset);
        }
        Ok(row.value().clone())
    }

    async fn try_consume(&self, request: ConsumeRequest) -> StoreResult<ConsumeOutcome> {
        let ConsumeRequest {
            tenant_id,
            operation,
            cost,
            allotment,
            next_reset,
            now,
            usage,
        } = request;

        // The row guard is held until the usage row is in place.
        let mut row = self
            .ledger
            .entry((tenant_id.clone(), operation))
            .or_insert_with(|| LedgerEntry::fresh(tenant_id, operation, allotment, next_reset));
        if row.is_expired(now) {
            row.reset(allotment, next_reset);
        }
        if !row.try_take(cost) {
            return Ok(ConsumeOutcome::Insufficient {
                entry: row.value().clone(),
            });
        }
        self.usage.insert(usage.id, usage);
        Ok(ConsumeOutcome::Granted {
            entry: row.value().clone(),
        })
    }

    async fn refund(&self, request: RefundRequest) -> StoreResult<bool> {
        // Settle the usage row first and release its guard before touching
        // the ledger; try_consume locks in the opposite order.
        {
            let Some(mut record) = self.usage.get_mut(&request.usage_id) else {
                return Ok(false);
            };
            if record.tenant_id != request.tenant_id || record.outcome.is_terminal() {
                return Ok(false);
            }
            record.outcome = UsageOutcome::Refunded;
            record.completed_at = Some(request.now);
        }

        let credited = match self
            .ledger
            .get_mut(&(request.tenant_id.clone(), request.operation))
        {
            Some(mut row) if row.reset_date == request.cycle => row.give_back(request.amount),
            _ => false,
        };
        Ok(credited)
    }

    async fn reset_all(
        &self,
        tenant: &TenantId,
        allotment: Tokens,
        reset_date: DateTime<Utc>,
    ) -> StoreResult<Vec<LedgerEntry>> {
        Ok(self.reset_rows(tenant, allotment, reset_date))
    }
}

#[async_trait]
impl UsageRepository for MemoryStore {
    async fn append_usage(&self, record: UsageRecord) -> StoreResult<()> {
        if self.usage.contains_key(&record.id) {
            return Err(StoreError::Conflict {
                message: format!("usage row {} already exists", record.id),
            });
        }
        self.usage.insert(record.id, record);
        Ok(())
    }

    async fn complete_usage(
        &self,
        tenant: &TenantId,
        id: UsageId,
        outcome: UsageOutcome,
        output_ref: Option<String>,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        match self.usage.get_mut(&id) {
            Some(mut record) if &record.tenant_id == tenant && !record.outcome.is_terminal() => {
                record.outcome = outcome;
                if output_ref.is_some() {
                    record.output_ref = output_ref;
                }
                record.completed_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_usage(&self, tenant: &TenantId, id: UsageId) -> StoreResult<Option<UsageRecord>> {
        Ok(self
            .usage
            .get(&id)
            .filter(|r| &r.tenant_id == tenant)
            .map(|r| r.value().clone()))
    }

    async fn list_usage(
        &self,
        tenant: &TenantId,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> StoreResult<Vec<UsageRecord>> {
        let mut rows: Vec<UsageRecord> = self
            .usage
            .iter()
            .filter(|r| &r.tenant_id == tenant)
            .filter(|r| since.is_none_or(|s| r.created_at >= s))
            .map(|r| r.value().clone())
            .collect();
        rows.sort_by_key(|r| r.created_at);
        rows.truncate(limit);
        Ok(rows)
    }

    async fn delete_usage_for_tenant(&self, tenant: &TenantId) -> StoreResult<u64> {
        let before = self.usage.len();
        self.usage.retain(|_, r| &r.tenant_id != tenant);
        Ok((before - self.usage.len()) as u64)
    }
}

#[async_trait]
impl SubscriptionRepository for MemoryStore {
    async fn subscription_by_external_id(
        &self,
        external_id: &str,
    ) -> StoreResult<Option<Subscription>> {
        Ok(self
            .subscriptions
            .get(external_id)
            .map(|s| s.value().clone()))
    }

    async fn current_subscription(&self, tenant: &TenantId) -> StoreResult<Option<Subscription>> {
        Ok(self
            .subscriptions
            .iter()
            .filter(|s| &s.tenant_id == tenant && s.grants_plan())
            .max_by_key(|s| s.updated_at)
            .map(|s| s.value().clone()))
    }

    async fn list_subscriptions(&self, tenant: &TenantId) -> StoreResult<Vec<Subscription>> {
        let mut subs: Vec<Subscription> = self
            .subscriptions
            .iter()
            .filter(|s| &s.tenant_id == tenant)
            .map(|s| s.value().clone())
            .collect();
        subs.sort_by_key(|s| std::cmp::Reverse(s.created_at));
        Ok(subs)
    }

    async fn save_subscription(&self, subscription: &Subscription) -> StoreResult<()> {
        let _guard = self.billing_writes.lock().await;
        self.upsert_subscription(subscription);
        Ok(())
    }
}

#[async_trait]
impl EventRepository for MemoryStore {
    async fn is_event_processed(&self, event_id: &str) -> StoreResult<bool> {
        Ok(self.events.contains_key(event_id))
    }

    async fn commit_event(
        &self,
        event: ProcessedEvent,
        change: Option<&SubscriptionChange>,
    ) -> StoreResult<CommitOutcome> {
        let _guard = self.billing_writes.lock().await;

        let Entry::Vacant(slot) = self.events.entry(event.event_id.clone()) else {
            return Ok(CommitOutcome::Duplicate);
        };
        if let Some(change) = change {
            let stored = self
                .subscriptions
                .get(&change.subscription.external_subscription_id)
                .map(|s| s.value().clone());
            if stored.as_ref() != change.expected.as_ref() {
                return Ok(CommitOutcome::Conflict);
            }
            self.upsert_subscription(&change.subscription);
            if let Some(reset) = &change.reset {
                self.reset_rows(&change.subscription.tenant_id, reset.allotment, reset.reset_date);
            }
        }
        slot.insert(event);
        Ok(CommitOutcome::Committed)
    }
}

#[async_trait]
impl VoiceCloneRepository for MemoryStore {
    async fn insert_clone(&self, clone: &VoiceClone) -> StoreResult<()> {
        self.clones.insert(clone.id, clone.clone());
        Ok(())
    }

    async fn get_clone(&self, tenant: &TenantId, id: Uuid) -> StoreResult<Option<VoiceClone>> {
        Ok(self
            .clones
            .get(&id)
            .filter(|c| &c.tenant_id == tenant)
            .map(|c| c.value().clone()))
    }

    async fn clone_by_provider_voice(
        &self,
        tenant: &TenantId,
        provider_voice_id: &str,
    ) -> StoreResult<Option<VoiceClone>> {
        Ok(self
            .clones
            .iter()
            .find(|c| &c.tenant_id == tenant && c.provider_voice_id == provider_voice_id)
            .map(|c| c.value().clone()))
    }

    async fn list_clones(&self, tenant: &TenantId) -> StoreResult<Vec<VoiceClone>> {
        let mut clones: Vec<VoiceClone> = self
            .clones
            .iter()
            .filter(|c| &c.tenant_id == tenant)
            .map(|c| c.value().clone())
            .collect();
        clones.sort_by_key(|c| std::cmp::Reverse(c.created_at));
        Ok(clones)
    }

    async fn set_clone_status(
        &self,
        tenant: &TenantId,
        id: Uuid,
        status: TrainingStatus,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<VoiceClone>> {
        let Some(mut clone) = self.clones.get_mut(&id) else {
            return Ok(None);
        };
        if &clone.tenant_id != tenant {
            return Ok(None);
        }
        if !clone.status.can_transition_to(status) {
            return Err(StoreError::Conflict {
                message: format!("voice clone {} cannot move from {} to {}", id, clone.status, status),
            });
        }
        if clone.status != status {
            clone.status = status;
            clone.updated_at = at;
        }
        Ok(Some(clone.value().clone()))
    }

    async fn delete_clone(&self, tenant: &TenantId, id: Uuid) -> StoreResult<bool> {
        Ok(self
            .clones
            .remove_if(&id, |_, c| &c.tenant_id == tenant)
            .is_some())
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }
}
