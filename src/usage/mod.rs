//! Append-only usage log.

mod record;

pub use record::{HistoryPeriod, UsageOutcome, UsageRecord, preview};

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::store::{Store, StoreResult};
use crate::types::{SharedClock, TenantId, UsageId};

/// Upper bound on rows returned by a single history query.
pub const MAX_HISTORY_ROWS: usize = 1000;

/// Read and lifecycle access to the usage log. Rows are appended by the
/// ledger in the same transaction as the token decrement; this service only
/// appends audit rows directly.
#[derive(Clone)]
pub struct UsageLog {
    store: Arc<dyn Store>,
    clock: SharedClock,
}

impl UsageLog {
    pub fn new(store: Arc<dyn Store>, clock: SharedClock) -> Self {
        Self { store, clock }
    }

    pub async fn append(&self, record: UsageRecord) -> StoreResult<()> {
        self.store.append_usage(record).await
    }

    /// Mark a reserved row succeeded or failed. Terminal rows never change.
    pub async fn complete(
        &self,
        tenant: &TenantId,
        id: UsageId,
        outcome: UsageOutcome,
        output_ref: Option<String>,
    ) -> StoreResult<bool> {
        self.store
            .complete_usage(tenant, id, outcome, output_ref, self.clock.now())
            .await
    }

    pub async fn get(&self, tenant: &TenantId, id: UsageId) -> StoreResult<Option<UsageRecord>> {
        self.store.get_usage(tenant, id).await
    }

    pub async fn history(&self, tenant: &TenantId, period: HistoryPeriod) -> StoreResult<Vec<UsageRecord>> {
        self.since(tenant, Some(period.since(self.clock.now()))).await
    }

    pub async fn since(
        &self,
        tenant: &TenantId,
        since: Option<DateTime<Utc>>,
    ) -> StoreResult<Vec<UsageRecord>> {
        self.store.list_usage(tenant, since, MAX_HISTORY_ROWS).await
    }

    /// Tenant-initiated data deletion. The only way rows leave the log.
    pub async fn delete_for_tenant(&self, tenant: &TenantId) -> StoreResult<u64> {
        let deleted = self.store.delete_usage_for_tenant(tenant).await?;
        info!(tenant_id = %tenant, deleted, "Usage history deleted");
        Ok(deleted)
    }
}

impl std::fmt::Debug for UsageLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsageLog")
            .field("store", &self.store.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::{Clock, ManualClock, OperationClass};
    use chrono::Duration;

    fn log() -> (UsageLog, ManualClock) {
        let clock = ManualClock::new(Utc::now());
        (
            UsageLog::new(Arc::new(MemoryStore::new()), Arc::new(clock.clone())),
            clock,
        )
    }

    #[tokio::test]
    async fn test_history_window_and_order() {
        let (log, clock) = log();
        let tenant = TenantId::from("t1");
        let now = clock.now();

        for days_ago in [40, 3, 10, 1] {
            log.append(UsageRecord::new(
                tenant.clone(),
                OperationClass::Tts,
                1,
                format!("{days_ago} days ago"),
                now - Duration::days(days_ago),
            ))
            .await
            .unwrap();
        }

        let month = log.history(&tenant, HistoryPeriod::Month).await.unwrap();
        let labels: Vec<&str> = month.iter().map(|r| r.input_descriptor.as_str()).collect();
        assert_eq!(labels, ["10 days ago", "3 days ago", "1 days ago"]);

        let week = log.history(&tenant, HistoryPeriod::Week).await.unwrap();
        assert_eq!(week.len(), 2);
        assert_eq!(log.history(&tenant, HistoryPeriod::Year).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_complete_only_once() {
        let (log, clock) = log();
        let tenant = TenantId::from("t1");
        let record = UsageRecord::new(tenant.clone(), OperationClass::Stt, 1, "a.mp3", clock.now());
        let id = record.id;
        log.append(record).await.unwrap();

        assert!(log
            .complete(&tenant, id, UsageOutcome::Succeeded, Some("out".into()))
            .await
            .unwrap());
        assert!(!log
            .complete(&tenant, id, UsageOutcome::Failed, None)
            .await
            .unwrap());

        let stored = log.get(&tenant, id).await.unwrap().unwrap();
        assert_eq!(stored.outcome, UsageOutcome::Succeeded);
        assert_eq!(stored.output_ref.as_deref(), Some("out"));
    }

    #[tokio::test]
    async fn test_rows_are_tenant_scoped_and_deletable() {
        let (log, clock) = log();
        let a = TenantId::from("a");
        let b = TenantId::from("b");
        let record = UsageRecord::new(a.clone(), OperationClass::Tts, 1, "x", clock.now());
        let id = record.id;
        log.append(record).await.unwrap();
        log.append(UsageRecord::new(b.clone(), OperationClass::Tts, 1, "y", clock.now()))
            .await
            .unwrap();

        assert!(log.get(&b, id).await.unwrap().is_none());
        assert_eq!(log.delete_for_tenant(&a).await.unwrap(), 1);
        assert!(log.since(&a, None).await.unwrap().is_empty());
        assert_eq!(log.since(&b, None).await.unwrap().len(), 1);
    }
}
