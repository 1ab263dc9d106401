//! PostgreSQL store.
//!
//! Enable with the `postgres` feature flag.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use uuid::Uuid;

use super::repository::{
    CommitOutcome, ConsumeOutcome, ConsumeRequest, EventRepository, LedgerRepository,
    ProcessedEvent, RefundRequest, Store, SubscriptionChange, SubscriptionRepository,
    UsageRepository, VoiceCloneRepository,
};
use super::{RetryPolicy, StorageResultExt, StoreError, StoreResult, with_retry};
use crate::billing::{Subscription, SubscriptionStatus};
use crate::ledger::LedgerEntry;
use crate::types::{OperationClass, TenantId, Tokens, UsageId};
use crate::usage::{UsageOutcome, UsageRecord};
use crate::voices::{SampleMetadata, TrainingStatus, VoiceClone};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS quota_ledger (
    tenant_id VARCHAR(255) NOT NULL,
    operation VARCHAR(32) NOT NULL,
    tokens_used BIGINT NOT NULL CHECK (tokens_used >= 0),
    tokens_remaining BIGINT NOT NULL CHECK (tokens_remaining >= 0),
    reset_date TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (tenant_id, operation)
);

CREATE TABLE IF NOT EXISTS usage_log (
    id UUID PRIMARY KEY,
    tenant_id VARCHAR(255) NOT NULL,
    operation VARCHAR(32) NOT NULL,
    tokens_charged BIGINT NOT NULL,
    input_descriptor TEXT NOT NULL,
    voice_id VARCHAR(255),
    output_ref TEXT,
    metadata JSONB NOT NULL DEFAULT 'null'::jsonb,
    outcome VARCHAR(16) NOT NULL,
    created_at TIMESTAMPTZ NOT NULL,
    completed_at TIMESTAMPTZ
);
CREATE INDEX IF NOT EXISTS idx_usage_log_tenant_created ON usage_log (tenant_id, created_at);

CREATE TABLE IF NOT EXISTS subscriptions (
    id UUID PRIMARY KEY,
    tenant_id VARCHAR(255) NOT NULL,
    plan_id VARCHAR(64) NOT NULL,
    status VARCHAR(16) NOT NULL,
    cycle VARCHAR(16) NOT NULL,
    current_period_start TIMESTAMPTZ NOT NULL,
    current_period_end TIMESTAMPTZ NOT NULL,
    external_subscription_id VARCHAR(255) NOT NULL UNIQUE,
    external_customer_id VARCHAR(255),
    cancel_at_period_end BOOLEAN NOT NULL DEFAULT FALSE,
    period_synthesized BOOLEAN NOT NULL DEFAULT FALSE,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL
);
ALTER TABLE subscriptions ADD COLUMN IF NOT EXISTS period_synthesized BOOLEAN NOT NULL DEFAULT FALSE;
CREATE INDEX IF NOT EXISTS idx_subscriptions_tenant ON subscriptions (tenant_id);
CREATE UNIQUE INDEX IF NOT EXISTS idx_subscriptions_one_live
    ON subscriptions (tenant_id) WHERE status IN ('trialing', 'active', 'past_due');

CREATE TABLE IF NOT EXISTS billing_events (
    event_id VARCHAR(255) PRIMARY KEY,
    event_type VARCHAR(128) NOT NULL,
    processed_at TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS voice_clones (
    id UUID PRIMARY KEY,
    tenant_id VARCHAR(255) NOT NULL,
    name VARCHAR(255) NOT NULL,
    description TEXT,
    provider_voice_id VARCHAR(255) NOT NULL,
    status VARCHAR(16) NOT NULL,
    sample_filename TEXT NOT NULL,
    sample_size_bytes BIGINT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_voice_clones_tenant ON voice_clones (tenant_id);
"#;

const LIVE_STATUSES: &str = "('trialing', 'active', 'past_due')";

const INSERT_SUBSCRIPTION: &str = "INSERT INTO subscriptions (id, tenant_id, plan_id, status, cycle,
     current_period_start, current_period_end, external_subscription_id, external_customer_id,
     cancel_at_period_end, period_synthesized, created_at, updated_at)
 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)";

#[derive(Debug, Clone)]
pub struct PgPoolConfig {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for PgPoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

pub struct PostgresStore {
    pool: PgPool,
    retry: RetryPolicy,
}

impl PostgresStore {
    pub async fn connect(database_url: &str, config: PgPoolConfig) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(database_url)
            .await
            .storage_err_ctx("connect")?;
        Ok(Self::with_pool(pool))
    }

    pub fn with_pool(pool: PgPool) -> Self {
        Self {
            pool,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .storage_err_ctx("migrate")?;
        Ok(())
    }

    async fn begin(&self) -> StoreResult<Transaction<'static, Postgres>> {
        self.pool.begin().await.storage_err_ctx("begin")
    }

    /// Create the row if missing and reset it if expired, inside `tx`.
    async fn heal_entry(
        tx: &mut Transaction<'static, Postgres>,
        tenant: &TenantId,
        operation: OperationClass,
        allotment: Tokens,
        next_reset: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO quota_ledger (tenant_id, operation, tokens_used, tokens_remaining, reset_date, updated_at)
             VALUES ($1, $2, 0, $3, $4, $5)
             ON CONFLICT (tenant_id, operation) DO NOTHING",
        )
        .bind(tenant.as_str())
        .bind(operation.as_str())
        .bind(i64::from(allotment))
        .bind(next_reset)
        .bind(now)
        .execute(&mut **tx)
        .await
        .storage_err_ctx("create ledger row")?;

        sqlx::query(
            "UPDATE quota_ledger
             SET tokens_used = 0, tokens_remaining = $3, reset_date = $4, updated_at = $5
             WHERE tenant_id = $1 AND operation = $2 AND reset_date <= $5",
        )
        .bind(tenant.as_str())
        .bind(operation.as_str())
        .bind(i64::from(allotment))
        .bind(next_reset)
        .bind(now)
        .execute(&mut **tx)
        .await
        .storage_err_ctx("reset expired ledger row")?;
        Ok(())
    }

    async fn select_entry(
        tx: &mut Transaction<'static, Postgres>,
        tenant: &TenantId,
        operation: OperationClass,
    ) -> StoreResult<LedgerEntry> {
        let row = sqlx::query(
            "SELECT tenant_id, operation, tokens_used, tokens_remaining, reset_date
             FROM quota_ledger WHERE tenant_id = $1 AND operation = $2",
        )
        .bind(tenant.as_str())
        .bind(operation.as_str())
        .fetch_one(&mut **tx)
        .await
        .storage_err_ctx("read ledger row")?;
        ledger_from_row(&row)
    }

    async fn insert_usage(
        tx: &mut Transaction<'static, Postgres>,
        record: &UsageRecord,
    ) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO usage_log (id, tenant_id, operation, tokens_charged, input_descriptor,
                                    voice_id, output_ref, metadata, outcome, created_at, completed_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(record.id.as_uuid())
        .bind(record.tenant_id.as_str())
        .bind(record.operation.as_str())
        .bind(i64::from(record.tokens_charged))
        .bind(&record.input_descriptor)
        .bind(&record.voice_id)
        .bind(&record.output_ref)
        .bind(&record.metadata)
        .bind(record.outcome.as_str())
        .bind(record.created_at)
        .bind(record.completed_at)
        .execute(&mut **tx)
        .await
        .storage_err_ctx("append usage row")?;
        Ok(())
    }

    async fn reset_ledger(
        tx: &mut Transaction<'static, Postgres>,
        tenant: &TenantId,
        allotment: Tokens,
        reset_date: DateTime<Utc>,
    ) -> StoreResult<()> {
        for operation in OperationClass::ALL {
            sqlx::query(
                "INSERT INTO quota_ledger (tenant_id, operation, tokens_used, tokens_remaining, reset_date, updated_at)
                 VALUES ($1, $2, 0, $3, $4, NOW())
                 ON CONFLICT (tenant_id, operation) DO UPDATE SET
                     tokens_used = 0,
                     tokens_remaining = EXCLUDED.tokens_remaining,
                     reset_date = EXCLUDED.reset_date,
                     updated_at = NOW()",
            )
            .bind(tenant.as_str())
            .bind(operation.as_str())
            .bind(i64::from(allotment))
            .bind(reset_date)
            .execute(&mut **tx)
            .await
            .storage_err_ctx("reset ledger")?;
        }
        Ok(())
    }

    /// Cancel the tenant's other live rows when `subscription` grants a plan.
    async fn supersede_subscriptions(
        tx: &mut Transaction<'static, Postgres>,
        subscription: &Subscription,
    ) -> StoreResult<()> {
        if !subscription.grants_plan() {
            return Ok(());
        }
        let query = format!(
            "UPDATE subscriptions SET status = $3, updated_at = $4
             WHERE tenant_id = $1 AND external_subscription_id <> $2 AND status IN {}",
            LIVE_STATUSES
        );
        sqlx::query(&query)
            .bind(subscription.tenant_id.as_str())
            .bind(&subscription.external_subscription_id)
            .bind(SubscriptionStatus::Canceled.as_str())
            .bind(subscription.updated_at)
            .execute(&mut **tx)
            .await
            .storage_err_ctx("cancel superseded subscriptions")?;
        Ok(())
    }

    /// Write `subscription` only if the stored row still matches `expected`,
    /// or, with no `expected`, only if no row exists. Returns whether it was
    /// written.
    async fn swap_subscription(
        tx: &mut Transaction<'static, Postgres>,
        expected: Option<&Subscription>,
        subscription: &Subscription,
    ) -> StoreResult<bool> {
        let Some(expected) = expected else {
            let result = sqlx::query(&format!("{} ON CONFLICT (external_subscription_id) DO NOTHING", INSERT_SUBSCRIPTION))
                .bind(subscription.id)
                .bind(subscription.tenant_id.as_str())
                .bind(subscription.plan_id.as_str())
                .bind(subscription.status.as_str())
                .bind(subscription.cycle.as_str())
                .bind(subscription.current_period_start)
                .bind(subscription.current_period_end)
                .bind(&subscription.external_subscription_id)
                .bind(&subscription.external_customer_id)
                .bind(subscription.cancel_at_period_end)
                .bind(subscription.period_synthesized)
                .bind(subscription.created_at)
                .bind(subscription.updated_at)
                .execute(&mut **tx)
                .await
                .storage_err_ctx("insert subscription")?;
            return Ok(result.rows_affected() > 0);
        };

        let result = sqlx::query(
            "UPDATE subscriptions SET
                 plan_id = $2, status = $3, cycle = $4, current_period_start = $5,
                 current_period_end = $6, external_customer_id = $7,
                 cancel_at_period_end = $8, period_synthesized = $9, updated_at = $10
             WHERE external_subscription_id = $1
               AND plan_id = $11 AND status = $12 AND current_period_start = $13
               AND current_period_end = $14 AND cancel_at_period_end = $15
               AND period_synthesized = $16 AND updated_at = $17",
        )
        .bind(&subscription.external_subscription_id)
        .bind(subscription.plan_id.as_str())
        .bind(subscription.status.as_str())
        .bind(subscription.cycle.as_str())
        .bind(subscription.current_period_start)
        .bind(subscription.current_period_end)
        .bind(&subscription.external_customer_id)
        .bind(subscription.cancel_at_period_end)
        .bind(subscription.period_synthesized)
        .bind(subscription.updated_at)
        .bind(expected.plan_id.as_str())
        .bind(expected.status.as_str())
        .bind(expected.current_period_start)
        .bind(expected.current_period_end)
        .bind(expected.cancel_at_period_end)
        .bind(expected.period_synthesized)
        .bind(expected.updated_at)
        .execute(&mut **tx)
        .await
        .storage_err_ctx("update subscription")?;
        Ok(result.rows_affected() > 0)
    }
}

fn tokens(value: i64) -> StoreResult<Tokens> {
    Tokens::try_from(value).map_err(|_| StoreError::Storage {
        message: format!("token count out of range: {}", value),
    })
}

fn parsed<T: std::str::FromStr>(value: &str, what: &str) -> StoreResult<T>
where
    T::Err: std::fmt::Display,
{
    value.parse::<T>().map_err(|e| StoreError::Storage {
        message: format!("invalid {} column: {}", what, e),
    })
}

fn ledger_from_row(row: &PgRow) -> StoreResult<LedgerEntry> {
    Ok(LedgerEntry {
        tenant_id: TenantId::new(row.try_get::<String, _>("tenant_id").storage_err()?),
        operation: parsed(&row.try_get::<String, _>("operation").storage_err()?, "operation")?,
        tokens_used: tokens(row.try_get("tokens_used").storage_err()?)?,
        tokens_remaining: tokens(row.try_get("tokens_remaining").storage_err()?)?,
        reset_date: row.try_get("reset_date").storage_err()?,
    })
}

fn usage_from_row(row: &PgRow) -> StoreResult<UsageRecord> {
    Ok(UsageRecord {
        id: UsageId::from(row.try_get::<Uuid, _>("id").storage_err()?),
        tenant_id: TenantId::new(row.try_get::<String, _>("tenant_id").storage_err()?),
        operation: parsed(&row.try_get::<String, _>("operation").storage_err()?, "operation")?,
        tokens_charged: tokens(row.try_get("tokens_charged").storage_err()?)?,
        input_descriptor: row.try_get("input_descriptor").storage_err()?,
        voice_id: row.try_get("voice_id").storage_err()?,
        output_ref: row.try_get("output_ref").storage_err()?,
        metadata: row.try_get("metadata").storage_err()?,
        outcome: parsed(&row.try_get::<String, _>("outcome").storage_err()?, "outcome")?,
        created_at: row.try_get("created_at").storage_err()?,
        completed_at: row.try_get("completed_at").storage_err()?,
    })
}

fn subscription_from_row(row: &PgRow) -> StoreResult<Subscription> {
    Ok(Subscription {
        id: row.try_get("id").storage_err()?,
        tenant_id: TenantId::new(row.try_get::<String, _>("tenant_id").storage_err()?),
        plan_id: row.try_get::<String, _>("plan_id").storage_err()?.into(),
        status: parsed(&row.try_get::<String, _>("status").storage_err()?, "status")?,
        cycle: parsed(&row.try_get::<String, _>("cycle").storage_err()?, "cycle")?,
        current_period_start: row.try_get("current_period_start").storage_err()?,
        current_period_end: row.try_get("current_period_end").storage_err()?,
        external_subscription_id: row.try_get("external_subscription_id").storage_err()?,
        external_customer_id: row.try_get("external_customer_id").storage_err()?,
        cancel_at_period_end: row.try_get("cancel_at_period_end").storage_err()?,
        period_synthesized: row.try_get("period_synthesized").storage_err()?,
        created_at: row.try_get("created_at").storage_err()?,
        updated_at: row.try_get("updated_at").storage_err()?,
    })
}

fn clone_from_row(row: &PgRow) -> StoreResult<VoiceClone> {
    let size: i64 = row.try_get("sample_size_bytes").storage_err()?;
    Ok(VoiceClone {
        id: row.try_get("id").storage_err()?,
        tenant_id: TenantId::new(row.try_get::<String, _>("tenant_id").storage_err()?),
        name: row.try_get("name").storage_err()?,
        description: row.try_get("description").storage_err()?,
        provider_voice_id: row.try_get("provider_voice_id").storage_err()?,
        status: parsed(&row.try_get::<String, _>("status").storage_err()?, "status")?,
        sample: SampleMetadata {
            filename: row.try_get("sample_filename").storage_err()?,
            size_bytes: u64::try_from(size).unwrap_or_default(),
        },
        created_at: row.try_get("created_at").storage_err()?,
        updated_at: row.try_get("updated_at").storage_err()?,
    })
}

#[async_trait]
impl LedgerRepository for PostgresStore {
    async fn get_entry(
        &self,
        tenant: &TenantId,
        operation: OperationClass,
    ) -> StoreResult<Option<LedgerEntry>> {
        with_retry(self.retry, || async {
            let row = sqlx::query(
                "SELECT tenant_id, operation, tokens_used, tokens_remaining, reset_date
                 FROM quota_ledger WHERE tenant_id = $1 AND operation = $2",
            )
            .bind(tenant.as_str())
            .bind(operation.as_str())
            .fetch_optional(&self.pool)
            .await
            .storage_err()?;
            row.as_ref().map(ledger_from_row).transpose()
        })
        .await
    }

    async fn list_entries(&self, tenant: &TenantId) -> StoreResult<Vec<LedgerEntry>> {
        with_retry(self.retry, || async {
            let rows = sqlx::query(
                "SELECT tenant_id, operation, tokens_used, tokens_remaining, reset_date
                 FROM quota_ledger WHERE tenant_id = $1 ORDER BY operation",
            )
            .bind(tenant.as_str())
            .fetch_all(&self.pool)
            .await
            .storage_err()?;
            let mut entries = rows
                .iter()
                .map(ledger_from_row)
                .collect::<StoreResult<Vec<_>>>()?;
            entries.sort_by_key(|e| e.operation);
            Ok(entries)
        })
        .await
    }

    async fn ensure_entry(
        &self,
        tenant: &TenantId,
        operation: OperationClass,
        allotment: Tokens,
        next_reset: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<LedgerEntry> {
        with_retry(self.retry, || async {
            let mut tx = self.begin().await?;
            Self::heal_entry(&mut tx, tenant, operation, allotment, next_reset, now).await?;
            let entry = Self::select_entry(&mut tx, tenant, operation).await?;
            tx.commit().await.storage_err_ctx("commit")?;
            Ok(entry)
        })
        .await
    }

    async fn try_consume(&self, request: ConsumeRequest) -> StoreResult<ConsumeOutcome> {
        let mut tx = self.begin().await?;
        Self::heal_entry(
            &mut tx,
            &request.tenant_id,
            request.operation,
            request.allotment,
            request.next_reset,
            request.now,
        )
        .await?;

        // Conditional decrement: the row lock taken by UPDATE serializes
        // concurrent reservations and the WHERE clause is re-checked after it.
        let granted = sqlx::query(
            "UPDATE quota_ledger
             SET tokens_used = tokens_used + $3,
                 tokens_remaining = tokens_remaining - $3,
                 updated_at = $4
             WHERE tenant_id = $1 AND operation = $2
               AND tokens_remaining >= $3 AND reset_date > $4
             RETURNING tenant_id, operation, tokens_used, tokens_remaining, reset_date",
        )
        .bind(request.tenant_id.as_str())
        .bind(request.operation.as_str())
        .bind(i64::from(request.cost))
        .bind(request.now)
        .fetch_optional(&mut *tx)
        .await
        .storage_err_ctx("consume tokens")?;

        let outcome = match granted {
            Some(row) => {
                let entry = ledger_from_row(&row)?;
                Self::insert_usage(&mut tx, &request.usage).await?;
                ConsumeOutcome::Granted { entry }
            }
            None => ConsumeOutcome::Insufficient {
                entry: Self::select_entry(&mut tx, &request.tenant_id, request.operation).await?,
            },
        };
        tx.commit().await.storage_err_ctx("commit")?;
        Ok(outcome)
    }

    async fn refund(&self, request: RefundRequest) -> StoreResult<bool> {
        let mut tx = self.begin().await?;
        let settled = sqlx::query(
            "UPDATE usage_log SET outcome = 'refunded', completed_at = $3
             WHERE id = $1 AND tenant_id = $2 AND outcome = 'reserved'",
        )
        .bind(request.usage_id.as_uuid())
        .bind(request.tenant_id.as_str())
        .bind(request.now)
        .execute(&mut *tx)
        .await
        .storage_err_ctx("mark usage refunded")?
        .rows_affected();
        if settled == 0 {
            tx.rollback().await.storage_err_ctx("rollback")?;
            return Ok(false);
        }

        let credited = sqlx::query(
            "UPDATE quota_ledger
             SET tokens_used = tokens_used - $3,
                 tokens_remaining = tokens_remaining + $3,
                 updated_at = $5
             WHERE tenant_id = $1 AND operation = $2
               AND reset_date = $4 AND tokens_used >= $3",
        )
        .bind(request.tenant_id.as_str())
        .bind(request.operation.as_str())
        .bind(i64::from(request.amount))
        .bind(request.cycle)
        .bind(request.now)
        .execute(&mut *tx)
        .await
        .storage_err_ctx("refund tokens")?
        .rows_affected()
            > 0;

        tx.commit().await.storage_err_ctx("commit")?;
        Ok(credited)
    }

    async fn reset_all(
        &self,
        tenant: &TenantId,
        allotment: Tokens,
        reset_date: DateTime<Utc>,
    ) -> StoreResult<Vec<LedgerEntry>> {
        with_retry(self.retry, || async {
            let mut tx = self.begin().await?;
            Self::reset_ledger(&mut tx, tenant, allotment, reset_date).await?;
            tx.commit().await.storage_err_ctx("commit")?;
            Ok(OperationClass::ALL
                .iter()
                .map(|op| LedgerEntry::fresh(tenant.clone(), *op, allotment, reset_date))
                .collect())
        })
        .await
    }
}

#[async_trait]
impl UsageRepository for PostgresStore {
    async fn append_usage(&self, record: UsageRecord) -> StoreResult<()> {
        let mut tx = self.begin().await?;
        Self::insert_usage(&mut tx, &record).await?;
        tx.commit().await.storage_err_ctx("commit")?;
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
        let result = sqlx::query(
            "UPDATE usage_log
             SET outcome = $3, output_ref = COALESCE($4, output_ref), completed_at = $5
             WHERE id = $1 AND tenant_id = $2 AND outcome = 'reserved'",
        )
        .bind(id.as_uuid())
        .bind(tenant.as_str())
        .bind(outcome.as_str())
        .bind(output_ref)
        .bind(at)
        .execute(&self.pool)
        .await
        .storage_err_ctx("complete usage row")?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_usage(&self, tenant: &TenantId, id: UsageId) -> StoreResult<Option<UsageRecord>> {
        let row = sqlx::query("SELECT * FROM usage_log WHERE id = $1 AND tenant_id = $2")
            .bind(id.as_uuid())
            .bind(tenant.as_str())
            .fetch_optional(&self.pool)
            .await
            .storage_err()?;
        row.as_ref().map(usage_from_row).transpose()
    }

    async fn list_usage(
        &self,
        tenant: &TenantId,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> StoreResult<Vec<UsageRecord>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(
            "SELECT * FROM usage_log
             WHERE tenant_id = $1 AND ($2::timestamptz IS NULL OR created_at >= $2)
             ORDER BY created_at ASC LIMIT $3",
        )
        .bind(tenant.as_str())
        .bind(since)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .storage_err()?;
        rows.iter().map(usage_from_row).collect()
    }

    async fn delete_usage_for_tenant(&self, tenant: &TenantId) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM usage_log WHERE tenant_id = $1")
            .bind(tenant.as_str())
            .execute(&self.pool)
            .await
            .storage_err()?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl SubscriptionRepository for PostgresStore {
    async fn subscription_by_external_id(
        &self,
        external_id: &str,
    ) -> StoreResult<Option<Subscription>> {
        with_retry(self.retry, || async {
            let row = sqlx::query("SELECT * FROM subscriptions WHERE external_subscription_id = $1")
                .bind(external_id)
                .fetch_optional(&self.pool)
                .await
                .storage_err()?;
            row.as_ref().map(subscription_from_row).transpose()
        })
        .await
    }

    async fn current_subscription(&self, tenant: &TenantId) -> StoreResult<Option<Subscription>> {
        let query = format!(
            "SELECT * FROM subscriptions WHERE tenant_id = $1 AND status IN {}
             ORDER BY updated_at DESC LIMIT 1",
            LIVE_STATUSES
        );
        with_retry(self.retry, || async {
            let row = sqlx::query(&query)
                .bind(tenant.as_str())
                .fetch_optional(&self.pool)
                .await
                .storage_err()?;
            row.as_ref().map(subscription_from_row).transpose()
        })
        .await
    }

    async fn list_subscriptions(&self, tenant: &TenantId) -> StoreResult<Vec<Subscription>> {
        let rows =
            sqlx::query("SELECT * FROM subscriptions WHERE tenant_id = $1 ORDER BY created_at DESC")
                .bind(tenant.as_str())
                .fetch_all(&self.pool)
                .await
                .storage_err()?;
        rows.iter().map(subscription_from_row).collect()
    }

    async fn save_subscription(&self, subscription: &Subscription) -> StoreResult<()> {
        let mut tx = self.begin().await?;
        Self::supersede_subscriptions(&mut tx, subscription).await?;

        sqlx::query(&format!(
            "{} ON CONFLICT (external_subscription_id) DO UPDATE SET
                 tenant_id = EXCLUDED.tenant_id,
                 plan_id = EXCLUDED.plan_id,
                 status = EXCLUDED.status,
                 cycle = EXCLUDED.cycle,
                 current_period_start = EXCLUDED.current_period_start,
                 current_period_end = EXCLUDED.current_period_end,
                 external_customer_id = EXCLUDED.external_customer_id,
                 cancel_at_period_end = EXCLUDED.cancel_at_period_end,
                 period_synthesized = EXCLUDED.period_synthesized,
                 updated_at = EXCLUDED.updated_at",
            INSERT_SUBSCRIPTION
        ))
        .bind(subscription.id)
        .bind(subscription.tenant_id.as_str())
        .bind(subscription.plan_id.as_str())
        .bind(subscription.status.as_str())
        .bind(subscription.cycle.as_str())
        .bind(subscription.current_period_start)
        .bind(subscription.current_period_end)
        .bind(&subscription.external_subscription_id)
        .bind(&subscription.external_customer_id)
        .bind(subscription.cancel_at_period_end)
        .bind(subscription.period_synthesized)
        .bind(subscription.created_at)
        .bind(subscription.updated_at)
        .execute(&mut *tx)
        .await
        .storage_err_ctx("upsert subscription")?;

        tx.commit().await.storage_err_ctx("commit")?;
        Ok(())
    }
}

#[async_trait]
impl EventRepository for PostgresStore {
    async fn is_event_processed(&self, event_id: &str) -> StoreResult<bool> {
        with_retry(self.retry, || async {
            let row = sqlx::query("SELECT 1 AS present FROM billing_events WHERE event_id = $1")
                .bind(event_id)
                .fetch_optional(&self.pool)
                .await
                .storage_err()?;
            Ok(row.is_some())
        })
        .await
    }

    async fn commit_event(
        &self,
        event: ProcessedEvent,
        change: Option<&SubscriptionChange>,
    ) -> StoreResult<CommitOutcome> {
        with_retry(self.retry, || async {
            let mut tx = self.begin().await?;

            // Blocks on a concurrent insert of the same id until that
            // transaction ends.
            let claimed = sqlx::query(
                "INSERT INTO billing_events (event_id, event_type, processed_at)
                 VALUES ($1, $2, $3) ON CONFLICT (event_id) DO NOTHING",
            )
            .bind(&event.event_id)
            .bind(&event.event_type)
            .bind(event.processed_at)
            .execute(&mut *tx)
            .await
            .storage_err_ctx("record billing event")?
            .rows_affected()
                > 0;
            if !claimed {
                tx.rollback().await.storage_err_ctx("rollback")?;
                return Ok(CommitOutcome::Duplicate);
            }

            if let Some(change) = change {
                let subscription = &change.subscription;
                Self::supersede_subscriptions(&mut tx, subscription).await?;
                if !Self::swap_subscription(&mut tx, change.expected.as_ref(), subscription).await? {
                    tx.rollback().await.storage_err_ctx("rollback")?;
                    return Ok(CommitOutcome::Conflict);
                }
                if let Some(reset) = &change.reset {
                    Self::reset_ledger(&mut tx, &subscription.tenant_id, reset.allotment, reset.reset_date)
                        .await?;
                }
            }

            tx.commit().await.storage_err_ctx("commit")?;
            Ok(CommitOutcome::Committed)
        })
        .await
    }
}

#[async_trait]
impl VoiceCloneRepository for PostgresStore {
    async fn insert_clone(&self, clone: &VoiceClone) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO voice_clones (id, tenant_id, name, description, provider_voice_id, status,
                 sample_filename, sample_size_bytes, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(clone.id)
        .bind(clone.tenant_id.as_str())
        .bind(&clone.name)
        .bind(&clone.description)
        .bind(&clone.provider_voice_id)
        .bind(clone.status.as_str())
        .bind(&clone.sample.filename)
        .bind(i64::try_from(clone.sample.size_bytes).unwrap_or(i64::MAX))
        .bind(clone.created_at)
        .bind(clone.updated_at)
        .execute(&self.pool)
        .await
        .storage_err_ctx("insert voice clone")?;
        Ok(())
    }

    async fn get_clone(&self, tenant: &TenantId, id: Uuid) -> StoreResult<Option<VoiceClone>> {
        let row = sqlx::query("SELECT * FROM voice_clones WHERE id = $1 AND tenant_id = $2")
            .bind(id)
            .bind(tenant.as_str())
            .fetch_optional(&self.pool)
            .await
            .storage_err()?;
        row.as_ref().map(clone_from_row).transpose()
    }

    async fn clone_by_provider_voice(
        &self,
        tenant: &TenantId,
        provider_voice_id: &str,
    ) -> StoreResult<Option<VoiceClone>> {
        let row = sqlx::query(
            "SELECT * FROM voice_clones WHERE tenant_id = $1 AND provider_voice_id = $2 LIMIT 1",
        )
        .bind(tenant.as_str())
        .bind(provider_voice_id)
        .fetch_optional(&self.pool)
        .await
        .storage_err()?;
        row.as_ref().map(clone_from_row).transpose()
    }

    async fn list_clones(&self, tenant: &TenantId) -> StoreResult<Vec<VoiceClone>> {
        let rows =
            sqlx::query("SELECT * FROM voice_clones WHERE tenant_id = $1 ORDER BY created_at DESC")
                .bind(tenant.as_str())
                .fetch_all(&self.pool)
                .await
                .storage_err()?;
        rows.iter().map(clone_from_row).collect()
    }

    async fn set_clone_status(
        &self,
        tenant: &TenantId,
        id: Uuid,
        status: TrainingStatus,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<VoiceClone>> {
        let row = sqlx::query(
            "UPDATE voice_clones
             SET status = $3,
                 updated_at = CASE WHEN status = $3 THEN updated_at ELSE $4 END
             WHERE id = $1 AND tenant_id = $2 AND (status = 'training' OR status = $3)
             RETURNING *",
        )
        .bind(id)
        .bind(tenant.as_str())
        .bind(status.as_str())
        .bind(at)
        .fetch_optional(&self.pool)
        .await
        .storage_err_ctx("update voice clone status")?;

        if let Some(row) = row {
            return clone_from_row(&row).map(Some);
        }
        match self.get_clone(tenant, id).await? {
            Some(existing) => Err(StoreError::Conflict {
                message: format!(
                    "voice clone {} cannot move from {} to {}",
                    id, existing.status, status
                ),
            }),
            None => Ok(None),
        }
    }

    async fn delete_clone(&self, tenant: &TenantId, id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM voice_clones WHERE id = $1 AND tenant_id = $2")
            .bind(id)
            .bind(tenant.as_str())
            .execute(&self.pool)
            .await
            .storage_err()?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl Store for PostgresStore {
    fn name(&self) -> &str {
        "postgres"
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
