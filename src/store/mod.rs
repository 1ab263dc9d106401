//! Persistent state behind repository traits.
//!
//! All shared state lives in a transactional store. [`MemoryStore`] serves
//! tests and single-instance deployments; [`PostgresStore`] (feature
//! `postgres`) is the production backend.

mod memory;
#[cfg(feature = "postgres")]
mod postgres;
mod repository;

pub use memory::MemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::{PgPoolConfig, PostgresStore};
pub use repository::{
    CommitOutcome, ConsumeOutcome, ConsumeRequest, EventRepository, LedgerRepository, LedgerReset,
    ProcessedEvent, RefundRequest, Store, SubscriptionChange, SubscriptionRepository,
    UsageRepository, VoiceCloneRepository,
};

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Not found: {what}")]
    NotFound { what: String },

    #[error("Conflict: {message}")]
    Conflict { message: String },

    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage { .. })
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[cfg(feature = "postgres")]
pub(crate) trait StorageResultExt<T> {
    fn storage_err(self) -> StoreResult<T>;
    fn storage_err_ctx(self, context: &str) -> StoreResult<T>;
}

#[cfg(feature = "postgres")]
impl<T, E: std::fmt::Display> StorageResultExt<T> for std::result::Result<T, E> {
    fn storage_err(self) -> StoreResult<T> {
        self.map_err(|e| StoreError::Storage {
            message: e.to_string(),
        })
    }

    fn storage_err_ctx(self, context: &str) -> StoreResult<T> {
        self.map_err(|e| StoreError::Storage {
            message: format!("{}: {}", context, e),
        })
    }
}

/// Backoff schedule for transient storage failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }
}

/// Run `operation`, retrying retryable failures with jittered exponential
/// backoff. Only wrap operations that are safe to repeat.
pub async fn with_retry<F, Fut, T>(policy: RetryPolicy, operation: F) -> StoreResult<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = StoreResult<T>>,
{
    let mut attempt = 0;
    let mut backoff = policy.initial_backoff;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if attempt < policy.max_retries && e.is_retryable() => {
                attempt += 1;
                tracing::warn!(
                    attempt = attempt,
                    error = %e,
                    "Retrying storage operation after transient failure"
                );
                // Symmetrical 10% jitter to prevent thundering herd
                let jitter_factor = 1.0 + (rand::random::<f64>() * 0.2 - 0.1);
                tokio::time::sleep(backoff.mul_f64(jitter_factor)).await;
                backoff = (backoff * 2).min(policy.max_backoff);
            }
            Err(e) => return Err(e),
        }
    }
}
