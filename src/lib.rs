//! # voicemeter
//!
//! Token metering and entitlement enforcement for metered AI audio
//! operations (text-to-speech, speech-to-text, voice cloning).
//!
//! Every operation is priced, checked against the tenant's plan, and paid
//! for with an atomic reservation against a per-tenant quota ledger before
//! the provider is called. Billing processor webhooks drive plan changes and
//! renewals.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use voicemeter::provider::{OperationRequest, SpeechParams};
//! use voicemeter::store::MemoryStore;
//! use voicemeter::{MeteringService, QualityTier, TenantId};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), voicemeter::Error> {
//!     let service = MeteringService::builder(Arc::new(MemoryStore::new())).build();
//!     let metered = service
//!         .execute(
//!             &TenantId::from("tenant-1"),
//!             OperationRequest::TextToSpeech(SpeechParams {
//!                 text: "Hello".into(),
//!                 voice_id: "21m00Tcm4TlvDq8ikWAM".into(),
//!                 quality: QualityTier::Standard,
//!                 language: "en".into(),
//!             }),
//!         )
//!         .await?;
//!     println!("{} tokens left", metered.reservation.tokens_remaining());
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod admission;
pub mod billing;
pub mod config;
pub mod entitlements;
pub mod http;
pub mod ledger;
pub mod observability;
pub mod plans;
pub mod provider;
pub mod service;
pub mod store;
pub mod types;
pub mod usage;
pub mod voices;

pub use admission::{
    AdmissionController, AdmissionError, AdmissionResult, CostPolicy, FlatRateCostPolicy, Metered,
    Reservation,
};
pub use billing::{
    BillingEvent, BillingEventKind, BillingGateway, BillingReconciler, ReconcileError,
    ReconcileOutcome, SignatureVerifier, StripeGateway, Subscription, SubscriptionStatus,
};
pub use config::{ConfigBuilder, ConfigError, Settings};
pub use entitlements::{
    Capability, CapabilityRegistry, EntitlementDenied, EntitlementResolver, QualityTier,
};
pub use ledger::{LedgerEntry, QuotaLedger};
pub use observability::{
    MetricsConfig, MetricsRegistry, MetricsSummary, ObservabilityConfig, TracingConfig,
    init_tracing,
};
pub use plans::{BillingCycle, CatalogError, Plan, PlanCatalog, PlanLevel};
pub use provider::{AudioOpProvider, OperationOutput, OperationRequest, ProviderError};
pub use service::{MeteringService, MeteringServiceBuilder, SubscriptionView, UsageOverview};
pub use store::{MemoryStore, Store, StoreError};
pub use types::{OperationClass, PlanId, TenantId, Tokens, UsageId};
pub use usage::{HistoryPeriod, UsageLog, UsageOutcome, UsageRecord};
pub use voices::{TrainingStatus, VoiceClone, VoiceRegistry};

/// Error type for voicemeter operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// No authenticated tenant on the request.
    #[error("Unauthorized")]
    Unauthorized,

    /// Admission refused or the metered operation failed.
    #[error(transparent)]
    Admission(#[from] AdmissionError),

    /// A billing event could not be applied.
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// The plan catalog is malformed.
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<EntitlementDenied> for Error {
    fn from(denied: EntitlementDenied) -> Self {
        Error::Admission(AdmissionError::EntitlementDenied(denied))
    }
}

/// Error category for unified error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// No valid tenant session (401)
    Authorization,
    /// Ledger has too few tokens for the operation (402)
    QuotaExhausted,
    /// The plan does not include the capability (403)
    EntitlementDenied,
    /// The AI provider failed after tokens were reserved (502)
    Provider,
    /// Malformed requests, invalid billing events, bad configuration
    InvalidInput,
    /// A billing event that needs manual review
    Unreconcilable,
    NotFound,
    /// Storage or network failures that may succeed on retry
    Transient,
    Internal,
}

impl Error {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Unauthorized => ErrorCategory::Authorization,

            Error::Admission(e) => match e {
                AdmissionError::InsufficientTokens { .. } => ErrorCategory::QuotaExhausted,
                AdmissionError::EntitlementDenied(_) => ErrorCategory::EntitlementDenied,
                AdmissionError::InvalidCost { .. } | AdmissionError::InvalidRequest(_) => {
                    ErrorCategory::InvalidInput
                }
                AdmissionError::ProviderFailure { .. } => ErrorCategory::Provider,
                AdmissionError::Store(e) => store_category(e),
            },

            Error::Reconcile(e) => match e {
                ReconcileError::InvalidEvent(_) => ErrorCategory::InvalidInput,
                ReconcileError::Unreconcilable { .. } => ErrorCategory::Unreconcilable,
                ReconcileError::Gateway(_) => ErrorCategory::Transient,
                ReconcileError::Store(e) => store_category(e),
            },

            Error::Store(e) => store_category(e),
            Error::Provider(_) => ErrorCategory::Provider,

            Error::Catalog(_) | Error::Config(_) | Error::InvalidRequest(_) => {
                ErrorCategory::InvalidInput
            }
            Error::NotFound(_) => ErrorCategory::NotFound,
            Error::Io(_) => ErrorCategory::Internal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }

    pub fn is_quota_exhausted(&self) -> bool {
        self.category() == ErrorCategory::QuotaExhausted
    }

    pub fn is_entitlement_denied(&self) -> bool {
        self.category() == ErrorCategory::EntitlementDenied
    }
}

fn store_category(e: &StoreError) -> ErrorCategory {
    match e {
        StoreError::NotFound { .. } => ErrorCategory::NotFound,
        StoreError::Storage { .. } => ErrorCategory::Transient,
        StoreError::Conflict { .. } | StoreError::Serialization(_) => ErrorCategory::Internal,
    }
}

/// Result type alias for voicemeter operations.
pub type Result<T> = std::result::Result<T, Error>;
