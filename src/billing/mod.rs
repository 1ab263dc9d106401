//! Billing processor integration: signed webhooks, typed events and the
//! reconciler that turns them into subscription and ledger changes.

mod event;
mod gateway;
mod reconciler;
mod signature;
mod subscription;

pub use event::{
    BillingEvent, BillingEventKind, CheckoutSession, InvoiceObject, SubscriptionObject,
};
pub use gateway::{BillingGateway, StripeGateway, StripeGatewayConfig};
pub use reconciler::{BillingReconciler, ReconcileOutcome};
pub use signature::{DEFAULT_TOLERANCE_SECS, SIGNATURE_HEADER, SignatureVerifier};
pub use subscription::{Subscription, SubscriptionStatus};

use thiserror::Error;

use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum ReconcileError {
    /// Bad signature or malformed payload. Never retried, nothing mutated.
    #[error("Invalid billing event: {0}")]
    InvalidEvent(String),

    /// Well-formed event that references an unknown tenant, subscription or
    /// plan. Logged for manual review.
    #[error("Unreconcilable billing event {event_id}: {reason}")]
    Unreconcilable { event_id: String, reason: String },

    #[error("Billing gateway error: {0}")]
    Gateway(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ReconcileError {
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidEvent(reason.into())
    }

    pub fn unreconcilable(event_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Unreconcilable {
            event_id: event_id.into(),
            reason: reason.into(),
        }
    }

    /// Failures worth a redelivery from the processor.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Gateway(_) | Self::Store(_))
    }
}

pub type ReconcileResult<T> = std::result::Result<T, ReconcileError>;
