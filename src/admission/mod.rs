//! Admission control: price, entitle, reserve, run, then settle.

mod controller;
mod cost;

pub use controller::{AdmissionController, DEFAULT_PROVIDER_TIMEOUT, Metered, Reservation};
pub use cost::{CostPolicy, FlatRateCostPolicy};

use thiserror::Error;

use crate::entitlements::EntitlementDenied;
use crate::store::StoreError;
use crate::types::{OperationClass, Tokens};

#[derive(Error, Debug)]
pub enum AdmissionError {
    #[error("Insufficient {operation} tokens: {tokens_needed} needed, {tokens_remaining} remaining")]
    InsufficientTokens {
        operation: OperationClass,
        tokens_needed: Tokens,
        tokens_remaining: Tokens,
    },

    #[error(transparent)]
    EntitlementDenied(#[from] EntitlementDenied),

    #[error("Invalid cost {cost}: must be a positive integer")]
    InvalidCost { cost: Tokens },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The provider call failed after tokens were reserved. `refunded`
    /// reports whether the reservation was reversed.
    #[error("Provider failure: {message}")]
    ProviderFailure { message: String, refunded: bool },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl AdmissionError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }
}

pub type AdmissionResult<T> = std::result::Result<T, AdmissionError>;
