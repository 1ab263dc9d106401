//! Plan catalog: subscription tiers, their monthly token allotments and
//! external billing price references.

mod catalog;
mod plan;

pub use catalog::{PlanCatalog, PlanCatalogBuilder, TokenAllotments};
pub use plan::{BillingCycle, Plan, PlanLevel};

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CatalogError {
    #[error("Unknown plan: {id}")]
    UnknownPlan { id: String },

    #[error("Invalid plan catalog: {message}")]
    Invalid { message: String },
}

pub type CatalogResult<T> = std::result::Result<T, CatalogError>;
