//! Quota ledger: one token counter per tenant and operation class.

mod entry;
mod quota;

pub use entry::LedgerEntry;
pub use quota::{DEFAULT_RESET_PERIOD_DAYS, QuotaLedger};
