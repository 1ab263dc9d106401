//! Core identifiers, the operation classes that are metered, and the clock.

mod clock;
mod ids;
mod operation;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock, system_clock};
pub use ids::{PlanId, TenantId, UsageId};
pub use operation::{OperationClass, Tokens, UnknownOperation};
