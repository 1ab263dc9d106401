use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{OperationClass, TenantId, Tokens};

/// Per-tenant, per-operation-class quota counter.
///
/// Between resets `tokens_used + tokens_remaining` equals the allotment the
/// row was last reset to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    pub tenant_id: TenantId,
    pub operation: OperationClass,
    pub tokens_used: Tokens,
    pub tokens_remaining: Tokens,
    pub reset_date: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn fresh(
        tenant_id: TenantId,
        operation: OperationClass,
        allotment: Tokens,
        reset_date: DateTime<Utc>,
    ) -> Self {
        Self {
            tenant_id,
            operation,
            tokens_used: 0,
            tokens_remaining: allotment,
            reset_date,
        }
    }

    pub fn allotment(&self) -> Tokens {
        self.tokens_used.saturating_add(self.tokens_remaining)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.reset_date <= now
    }

    pub fn reset(&mut self, allotment: Tokens, reset_date: DateTime<Utc>) {
        self.tokens_used = 0;
        self.tokens_remaining = allotment;
        self.reset_date = reset_date;
    }

    /// Conditional decrement. Leaves the entry untouched when short.
    pub fn try_take(&mut self, cost: Tokens) -> bool {
        if self.tokens_remaining < cost {
            return false;
        }
        self.tokens_remaining -= cost;
        self.tokens_used += cost;
        true
    }

    /// Inverse of [`try_take`](Self::try_take). Refuses to drive
    /// `tokens_used` negative.
    pub fn give_back(&mut self, amount: Tokens) -> bool {
        if self.tokens_used < amount {
            return false;
        }
        self.tokens_used -= amount;
        self.tokens_remaining += amount;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn entry(allotment: Tokens) -> LedgerEntry {
        LedgerEntry::fresh(
            TenantId::from("t"),
            OperationClass::Tts,
            allotment,
            Utc::now() + Duration::days(30),
        )
    }

    #[test]
    fn test_take_and_give_back() {
        let mut e = entry(2);
        assert!(e.try_take(1));
        assert!(e.try_take(1));
        assert!(!e.try_take(1));
        assert_eq!((e.tokens_used, e.tokens_remaining), (2, 0));

        assert!(e.give_back(1));
        assert_eq!((e.tokens_used, e.tokens_remaining), (1, 1));
        assert!(!e.give_back(5));
        assert_eq!(e.allotment(), 2);
    }

    #[test]
    fn test_expiry_boundary() {
        let e = entry(1);
        assert!(!e.is_expired(Utc::now()));
        assert!(e.is_expired(e.reset_date));
    }
}
