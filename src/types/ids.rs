//! Tenant, plan and usage identifiers.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An authenticated account owning subscriptions, ledgers and usage history.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(pub String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TenantId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TenantId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Plan catalog identifier (`free`, `starter`, ...).
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlanId(pub String);

impl PlanId {
    pub const FREE: &'static str = "free";

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn free() -> Self {
        Self(Self::FREE.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_free(&self) -> bool {
        self.0 == Self::FREE
    }
}

impl std::fmt::Display for PlanId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PlanId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PlanId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identifier of a Usage Log row. A reservation is addressed by the id of the
/// row it appended.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UsageId(pub Uuid);

impl UsageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for UsageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for UsageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for UsageId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl From<Uuid> for UsageId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_id_free() {
        assert!(PlanId::free().is_free());
        assert!(!PlanId::from("pro").is_free());
    }

    #[test]
    fn test_usage_id_parse() {
        let id = UsageId::new();
        assert_eq!(UsageId::parse(&id.to_string()), Some(id));
        assert!(UsageId::parse("not-a-uuid").is_none());
    }

    #[test]
    fn test_tenant_id_serde_transparent() {
        let id = TenantId::from("tenant-a");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"tenant-a\"");
    }
}
