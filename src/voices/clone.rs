use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::TenantId;

#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingStatus {
    Training,
    Ready,
    Failed,
}

impl TrainingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Training => "training",
            Self::Ready => "ready",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Training)
    }

    /// `training -> ready | failed`; re-asserting the current status is allowed.
    pub fn can_transition_to(&self, next: TrainingStatus) -> bool {
        *self == next || matches!(self, Self::Training)
    }
}

impl FromStr for TrainingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "training" => Ok(Self::Training),
            "ready" => Ok(Self::Ready),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown training status: {}", other)),
        }
    }
}

impl std::fmt::Display for TrainingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SampleMetadata {
    pub filename: String,
    pub size_bytes: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceClone {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub name: String,
    pub description: Option<String>,
    pub provider_voice_id: String,
    pub status: TrainingStatus,
    pub sample: SampleMetadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl VoiceClone {
    pub fn new(
        tenant_id: TenantId,
        name: impl Into<String>,
        provider_voice_id: impl Into<String>,
        sample: SampleMetadata,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            name: name.into(),
            description: None,
            provider_voice_id: provider_voice_id.into(),
            status: TrainingStatus::Training,
            sample,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_description(mut self, description: Option<String>) -> Self {
        self.description = description;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_training_transitions() {
        use TrainingStatus::*;
        assert!(Training.can_transition_to(Ready));
        assert!(Training.can_transition_to(Failed));
        assert!(Ready.can_transition_to(Ready));
        assert!(!Ready.can_transition_to(Training));
        assert!(!Failed.can_transition_to(Ready));
    }
}
