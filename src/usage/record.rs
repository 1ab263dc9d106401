use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{OperationClass, TenantId, Tokens, UsageId};

/// Lifecycle of a Usage Log row. Only `Reserved` rows move, and only forward.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageOutcome {
    Reserved,
    Succeeded,
    /// Provider outcome unknown or failed without refund; the charge stands.
    Failed,
    Refunded,
    Rejected,
}

impl UsageOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reserved => "reserved",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Refunded => "refunded",
            Self::Rejected => "rejected",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Reserved)
    }
}

impl FromStr for UsageOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reserved" => Ok(Self::Reserved),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "refunded" => Ok(Self::Refunded),
            "rejected" => Ok(Self::Rejected),
            other => Err(format!("unknown usage outcome: {}", other)),
        }
    }
}

impl std::fmt::Display for UsageOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    pub id: UsageId,
    pub tenant_id: TenantId,
    pub operation: OperationClass,
    pub tokens_charged: Tokens,
    pub input_descriptor: String,
    pub voice_id: Option<String>,
    pub output_ref: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub outcome: UsageOutcome,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl UsageRecord {
    pub fn new(
        tenant_id: TenantId,
        operation: OperationClass,
        tokens_charged: Tokens,
        input_descriptor: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: UsageId::new(),
            tenant_id,
            operation,
            tokens_charged,
            input_descriptor: input_descriptor.into(),
            voice_id: None,
            output_ref: None,
            metadata: serde_json::Value::Null,
            outcome: UsageOutcome::Reserved,
            created_at,
            completed_at: None,
        }
    }

    pub fn with_voice(mut self, voice_id: Option<String>) -> Self {
        self.voice_id = voice_id;
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn rejected(mut self) -> Self {
        self.tokens_charged = 0;
        self.outcome = UsageOutcome::Rejected;
        self.completed_at = Some(self.created_at);
        self
    }
}

/// History window for usage queries.
#[derive(Clone, Copy, Debug, Default, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryPeriod {
    Day,
    Week,
    #[default]
    Month,
    Year,
}

impl HistoryPeriod {
    pub fn duration(&self) -> Duration {
        match self {
            Self::Day => Duration::days(1),
            Self::Week => Duration::days(7),
            Self::Month => Duration::days(30),
            Self::Year => Duration::days(365),
        }
    }

    pub fn since(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.duration()
    }
}

impl FromStr for HistoryPeriod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "day" => Ok(Self::Day),
            "week" => Ok(Self::Week),
            "month" => Ok(Self::Month),
            "year" => Ok(Self::Year),
            other => Err(format!("unknown history period: {}", other)),
        }
    }
}

/// Cut `text` to at most `max_chars` characters for an input descriptor.
pub fn preview(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
