//! Metered operation classes.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Abstract unit of metered consumption.
pub type Tokens = u32;

/// A metered operation class. Each class has its own ledger row per tenant.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationClass {
    /// Text-to-speech synthesis.
    Tts,
    /// Speech-to-text transcription.
    Stt,
    VoiceClone,
}

impl OperationClass {
    pub const ALL: [OperationClass; 3] = [Self::Tts, Self::Stt, Self::VoiceClone];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tts => "tts",
            Self::Stt => "stt",
            Self::VoiceClone => "voice_clone",
        }
    }
}

impl std::fmt::Display for OperationClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown operation class: {0}")]
pub struct UnknownOperation(pub String);

impl FromStr for OperationClass {
    type Err = UnknownOperation;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tts" => Ok(Self::Tts),
            "stt" => Ok(Self::Stt),
            "voice_clone" => Ok(Self::VoiceClone),
            other => Err(UnknownOperation(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_class_str() {
        for op in OperationClass::ALL {
            assert_eq!(op.as_str().parse::<OperationClass>().unwrap(), op);
        }
        assert!("tts_hd".parse::<OperationClass>().is_err());
    }

    #[test]
    fn test_operation_class_serde() {
        let json = serde_json::to_string(&OperationClass::VoiceClone).unwrap();
        assert_eq!(json, "\"voice_clone\"");
    }
}
