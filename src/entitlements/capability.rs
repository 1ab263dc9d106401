//! Gated capabilities and the minimum plan level each one requires.

use std::collections::HashMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::plans::PlanLevel;

#[derive(Clone, Copy, Debug, Default, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityTier {
    #[default]
    Standard,
    High,
}

impl QualityTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::High => "high",
        }
    }
}

impl FromStr for QualityTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "standard" => Ok(Self::Standard),
            "high" => Ok(Self::High),
            other => Err(format!("unknown quality tier: {}", other)),
        }
    }
}

/// A capability gated by plan level.
///
/// String form is `kind:value`, e.g. `voice:21m00Tcm4TlvDq8ikWAM`,
/// `language:fr`, `quality:high`, `feature:voice_cloning`.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Capability {
    Voice(String),
    Language(String),
    Quality(QualityTier),
    VoiceCloning,
}

impl Capability {
    pub fn voice(id: impl Into<String>) -> Self {
        Self::Voice(id.into())
    }

    pub fn language(code: impl AsRef<str>) -> Self {
        Self::Language(code.as_ref().to_ascii_lowercase())
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Voice(id) => write!(f, "voice:{}", id),
            Self::Language(code) => write!(f, "language:{}", code),
            Self::Quality(tier) => write!(f, "quality:{}", tier.as_str()),
            Self::VoiceCloning => f.write_str("feature:voice_cloning"),
        }
    }
}

impl FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, value) = s
            .split_once(':')
            .ok_or_else(|| format!("invalid capability id: {}", s))?;
        if value.is_empty() {
            return Err(format!("invalid capability id: {}", s));
        }
        match kind {
            "voice" => Ok(Self::voice(value)),
            "language" => Ok(Self::language(value)),
            "quality" => value.parse().map(Self::Quality),
            "feature" if value == "voice_cloning" => Ok(Self::VoiceCloning),
            _ => Err(format!("invalid capability id: {}", s)),
        }
    }
}

impl From<Capability> for String {
    fn from(c: Capability) -> Self {
        c.to_string()
    }
}

impl TryFrom<String> for Capability {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Minimum plan level per capability. Capabilities that are not registered
/// are denied on every plan.
#[derive(Debug, Clone, Default)]
pub struct CapabilityRegistry {
    required: HashMap<Capability, PlanLevel>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::new()
            .require(Capability::Quality(QualityTier::Standard), PlanLevel::Free)
            .require(Capability::Quality(QualityTier::High), PlanLevel::Starter)
            .require(Capability::VoiceCloning, PlanLevel::Pro);

        registry = registry.require(Capability::language("en"), PlanLevel::Free);
        for code in ["es", "fr", "de", "it", "pt"] {
            registry = registry.require(Capability::language(code), PlanLevel::Starter);
        }
        for code in ["nl", "pl", "sv", "ru", "ja", "ko", "zh", "hi", "ar", "tr"] {
            registry = registry.require(Capability::language(code), PlanLevel::Pro);
        }

        for (voice, level) in [
            ("21m00Tcm4TlvDq8ikWAM", PlanLevel::Free),
            ("AZnzlk1XvdvUeBnXmlld", PlanLevel::Free),
            ("EXAVITQu4vr4xnSDxMaL", PlanLevel::Starter),
            ("ErXwobaYiN019PkySvjV", PlanLevel::Starter),
            ("MF3mDGzJIvQcZGZjSpoT", PlanLevel::Pro),
            ("TxGEqnHWrfWFTfGW9XjX", PlanLevel::Pro),
            ("VR6AewLTigWG4xSOukaG", PlanLevel::Premium),
            ("pNInz6obpgDQGcFmaJgB", PlanLevel::Premium),
            ("yoZ06aMxZJJ28mfd3POQ", PlanLevel::Enterprise),
        ] {
            registry = registry.require(Capability::voice(voice), level);
        }
        registry
    }

    pub fn require(mut self, capability: Capability, level: PlanLevel) -> Self {
        self.required.insert(capability, level);
        self
    }

    pub fn required_level(&self, capability: &Capability) -> Option<PlanLevel> {
        self.required.get(capability).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Capability, PlanLevel)> {
        self.required.iter().map(|(c, l)| (c, *l))
    }

    pub fn len(&self) -> usize {
        self.required.len()
    }

    pub fn is_empty(&self) -> bool {
        self.required.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_parse_roundtrip() {
        for id in [
            "voice:21m00Tcm4TlvDq8ikWAM",
            "language:fr",
            "quality:high",
            "feature:voice_cloning",
        ] {
            let cap: Capability = id.parse().unwrap();
            assert_eq!(cap.to_string(), id);
        }
    }

    #[test]
    fn test_capability_parse_invalid() {
        assert!("voice".parse::<Capability>().is_err());
        assert!("voice:".parse::<Capability>().is_err());
        assert!("quality:ultra".parse::<Capability>().is_err());
        assert!("feature:teleport".parse::<Capability>().is_err());
    }

    #[test]
    fn test_language_normalized() {
        assert_eq!(Capability::language("FR"), Capability::language("fr"));
    }

    #[test]
    fn test_default_registry_levels() {
        let registry = CapabilityRegistry::with_defaults();
        assert_eq!(
            registry.required_level(&Capability::Quality(QualityTier::High)),
            Some(PlanLevel::Starter)
        );
        assert_eq!(
            registry.required_level(&Capability::VoiceCloning),
            Some(PlanLevel::Pro)
        );
        assert_eq!(registry.required_level(&Capability::voice("unknown")), None);
    }

    #[test]
    fn test_capability_serde_as_string() {
        let json = serde_json::to_string(&Capability::language("de")).unwrap();
        assert_eq!(json, "\"language:de\"");
        let back: Capability = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Capability::language("de"));
    }
}
