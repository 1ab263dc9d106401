//! Token cost policies.

use crate::provider::OperationRequest;
use crate::types::{OperationClass, Tokens};

/// Prices an operation before it is reserved. A controller holds exactly
/// one policy.
pub trait CostPolicy: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    fn cost(&self, request: &OperationRequest) -> Tokens;
}

/// A fixed number of tokens per request, independent of text length or
/// audio duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlatRateCostPolicy {
    tts: Tokens,
    stt: Tokens,
    voice_clone: Tokens,
}

impl Default for FlatRateCostPolicy {
    fn default() -> Self {
        Self {
            tts: 1,
            stt: 1,
            voice_clone: 1,
        }
    }
}

impl FlatRateCostPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the rate for one operation class. Zero is clamped to one.
    pub fn with_rate(mut self, operation: OperationClass, tokens: Tokens) -> Self {
        let tokens = tokens.max(1);
        match operation {
            OperationClass::Tts => self.tts = tokens,
            OperationClass::Stt => self.stt = tokens,
            OperationClass::VoiceClone => self.voice_clone = tokens,
        }
        self
    }

    pub fn rate(&self, operation: OperationClass) -> Tokens {
        match operation {
            OperationClass::Tts => self.tts,
            OperationClass::Stt => self.stt,
            OperationClass::VoiceClone => self.voice_clone,
        }
    }
}

impl CostPolicy for FlatRateCostPolicy {
    fn name(&self) -> &str {
        "flat_rate"
    }

    fn cost(&self, request: &OperationRequest) -> Tokens {
        self.rate(request.class())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entitlements::QualityTier;
    use crate::provider::SpeechParams;

    fn speech(text: &str) -> OperationRequest {
        OperationRequest::TextToSpeech(SpeechParams {
            text: text.into(),
            voice_id: "21m00Tcm4TlvDq8ikWAM".into(),
            quality: QualityTier::Standard,
            language: "en".into(),
        })
    }

    #[test]
    fn test_flat_rate_ignores_length() {
        let policy = FlatRateCostPolicy::new();
        assert_eq!(policy.cost(&speech("hi")), 1);
        assert_eq!(policy.cost(&speech(&"long text ".repeat(400))), 1);
    }

    #[test]
    fn test_rate_override_stays_positive() {
        let policy = FlatRateCostPolicy::new()
            .with_rate(OperationClass::VoiceClone, 5)
            .with_rate(OperationClass::Stt, 0);
        assert_eq!(policy.rate(OperationClass::VoiceClone), 5);
        assert_eq!(policy.rate(OperationClass::Stt), 1);
        assert_eq!(policy.rate(OperationClass::Tts), 1);
    }
}
