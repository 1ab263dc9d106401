//! AI audio providers invoked after a successful reservation.

mod elevenlabs;
mod scripted;

pub use elevenlabs::{ElevenLabsConfig, ElevenLabsProvider};
pub use scripted::ScriptedProvider;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;
use thiserror::Error;

use crate::entitlements::QualityTier;
use crate::types::{OperationClass, UsageId};
use crate::usage::preview;
use crate::voices::TrainingStatus;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Provider request failed{}: {message}", .status.map(|s| format!(" ({})", s)).unwrap_or_default())]
    Failed { status: Option<u16>, message: String },

    #[error("Provider call timed out")]
    Timeout,

    #[error("Provider outcome uncertain: {0}")]
    Uncertain(String),

    #[error("Operation not supported by provider: {0}")]
    NotSupported(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
}

impl ProviderError {
    pub fn failed(status: Option<u16>, message: impl Into<String>) -> Self {
        Self::Failed {
            status,
            message: message.into(),
        }
    }

    /// Whether the provider may have done (and billed) the work. Such
    /// failures keep the token charge.
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, Self::Timeout | Self::Uncertain(_))
    }

    /// Classify a transport error raised while sending a request.
    pub(crate) fn from_send(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_connect() {
            Self::failed(None, err.to_string())
        } else if err.is_builder() || err.is_request() {
            Self::Network(err)
        } else {
            Self::Uncertain(err.to_string())
        }
    }
}

pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

pub const MAX_TEXT_CHARS: usize = 5000;
const DESCRIPTOR_PREVIEW_CHARS: usize = 100;

#[derive(Clone, Debug, PartialEq)]
pub struct SpeechParams {
    pub text: String,
    pub voice_id: String,
    pub quality: QualityTier,
    pub language: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TranscriptionParams {
    pub audio: Bytes,
    pub filename: String,
    pub language: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CloneParams {
    pub name: String,
    pub description: Option<String>,
    pub sample: Bytes,
    pub filename: String,
}

/// A validated metered operation.
#[derive(Clone, Debug, PartialEq)]
pub enum OperationRequest {
    TextToSpeech(SpeechParams),
    SpeechToText(TranscriptionParams),
    VoiceClone(CloneParams),
}

impl OperationRequest {
    pub fn class(&self) -> OperationClass {
        match self {
            Self::TextToSpeech(_) => OperationClass::Tts,
            Self::SpeechToText(_) => OperationClass::Stt,
            Self::VoiceClone(_) => OperationClass::VoiceClone,
        }
    }

    pub fn voice_id(&self) -> Option<&str> {
        match self {
            Self::TextToSpeech(p) => Some(&p.voice_id),
            _ => None,
        }
    }

    pub fn input_descriptor(&self) -> String {
        match self {
            Self::TextToSpeech(p) => preview(&p.text, DESCRIPTOR_PREVIEW_CHARS),
            Self::SpeechToText(p) => format!("Audio file: {}", p.filename),
            Self::VoiceClone(p) => format!("Voice clone: {}", p.name),
        }
    }

    pub fn metadata(&self) -> serde_json::Value {
        match self {
            Self::TextToSpeech(p) => json!({
                "quality": p.quality.as_str(),
                "language": p.language,
                "characters": p.text.chars().count(),
            }),
            Self::SpeechToText(p) => json!({
                "language": p.language,
                "fileSize": p.audio.len(),
            }),
            Self::VoiceClone(p) => json!({
                "filename": p.filename,
                "fileSize": p.sample.len(),
            }),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum OperationOutput {
    Speech { audio: Bytes, content_type: String },
    Transcription { text: String, language: Option<String> },
    VoiceCloned { voice_id: String },
}

impl OperationOutput {
    /// Reference recorded on the usage row.
    pub fn output_ref(&self, usage_id: UsageId) -> String {
        match self {
            Self::Speech { .. } => format!("tts_{}.mp3", usage_id),
            Self::Transcription { .. } => format!("stt_{}.txt", usage_id),
            Self::VoiceCloned { voice_id } => voice_id.clone(),
        }
    }

    pub fn matches(&self, class: OperationClass) -> bool {
        matches!(
            (self, class),
            (Self::Speech { .. }, OperationClass::Tts)
                | (Self::Transcription { .. }, OperationClass::Stt)
                | (Self::VoiceCloned { .. }, OperationClass::VoiceClone)
        )
    }
}

/// An external AI audio service.
#[async_trait]
pub trait AudioOpProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, request: &OperationRequest) -> ProviderResult<OperationOutput>;

    /// Training status of a cloned voice.
    async fn voice_status(&self, voice_id: &str) -> ProviderResult<TrainingStatus> {
        Err(ProviderError::NotSupported(format!("voice status for {}", voice_id)))
    }
}

/// Stands in when no provider credentials are configured. Every call fails
/// definitively, so reservations are refunded.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledProvider;

#[async_trait]
impl AudioOpProvider for DisabledProvider {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn run(&self, request: &OperationRequest) -> ProviderResult<OperationOutput> {
        Err(ProviderError::NotSupported(format!(
            "{} (no provider configured)",
            request.class()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ambiguous_errors_keep_charge() {
        assert!(ProviderError::Timeout.is_ambiguous());
        assert!(ProviderError::Uncertain("eof".into()).is_ambiguous());
        assert!(!ProviderError::failed(Some(503), "busy").is_ambiguous());
        assert!(!ProviderError::NotSupported("x".into()).is_ambiguous());
    }

    #[test]
    fn test_failed_display_includes_status() {
        assert_eq!(
            ProviderError::failed(Some(500), "boom").to_string(),
            "Provider request failed (500): boom"
        );
        assert_eq!(
            ProviderError::failed(None, "refused").to_string(),
            "Provider request failed: refused"
        );
    }

    #[test]
    fn test_request_descriptors() {
        let tts = OperationRequest::TextToSpeech(SpeechParams {
            text: "a".repeat(150),
            voice_id: "v1".into(),
            quality: QualityTier::High,
            language: "en".into(),
        });
        assert_eq!(tts.class(), OperationClass::Tts);
        assert_eq!(tts.voice_id(), Some("v1"));
        assert_eq!(tts.input_descriptor().chars().count(), 103);
        assert_eq!(tts.metadata()["characters"], 150);

        let stt = OperationRequest::SpeechToText(TranscriptionParams {
            audio: Bytes::from_static(b"abc"),
            filename: "memo.mp3".into(),
            language: "en".into(),
        });
        assert_eq!(stt.input_descriptor(), "Audio file: memo.mp3");
        assert_eq!(stt.voice_id(), None);
    }

    #[test]
    fn test_output_ref_and_match() {
        let id = UsageId::new();
        let out = OperationOutput::VoiceCloned {
            voice_id: "v_9".into(),
        };
        assert_eq!(out.output_ref(id), "v_9");
        assert!(out.matches(OperationClass::VoiceClone));
        assert!(!out.matches(OperationClass::Tts));
    }

    #[tokio::test]
    async fn test_disabled_provider_fails_definitively() {
        let req = OperationRequest::VoiceClone(CloneParams {
            name: "me".into(),
            description: None,
            sample: Bytes::from_static(b"x"),
            filename: "me.wav".into(),
        });
        let err = DisabledProvider.run(&req).await.unwrap_err();
        assert!(!err.is_ambiguous());
    }
}
