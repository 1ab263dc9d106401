//! ElevenLabs HTTP client.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;

use super::{
    AudioOpProvider, CloneParams, OperationOutput, OperationRequest, ProviderError,
    ProviderResult, SpeechParams, TranscriptionParams,
};
use crate::entitlements::QualityTier;
use crate::voices::TrainingStatus;

const BASE_URL: &str = "https://api.elevenlabs.io";
const MODEL_MONOLINGUAL: &str = "eleven_monolingual_v1";
const MODEL_MULTILINGUAL: &str = "eleven_multilingual_v2";
const MODEL_TRANSCRIBE: &str = "scribe_v1";

#[derive(Clone)]
pub struct ElevenLabsConfig {
    pub api_key: SecretString,
    pub base_url: String,
    pub timeout: Duration,
}

impl ElevenLabsConfig {
    pub fn new(api_key: SecretString) -> Self {
        Self {
            api_key,
            base_url: BASE_URL.into(),
            timeout: Duration::from_secs(60),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl std::fmt::Debug for ElevenLabsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElevenLabsConfig")
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct ElevenLabsProvider {
    http: reqwest::Client,
    config: ElevenLabsConfig,
}

#[derive(Deserialize)]
struct TranscriptionResponse {
    text: String,
    #[serde(default)]
    language_code: Option<String>,
}

#[derive(Deserialize)]
struct AddVoiceResponse {
    voice_id: String,
}

impl ElevenLabsProvider {
    pub fn new(config: ElevenLabsConfig) -> ProviderResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(ProviderError::Network)?;
        Ok(Self { http, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn model_for(quality: QualityTier, language: &str) -> &'static str {
        if quality == QualityTier::High || language != "en" {
            MODEL_MULTILINGUAL
        } else {
            MODEL_MONOLINGUAL
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> ProviderResult<reqwest::Response> {
        let response = request
            .header("xi-api-key", self.config.api_key.expose_secret())
            .send()
            .await
            .map_err(ProviderError::from_send)?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        tracing::warn!(status = status.as_u16(), body = %body, "ElevenLabs request rejected");
        Err(ProviderError::failed(Some(status.as_u16()), body))
    }

    async fn synthesize(&self, params: &SpeechParams) -> ProviderResult<OperationOutput> {
        let body = json!({
            "text": params.text,
            "model_id": Self::model_for(params.quality, &params.language),
            "voice_settings": {
                "stability": 0.5,
                "similarity_boost": 0.5,
                "style": 0,
                "use_speaker_boost": true,
            },
        });
        let response = self
            .send(
                self.http
                    .post(self.url(&format!("/v1/text-to-speech/{}", params.voice_id)))
                    .header("accept", "audio/mpeg")
                    .json(&body),
            )
            .await?;

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("audio/mpeg")
            .to_string();
        let audio = response.bytes().await.map_err(body_err)?;
        if audio.is_empty() {
            return Err(ProviderError::Uncertain("empty audio body".into()));
        }
        Ok(OperationOutput::Speech {
            audio,
            content_type,
        })
    }

    async fn transcribe(&self, params: &TranscriptionParams) -> ProviderResult<OperationOutput> {
        let mut form = Form::new()
            .part("file", file_part(&params.audio, &params.filename)?)
            .text("model_id", MODEL_TRANSCRIBE);
        if !params.language.is_empty() {
            form = form.text("language_code", params.language.clone());
        }
        let response = self
            .send(self.http.post(self.url("/v1/speech-to-text")).multipart(form))
            .await?;
        let parsed: TranscriptionResponse = response.json().await.map_err(body_err)?;
        Ok(OperationOutput::Transcription {
            text: parsed.text,
            language: parsed.language_code,
        })
    }

    async fn clone_voice(&self, params: &CloneParams) -> ProviderResult<OperationOutput> {
        let mut form = Form::new()
            .text("name", params.name.clone())
            .part("files", file_part(&params.sample, &params.filename)?);
        if let Some(description) = &params.description {
            form = form.text("description", description.clone());
        }
        let response = self
            .send(self.http.post(self.url("/v1/voices/add")).multipart(form))
            .await?;
        let parsed: AddVoiceResponse = response.json().await.map_err(body_err)?;
        Ok(OperationOutput::VoiceCloned {
            voice_id: parsed.voice_id,
        })
    }
}

fn file_part(data: &Bytes, filename: &str) -> ProviderResult<Part> {
    Part::bytes(data.to_vec())
        .file_name(filename.to_string())
        .mime_str("application/octet-stream")
        .map_err(ProviderError::Network)
}

/// A 2xx whose body could not be read: the work was likely done.
fn body_err(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout
    } else {
        ProviderError::Uncertain(err.to_string())
    }
}

#[async_trait]
impl AudioOpProvider for ElevenLabsProvider {
    fn name(&self) -> &str {
        "elevenlabs"
    }

    async fn run(&self, request: &OperationRequest) -> ProviderResult<OperationOutput> {
        match request {
            OperationRequest::TextToSpeech(p) => self.synthesize(p).await,
            OperationRequest::SpeechToText(p) => self.transcribe(p).await,
            OperationRequest::VoiceClone(p) => self.clone_voice(p).await,
        }
    }

    async fn voice_status(&self, voice_id: &str) -> ProviderResult<TrainingStatus> {
        let response = self
            .http
            .get(self.url(&format!("/v1/voices/{}", voice_id)))
            .header("xi-api-key", self.config.api_key.expose_secret())
            .send()
            .await
            .map_err(ProviderError::from_send)?;
        match response.status().as_u16() {
            200..=299 => Ok(TrainingStatus::Ready),
            404 => Ok(TrainingStatus::Failed),
            status => Err(ProviderError::failed(
                Some(status),
                response.text().await.unwrap_or_default(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(server: &MockServer) -> ElevenLabsProvider {
        ElevenLabsProvider::new(
            ElevenLabsConfig::new(SecretString::from("test-key".to_string()))
                .with_base_url(server.uri())
                .with_timeout(Duration::from_millis(500)),
        )
        .unwrap()
    }

    fn speech(quality: QualityTier) -> OperationRequest {
        OperationRequest::TextToSpeech(SpeechParams {
            text: "Hello there".into(),
            voice_id: "voice123".into(),
            quality,
            language: "en".into(),
        })
    }

    #[tokio::test]
    async fn test_synthesize_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/text-to-speech/voice123"))
            .and(header("xi-api-key", "test-key"))
            .and(body_partial_json(json!({"model_id": MODEL_MULTILINGUAL})))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "audio/mpeg")
                    .set_body_bytes(b"ID3audio".to_vec()),
            )
            .expect(1)
            .mount(&server)
            .await;

        let out = provider(&server).run(&speech(QualityTier::High)).await.unwrap();
        match out {
            OperationOutput::Speech { audio, content_type } => {
                assert_eq!(&audio[..], b"ID3audio");
                assert_eq!(content_type, "audio/mpeg");
            }
            other => panic!("unexpected output {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_server_error_is_definite_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let err = provider(&server)
            .run(&speech(QualityTier::Standard))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Failed { status: Some(503), .. }));
        assert!(!err.is_ambiguous());
    }

    #[tokio::test]
    async fn test_slow_provider_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(b"late".to_vec())
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&server)
            .await;

        let err = provider(&server)
            .run(&speech(QualityTier::Standard))
            .await
            .unwrap_err();
        assert!(err.is_ambiguous(), "{err:?}");
    }

    #[tokio::test]
    async fn test_undecodable_success_is_uncertain() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/voices/add"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let req = OperationRequest::VoiceClone(CloneParams {
            name: "Mine".into(),
            description: Some("my voice".into()),
            sample: Bytes::from_static(b"RIFF"),
            filename: "me.wav".into(),
        });
        let err = provider(&server).run(&req).await.unwrap_err();
        assert!(matches!(err, ProviderError::Uncertain(_)));
    }

    #[tokio::test]
    async fn test_transcribe_and_clone() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/speech-to-text"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"text": "hello world", "language_code": "en"})),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/voices/add"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"voice_id": "cl_1"})))
            .mount(&server)
            .await;

        let p = provider(&server);
        let stt = p
            .run(&OperationRequest::SpeechToText(TranscriptionParams {
                audio: Bytes::from_static(b"audio"),
                filename: "memo.mp3".into(),
                language: "en".into(),
            }))
            .await
            .unwrap();
        assert_eq!(
            stt,
            OperationOutput::Transcription {
                text: "hello world".into(),
                language: Some("en".into()),
            }
        );

        let cloned = p
            .run(&OperationRequest::VoiceClone(CloneParams {
                name: "Mine".into(),
                description: None,
                sample: Bytes::from_static(b"RIFF"),
                filename: "me.wav".into(),
            }))
            .await
            .unwrap();
        assert_eq!(
            cloned,
            OperationOutput::VoiceCloned {
                voice_id: "cl_1".into()
            }
        );
    }

    #[tokio::test]
    async fn test_voice_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/voices/cl_1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"voice_id": "cl_1"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/voices/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let p = provider(&server);
        assert_eq!(p.voice_status("cl_1").await.unwrap(), TrainingStatus::Ready);
        assert_eq!(p.voice_status("gone").await.unwrap(), TrainingStatus::Failed);
    }

    #[test]
    fn test_model_selection() {
        assert_eq!(
            ElevenLabsProvider::model_for(QualityTier::Standard, "en"),
            MODEL_MONOLINGUAL
        );
        assert_eq!(
            ElevenLabsProvider::model_for(QualityTier::Standard, "fr"),
            MODEL_MULTILINGUAL
        );
    }
}
