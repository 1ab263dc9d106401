//! Request handlers. Bodies are validated here, before admission.

use axum::Json;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::{ApiError, AppState, Tenant};
use crate::entitlements::{PlanEntitlements, QualityTier};
use crate::plans::Plan;
use crate::provider::{
    CloneParams, MAX_TEXT_CHARS, OperationOutput, OperationRequest, SpeechParams,
    TranscriptionParams,
};
use crate::service::{SubscriptionView, UsageOverview};
use crate::types::Tokens;
use crate::usage::HistoryPeriod;
use crate::voices::{TrainingStatus, VoiceClone};

const DEFAULT_LANGUAGE: &str = "en";

type ApiResult<T> = Result<Json<T>, ApiError>;

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| ApiError::bad_request(rejection.body_text()))
}

fn required(field: &str, value: String) -> Result<String, ApiError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ApiError::bad_request(format!("{} is required", field)));
    }
    Ok(trimmed.to_string())
}

fn language(value: Option<String>) -> String {
    value
        .map(|l| l.trim().to_ascii_lowercase())
        .filter(|l| !l.is_empty())
        .unwrap_or_else(|| DEFAULT_LANGUAGE.to_string())
}

fn decode_base64(field: &str, value: &str) -> Result<Bytes, ApiError> {
    let bytes = BASE64
        .decode(value.trim())
        .map_err(|e| ApiError::bad_request(format!("{} is not valid base64: {}", field, e)))?;
    if bytes.is_empty() {
        return Err(ApiError::bad_request(format!("{} is empty", field)));
    }
    Ok(Bytes::from(bytes))
}

pub(super) async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

pub(super) async fn plans(State(state): State<AppState>) -> Json<Vec<Plan>> {
    Json(
        state
            .service
            .catalog()
            .list()
            .into_iter()
            .filter(|p| p.active)
            .cloned()
            .collect(),
    )
}

#[derive(Debug, Deserialize)]
pub(super) struct SpeechBody {
    text: String,
    voice: String,
    #[serde(default)]
    quality: Option<String>,
    #[serde(default)]
    language: Option<String>,
}

impl SpeechBody {
    fn into_request(self) -> Result<OperationRequest, ApiError> {
        let text = required("text", self.text)?;
        if text.chars().count() > MAX_TEXT_CHARS {
            return Err(ApiError::bad_request(format!(
                "text is limited to {} characters",
                MAX_TEXT_CHARS
            )));
        }
        let quality = match self.quality.as_deref().map(str::trim) {
            None | Some("") => QualityTier::Standard,
            Some(raw) => raw.parse().map_err(ApiError::BadRequest)?,
        };
        Ok(OperationRequest::TextToSpeech(SpeechParams {
            text,
            voice_id: required("voice", self.voice)?,
            quality,
            language: language(self.language),
        }))
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct SpeechResponse {
    audio: String,
    content_type: String,
    filename: String,
    tokens_used: Tokens,
    tokens_remaining: Tokens,
}

pub(super) async fn text_to_speech(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    payload: Result<Json<SpeechBody>, JsonRejection>,
) -> ApiResult<SpeechResponse> {
    let request = body(payload)?.into_request()?;
    let metered = state.service.execute(&tenant, request).await?;
    let OperationOutput::Speech {
        audio,
        content_type,
    } = metered.output
    else {
        return Err(ApiError::Service(crate::Error::InvalidRequest(
            "provider returned a non-speech result".into(),
        )));
    };
    Ok(Json(SpeechResponse {
        audio: BASE64.encode(&audio),
        content_type,
        filename: metered.output_ref,
        tokens_used: metered.reservation.cost,
        tokens_remaining: metered.reservation.tokens_remaining(),
    }))
}

#[derive(Debug, Deserialize)]
pub(super) struct TranscriptionBody {
    audio: String,
    filename: String,
    #[serde(default)]
    language: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct TranscriptionResponse {
    transcription: String,
    language: String,
    tokens_used: Tokens,
    tokens_remaining: Tokens,
}

pub(super) async fn speech_to_text(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    payload: Result<Json<TranscriptionBody>, JsonRejection>,
) -> ApiResult<TranscriptionResponse> {
    let payload = body(payload)?;
    let requested_language = language(payload.language);
    let request = OperationRequest::SpeechToText(TranscriptionParams {
        audio: decode_base64("audio", &payload.audio)?,
        filename: required("filename", payload.filename)?,
        language: requested_language.clone(),
    });
    let metered = state.service.execute(&tenant, request).await?;
    let OperationOutput::Transcription { text, language } = metered.output else {
        return Err(ApiError::Service(crate::Error::InvalidRequest(
            "provider returned a non-transcription result".into(),
        )));
    };
    Ok(Json(TranscriptionResponse {
        transcription: text,
        language: language.unwrap_or(requested_language),
        tokens_used: metered.reservation.cost,
        tokens_remaining: metered.reservation.tokens_remaining(),
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct CloneBody {
    voice_name: String,
    #[serde(default)]
    description: Option<String>,
    sample: String,
    filename: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct CloneResponse {
    voice_id: String,
    voice_name: String,
    status: TrainingStatus,
    tokens_used: Tokens,
    tokens_remaining: Tokens,
}

pub(super) async fn voice_clone(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    payload: Result<Json<CloneBody>, JsonRejection>,
) -> ApiResult<CloneResponse> {
    let payload = body(payload)?;
    let name = required("voiceName", payload.voice_name)?;
    let request = OperationRequest::VoiceClone(CloneParams {
        name: name.clone(),
        description: payload.description.filter(|d| !d.trim().is_empty()),
        sample: decode_base64("sample", &payload.sample)?,
        filename: required("filename", payload.filename)?,
    });
    let metered = state.service.execute(&tenant, request).await?;
    let status = metered
        .voice_clone
        .as_ref()
        .map(|c| c.status)
        .unwrap_or(TrainingStatus::Training);
    Ok(Json(CloneResponse {
        voice_id: metered.output_ref,
        voice_name: name,
        status,
        tokens_used: metered.reservation.cost,
        tokens_remaining: metered.reservation.tokens_remaining(),
    }))
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct UsageQuery {
    #[serde(default)]
    period: Option<HistoryPeriod>,
}

pub(super) async fn usage(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    query: Result<Query<UsageQuery>, QueryRejection>,
) -> ApiResult<UsageOverview> {
    let Query(query) = query.map_err(|r| ApiError::bad_request(r.body_text()))?;
    let overview = state
        .service
        .usage_overview(&tenant, query.period.unwrap_or_default())
        .await?;
    Ok(Json(overview))
}

pub(super) async fn subscription(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
) -> ApiResult<Option<SubscriptionView>> {
    Ok(Json(state.service.subscription(&tenant).await?))
}

pub(super) async fn entitlements(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
) -> ApiResult<PlanEntitlements> {
    Ok(Json(state.service.entitlements(&tenant).await?))
}

pub(super) async fn list_voice_clones(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
) -> ApiResult<Vec<VoiceClone>> {
    Ok(Json(state.service.list_voice_clones(&tenant).await?))
}

pub(super) async fn get_voice_clone(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path(voice_id): Path<String>,
) -> ApiResult<VoiceClone> {
    state
        .service
        .voice_clone(&tenant, &voice_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("voice clone".into()))
}

pub(super) async fn delete_voice_clone(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path(voice_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.service.delete_voice_clone(&tenant, &voice_id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound("voice clone".into()))
    }
}
