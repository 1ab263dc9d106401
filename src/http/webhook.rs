//! Billing webhook endpoint.
//!
//! Answers 400 when the delivery is unsigned or malformed and 500 only for
//! transient failures, so the processor retries exactly those. Everything
//! else, including events needing manual review, is acknowledged with 200.

use axum::Json;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use bytes::Bytes;
use serde_json::{Value, json};
use tracing::error;

use super::AppState;
use crate::billing::{ReconcileError, SIGNATURE_HEADER};

pub(super) async fn billing_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());
    match state.service.handle_webhook(&body, signature).await {
        Ok(outcome) => (
            StatusCode::OK,
            Json(json!({"received": true, "outcome": outcome.as_str()})),
        ),
        Err(ReconcileError::InvalidEvent(reason)) => {
            (StatusCode::BAD_REQUEST, Json(json!({"error": reason})))
        }
        Err(e @ ReconcileError::Unreconcilable { .. }) => (
            StatusCode::OK,
            Json(json!({
                "received": true,
                "outcome": "unreconcilable",
                "error": e.to_string(),
            })),
        ),
        Err(e) => {
            error!(error = %e, "Billing webhook failed; processor will retry");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "Temporarily unable to process event"})),
            )
        }
    }
}
