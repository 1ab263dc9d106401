//! Error to HTTP response mapping.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};
use tracing::error;

use crate::admission::AdmissionError;
use crate::store::StoreError;
use crate::{Error, ErrorCategory};

#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    BadRequest(String),
    NotFound(String),
    Service(Error),
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn status(&self) -> StatusCode {
        self.parts().0
    }

    fn parts(&self) -> (StatusCode, Value) {
        match self {
            Self::Unauthorized => (StatusCode::UNAUTHORIZED, json!({"error": "Unauthorized"})),
            Self::BadRequest(message) => (StatusCode::BAD_REQUEST, json!({"error": message})),
            Self::NotFound(what) => (
                StatusCode::NOT_FOUND,
                json!({"error": format!("{} not found", what)}),
            ),
            Self::Service(err) => service_parts(err),
        }
    }
}

fn service_parts(err: &Error) -> (StatusCode, Value) {
    match err {
        Error::Admission(AdmissionError::InsufficientTokens {
            operation,
            tokens_needed,
            tokens_remaining,
        }) => (
            StatusCode::PAYMENT_REQUIRED,
            json!({
                "error": "Insufficient tokens",
                "operation": operation.as_str(),
                "tokensNeeded": tokens_needed,
                "tokensRemaining": tokens_remaining,
            }),
        ),
        Error::Admission(AdmissionError::EntitlementDenied(denied)) => (
            StatusCode::FORBIDDEN,
            json!({
                "error": denied.to_string(),
                "capability": denied.capability,
                "requiredPlan": denied.required.map(|l| l.as_str()),
                "currentPlan": denied.current.as_str(),
            }),
        ),
        Error::Admission(AdmissionError::ProviderFailure { refunded, .. }) => (
            StatusCode::BAD_GATEWAY,
            json!({
                "error": "The audio provider failed, please try again",
                "refunded": refunded,
            }),
        ),
        other => {
            let status = match other.category() {
                ErrorCategory::Authorization => StatusCode::UNAUTHORIZED,
                ErrorCategory::InvalidInput => StatusCode::BAD_REQUEST,
                ErrorCategory::NotFound => StatusCode::NOT_FOUND,
                ErrorCategory::Unreconcilable => StatusCode::UNPROCESSABLE_ENTITY,
                ErrorCategory::Provider => StatusCode::BAD_GATEWAY,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            let message = if status.is_server_error() {
                "Internal server error".to_string()
            } else {
                other.to_string()
            };
            (status, json!({"error": message}))
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = self.parts();
        if status.is_server_error() {
            error!(status = status.as_u16(), error = ?self, "Request failed");
        }
        (status, Json(body)).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        match err {
            Error::Unauthorized => Self::Unauthorized,
            other => Self::Service(other),
        }
    }
}

impl From<AdmissionError> for ApiError {
    fn from(err: AdmissionError) -> Self {
        Self::Service(err.into())
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self::Service(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entitlements::{Capability, EntitlementDenied};
    use crate::plans::PlanLevel;
    use crate::types::OperationClass;

    #[test]
    fn test_insufficient_tokens_is_402_with_counts() {
        let err = ApiError::from(AdmissionError::InsufficientTokens {
            operation: OperationClass::Tts,
            tokens_needed: 1,
            tokens_remaining: 0,
        });
        let (status, body) = err.parts();
        assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
        assert_eq!(body["tokensNeeded"], 1);
        assert_eq!(body["tokensRemaining"], 0);
    }

    #[test]
    fn test_entitlement_denied_is_403() {
        let err = ApiError::from(AdmissionError::EntitlementDenied(EntitlementDenied {
            capability: Capability::voice("premium-voice"),
            required: Some(PlanLevel::Premium),
            current: PlanLevel::Starter,
        }));
        let (status, body) = err.parts();
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["requiredPlan"], "premium");
        assert_eq!(body["currentPlan"], "starter");
        assert_eq!(body["capability"], "voice:premium-voice");
    }

    #[test]
    fn test_status_mapping() {
        let provider = ApiError::from(AdmissionError::ProviderFailure {
            message: "boom".into(),
            refunded: true,
        });
        assert_eq!(provider.status(), StatusCode::BAD_GATEWAY);

        let invalid = ApiError::from(AdmissionError::InvalidRequest("text is empty".into()));
        assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);

        let storage = ApiError::from(StoreError::Storage {
            message: "pool timed out".into(),
        });
        let (status, body) = storage.parts();
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Internal server error");

        assert_eq!(ApiError::from(Error::Unauthorized).status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::NotFound("voice clone".into()).status(), StatusCode::NOT_FOUND);
    }
}
