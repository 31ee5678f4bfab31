//! API error types with structured JSON responses.

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::authorization::Capability;
use crate::core_state::CoreError;
use crate::models::enums::OrderStatus;

/// Seconds a client should wait before retrying a timed-out request.
const RETRY_AFTER_SECS: u64 = 1;

/// Structured error response body.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<OrderStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<OrderStatus>,
}

/// API-level errors with HTTP status mapping.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Authentication required")]
    Unauthorized,
    #[error("Role may not {}", .0.as_str())]
    Forbidden(Capability),
    #[error("{field}: {message}")]
    Validation { field: String, message: String },
    #[error("Invalid request: {0}")]
    BadRequest(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: OrderStatus, to: OrderStatus },
    #[error("Timed out: {0}")]
    Timeout(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// HTTP status and JSON detail for this error.
    pub fn status_and_detail(&self) -> (StatusCode, ErrorDetail) {
        let mut detail = ErrorDetail {
            code: "INTERNAL",
            message: self.to_string(),
            field: None,
            from: None,
            to: None,
        };
        let status = match self {
            ApiError::Unauthorized => {
                detail.code = "AUTH_REQUIRED";
                StatusCode::UNAUTHORIZED
            }
            ApiError::Forbidden(_) => {
                detail.code = "FORBIDDEN";
                StatusCode::FORBIDDEN
            }
            ApiError::Validation { field, .. } => {
                detail.code = "VALIDATION_FAILED";
                detail.field = Some(field.clone());
                StatusCode::BAD_REQUEST
            }
            ApiError::BadRequest(_) => {
                detail.code = "BAD_REQUEST";
                StatusCode::BAD_REQUEST
            }
            ApiError::NotFound(_) => {
                detail.code = "NOT_FOUND";
                StatusCode::NOT_FOUND
            }
            ApiError::Conflict(_) => {
                detail.code = "CONFLICT";
                StatusCode::CONFLICT
            }
            ApiError::InvalidTransition { from, to } => {
                detail.code = "INVALID_TRANSITION";
                detail.from = Some(*from);
                detail.to = Some(*to);
                StatusCode::CONFLICT
            }
            ApiError::Timeout(_) => {
                detail.code = "TIMEOUT";
                StatusCode::SERVICE_UNAVAILABLE
            }
            ApiError::Internal(reason) => {
                tracing::error!(reason, "API internal error");
                detail.message = "An internal error occurred".to_string();
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, detail)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = self.status_and_detail();
        let mut response = (status, Json(ErrorBody { error: detail })).into_response();
        if let ApiError::Timeout(_) = &self {
            response.headers_mut().insert(
                "Retry-After",
                HeaderValue::from_str(&RETRY_AFTER_SECS.to_string())
                    .unwrap_or(HeaderValue::from_static("1")),
            );
        }
        response
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Validation(v) => ApiError::Validation {
                field: v.field,
                message: v.message,
            },
            e @ CoreError::NotFound { .. } => ApiError::NotFound(e.to_string()),
            CoreError::Conflict(reason) => ApiError::Conflict(reason),
            CoreError::InvalidTransition { from, to } => ApiError::InvalidTransition { from, to },
            CoreError::Timeout(reason) => ApiError::Timeout(reason),
            CoreError::LockPoisoned => ApiError::Internal("lock poisoned".into()),
            CoreError::Database(e) => ApiError::Internal(e.to_string()),
            CoreError::Config(e) => ApiError::Internal(e.to_string()),
            CoreError::Io(e) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validator::ValidationError;
    use http_body_util::BodyExt;

    async fn json_of(response: Response) -> serde_json::Value {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn unauthorized_returns_401() {
        let response = ApiError::Unauthorized.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_of(response).await["error"]["code"], "AUTH_REQUIRED");
    }

    #[tokio::test]
    async fn validation_names_the_field() {
        let api_err: ApiError =
            CoreError::from(ValidationError::new("Hemoglobin", "must be a number")).into();
        let response = api_err.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = json_of(response).await;
        assert_eq!(json["error"]["code"], "VALIDATION_FAILED");
        assert_eq!(json["error"]["field"], "Hemoglobin");
    }

    #[tokio::test]
    async fn invalid_transition_names_both_states() {
        let response = ApiError::InvalidTransition {
            from: OrderStatus::Approved,
            to: OrderStatus::Cancelled,
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let json = json_of(response).await;
        assert_eq!(json["error"]["code"], "INVALID_TRANSITION");
        assert_eq!(json["error"]["from"], "approved");
        assert_eq!(json["error"]["to"], "cancelled");
    }

    #[tokio::test]
    async fn timeout_returns_503_with_retry_after() {
        let response = ApiError::Timeout("busy".into()).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers().get("Retry-After").unwrap(), "1");
        assert_eq!(json_of(response).await["error"]["code"], "TIMEOUT");
    }

    #[tokio::test]
    async fn conflict_and_not_found() {
        let response = ApiError::from(CoreError::Conflict("stale".into())).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let response = ApiError::from(CoreError::not_found("TestOrder", "x")).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn forbidden_returns_403() {
        let response = ApiError::Forbidden(Capability::ManageCatalog).into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(json_of(response).await["error"]["code"], "FORBIDDEN");
    }

    #[tokio::test]
    async fn internal_hides_details() {
        let response = ApiError::Internal("disk on fire".into()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = json_of(response).await;
        assert_eq!(json["error"]["message"], "An internal error occurred");
    }
}
