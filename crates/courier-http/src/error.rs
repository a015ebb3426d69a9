//! Structured error responses for the bridge endpoint
//!
//! Every rejection carries a machine-readable code, a message, an optional
//! `details` object and the request id also returned in `X-Request-ID`.

use axum::{
    extract::Request,
    http::{
        StatusCode,
        header::{self, HeaderValue},
    },
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use courier_mesh::{MeshError, ValidationError};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{error, warn};

/// Maximum length for client-provided request IDs
const MAX_REQUEST_ID_LENGTH: usize = 128;

/// Correlation id for one HTTP request
///
/// Client-supplied ids must be at most 128 characters of ASCII alphanumerics,
/// hyphens and underscores. Anything else is replaced by a fresh UUID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Accept a client-provided id if it is well formed
    pub fn parse(id: &str) -> Option<Self> {
        validate_request_id(id).then(|| Self(id.to_string()))
    }

    /// Fresh random id
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Request extension carrying the id chosen by [`request_id_middleware`]
#[derive(Debug, Clone)]
pub struct RequestIdExtension(pub RequestId);

// Colons are excluded: they read as field separators in log lines.
fn validate_request_id(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= MAX_REQUEST_ID_LENGTH
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Middleware that extracts or generates the request id
///
/// Stores it in request extensions for handlers and echoes it in the
/// response `X-Request-ID` header.
pub async fn request_id_middleware(mut request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .and_then(RequestId::parse)
        .unwrap_or_else(RequestId::generate);

    request
        .extensions_mut()
        .insert(RequestIdExtension(request_id.clone()));

    let mut response = next.run(request).await;

    if let Ok(header_value) = HeaderValue::from_str(request_id.as_str()) {
        response.headers_mut().insert(
            header::HeaderName::from_static("x-request-id"),
            header_value,
        );
    }

    response
}

/// Type-safe error codes for bridge responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Body is not JSON
    InvalidJson,
    /// Body is JSON but not a valid envelope
    ValidationFailed,
    /// The pub/sub transport rejected or could not take the envelope
    PublishFailed,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidJson => "invalid_json",
            Self::ValidationFailed => "validation_failed",
            Self::PublishFailed => "publish_failed",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidJson => StatusCode::BAD_REQUEST,
            Self::ValidationFailed => StatusCode::UNPROCESSABLE_ENTITY,
            Self::PublishFailed => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Structured error body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Machine-readable error code
    pub error: String,
    /// Human-readable error message
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    pub request_id: RequestId,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl ErrorResponse {
    pub fn new(code: ErrorCode, message: impl Into<String>, request_id: RequestId) -> Self {
        Self {
            error: code.as_str().to_string(),
            message: message.into(),
            details: None,
            request_id,
            timestamp: chrono::Utc::now(),
        }
    }

    /// Attach additional context
    pub fn with_details<T: Serialize>(mut self, details: T) -> Self {
        self.details = serde_json::to_value(details).ok();
        self
    }
}

/// What went wrong while accepting an inbound envelope
#[derive(Debug, thiserror::Error)]
pub enum BridgeErrorKind {
    #[error("request body is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("invalid envelope: {0}")]
    Validation(#[from] ValidationError),

    #[error("failed to publish envelope: {0}")]
    Publish(#[from] MeshError),
}

/// Bridge endpoint error, tied to the request it answers
#[derive(Debug, thiserror::Error)]
#[error("{kind}")]
pub struct BridgeError {
    pub request_id: RequestId,
    pub kind: BridgeErrorKind,
}

impl BridgeError {
    pub fn new(kind: impl Into<BridgeErrorKind>, request_id: RequestId) -> Self {
        Self {
            request_id,
            kind: kind.into(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self.kind {
            BridgeErrorKind::InvalidJson(_) => ErrorCode::InvalidJson,
            BridgeErrorKind::Validation(_) => ErrorCode::ValidationFailed,
            BridgeErrorKind::Publish(_) => ErrorCode::PublishFailed,
        }
    }

    pub fn to_error_response(&self) -> ErrorResponse {
        let response = ErrorResponse::new(self.code(), self.to_string(), self.request_id.clone());
        match &self.kind {
            BridgeErrorKind::Validation(err) => match err.field() {
                Some(field) => response.with_details(serde_json::json!({ "field": field })),
                None => response,
            },
            _ => response,
        }
    }
}

impl IntoResponse for BridgeError {
    fn into_response(self) -> Response {
        let code = self.code();
        match &self.kind {
            BridgeErrorKind::Publish(e) => {
                error!(request_id = %self.request_id, error = %e, "Publish failed");
            }
            kind => {
                warn!(request_id = %self.request_id, code = %code, error = %kind, "Rejected envelope");
            }
        }
        (code.status(), Json(self.to_error_response())).into_response()
    }
}
