//! Registry errors and JSON error responses for the admin API

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use thiserror::Error;

/// Failures returned by registry operations.
///
/// Validation, duplicate and not-found errors are raised before any mutation
/// takes place, so callers never observe a partial write.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// Input failed shape or range validation
    #[error("{message}")]
    Validation { field: &'static str, message: String },

    /// Another enabled route already serves this path
    #[error("Route with path '{0}' already exists")]
    DuplicatePath(String),

    /// No route with this id
    #[error("Route not found: {0}")]
    NotFound(String),

    /// The operation could not run to completion
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RegistryError {
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        RegistryError::Validation {
            field,
            message: message.into(),
        }
    }

    /// Stable machine-readable kind
    pub fn kind(&self) -> &'static str {
        match self {
            RegistryError::Validation { .. } => "validation_error",
            RegistryError::DuplicatePath(_) => "duplicate_path",
            RegistryError::NotFound(_) => "not_found",
            RegistryError::Internal(_) => "internal_error",
        }
    }

    /// API error code used when this error crosses the REST boundary
    pub fn code(&self) -> ApiErrorCode {
        match self {
            RegistryError::Validation { .. } => ApiErrorCode::ValidationError,
            RegistryError::DuplicatePath(_) => ApiErrorCode::DuplicatePath,
            RegistryError::NotFound(_) => ApiErrorCode::NotFound,
            RegistryError::Internal(_) => ApiErrorCode::InternalError,
        }
    }
}

/// Error codes for admin API responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApiErrorCode {
    /// Route payload failed validation
    ValidationError,
    /// Path conflicts with another enabled route
    DuplicatePath,
    /// Unknown route id or endpoint
    NotFound,
    /// Request body is not valid JSON for the endpoint
    InvalidJson,
    /// Missing or wrong bearer token
    Unauthorized,
    /// Endpoint exists but not for this method
    MethodNotAllowed,
    /// Internal error
    InternalError,
}

impl ApiErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiErrorCode::ValidationError => StatusCode::BAD_REQUEST,
            ApiErrorCode::DuplicatePath => StatusCode::CONFLICT,
            ApiErrorCode::NotFound => StatusCode::NOT_FOUND,
            ApiErrorCode::InvalidJson => StatusCode::BAD_REQUEST,
            ApiErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiErrorCode::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ApiErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Api-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ApiErrorCode::ValidationError => "VALIDATION_ERROR",
            ApiErrorCode::DuplicatePath => "DUPLICATE_PATH",
            ApiErrorCode::NotFound => "NOT_FOUND",
            ApiErrorCode::InvalidJson => "INVALID_JSON",
            ApiErrorCode::Unauthorized => "UNAUTHORIZED",
            ApiErrorCode::MethodNotAllowed => "METHOD_NOT_ALLOWED",
            ApiErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Always false, mirrors the success envelope of other responses
    pub success: bool,
    /// The error code
    pub code: ApiErrorCode,
    /// Human-readable error message
    pub error: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ApiErrorCode, message: impl Into<String>) -> Self {
        Self {
            success: false,
            status: code.status_code().as_u16(),
            code,
            error: message.into(),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"success":false,"code":"{}","error":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.error.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Api-Error header
pub fn json_error_response(code: ApiErrorCode, message: impl Into<String>) -> Response<Full<Bytes>> {
    let body = ErrorResponse::new(code, message).to_json();

    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "application/json")
        .header("X-Api-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)))
        .expect("valid response with StatusCode enum and static headers")
}

/// Map a registry failure onto its structured JSON response
pub fn registry_error_response(err: &RegistryError) -> Response<Full<Bytes>> {
    json_error_response(err.code(), err.to_string())
}
