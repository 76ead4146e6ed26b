//! Standardized error handling for the automation engine API.
//!
//! Every endpoint returns errors in the same envelope:
//! `{ "error": { "code": "...", "message": "...", "details": { ... } } }`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

/// JSON error envelope returned by every endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    pub error: ErrorBody,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: ErrorBody {
                code: code.into(),
                message: message.into(),
                details: None,
            },
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.error.details = Some(details);
        self
    }
}

/// Application error type that can be converted to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    Unauthorized(String),
    NotFound(String),
    BadRequest(String),
    ValidationError { details: serde_json::Value },
    InternalError(String),
    DatabaseError(String),
    UpstreamError(String),
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) | Self::ValidationError { .. } => StatusCode::BAD_REQUEST,
            Self::InternalError(_) | Self::DatabaseError(_) | Self::UpstreamError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::NotFound(_) => "NOT_FOUND",
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::InternalError(_) => "INTERNAL_ERROR",
            Self::DatabaseError(_) => "DATABASE_ERROR",
            Self::UpstreamError(_) => "UPSTREAM_ERROR",
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::Unauthorized(msg) => msg.clone(),
            Self::NotFound(resource) => format!("{} not found", resource),
            Self::BadRequest(msg) => msg.clone(),
            Self::ValidationError { .. } => "Validation failed".to_string(),
            Self::InternalError(msg) => {
                tracing::error!("Internal error: {}", msg);
                "An internal error occurred".to_string()
            }
            Self::DatabaseError(msg) => {
                tracing::error!("Database error: {}", msg);
                "A database error occurred".to_string()
            }
            Self::UpstreamError(msg) => {
                tracing::error!("Upstream error: {}", msg);
                format!("Upstream service error: {}", msg)
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let mut error = ApiError::new(self.error_code(), self.message());

        if let Self::ValidationError { details } = &self {
            error.error.details = Some(details.clone());
        }

        (status, Json(error)).into_response()
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("Resource".to_string()),
            _ => Self::DatabaseError(err.to_string()),
        }
    }
}

impl From<crate::onstaq::OnstaqError> for AppError {
    fn from(err: crate::onstaq::OnstaqError) -> Self {
        match err {
            crate::onstaq::OnstaqError::Unauthorized => {
                Self::Unauthorized("Upstream rejected credentials".to_string())
            }
            crate::onstaq::OnstaqError::NotFound(what) => Self::NotFound(what),
            other => Self::UpstreamError(other.to_string()),
        }
    }
}

/// Result type alias for handlers.
pub type ApiResult<T> = Result<T, AppError>;

/// Helper to create a single-field validation error.
pub fn validation_error(field: &str, message: &str) -> AppError {
    AppError::ValidationError {
        details: serde_json::json!({ field: [message] }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_and_status() {
        assert_eq!(
            AppError::NotFound("Automation".to_string()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::Unauthorized("nope".to_string()).error_code(),
            "UNAUTHORIZED"
        );
        assert_eq!(
            validation_error("trigger", "unknown trigger type").status_code(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_envelope_shape() {
        let api = ApiError::new("NOT_FOUND", "Automation not found");
        let json = serde_json::to_value(&api).unwrap();
        assert_eq!(json["error"]["code"], "NOT_FOUND");
        assert!(json["error"].get("details").is_none());
    }
}
