//! # Error Handling
//!
//! This module defines the HTTP-facing error type and how it is rendered to clients.
//! Domain errors (`CoordinatorError`, `TranscodeError`) live next to the code that
//! raises them and convert into `AppError` at the handler boundary.
//!
//! ## Key Rust Concepts for Error Handling:
//! - **Result<T, E>**: Forces every caller to handle both outcomes
//! - **Enums for Error Types**: Each variant is one failure category with its own status code
//! - **From trait**: Lets `?` convert lower-level errors automatically
//! - **ResponseError trait**: Turns an error into an HTTP response

use crate::conversion::ConversionError;
use crate::session::CoordinatorError;
use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Custom error types for the application.
///
/// ## Error Categories:
/// - **Internal**: Server-side problems (500)
/// - **BadRequest** / **ValidationError**: Client sent invalid data (400)
/// - **Unauthorized**: Missing, expired or forged token (401)
/// - **Forbidden**: Valid token, wrong role (403)
/// - **NotFound**: Requested resource doesn't exist (404)
/// - **Conflict**: Someone else holds the on-air slot, or the command does not
///   apply to the current broadcast state (409)
/// - **ConfigError**: Configuration problems (500)
#[derive(Debug)]
pub enum AppError {
    Internal(String),
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    Conflict { code: &'static str, message: String },
    ConfigError(String),
    ValidationError(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::Unauthorized(msg) => write!(f, "Unauthorized: {}", msg),
            AppError::Forbidden(msg) => write!(f, "Forbidden: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::Conflict { code, message } => write!(f, "Conflict ({}): {}", code, message),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

/// HTTP rendering.
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "conflict",
///     "code": "ALREADY_LIVE",
///     "message": "broadcast is held by another presenter",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Internal(_) | AppError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BadRequest(_) | AppError::ValidationError(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict { .. } => StatusCode::CONFLICT,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let (error_type, code, message) = match self {
            AppError::Internal(msg) => ("internal_error", None, msg.clone()),
            AppError::BadRequest(msg) => ("bad_request", None, msg.clone()),
            AppError::Unauthorized(msg) => ("unauthorized", None, msg.clone()),
            AppError::Forbidden(msg) => ("forbidden", None, msg.clone()),
            AppError::NotFound(msg) => ("not_found", None, msg.clone()),
            AppError::Conflict { code, message } => ("conflict", Some(*code), message.clone()),
            AppError::ConfigError(msg) => ("config_error", None, msg.clone()),
            AppError::ValidationError(msg) => ("validation_error", None, msg.clone()),
        };

        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": error_type,
                "code": code,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

/// Anything bubbling up through `anyhow` is a server-side failure.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(format!("{:#}", err))
    }
}

/// JSON parsing errors are almost always the client's fault, so 400 rather than 500.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

/// Ownership conflicts and wrong-state commands are reported to the caller
/// verbatim; store failures are internal.
impl From<CoordinatorError> for AppError {
    fn from(err: CoordinatorError) -> Self {
        match err {
            CoordinatorError::Store(e) => AppError::Internal(format!("{:#}", e)),
            CoordinatorError::NotPrivileged => {
                AppError::Forbidden(CoordinatorError::NotPrivileged.to_string())
            }
            other => AppError::Conflict {
                code: other.code(),
                message: other.to_string(),
            },
        }
    }
}

impl From<ConversionError> for AppError {
    fn from(err: ConversionError) -> Self {
        match err {
            ConversionError::NotConvertible(_) | ConversionError::Invalid(_) => {
                AppError::ValidationError(err.to_string())
            }
            ConversionError::NotFound(_) => AppError::NotFound(err.to_string()),
            ConversionError::NotRetryable { .. } => AppError::Conflict {
                code: "NOT_RETRYABLE",
                message: err.to_string(),
            },
            ConversionError::Store(e) => AppError::Internal(format!("{:#}", e)),
        }
    }
}
