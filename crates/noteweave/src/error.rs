//! Error types for the chat pipeline

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, Error>;

/// How a provider call failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    /// Upstream call exceeded its time budget
    Timeout,
    /// Upstream rejected the call because of request rate or quota
    RateLimited,
    /// Upstream is overloaded or returned a server error
    Unavailable,
    /// Credentials were rejected
    Auth,
    /// Upstream rejected the request itself
    InvalidRequest,
}

impl ProviderErrorKind {
    /// Timeouts, rate limits and upstream outages may succeed on another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::RateLimited | Self::Unavailable)
    }

    /// Classify an HTTP status returned by a provider
    pub fn from_status(status: u16) -> Self {
        match status {
            401 | 403 => Self::Auth,
            429 => Self::RateLimited,
            408 | 504 => Self::Timeout,
            // includes Anthropic's non-standard 529 "overloaded"
            500..=599 => Self::Unavailable,
            _ => Self::InvalidRequest,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::Unavailable => "unavailable",
            Self::Auth => "auth",
            Self::InvalidRequest => "invalid_request",
        }
    }
}

/// Pipeline errors
#[derive(Debug, Error)]
pub enum Error {
    /// Bad input rejected before any work starts
    #[error("Validation error: {0}")]
    Validation(String),

    /// Text extraction failed
    #[error("Failed to extract '{filename}': {message}")]
    Extraction { filename: String, message: String },

    /// Embedding a chunk failed
    #[error("Embedding generation failed: {0}")]
    Embedding(String),

    /// An AI provider call failed
    #[error("Provider '{provider}' failed ({}): {message}", kind.as_str())]
    Provider {
        provider: String,
        kind: ProviderErrorKind,
        message: String,
    },

    /// Referenced entity does not exist
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Operation conflicts with current state
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP request error
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create an extraction error
    pub fn extraction(filename: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Extraction {
            filename: filename.into(),
            message: message.into(),
        }
    }

    /// Create an embedding error
    pub fn embedding(message: impl Into<String>) -> Self {
        Self::Embedding(message.into())
    }

    /// Create a provider error
    pub fn provider(
        provider: impl Into<String>,
        kind: ProviderErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self::Provider {
            provider: provider.into(),
            kind,
            message: message.into(),
        }
    }

    /// Create a not-found error
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Create a conflict error
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    /// Create a database error
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database(message.into())
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Whether another attempt (or another provider) may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Provider { kind, .. } => kind.is_retryable(),
            Error::Http(err) => err.is_timeout() || err.is_connect(),
            _ => false,
        }
    }

    /// Short machine-readable error type
    pub fn error_type(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation_error",
            Error::Extraction { .. } => "extraction_error",
            Error::Embedding(_) => "embedding_error",
            Error::Provider { .. } => "provider_error",
            Error::NotFound { .. } => "not_found",
            Error::Conflict(_) => "conflict",
            Error::Config(_) => "config_error",
            Error::Database(_) => "database_error",
            Error::Io(_) => "io_error",
            Error::Json(_) => "json_error",
            Error::Http(_) => "http_error",
            Error::Internal(_) => "internal_error",
        }
    }

    /// `{"error": {type, message, retryable}}` body shared by HTTP and stream errors
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "error": {
                "type": self.error_type(),
                "message": self.to_string(),
                "retryable": self.is_retryable(),
            }
        })
    }

    fn status(&self) -> StatusCode {
        match self {
            Error::Validation(_) | Error::Json(_) => StatusCode::BAD_REQUEST,
            Error::Extraction { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::Provider { kind, .. } => match kind {
                ProviderErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
                ProviderErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
                ProviderErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
                ProviderErrorKind::Auth | ProviderErrorKind::InvalidRequest => {
                    StatusCode::BAD_GATEWAY
                }
            },
            Error::Http(_) => StatusCode::BAD_GATEWAY,
            Error::Embedding(_)
            | Error::Config(_)
            | Error::Database(_)
            | Error::Io(_)
            | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Database(err.to_string())
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        }

        (status, Json(self.to_json())).into_response()
    }
}
