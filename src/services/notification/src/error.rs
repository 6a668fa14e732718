//! Error handling for the notification dispatch service
//!
//! Every fallible operation in the crate returns [`NotificationError`]. The
//! HTTP layer renders it through [`IntoResponse`]; the queue consumer asks
//! [`NotificationError::is_retryable`] before deciding whether to try again.

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Result type alias for notification dispatch operations
pub type Result<T> = std::result::Result<T, NotificationError>;

/// Main error type for the notification dispatch service
#[derive(Error, Debug)]
pub enum NotificationError {
    /// Relational store errors
    #[error("Database error: {message}")]
    Database { message: String },

    /// Preference cache errors
    #[error("Cache error: {message}")]
    Cache { message: String },

    /// Queue publish/consume errors
    #[error("Queue error: {message}")]
    Queue { message: String },

    /// A provider rejected or failed a send
    #[error("Provider error ({channel}): {message}")]
    Provider { channel: String, message: String },

    /// No adapter registered for the channel at send time
    #[error("unsupported channel type: {channel}")]
    UnsupportedChannel { channel: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Request validation errors
    #[error("Validation error: {field}: {message}")]
    Validation { field: String, message: String },

    /// The user's preference blocks delivery on this channel
    #[error("notifications disabled for user {user_id} on channel {channel}")]
    PreferenceDenied { user_id: String, channel: String },

    /// Not found errors
    #[error("Resource not found: {resource}")]
    NotFound { resource: String },

    /// Conflicting state, e.g. cancelling a delivered notification
    #[error("Conflict: {message}")]
    Conflict { message: String },

    /// Timeout errors
    #[error("Operation timed out: {operation}")]
    Timeout { operation: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// Internal service errors
    #[error("Internal error: {message}")]
    Internal { message: String },

    /// A backing service could not be reached
    #[error("Service unavailable: {service}")]
    ServiceUnavailable { service: String },
}

impl NotificationError {
    /// Get the HTTP status code that should be returned for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            NotificationError::Database { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            NotificationError::Cache { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            NotificationError::Queue { .. } => StatusCode::SERVICE_UNAVAILABLE,
            NotificationError::Provider { .. } => StatusCode::BAD_GATEWAY,
            NotificationError::UnsupportedChannel { .. } => StatusCode::BAD_REQUEST,
            NotificationError::Config { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            NotificationError::Validation { .. } => StatusCode::BAD_REQUEST,
            NotificationError::PreferenceDenied { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            NotificationError::NotFound { .. } => StatusCode::NOT_FOUND,
            NotificationError::Conflict { .. } => StatusCode::CONFLICT,
            NotificationError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            NotificationError::Serialization { .. } => StatusCode::BAD_REQUEST,
            NotificationError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            NotificationError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Get the error code for API responses
    pub fn error_code(&self) -> &'static str {
        match self {
            NotificationError::Database { .. } => "DATABASE_ERROR",
            NotificationError::Cache { .. } => "CACHE_ERROR",
            NotificationError::Queue { .. } => "QUEUE_ERROR",
            NotificationError::Provider { .. } => "PROVIDER_ERROR",
            NotificationError::UnsupportedChannel { .. } => "UNSUPPORTED_CHANNEL",
            NotificationError::Config { .. } => "CONFIG_ERROR",
            NotificationError::Validation { .. } => "VALIDATION_ERROR",
            NotificationError::PreferenceDenied { .. } => "PREFERENCE_DENIED",
            NotificationError::NotFound { .. } => "NOT_FOUND",
            NotificationError::Conflict { .. } => "CONFLICT",
            NotificationError::Timeout { .. } => "TIMEOUT",
            NotificationError::Serialization { .. } => "SERIALIZATION_ERROR",
            NotificationError::Internal { .. } => "INTERNAL_ERROR",
            NotificationError::ServiceUnavailable { .. } => "SERVICE_UNAVAILABLE",
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            NotificationError::Database { .. } => true,
            NotificationError::Cache { .. } => true,
            NotificationError::Queue { .. } => true,
            NotificationError::Provider { .. } => true,
            NotificationError::UnsupportedChannel { .. } => false,
            NotificationError::Config { .. } => false,
            NotificationError::Validation { .. } => false,
            NotificationError::PreferenceDenied { .. } => false,
            NotificationError::NotFound { .. } => false,
            NotificationError::Conflict { .. } => false,
            NotificationError::Timeout { .. } => true,
            NotificationError::Serialization { .. } => false,
            NotificationError::Internal { .. } => true,
            NotificationError::ServiceUnavailable { .. } => true,
        }
    }

    /// Short label used as the `reason` metric dimension
    pub fn reason(&self) -> &'static str {
        match self {
            NotificationError::Database { .. } => "database",
            NotificationError::Cache { .. } => "cache",
            NotificationError::Queue { .. } => "queue",
            NotificationError::Provider { .. } => "provider",
            NotificationError::UnsupportedChannel { .. } => "unsupported_channel",
            NotificationError::NotFound { .. } => "not_found",
            NotificationError::Timeout { .. } => "timeout",
            NotificationError::Serialization { .. } => "serialization",
            _ => "other",
        }
    }
}

impl IntoResponse for NotificationError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_code = self.error_code();
        let message = self.to_string();

        let body = Json(json!({
            "error": {
                "code": error_code,
                "message": message,
                "status": status.as_u16()
            }
        }));

        (status, body).into_response()
    }
}

// Conversion implementations for external error types

impl From<sqlx::Error> for NotificationError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => NotificationError::NotFound {
                resource: "row".to_string(),
            },
            sqlx::Error::PoolTimedOut => NotificationError::ServiceUnavailable {
                service: "postgres".to_string(),
            },
            other => NotificationError::Database {
                message: other.to_string(),
            },
        }
    }
}

impl From<redis::RedisError> for NotificationError {
    fn from(err: redis::RedisError) -> Self {
        NotificationError::Cache {
            message: err.to_string(),
        }
    }
}

impl From<lettre::error::Error> for NotificationError {
    fn from(err: lettre::error::Error) -> Self {
        NotificationError::provider("email", err.to_string())
    }
}

impl From<lettre::address::AddressError> for NotificationError {
    fn from(err: lettre::address::AddressError) -> Self {
        NotificationError::provider("email", format!("invalid address: {}", err))
    }
}

impl From<lettre::transport::smtp::Error> for NotificationError {
    fn from(err: lettre::transport::smtp::Error) -> Self {
        NotificationError::provider("email", err.to_string())
    }
}

impl From<reqwest::Error> for NotificationError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            NotificationError::Timeout {
                operation: "HTTP request".to_string(),
            }
        } else {
            NotificationError::ServiceUnavailable {
                service: format!("HTTP: {}", err),
            }
        }
    }
}

impl From<serde_json::Error> for NotificationError {
    fn from(err: serde_json::Error) -> Self {
        NotificationError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<config::ConfigError> for NotificationError {
    fn from(err: config::ConfigError) -> Self {
        NotificationError::Config {
            message: err.to_string(),
        }
    }
}

impl From<prometheus::Error> for NotificationError {
    fn from(err: prometheus::Error) -> Self {
        NotificationError::Internal {
            message: format!("metrics: {}", err),
        }
    }
}

impl From<dispatch_shared::ParseEnumError> for NotificationError {
    fn from(err: dispatch_shared::ParseEnumError) -> Self {
        NotificationError::Validation {
            field: err.kind.to_string(),
            message: err.to_string(),
        }
    }
}

impl From<JsonRejection> for NotificationError {
    fn from(rejection: JsonRejection) -> Self {
        NotificationError::Validation {
            field: "body".to_string(),
            message: rejection.body_text(),
        }
    }
}

impl From<validator::ValidationErrors> for NotificationError {
    fn from(err: validator::ValidationErrors) -> Self {
        let message = err
            .field_errors()
            .iter()
            .map(|(field, errors)| {
                let field_errors: Vec<String> = errors
                    .iter()
                    .map(|e| {
                        e.message
                            .as_ref()
                            .map(|m| m.to_string())
                            .unwrap_or_else(|| e.code.to_string())
                    })
                    .collect();
                format!("{}: {}", field, field_errors.join(", "))
            })
            .collect::<Vec<String>>()
            .join("; ");

        NotificationError::Validation {
            field: "request".to_string(),
            message,
        }
    }
}

// Utility functions for creating specific error types

impl NotificationError {
    /// Create a database error
    pub fn database<S: Into<String>>(message: S) -> Self {
        Self::Database {
            message: message.into(),
        }
    }

    /// Create a cache error
    pub fn cache<S: Into<String>>(message: S) -> Self {
        Self::Cache {
            message: message.into(),
        }
    }

    /// Create a queue error
    pub fn queue<S: Into<String>>(message: S) -> Self {
        Self::Queue {
            message: message.into(),
        }
    }

    /// Create a provider error
    pub fn provider<S1: Into<String>, S2: Into<String>>(channel: S1, message: S2) -> Self {
        Self::Provider {
            channel: channel.into(),
            message: message.into(),
        }
    }

    /// Create an unsupported channel error
    pub fn unsupported_channel<S: Into<String>>(channel: S) -> Self {
        Self::UnsupportedChannel {
            channel: channel.into(),
        }
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a validation error
    pub fn validation<S1: Into<String>, S2: Into<String>>(field: S1, message: S2) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a preference denied error
    pub fn preference_denied<S1: Into<String>, S2: Into<String>>(user_id: S1, channel: S2) -> Self {
        Self::PreferenceDenied {
            user_id: user_id.into(),
            channel: channel.into(),
        }
    }

    /// Create a not found error
    pub fn not_found<S: Into<String>>(resource: S) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    /// Create a conflict error
    pub fn conflict<S: Into<String>>(message: S) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(operation: S) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization<S: Into<String>>(message: S) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Create a service unavailable error
    pub fn service_unavailable<S: Into<String>>(service: S) -> Self {
        Self::ServiceUnavailable {
            service: service.into(),
        }
    }
}
