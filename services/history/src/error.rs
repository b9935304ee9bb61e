//! Error types shared by the persister and the history API.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;
use tracing::error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, HistoryError>;

/// Errors raised while ingesting events or answering history queries.
#[derive(Error, Debug)]
pub enum HistoryError {
    /// Payload is not a JSON object or does not have the expected shape.
    #[error("Invalid event payload: {0}")]
    Decode(String),

    /// A field the contract requires is absent.
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Timestamp could not be parsed: {0}")]
    MalformedTimestamp(String),

    /// Inserting documents into a partition failed.
    #[error("Failed to persist documents in {partition}: {message}")]
    StorageWrite { partition: String, message: String },

    /// Index or sharding command failed.
    #[error("Administrative command failed on {partition}: {message}")]
    StorageAdmin { partition: String, message: String },

    /// Read-side storage failure.
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid parameter {name}: {message}")]
    InvalidParameter { name: String, message: String },

    #[error("{title}: {description}")]
    NotFound { title: String, description: String },

    /// An external HTTP collaborator failed, timed out or answered non-2xx.
    #[error("Upstream request failed: {0}")]
    Upstream(String),

    #[error("Authentication required: {0}")]
    Unauthorized(String),

    #[error("Not Acceptable")]
    NotAcceptable,

    #[error("Message bus error: {0}")]
    Bus(String),

    /// A response body could not be produced.
    #[error("Failed to render response: {0}")]
    Render(String),
}

impl HistoryError {
    pub fn invalid_parameter(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn not_found(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self::NotFound {
            title: title.into(),
            description: description.into(),
        }
    }

    /// HTTP status used when the error reaches an API caller.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidParameter { .. } | Self::Decode(_) | Self::MissingField(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::NotAcceptable => StatusCode::NOT_ACCEPTABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<serde_json::Error> for HistoryError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

impl From<reqwest::Error> for HistoryError {
    fn from(err: reqwest::Error) -> Self {
        Self::Upstream(err.to_string())
    }
}

impl From<mongodb::error::Error> for HistoryError {
    fn from(err: mongodb::error::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<csv::Error> for HistoryError {
    fn from(err: csv::Error) -> Self {
        Self::Render(err.to_string())
    }
}

impl From<rdkafka::error::KafkaError> for HistoryError {
    fn from(err: rdkafka::error::KafkaError) -> Self {
        Self::Bus(err.to_string())
    }
}

/// Error body returned by the history API
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub title: String,
    pub description: String,
}

impl IntoResponse for HistoryError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = match &self {
            Self::NotFound { title, description } => ErrorResponse {
                title: title.clone(),
                description: description.clone(),
            },
            Self::InvalidParameter { name, message } => ErrorResponse {
                title: "Invalid parameter".to_string(),
                description: format!("The \"{}\" parameter is invalid. {}", name, message),
            },
            Self::Unauthorized(description) => ErrorResponse {
                title: "Authentication required".to_string(),
                description: description.clone(),
            },
            Self::NotAcceptable => ErrorResponse {
                title: "Not Acceptable".to_string(),
                description: "Supported media types are application/json and text/csv"
                    .to_string(),
            },
            Self::Decode(_) | Self::MissingField(_) => ErrorResponse {
                title: "Bad request".to_string(),
                description: self.to_string(),
            },
            _ => {
                error!(error = %self, "Request failed");
                ErrorResponse {
                    title: "Internal Server Error".to_string(),
                    description: "The request could not be completed".to_string(),
                }
            }
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_errors_map_to_4xx() {
        assert_eq!(
            HistoryError::invalid_parameter("lastN", "Must be integer.").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            HistoryError::not_found("Device not found", "none").status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            HistoryError::NotAcceptable.status_code(),
            StatusCode::NOT_ACCEPTABLE
        );
    }

    #[test]
    fn test_storage_errors_are_server_errors() {
        let err = HistoryError::Storage("connection reset".to_string());
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
