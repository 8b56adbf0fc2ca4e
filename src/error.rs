//! Error handling for the crop analysis service
//!
//! This module provides a unified error type with proper mapping to HTTP
//! status codes and structured error responses. Recoverable checkpoint
//! conditions (missing, unexpected or shape-incompatible parameters) are
//! deliberately *not* represented here; they travel as load-report data
//! next to a usable model.

use actix_web::{HttpResponse, ResponseError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for the service
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// A checkpoint artifact could not be read or deserialized
    #[error("Failed to read checkpoint artifact: {message}")]
    ArtifactRead { message: String },

    /// No constructor is registered for the requested architecture
    #[error("Unknown architecture: {name}")]
    UnknownArchitecture { name: String },

    /// The requested model was not discovered on disk
    #[error("Model not found: {name}")]
    ModelNotFound { name: String },

    /// Inference computation errors
    #[error("Inference error: {message}")]
    Inference { message: String },

    /// Invalid request errors
    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    /// A record (field, spot, analysis) does not exist
    #[error("Not found: {message}")]
    NotFound { message: String },

    /// Internal server errors
    #[error("Internal error: {message}")]
    Internal { message: String },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Tensor framework errors
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, ServiceError>;

/// Error response structure for API responses
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetails,
}

/// Detailed error information
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub message: String,
    pub error_type: String,
    pub code: String,
}

impl ServiceError {
    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an artifact read error
    pub fn artifact_read<S: Into<String>>(message: S) -> Self {
        Self::ArtifactRead {
            message: message.into(),
        }
    }

    /// Create an unknown-architecture error
    pub fn unknown_architecture<S: Into<String>>(name: S) -> Self {
        Self::UnknownArchitecture { name: name.into() }
    }

    /// Create a model-not-found error
    pub fn model_not_found<S: Into<String>>(name: S) -> Self {
        Self::ModelNotFound { name: name.into() }
    }

    /// Create an inference error
    pub fn inference<S: Into<String>>(message: S) -> Self {
        Self::Inference {
            message: message.into(),
        }
    }

    /// Create an invalid request error
    pub fn invalid_request<S: Into<String>>(message: S) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Create a not-found error
    pub fn not_found<S: Into<String>>(message: S) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Convert to an error response for the API
    pub fn to_error_response(&self) -> ErrorResponse {
        let (error_type, code) = match self {
            ServiceError::Config { .. } => ("config_error", "CONFIG_ERROR"),
            ServiceError::ArtifactRead { .. } => ("artifact_read_error", "ARTIFACT_READ_ERROR"),
            ServiceError::UnknownArchitecture { .. } => {
                ("unknown_architecture_error", "UNKNOWN_ARCHITECTURE")
            }
            ServiceError::ModelNotFound { .. } => ("model_not_found_error", "MODEL_NOT_FOUND"),
            ServiceError::Inference { .. } => ("inference_error", "INFERENCE_ERROR"),
            ServiceError::InvalidRequest { .. } => ("invalid_request_error", "INVALID_REQUEST"),
            ServiceError::NotFound { .. } => ("not_found_error", "NOT_FOUND"),
            ServiceError::Internal { .. } => ("internal_error", "INTERNAL_ERROR"),
            ServiceError::Io(_) => ("io_error", "IO_ERROR"),
            ServiceError::Serde(_) => ("serialization_error", "SERIALIZATION_ERROR"),
            ServiceError::Candle(_) => ("ml_error", "ML_ERROR"),
            ServiceError::Database(_) => ("database_error", "DATABASE_ERROR"),
        };

        ErrorResponse {
            error: ErrorDetails {
                message: self.to_string(),
                error_type: error_type.to_string(),
                code: code.to_string(),
            },
        }
    }
}

impl ResponseError for ServiceError {
    fn error_response(&self) -> HttpResponse {
        let status = match self {
            ServiceError::InvalidRequest { .. } => actix_web::http::StatusCode::BAD_REQUEST,
            ServiceError::NotFound { .. } => actix_web::http::StatusCode::NOT_FOUND,
            ServiceError::ModelNotFound { .. } => actix_web::http::StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::Config { .. }
            | ServiceError::ArtifactRead { .. }
            | ServiceError::UnknownArchitecture { .. }
            | ServiceError::Inference { .. }
            | ServiceError::Internal { .. }
            | ServiceError::Io(_)
            | ServiceError::Serde(_)
            | ServiceError::Candle(_)
            | ServiceError::Database(_) => actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
        };

        HttpResponse::build(status).json(self.to_error_response())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let error = ServiceError::config("Test config error");
        assert!(error.to_string().contains("Test config error"));

        let error = ServiceError::model_not_found("CustomCNN1");
        assert!(error.to_string().contains("CustomCNN1"));
    }

    #[test]
    fn test_error_response() {
        let error = ServiceError::invalid_request("Test error");
        let response = error.to_error_response();

        assert_eq!(response.error.error_type, "invalid_request_error");
        assert_eq!(response.error.code, "INVALID_REQUEST");
        assert!(response.error.message.contains("Test error"));
    }

    #[test]
    fn test_http_status_mapping() {
        let error = ServiceError::invalid_request("Test error");
        assert_eq!(error.error_response().status(), 400);

        let error = ServiceError::model_not_found("BinaryCNN_Deep");
        assert_eq!(error.error_response().status(), 503);

        let error = ServiceError::artifact_read("truncated file");
        assert_eq!(error.error_response().status(), 500);
    }
}
