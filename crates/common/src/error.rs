//! Common error types for TensorServe
//!
//! This module defines the error taxonomy shared by every layer of the server.
//! Errors are cloneable so a single batch-level failure can be handed to every
//! member of the batch, and convertible to gRPC / HTTP status codes so that
//! transport adapters can translate them without inspecting messages.

use thiserror::Error;

/// Main error type for TensorServe
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServeError {
    /// No descriptor matches the requested name / version
    #[error("Model {name} with version {version} not found")]
    ModelNotFound { name: String, version: String },

    /// Descriptor exists but the instance is not serving
    #[error("Model {name} with version {version} is not ready yet")]
    ModelNotReady { name: String, version: String },

    /// No codec registered for a content-type tag
    #[error("Unsupported content type: {0}")]
    UnsupportedContentType(String),

    /// Worker pool exhausted within the wait budget
    #[error("Worker unavailable: {0}")]
    WorkerUnavailable(String),

    /// The execution backend failed
    #[error("Inference error: {0}")]
    Inference(String),

    /// A single descriptor could not be parsed
    #[error("Discovery error at {path}: {reason}")]
    Discovery { path: String, reason: String },

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for ServeError {
    fn from(err: std::io::Error) -> Self {
        ServeError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for ServeError {
    fn from(err: serde_json::Error) -> Self {
        ServeError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for ServeError {
    fn from(err: serde_yaml::Error) -> Self {
        ServeError::Serialization(err.to_string())
    }
}

impl From<::config::ConfigError> for ServeError {
    fn from(err: ::config::ConfigError) -> Self {
        ServeError::Config(err.to_string())
    }
}

fn version_label(version: Option<&str>) -> String {
    version.unwrap_or("latest").to_string()
}

impl ServeError {
    /// Convert error to gRPC status code
    pub fn to_status(&self) -> tonic::Status {
        match self {
            ServeError::ModelNotFound { .. } => tonic::Status::not_found(self.to_string()),
            ServeError::ModelNotReady { .. } => tonic::Status::unavailable(self.to_string()),
            ServeError::UnsupportedContentType(_) | ServeError::InvalidInput(_) => {
                tonic::Status::invalid_argument(self.to_string())
            }
            ServeError::WorkerUnavailable(_) => tonic::Status::unavailable(self.to_string()),
            ServeError::Timeout(_) => tonic::Status::deadline_exceeded(self.to_string()),
            ServeError::Inference(_)
            | ServeError::Discovery { .. }
            | ServeError::Config(_)
            | ServeError::Io(_)
            | ServeError::Serialization(_)
            | ServeError::Internal(_) => tonic::Status::internal(self.to_string()),
        }
    }

    /// HTTP status code used by REST adapters
    pub fn http_status(&self) -> u16 {
        match self {
            ServeError::ModelNotFound { .. } => 404,
            ServeError::ModelNotReady { .. } => 400,
            ServeError::UnsupportedContentType(_) | ServeError::InvalidInput(_) => 400,
            ServeError::WorkerUnavailable(_) => 503,
            ServeError::Timeout(_) => 504,
            _ => 500,
        }
    }

    /// Whether a client may retry the same call after backing off
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ServeError::ModelNotReady { .. } | ServeError::WorkerUnavailable(_) | ServeError::Timeout(_)
        )
    }

    /// Create a model-not-found error
    pub fn model_not_found(name: impl Into<String>, version: Option<&str>) -> Self {
        ServeError::ModelNotFound {
            name: name.into(),
            version: version_label(version),
        }
    }

    /// Create a model-not-ready error
    pub fn model_not_ready(name: impl Into<String>, version: Option<&str>) -> Self {
        ServeError::ModelNotReady {
            name: name.into(),
            version: version_label(version),
        }
    }

    /// Create an unsupported content type error
    pub fn unsupported_content_type(content_type: impl Into<String>) -> Self {
        ServeError::UnsupportedContentType(content_type.into())
    }

    /// Create a worker unavailable error
    pub fn worker_unavailable(msg: impl Into<String>) -> Self {
        ServeError::WorkerUnavailable(msg.into())
    }

    /// Create an inference error
    pub fn inference(msg: impl Into<String>) -> Self {
        ServeError::Inference(msg.into())
    }

    /// Create a discovery error
    pub fn discovery(path: impl Into<String>, reason: impl Into<String>) -> Self {
        ServeError::Discovery {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        ServeError::Config(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        ServeError::InvalidInput(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        ServeError::Timeout(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        ServeError::Internal(msg.into())
    }
}

/// Result type alias for TensorServe operations
pub type Result<T> = std::result::Result<T, ServeError>;
