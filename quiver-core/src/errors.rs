use std::io;

use thiserror::Error;

/// Result type used across the Quiver core crate.
pub type Result<T> = std::result::Result<T, QuiverError>;

/// Canonical error representation shared by all services.
///
/// The variants follow the platform failure taxonomy: validation errors are
/// terminal (dropped, never retried), resolution/scale/transport errors are
/// retried by the asynchronous dispatcher's own loop, callback and ingestion
/// errors are absorbed and logged.
#[derive(Debug, Error)]
pub enum QuiverError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("deserialization error: {0}")]
    DeserializationError(String),

    #[error("invalid invocation message: {0}")]
    ValidationError(String),

    #[error("no live instance for function: {0}")]
    ResolutionError(String),

    #[error("scale gate failure: {0}")]
    ScaleError(String),

    #[error("transport error: {0}")]
    TransportError(String),

    #[error("callback delivery failed: {0}")]
    CallbackError(String),

    #[error("event ingestion failure: {0}")]
    IngestionError(String),

    #[error("queue error: {0}")]
    QueueError(String),

    #[error("database error: {0}")]
    DatabaseError(String),

    #[error("timeline not found for request: {0}")]
    TimelineNotFound(String),

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("general error: {0}")]
    GeneralError(String),
}

impl From<serde_json::Error> for QuiverError {
    fn from(err: serde_json::Error) -> Self {
        QuiverError::DeserializationError(err.to_string())
    }
}

impl From<sqlx::Error> for QuiverError {
    fn from(err: sqlx::Error) -> Self {
        QuiverError::DatabaseError(err.to_string())
    }
}

impl From<redis::RedisError> for QuiverError {
    fn from(err: redis::RedisError) -> Self {
        QuiverError::QueueError(err.to_string())
    }
}

impl From<anyhow::Error> for QuiverError {
    fn from(err: anyhow::Error) -> Self {
        QuiverError::GeneralError(err.to_string())
    }
}

/// Dedicated configuration error used by the configuration module.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("required environment variable missing: {0}")]
    MissingEnvVar(String),

    #[error("invalid value for environment variable {key}: {message}")]
    InvalidEnvVar { key: &'static str, message: String },

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<ConfigError> for QuiverError {
    fn from(value: ConfigError) -> Self {
        QuiverError::ConfigError(value.to_string())
    }
}
