//! Error types for swap-watch.

use std::time::Duration;

/// Top-level error type for the service.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DatabaseError {
    pub fn not_found(entity: &str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.to_string(),
            id: id.into(),
        }
    }
}

/// Errors raised while pulling a batch from an item source.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Source {source_name} request failed: {reason}")]
    RequestFailed { source_name: String, reason: String },

    #[error("Source {source_name} returned HTTP {status}: {body}")]
    Status {
        source_name: String,
        status: u16,
        body: String,
    },

    #[error("Source {source_name} gave up after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        source_name: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Failed to decode listing from {source_name}: {reason}")]
    Decode { source_name: String, reason: String },
}

/// Messenger errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Failed to send on channel {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("Channel {name} returned HTTP {status}: {body}")]
    Status {
        name: String,
        status: u16,
        body: String,
    },

    #[error("Rate limited on channel {name}")]
    RateLimited { name: String },

    #[error("Invalid message format: {0}")]
    InvalidMessage(String),
}

/// Classifier (LLM provider) errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LlmError {
    /// Whether a retry could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RequestFailed { .. } | Self::RateLimited { .. })
    }
}

/// Batch pipeline errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Source failed: {0}")]
    Source(#[from] SourceError),

    #[error("Store failed: {0}")]
    Store(#[from] DatabaseError),

    #[error("Classifier failed: {0}")]
    Classifier(#[from] LlmError),

    #[error("Messenger failed: {0}")]
    Messenger(#[from] ChannelError),

    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("Batch run cancelled")]
    Cancelled,
}

impl PipelineError {
    /// True when the wrapped store error means the entity is absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Store(DatabaseError::NotFound { .. }))
    }
}

/// Result type alias for the service.
pub type Result<T> = std::result::Result<T, Error>;
