//! Error types for petbot.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Turn error: {0}")]
    Turn(#[from] TurnError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
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

/// Channel-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel {name} failed to start: {reason}")]
    StartupFailed { name: String, reason: String },

    #[error("Failed to send response on channel {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("Invalid message format: {0}")]
    InvalidMessage(String),
}

/// LLM provider errors, as reported by a single request.
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

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Outcome of a model gateway call that produced no usable text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    /// Upstream throttling on a single attempt. The gateway retries these and
    /// never returns one to its caller; exhaustion becomes `NoResponseObtained`.
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Every attempt in the retry budget was rate limited.
    #[error("No response obtained after {attempts} attempts")]
    NoResponseObtained { attempts: u32 },

    /// Any other upstream failure. Never retried.
    #[error("Model fault: {0}")]
    ModelFault(String),

    /// The upstream answered but the answer carried no text.
    #[error("Malformed upstream response: {0}")]
    MalformedUpstream(String),
}

/// Turn-level failures that resolve to an apology reply.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TurnError {
    #[error("Model output is not a valid turn result ({reason}): {raw}")]
    MalformedTurn { raw: String, reason: String },

    #[error("Interval value {value:?} is not a non-negative number of weeks")]
    IntervalCoercion { value: String },
}

/// Result type alias for petbot.
pub type Result<T> = std::result::Result<T, Error>;
