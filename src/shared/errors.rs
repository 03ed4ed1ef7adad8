//! Error handling for the application

use thiserror::Error;

use crate::shared::types::StreamType;

/// Failures surfaced by a downstream server invocation
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InvokeError {
    #[error("Invocation timed out after {0}ms")]
    Timeout(u64),

    #[error("Server reported failure: {0}")]
    Failed(String),

    #[error("Unknown server: {0}")]
    UnknownServer(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

/// Coordination-related errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoordinationError {
    #[error("No connected provider for capability: {0}")]
    ProviderUnavailable(String),

    #[error("Fan-out deadline exceeded after {0}ms")]
    FetchTimeout(u64),

    #[error("Conflicting data for field {field}: spread {spread:.2}%")]
    ConflictingData { field: String, spread: f64 },

    #[error(transparent)]
    Invoke(#[from] InvokeError),

    #[error("Prepare failed on {server}: {reason}")]
    PrepareFailure { server: String, reason: String },

    #[error("Execute failed on {server}: {reason}")]
    ExecuteFailure { server: String, reason: String },

    #[error("Commit failed on {server}: {reason}")]
    CommitFailure { server: String, reason: String },

    #[error("Transaction not tracked: {0}")]
    UnknownTransaction(String),

    #[error("Shutdown in progress")]
    Cancelled,
}

/// Pipeline-related errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    #[error("Backpressure: dropped {0} event")]
    Backpressure(StreamType),

    #[error("Pipeline is stopped")]
    Stopped,

    #[error("Processor failed: {0}")]
    Processor(String),

    #[error("Subscriber failed: {0}")]
    Subscriber(String),
}

/// General application error
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Registry error: {0}")]
    RegistryError(String),

    #[error("Required server unavailable: {0}")]
    ServerUnavailable(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl From<InvokeError> for AppError {
    fn from(err: InvokeError) -> Self {
        AppError::TransportError(err.to_string())
    }
}

impl From<CoordinationError> for AppError {
    fn from(err: CoordinationError) -> Self {
        AppError::Unknown(err.to_string())
    }
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        AppError::Unknown(err.to_string())
    }
}
