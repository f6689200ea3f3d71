use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Buffer error: {0}")]
    Buffer(#[from] BufferError),

    #[error("Invocation error: {0}")]
    Invocation(#[from] InvocationError),

    #[error("Reconciliation error: {0}")]
    Reconciliation(#[from] ReconciliationError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Configuration validation failed: {reason}")]
    ValidationFailed { reason: String },
}

/// Failures of the bounded buffer. None of these lose a record: the write
/// paths hand the record back through [`crate::buffer::WriteError`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BufferError {
    #[error("Buffer write timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("Buffer is closed")]
    Closed,

    #[error("Write of {requested} records exceeds buffer capacity {capacity}")]
    SizeOverflow { requested: usize, capacity: usize },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvocationError {
    #[error("Remote invocation failed: {reason}")]
    Transport { reason: String },

    #[error("Remote function returned status {status_code}")]
    Status { status_code: u16 },

    #[error("Remote invocation exceeded deadline of {deadline:?}")]
    Timeout { deadline: Duration },

    #[error("Remote function returned an empty payload")]
    EmptyPayload,

    #[error("Failed to decode response payload: {0}")]
    Decode(#[from] CodecError),

    #[error("Failed to encode request payload: {reason}")]
    Encode { reason: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReconciliationError {
    #[error(
        "Strict mode requires the response to carry {expected} records but it carried {actual}"
    )]
    Mismatch { expected: usize, actual: usize },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Malformed payload: {reason}")]
    Malformed { reason: String },

    #[error("Unexpected payload shape: {reason}")]
    UnexpectedShape { reason: String },
}

#[derive(Error, Debug)]
pub enum SerializationError {
    #[error("JSON serialization failed: {reason}")]
    Json { reason: String },

    #[error("YAML serialization failed: {reason}")]
    Yaml { reason: String },
}

pub type Result<T> = std::result::Result<T, PipelineError>;

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Serialization(SerializationError::Json {
            reason: err.to_string(),
        })
    }
}

impl From<serde_yaml::Error> for PipelineError {
    fn from(err: serde_yaml::Error) -> Self {
        PipelineError::Serialization(SerializationError::Yaml {
            reason: err.to_string(),
        })
    }
}

impl From<serde_json::Error> for CodecError {
    fn from(err: serde_json::Error) -> Self {
        CodecError::Malformed {
            reason: err.to_string(),
        }
    }
}

impl PipelineError {
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::Buffer(BufferError::Timeout { .. }) => true,
            PipelineError::Buffer(_) => false,
            PipelineError::Invocation(InvocationError::Transport { .. }) => true,
            PipelineError::Invocation(InvocationError::Timeout { .. }) => true,
            PipelineError::Invocation(InvocationError::Status { status_code }) => {
                *status_code == 429 || *status_code >= 500
            }
            PipelineError::Invocation(_) => false,
            PipelineError::Reconciliation(_) => false,
            PipelineError::Config(_) => false,
            PipelineError::Serialization(_) => false,
            PipelineError::Io(_) => true,
        }
    }

    pub fn get_retry_delay_ms(&self) -> u64 {
        match self {
            PipelineError::Buffer(_) => 100,
            PipelineError::Invocation(_) => 1000,
            _ => 5000,
        }
    }
}
