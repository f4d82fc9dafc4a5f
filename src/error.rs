// src/error.rs
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type used throughout flushline
pub type Result<T> = std::result::Result<T, AgentError>;

/// Custom Error type for the flushline library
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Connect to {endpoint} timed out after {timeout:?}")]
    ConnectTimeout { endpoint: String, timeout: Duration },

    #[error("Synchronous operation '{operation}' timed out after {timeout:?}")]
    SynchOpTimeout {
        operation: String,
        timeout: Duration,
    },

    #[error("Discovery failed: {0}")]
    DiscoveryFailed(String),

    #[error("Endpoint unresolved: {0}")]
    EndpointUnresolved(String),

    #[error("Trace buffer overflow: dropped {dropped} oldest snapshots (capacity {capacity})")]
    BufferOverflow { dropped: usize, capacity: usize },

    #[error("Malformed discovery response: {0}")]
    MalformedResponse(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Encode error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Retry error: {0}")]
    Retry(String),

    #[error("Handle error: {0}")]
    Handle(String),

    #[error("Sample error: {0}")]
    Sample(String),

    #[error("Shutdown in progress")]
    Shutdown,

    #[error("Other error: {0}")]
    Other(String),
}

impl AgentError {
    /// Wrap the last failure of a retried operation
    pub fn retry(context: &str, attempts: usize, err: impl std::fmt::Display) -> Self {
        AgentError::Retry(format!(
            "{} failed after {} attempts: {}",
            context, attempts, err
        ))
    }

    /// Whether the transport should back off and try again later
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AgentError::ConnectTimeout { .. }
                | AgentError::SynchOpTimeout { .. }
                | AgentError::Connection(_)
                | AgentError::Io(_)
                | AgentError::DiscoveryFailed(_)
                | AgentError::EndpointUnresolved(_)
        )
    }
}

impl From<config::ConfigError> for AgentError {
    fn from(err: config::ConfigError) -> Self {
        AgentError::Config(err.to_string())
    }
}
