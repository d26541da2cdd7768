//! Error types for subscription management.

use crate::gateway::GatewayError;
use crate::types::{SubscriptionMode, Topology};
use thiserror::Error;

/// Main error type for pub/sub operations.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PubSubError {
    #[error("{mode} subscriptions are not available on a {topology} client")]
    InvalidModeForTopology {
        mode: SubscriptionMode,
        topology: Topology,
    },

    #[error("Timed out waiting for the server to confirm")]
    Timeout,

    #[error("Connection unavailable: {0}")]
    ConnectionUnavailable(String),

    #[error("Server rejected the request: {0}")]
    ServerRejected(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Client is closed")]
    Closed,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Message queue is unavailable when a message handler is registered")]
    QueueUnavailable,

    #[error("IO error: {0}")]
    Io(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl PubSubError {
    /// True for failures that are retried internally.
    pub fn is_transient(&self) -> bool {
        matches!(self, PubSubError::ConnectionUnavailable(_))
    }
}

impl From<std::io::Error> for PubSubError {
    fn from(e: std::io::Error) -> Self {
        PubSubError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for PubSubError {
    fn from(e: serde_json::Error) -> Self {
        PubSubError::Config(e.to_string())
    }
}

impl From<GatewayError> for PubSubError {
    fn from(e: GatewayError) -> Self {
        match e {
            GatewayError::Unavailable(msg) => PubSubError::ConnectionUnavailable(msg),
            GatewayError::Timeout => PubSubError::Timeout,
            GatewayError::Rejected(msg) => PubSubError::ServerRejected(msg),
        }
    }
}

/// Result type for pub/sub operations.
pub type Result<T> = std::result::Result<T, PubSubError>;
