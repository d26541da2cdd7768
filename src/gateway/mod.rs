//! Command gateway boundary.
//!
//! The gateway owns the transport: command encoding, connection management,
//! cluster routing. This crate only talks to it through [`CommandGateway`].
//!
//! [`memory`] provides an in-process implementation backed by a shared
//! [`MemoryBroker`], used by the test-suite and for local development.

pub mod memory;

pub use memory::{MemoryBroker, MemoryGateway};

use crate::types::{PubSubCommand, PushFrame, Topic};
use crossbeam_channel::Receiver;
use std::time::Duration;
use thiserror::Error;

/// Failure reported by a gateway.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum GatewayError {
    /// Transport is down or reconnecting. Retriable.
    #[error("connection unavailable: {0}")]
    Unavailable(String),

    /// The command did not complete within its timeout. Retriable.
    #[error("command timed out")]
    Timeout,

    /// The server refused the request. Not retriable.
    #[error("rejected: {0}")]
    Rejected(String),
}

impl GatewayError {
    pub fn is_transient(&self) -> bool {
        !matches!(self, GatewayError::Rejected(_))
    }
}

/// Transport-facing collaborator for the subscription manager.
pub trait CommandGateway: Send + Sync {
    /// Issue a (un)subscribe command for `topics`. An empty topic list on an
    /// unsubscribe command means every topic of that mode.
    fn send_command(
        &self,
        command: PubSubCommand,
        topics: &[Topic],
        timeout: Option<Duration>,
    ) -> Result<(), GatewayError>;

    /// Open the inbound push stream. The stream ends when the connection
    /// drops; callers reopen it after reconnecting.
    fn push_stream(&self) -> Result<Receiver<PushFrame>, GatewayError>;

    /// Publish `payload` and return the number of receivers.
    fn publish(&self, channel: &str, payload: &[u8], sharded: bool) -> Result<i64, GatewayError>;

    /// Active channels, optionally filtered by a glob.
    fn channels(&self, pattern: Option<&str>, sharded: bool) -> Result<Vec<String>, GatewayError>;

    /// Number of unique patterns subscribed across all clients.
    fn num_pat(&self) -> Result<i64, GatewayError>;

    /// Exact (or sharded) subscriber count per channel, in request order.
    fn num_sub(&self, channels: &[String], sharded: bool)
        -> Result<Vec<(String, i64)>, GatewayError>;
}
