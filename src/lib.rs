//! # Courier
//!
//! Client-side pub/sub subscription management: tracks what an application
//! wants to be subscribed to, keeps the server in line with it in the
//! background, and routes published messages back to the application.
//!
//! ## Core Concepts
//!
//! - **Registry**: desired subscriptions plus what the server acknowledged
//! - **Reconciler**: background thread issuing (un)subscribe commands, with
//!   retries, until both agree
//! - **Router**: matches push frames against confirmed subscriptions
//! - **Delivery**: either a [`MessageQueue`] or a [`MessageHandler`] callback
//! - **Gateway**: the transport seam, with an in-memory broker for tests
//!
//! ## Example
//!
//! ```
//! use courier::{Delivery, MemoryBroker, PubSubClient, PubSubConfig, SubscriptionMode, Topology};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let broker = MemoryBroker::new();
//! let client = PubSubClient::new(
//!     Arc::new(broker.connect()),
//!     Topology::Standalone,
//!     PubSubConfig::default(),
//!     Delivery::Queue,
//! )?;
//!
//! client.psubscribe_blocking(["news.*"], 1000)?;
//! client.publish("news.sports", "goal")?;
//!
//! let message = client.get_queue()?.wait_for_message_timeout(Duration::from_secs(1))?;
//! assert_eq!(message.matched_pattern.as_deref(), Some("news.*"));
//! # Ok::<(), courier::PubSubError>(())
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod gateway;
pub mod glob;
pub mod queue;
mod reconciler;
mod registry;
pub mod router;
pub mod topology;
pub mod types;

// Re-exports
pub use client::PubSubClient;
pub use config::{OverflowPolicy, PubSubConfig, QueueConfig, RetryConfig};
pub use error::{PubSubError, Result};
pub use gateway::{CommandGateway, GatewayError, MemoryBroker, MemoryGateway};
pub use queue::{CancelToken, MessageQueue};
pub use router::{Delivery, DeliveryStatsSnapshot, HandlerContext, HandlerError, MessageHandler};
pub use types::*;
