//! Delivery targets and delivery diagnostics.

use crate::types::PubSubMessage;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Error a handler may return. It is logged and counted, never propagated.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Opaque value supplied at registration and passed to every invocation.
pub type HandlerContext = Arc<dyn Any + Send + Sync>;

/// Application callback for delivered messages.
///
/// Invoked on the router thread in arrival order. A slow handler delays every
/// later message for the client. Handlers must not make blocking
/// (un)subscribe calls on the same client.
pub trait MessageHandler: Send + Sync {
    fn on_message(&self, message: &PubSubMessage, context: &HandlerContext) -> Result<(), HandlerError>;
}

impl<F> MessageHandler for F
where
    F: Fn(&PubSubMessage, &HandlerContext) -> Result<(), HandlerError> + Send + Sync,
{
    fn on_message(&self, message: &PubSubMessage, context: &HandlerContext) -> Result<(), HandlerError> {
        self(message, context)
    }
}

/// Where the router sends matched messages. Chosen once per client.
#[derive(Clone, Default)]
pub enum Delivery {
    /// Buffer messages in the client's [`MessageQueue`](crate::MessageQueue).
    #[default]
    Queue,
    /// Invoke a handler for each message.
    Callback {
        handler: Arc<dyn MessageHandler>,
        context: HandlerContext,
    },
}

impl Delivery {
    pub fn handler(handler: impl MessageHandler + 'static, context: HandlerContext) -> Self {
        Delivery::Callback {
            handler: Arc::new(handler),
            context,
        }
    }

    /// Callback delivery from a closure.
    pub fn from_fn<F>(f: F, context: HandlerContext) -> Self
    where
        F: Fn(&PubSubMessage, &HandlerContext) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        Self::handler(f, context)
    }

    pub fn is_callback(&self) -> bool {
        matches!(self, Delivery::Callback { .. })
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Delivery::Queue => f.write_str("Queue"),
            Delivery::Callback { .. } => f.write_str("Callback"),
        }
    }
}

/// Live counters, updated by the router thread.
#[derive(Default)]
pub(crate) struct DeliveryStats {
    delivered: AtomicU64,
    unmatched: AtomicU64,
    dropped: AtomicU64,
    handler_failures: AtomicU64,
}

impl DeliveryStats {
    pub fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unmatched(&self) {
        self.unmatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_handler_failure(&self) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DeliveryStatsSnapshot {
        DeliveryStatsSnapshot {
            delivered: self.delivered.load(Ordering::Relaxed),
            unmatched: self.unmatched.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time delivery counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryStatsSnapshot {
    /// Messages handed to the queue or a handler (including failed handler calls).
    pub delivered: u64,
    /// Push frames that matched no confirmed subscription.
    pub unmatched: u64,
    /// Messages discarded by a full drop-oldest queue.
    pub dropped: u64,
    /// Handler calls that returned an error or panicked.
    pub handler_failures: u64,
}
