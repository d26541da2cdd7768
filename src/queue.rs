//! Message queue for applications that consume deliveries by polling.
//!
//! The router is the only producer. The queue is meant for a single consumer;
//! several concurrent consumers each get some of the messages, in no
//! guaranteed order.

use crate::config::{OverflowPolicy, QueueConfig};
use crate::error::{PubSubError, Result};
use crate::types::PubSubMessage;
use crossbeam_channel::{bounded, never, select, unbounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Result of handing a message to the queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Enqueued {
    Queued,
    /// Queued after discarding the oldest message.
    QueuedDroppingOldest,
    /// The queue is closed; the message was discarded.
    Closed,
}

/// External cancellation signal for [`MessageQueue::wait_for_message`].
///
/// Clones share the same signal. Cancelling is permanent.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

struct CancelInner {
    /// Dropping the sender disconnects `signal`, waking every waiter.
    trigger: Mutex<Option<Sender<()>>>,
    signal: Receiver<()>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (trigger, signal) = bounded(0);
        Self {
            inner: Arc::new(CancelInner {
                trigger: Mutex::new(Some(trigger)),
                signal,
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.trigger.lock().take();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.trigger.lock().is_none()
    }

    pub(crate) fn receiver(&self) -> &Receiver<()> {
        &self.inner.signal
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// FIFO buffer of delivered messages.
pub struct MessageQueue {
    sender: Sender<PubSubMessage>,
    receiver: Receiver<PubSubMessage>,
    /// Overflow handling; `None` when unbounded.
    overflow: Option<OverflowPolicy>,
    closed: AtomicBool,
    close_signal: Mutex<Option<Sender<()>>>,
    closed_rx: Receiver<()>,
}

impl MessageQueue {
    pub fn new(config: &QueueConfig) -> Self {
        let (sender, receiver) = match config.capacity {
            Some(capacity) => bounded(capacity.max(1)),
            None => unbounded(),
        };
        let (close_signal, closed_rx) = bounded(0);

        Self {
            sender,
            receiver,
            overflow: config.capacity.map(|_| config.overflow),
            closed: AtomicBool::new(false),
            close_signal: Mutex::new(Some(close_signal)),
            closed_rx,
        }
    }

    /// Add a message at the back, applying the overflow policy when full.
    pub(crate) fn enqueue(&self, message: PubSubMessage) -> Enqueued {
        if self.is_closed() {
            return Enqueued::Closed;
        }

        match self.overflow {
            None => match self.sender.send(message) {
                Ok(()) => Enqueued::Queued,
                Err(_) => Enqueued::Closed,
            },
            Some(OverflowPolicy::DropOldest) => {
                let mut message = message;
                let mut dropped = false;
                loop {
                    match self.sender.try_send(message) {
                        Ok(()) if dropped => return Enqueued::QueuedDroppingOldest,
                        Ok(()) => return Enqueued::Queued,
                        Err(TrySendError::Full(rejected)) => {
                            // We also own a receiver, so make room ourselves.
                            dropped |= self.receiver.try_recv().is_ok();
                            message = rejected;
                        }
                        Err(TrySendError::Disconnected(_)) => return Enqueued::Closed,
                    }
                }
            }
            Some(OverflowPolicy::BlockProducer) => {
                select! {
                    send(self.sender, message) -> sent => match sent {
                        Ok(()) => Enqueued::Queued,
                        Err(_) => Enqueued::Closed,
                    },
                    recv(self.closed_rx) -> _ => Enqueued::Closed,
                }
            }
        }
    }

    /// Block until a message arrives, the queue closes, or `cancel` fires.
    pub fn wait_for_message(&self, cancel: Option<&CancelToken>) -> Result<PubSubMessage> {
        if self.is_closed() {
            return Err(PubSubError::Closed);
        }
        let cancelled = match cancel {
            Some(token) => token.receiver().clone(),
            None => never(),
        };

        select! {
            recv(self.receiver) -> message => message.map_err(|_| PubSubError::Closed),
            recv(self.closed_rx) -> _ => Err(PubSubError::Closed),
            recv(cancelled) -> _ => Err(PubSubError::Cancelled),
        }
    }

    /// Like [`wait_for_message`](Self::wait_for_message) with a deadline.
    pub fn wait_for_message_timeout(&self, timeout: Duration) -> Result<PubSubMessage> {
        if self.is_closed() {
            return Err(PubSubError::Closed);
        }

        select! {
            recv(self.receiver) -> message => message.map_err(|_| PubSubError::Closed),
            recv(self.closed_rx) -> _ => Err(PubSubError::Closed),
            default(timeout) => Err(PubSubError::Timeout),
        }
    }

    /// Take the oldest message without blocking.
    pub fn try_pop(&self) -> Option<PubSubMessage> {
        if self.is_closed() {
            return None;
        }
        self.receiver.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close the queue and discard anything buffered. Current and future
    /// waits fail with [`PubSubError::Closed`].
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.close_signal.lock().take();
        while self.receiver.try_recv().is_ok() {}
    }
}
