//! Message routing from the push stream to the application.
//!
//! The router runs on its own thread per client. For each push frame it looks
//! up matching confirmed subscriptions and hands one [`PubSubMessage`] per
//! match to the client's delivery target:
//!
//! - `Message` frames match exact subscriptions by channel name
//! - `SMessage` frames match sharded subscriptions by channel name
//! - `PMessage` frames match the reported pattern, or every confirmed
//!   pattern that globs the channel when the server did not report one
//!
//! A publication that matches both an exact and a pattern subscription is
//! delivered twice, once per match, as the server sends it.

mod delivery;

pub use delivery::{
    Delivery, DeliveryStatsSnapshot, HandlerContext, HandlerError, MessageHandler,
};
pub(crate) use delivery::DeliveryStats;

use crate::config::RetryConfig;
use crate::gateway::CommandGateway;
use crate::glob::glob_match;
use crate::queue::{Enqueued, MessageQueue};
use crate::reconciler::Control;
use crate::registry::Registry;
use crate::types::{PubSubMessage, PushFrame, PushKind, SubscriptionMode};
use backon::BackoffBuilder;
use crossbeam_channel::{select, Receiver, Sender};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Resolved delivery target.
pub(crate) enum Sink {
    Queue(Arc<MessageQueue>),
    Callback {
        handler: Arc<dyn MessageHandler>,
        context: HandlerContext,
    },
}

/// Messages produced by one push frame.
pub(crate) fn match_frame(registry: &Registry, frame: &PushFrame) -> Vec<PubSubMessage> {
    let view = registry.confirmed();
    let message = |pattern: Option<&str>, sharded: bool| PubSubMessage {
        channel: frame.channel.clone(),
        matched_pattern: pattern.map(str::to_string),
        payload: frame.payload.clone(),
        sharded,
    };

    match (frame.kind, frame.pattern.as_deref()) {
        (PushKind::Message, _) => {
            if view.contains(SubscriptionMode::Exact, &frame.channel) {
                vec![message(None, false)]
            } else {
                Vec::new()
            }
        }
        (PushKind::SMessage, _) => {
            if view.contains(SubscriptionMode::Sharded, &frame.channel) {
                vec![message(None, true)]
            } else {
                Vec::new()
            }
        }
        (PushKind::PMessage, Some(pattern)) => {
            if view.contains(SubscriptionMode::Pattern, pattern) {
                vec![message(Some(pattern), false)]
            } else {
                Vec::new()
            }
        }
        (PushKind::PMessage, None) => view
            .patterns()
            .filter(|pattern| glob_match(pattern, &frame.channel))
            .map(|pattern| message(Some(pattern.as_str()), false))
            .collect(),
    }
}

pub(crate) struct Router {
    name: String,
    registry: Arc<Registry>,
    gateway: Arc<dyn CommandGateway>,
    sink: Sink,
    stats: Arc<DeliveryStats>,
    control: Sender<Control>,
    shutdown: Receiver<()>,
    retry: RetryConfig,
    stream: Receiver<PushFrame>,
}

impl Router {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: String,
        registry: Arc<Registry>,
        gateway: Arc<dyn CommandGateway>,
        sink: Sink,
        stats: Arc<DeliveryStats>,
        control: Sender<Control>,
        shutdown: Receiver<()>,
        retry: RetryConfig,
        stream: Receiver<PushFrame>,
    ) -> Self {
        Self {
            name,
            registry,
            gateway,
            sink,
            stats,
            control,
            shutdown,
            retry,
            stream,
        }
    }

    /// Start the router on its own thread.
    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name(format!("{}-router", self.name))
            .spawn(move || self.run())
    }

    fn run(mut self) {
        debug!(client = %self.name, "Router started");

        loop {
            select! {
                recv(self.stream) -> frame => match frame {
                    Ok(frame) => self.route(frame),
                    Err(_) => {
                        info!(client = %self.name, "Push stream ended");
                        let _ = self.control.send(Control::ConnectionReset);
                        match self.reopen() {
                            Some(stream) => self.stream = stream,
                            None => break,
                        }
                    }
                },
                recv(self.shutdown) -> _ => break,
            }
        }

        debug!(client = %self.name, "Router stopped");
    }

    /// Reacquire the push stream, backing off between attempts. `None` on
    /// shutdown.
    fn reopen(&self) -> Option<Receiver<PushFrame>> {
        let mut backoff = self.retry.backoff().build();
        let mut attempts = 0u32;

        loop {
            match self.gateway.push_stream() {
                Ok(stream) => {
                    info!(client = %self.name, attempts, "Push stream reopened");
                    return Some(stream);
                }
                Err(error) => {
                    attempts += 1;
                    let delay = backoff.next().unwrap_or(self.retry.max_delay());
                    debug!(
                        client = %self.name,
                        %error,
                        attempts,
                        retry_ms = delay.as_millis() as u64,
                        "Push stream unavailable"
                    );
                    select! {
                        recv(self.shutdown) -> _ => return None,
                        default(delay) => {}
                    }
                }
            }
        }
    }

    fn route(&self, frame: PushFrame) {
        // Deliver outside the registry lock.
        let messages = match_frame(&self.registry, &frame);
        if messages.is_empty() {
            self.stats.record_unmatched();
            debug!(client = %self.name, kind = ?frame.kind, channel = %frame.channel, "Unmatched push frame");
            return;
        }
        for message in messages {
            self.deliver(message);
        }
    }

    fn deliver(&self, message: PubSubMessage) {
        match &self.sink {
            Sink::Queue(queue) => match queue.enqueue(message) {
                Enqueued::Queued => self.stats.record_delivered(),
                Enqueued::QueuedDroppingOldest => {
                    self.stats.record_delivered();
                    self.stats.record_dropped();
                    warn!(client = %self.name, queued = queue.len(), "Message queue full, dropped oldest message");
                }
                Enqueued::Closed => {}
            },
            Sink::Callback { handler, context } => {
                self.stats.record_delivered();
                let result =
                    panic::catch_unwind(AssertUnwindSafe(|| handler.on_message(&message, context)));
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(error)) => {
                        self.stats.record_handler_failure();
                        warn!(client = %self.name, channel = %message.channel, %error, "Message handler failed");
                    }
                    Err(payload) => {
                        self.stats.record_handler_failure();
                        let reason = payload
                            .downcast_ref::<&str>()
                            .map(|s| s.to_string())
                            .or_else(|| payload.downcast_ref::<String>().cloned())
                            .unwrap_or_else(|| "unknown panic".to_string());
                        warn!(client = %self.name, channel = %message.channel, %reason, "Message handler panicked");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Topic;
    use crossbeam_channel::unbounded;

    fn registry_with(mode: SubscriptionMode, topics: &[&str]) -> Registry {
        let (tx, _rx) = unbounded();
        let registry = Registry::new(tx);
        let topics: Vec<Topic> = topics.iter().map(|t| t.to_string()).collect();
        registry.add_desired(mode, &topics);
        registry.acknowledge(mode, &topics);
        registry
    }

    #[test]
    fn test_exact_match() {
        let registry = registry_with(SubscriptionMode::Exact, &["a"]);

        let found = match_frame(&registry, &PushFrame::message("a", b"x".to_vec()));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].matched_pattern, None);
        assert!(!found[0].sharded);

        assert!(match_frame(&registry, &PushFrame::message("b", b"x".to_vec())).is_empty());
        // Same name but a different mode.
        assert!(match_frame(&registry, &PushFrame::smessage("a", b"x".to_vec())).is_empty());
    }

    #[test]
    fn test_pattern_match_reported() {
        let registry = registry_with(SubscriptionMode::Pattern, &["news.*", "sport?"]);

        let found = match_frame(
            &registry,
            &PushFrame::pmessage("news.*", "news.sports", b"x".to_vec()),
        );
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].matched_pattern.as_deref(), Some("news.*"));
        assert_eq!(found[0].channel, "news.sports");
    }

    #[test]
    fn test_pattern_match_unreported_globs_all() {
        let registry = registry_with(SubscriptionMode::Pattern, &["n*", "news.*", "x*"]);
        let frame = PushFrame {
            kind: PushKind::PMessage,
            channel: "news.sports".to_string(),
            payload: Vec::new(),
            pattern: None,
        };

        let mut patterns: Vec<String> = match_frame(&registry, &frame)
            .into_iter()
            .filter_map(|m| m.matched_pattern)
            .collect();
        patterns.sort();
        assert_eq!(patterns, vec!["n*".to_string(), "news.*".to_string()]);
    }

    #[test]
    fn test_unconfirmed_not_delivered() {
        let (tx, _rx) = unbounded();
        let registry = Registry::new(tx);
        registry.add_desired(SubscriptionMode::Exact, &["a".to_string()]);
        assert!(match_frame(&registry, &PushFrame::message("a", b"x".to_vec())).is_empty());

        // Acknowledged but no longer desired.
        registry.acknowledge(SubscriptionMode::Exact, &["a".to_string()]);
        registry.remove_desired(SubscriptionMode::Exact, &["a".to_string()]);
        assert!(match_frame(&registry, &PushFrame::message("a", b"x".to_vec())).is_empty());
    }

    #[test]
    fn test_sharded_flag() {
        let registry = registry_with(SubscriptionMode::Sharded, &["orders"]);
        let found = match_frame(&registry, &PushFrame::smessage("orders", b"x".to_vec()));
        assert_eq!(found.len(), 1);
        assert!(found[0].sharded);
    }
}
