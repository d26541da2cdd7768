//! The application-facing pub/sub client.

use crate::config::PubSubConfig;
use crate::error::{PubSubError, Result};
use crate::gateway::CommandGateway;
use crate::queue::MessageQueue;
use crate::reconciler::{Control, Outcome, Reconciler, WaiterTable};
use crate::registry::Registry;
use crate::router::{Delivery, DeliveryStats, DeliveryStatsSnapshot, Router, Sink};
use crate::topology;
use crate::types::{
    OperationKind, SubscriptionKey, SubscriptionMode, SubscriptionState, Topic, Topology,
};
use crossbeam_channel::{bounded, unbounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Deduplicate caller-supplied topics.
fn collect_topics<I, T>(topics: I) -> Vec<Topic>
where
    I: IntoIterator<Item = T>,
    T: Into<Topic>,
{
    let unique: BTreeSet<Topic> = topics.into_iter().map(Into::into).collect();
    unique.into_iter().collect()
}

/// A pub/sub client: subscription state, background reconciliation and
/// message delivery for one gateway connection.
///
/// Lazy calls (`subscribe`, `unsubscribe`, ...) only update the desired
/// state and return. Blocking calls (`*_blocking`) also wait for the server
/// to confirm, up to `timeout_ms` (0 waits indefinitely). A timed-out
/// blocking call leaves its request in place; reconciliation continues.
///
/// Closing the client (explicitly or on drop) cancels every blocked call and
/// closes the message queue.
pub struct PubSubClient {
    name: String,
    topology: Topology,
    registry: Arc<Registry>,
    waiters: Arc<WaiterTable>,
    gateway: Arc<dyn CommandGateway>,
    queue: Option<Arc<MessageQueue>>,
    stats: Arc<DeliveryStats>,
    control: Sender<Control>,
    router_shutdown: Mutex<Option<Sender<()>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
    next_call: AtomicU64,
}

impl PubSubClient {
    /// Create a client and start its background threads.
    ///
    /// `config.initial_subscriptions` are validated against `topology` and
    /// then applied as lazy subscribes.
    pub fn new(
        gateway: Arc<dyn CommandGateway>,
        topology: Topology,
        config: PubSubConfig,
        delivery: Delivery,
    ) -> Result<Self> {
        for (mode, topics) in &config.initial_subscriptions {
            if !topics.is_empty() {
                topology::validate(*mode, topology)?;
            }
        }

        let name = config.client_name.clone();
        let stream = match gateway.push_stream() {
            Ok(stream) => stream,
            Err(error) => {
                // The router reopens it once the gateway is reachable.
                warn!(client = %name, %error, "Push stream unavailable at startup");
                let (_, ended) = unbounded();
                ended
            }
        };

        let (queue, sink) = match &delivery {
            Delivery::Queue => {
                let queue = Arc::new(MessageQueue::new(&config.queue));
                (Some(Arc::clone(&queue)), Sink::Queue(queue))
            }
            Delivery::Callback { handler, context } => (
                None,
                Sink::Callback {
                    handler: Arc::clone(handler),
                    context: Arc::clone(context),
                },
            ),
        };

        let (control, control_rx) = unbounded();
        let (router_shutdown, shutdown_rx) = bounded(0);
        let registry = Arc::new(Registry::new(control.clone()));
        let waiters = Arc::new(WaiterTable::new());
        let stats = Arc::new(DeliveryStats::default());

        let reconciler = Reconciler::new(
            name.clone(),
            Arc::clone(&registry),
            Arc::clone(&waiters),
            Arc::clone(&gateway),
            control_rx,
            config.retry.clone(),
            config.reconcile_interval(),
            config.command_timeout(),
        )
        .spawn()?;

        let router = Router::new(
            name.clone(),
            Arc::clone(&registry),
            Arc::clone(&gateway),
            sink,
            Arc::clone(&stats),
            control.clone(),
            shutdown_rx,
            config.retry.clone(),
            stream,
        )
        .spawn();
        let router = match router {
            Ok(handle) => handle,
            Err(error) => {
                let _ = control.send(Control::Shutdown);
                let _ = reconciler.join();
                return Err(error.into());
            }
        };

        let client = Self {
            name,
            topology,
            registry,
            waiters,
            gateway,
            queue,
            stats,
            control,
            router_shutdown: Mutex::new(Some(router_shutdown)),
            threads: Mutex::new(vec![reconciler, router]),
            closed: AtomicBool::new(false),
            next_call: AtomicU64::new(1),
        };

        for (mode, topics) in config.initial_subscriptions {
            let topics = collect_topics(topics);
            if !topics.is_empty() {
                client.registry.add_desired(mode, &topics);
            }
        }

        info!(client = %client.name, %topology, ?delivery, "Pub/sub client started");
        Ok(client)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn topology(&self) -> Topology {
        self.topology
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(PubSubError::Closed)
        } else {
            Ok(())
        }
    }

    fn prepare_subscribe<I, T>(&self, mode: SubscriptionMode, topics: I) -> Result<Vec<Topic>>
    where
        I: IntoIterator<Item = T>,
        T: Into<Topic>,
    {
        self.ensure_open()?;
        topology::validate(mode, self.topology)?;
        let topics = collect_topics(topics);
        if topics.is_empty() {
            return Err(PubSubError::InvalidArgument(
                "subscribe requires at least one topic".to_string(),
            ));
        }
        Ok(topics)
    }

    // --- Subscribe ---

    /// Add topics to the desired state and return without waiting.
    pub fn subscribe<I, T>(&self, mode: SubscriptionMode, topics: I) -> Result<()>
    where
        I: IntoIterator<Item = T>,
        T: Into<Topic>,
    {
        let topics = self.prepare_subscribe(mode, topics)?;
        let added = self.registry.add_desired(mode, &topics);
        debug!(client = %self.name, %mode, topics = ?topics, added, "Subscribe requested");
        Ok(())
    }

    /// Subscribe and wait until every topic is confirmed or fails.
    ///
    /// On [`PubSubError::ServerRejected`] the rejected topics are no longer
    /// desired; the others remain subscribed.
    pub fn subscribe_blocking<I, T>(
        &self,
        mode: SubscriptionMode,
        topics: I,
        timeout_ms: u64,
    ) -> Result<()>
    where
        I: IntoIterator<Item = T>,
        T: Into<Topic>,
    {
        let topics = self.prepare_subscribe(mode, topics)?;
        debug!(client = %self.name, %mode, topics = ?topics, timeout_ms, "Blocking subscribe requested");
        self.wait(OperationKind::Subscribe, timeout_ms, || {
            self.registry.add_desired(mode, &topics);
            topics
                .iter()
                .map(|topic| SubscriptionKey::new(mode, topic.as_str()))
                .collect()
        })
    }

    pub fn psubscribe<I, T>(&self, patterns: I) -> Result<()>
    where
        I: IntoIterator<Item = T>,
        T: Into<Topic>,
    {
        self.subscribe(SubscriptionMode::Pattern, patterns)
    }

    pub fn psubscribe_blocking<I, T>(&self, patterns: I, timeout_ms: u64) -> Result<()>
    where
        I: IntoIterator<Item = T>,
        T: Into<Topic>,
    {
        self.subscribe_blocking(SubscriptionMode::Pattern, patterns, timeout_ms)
    }

    /// Sharded subscribe. Cluster clients only.
    pub fn ssubscribe<I, T>(&self, channels: I) -> Result<()>
    where
        I: IntoIterator<Item = T>,
        T: Into<Topic>,
    {
        self.subscribe(SubscriptionMode::Sharded, channels)
    }

    pub fn ssubscribe_blocking<I, T>(&self, channels: I, timeout_ms: u64) -> Result<()>
    where
        I: IntoIterator<Item = T>,
        T: Into<Topic>,
    {
        self.subscribe_blocking(SubscriptionMode::Sharded, channels, timeout_ms)
    }

    // --- Unsubscribe ---

    /// Remove topics from the desired state. An empty list removes every
    /// topic of `mode`.
    pub fn unsubscribe<I, T>(&self, mode: SubscriptionMode, topics: I) -> Result<()>
    where
        I: IntoIterator<Item = T>,
        T: Into<Topic>,
    {
        self.ensure_open()?;
        topology::validate(mode, self.topology)?;
        let topics = collect_topics(topics);
        self.registry.remove_desired(mode, &topics);
        debug!(client = %self.name, %mode, topics = ?topics, "Unsubscribe requested");
        Ok(())
    }

    /// Unsubscribe and wait until the server has released every topic.
    pub fn unsubscribe_blocking<I, T>(
        &self,
        mode: SubscriptionMode,
        topics: I,
        timeout_ms: u64,
    ) -> Result<()>
    where
        I: IntoIterator<Item = T>,
        T: Into<Topic>,
    {
        self.ensure_open()?;
        topology::validate(mode, self.topology)?;
        let topics = collect_topics(topics);
        debug!(client = %self.name, %mode, topics = ?topics, timeout_ms, "Blocking unsubscribe requested");
        self.wait(OperationKind::Unsubscribe, timeout_ms, || {
            self.registry.remove_desired(mode, &topics)
        })
    }

    pub fn punsubscribe<I, T>(&self, patterns: I) -> Result<()>
    where
        I: IntoIterator<Item = T>,
        T: Into<Topic>,
    {
        self.unsubscribe(SubscriptionMode::Pattern, patterns)
    }

    pub fn punsubscribe_blocking<I, T>(&self, patterns: I, timeout_ms: u64) -> Result<()>
    where
        I: IntoIterator<Item = T>,
        T: Into<Topic>,
    {
        self.unsubscribe_blocking(SubscriptionMode::Pattern, patterns, timeout_ms)
    }

    pub fn sunsubscribe<I, T>(&self, channels: I) -> Result<()>
    where
        I: IntoIterator<Item = T>,
        T: Into<Topic>,
    {
        self.unsubscribe(SubscriptionMode::Sharded, channels)
    }

    pub fn sunsubscribe_blocking<I, T>(&self, channels: I, timeout_ms: u64) -> Result<()>
    where
        I: IntoIterator<Item = T>,
        T: Into<Topic>,
    {
        self.unsubscribe_blocking(SubscriptionMode::Sharded, channels, timeout_ms)
    }

    /// Apply `mutate` with waiters registered on the keys it returns, then
    /// block until every key resolves or the deadline passes.
    fn wait<F>(&self, kind: OperationKind, timeout_ms: u64, mutate: F) -> Result<()>
    where
        F: FnOnce() -> Vec<SubscriptionKey>,
    {
        let call = self.next_call.fetch_add(1, Ordering::Relaxed);
        let (notify, outcomes) = unbounded();
        let keys = self.waiters.register(call, kind, &notify, mutate)?;
        drop(notify);
        if keys.is_empty() {
            return Ok(());
        }
        // Settle keys the registry already satisfies.
        let _ = self.control.send(Control::Wake);

        let deadline =
            (timeout_ms > 0).then(|| Instant::now() + Duration::from_millis(timeout_ms));
        let mut remaining = keys.len();
        let mut failure = None;

        while remaining > 0 {
            let outcome = match deadline {
                Some(deadline) => outcomes.recv_deadline(deadline).map_err(|e| match e {
                    RecvTimeoutError::Timeout => PubSubError::Timeout,
                    RecvTimeoutError::Disconnected => PubSubError::Cancelled,
                }),
                None => outcomes.recv().map_err(|_| PubSubError::Cancelled),
            };

            match outcome {
                Ok(Outcome::Confirmed) | Ok(Outcome::Superseded) => remaining -= 1,
                Ok(Outcome::Failed(error)) => {
                    remaining -= 1;
                    failure.get_or_insert(error);
                }
                Ok(Outcome::Cancelled) => {
                    self.waiters.detach(call);
                    return Err(PubSubError::Cancelled);
                }
                Err(error) => {
                    self.waiters.detach(call);
                    debug!(client = %self.name, ?kind, %error, remaining, "Blocking call released early");
                    return Err(error);
                }
            }
        }

        match failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    // --- State ---

    /// Desired and confirmed subscriptions.
    pub fn get_subscriptions(&self) -> SubscriptionState {
        self.registry.snapshot()
    }

    /// True when no reconciliation work is outstanding.
    pub fn is_synchronized(&self) -> bool {
        self.registry.plan().is_empty()
    }

    /// The message queue. Fails when the client delivers to a handler.
    pub fn get_queue(&self) -> Result<Arc<MessageQueue>> {
        self.ensure_open()?;
        self.queue.clone().ok_or(PubSubError::QueueUnavailable)
    }

    pub fn delivery_stats(&self) -> DeliveryStatsSnapshot {
        self.stats.snapshot()
    }

    // --- Publish and introspection ---

    /// Publish to a channel. Returns the number of receivers.
    pub fn publish(&self, channel: &str, payload: impl AsRef<[u8]>) -> Result<i64> {
        self.ensure_open()?;
        Ok(self.gateway.publish(channel, payload.as_ref(), false)?)
    }

    /// Publish to a sharded channel. Cluster clients only.
    pub fn spublish(&self, channel: &str, payload: impl AsRef<[u8]>) -> Result<i64> {
        self.ensure_open()?;
        topology::validate(SubscriptionMode::Sharded, self.topology)?;
        Ok(self.gateway.publish(channel, payload.as_ref(), true)?)
    }

    /// Active channels, optionally filtered by a glob.
    pub fn pubsub_channels(&self, pattern: Option<&str>) -> Result<Vec<String>> {
        self.ensure_open()?;
        Ok(self.gateway.channels(pattern, false)?)
    }

    /// Number of distinct patterns subscribed on the server.
    pub fn pubsub_numpat(&self) -> Result<i64> {
        self.ensure_open()?;
        Ok(self.gateway.num_pat()?)
    }

    /// Exact-mode subscriber count per channel. Pattern subscribers are not
    /// counted.
    pub fn pubsub_numsub<I, T>(&self, channels: I) -> Result<HashMap<String, i64>>
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.ensure_open()?;
        let channels: Vec<String> = channels.into_iter().map(Into::into).collect();
        Ok(self.gateway.num_sub(&channels, false)?.into_iter().collect())
    }

    /// Active sharded channels. Cluster clients only.
    pub fn pubsub_shard_channels(&self, pattern: Option<&str>) -> Result<Vec<String>> {
        self.ensure_open()?;
        topology::validate(SubscriptionMode::Sharded, self.topology)?;
        Ok(self.gateway.channels(pattern, true)?)
    }

    /// Sharded subscriber count per channel. Cluster clients only.
    pub fn pubsub_shard_numsub<I, T>(&self, channels: I) -> Result<HashMap<String, i64>>
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.ensure_open()?;
        topology::validate(SubscriptionMode::Sharded, self.topology)?;
        let channels: Vec<String> = channels.into_iter().map(Into::into).collect();
        Ok(self.gateway.num_sub(&channels, true)?.into_iter().collect())
    }

    // --- Lifecycle ---

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop background threads, cancel blocked calls and close the queue.
    /// Calling it again does nothing.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let _ = self.control.send(Control::Shutdown);
        self.router_shutdown.lock().take();
        if let Some(queue) = &self.queue {
            queue.close();
        }

        // A handler may close its own client from the router thread.
        let current = thread::current().id();
        for handle in self.threads.lock().drain(..) {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!(client = %self.name, "Background thread panicked");
            }
        }

        info!(client = %self.name, "Pub/sub client closed");
    }
}

impl Drop for PubSubClient {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for PubSubClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubSubClient")
            .field("name", &self.name)
            .field("topology", &self.topology)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::MemoryBroker;

    fn client(broker: &Arc<MemoryBroker>, topology: Topology) -> PubSubClient {
        PubSubClient::new(
            Arc::new(broker.connect()),
            topology,
            PubSubConfig::default(),
            Delivery::Queue,
        )
        .unwrap()
    }

    #[test]
    fn test_collect_topics_dedupes() {
        assert_eq!(collect_topics(["b", "a", "b"]), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_empty_subscribe_rejected() {
        let broker = MemoryBroker::new();
        let client = client(&broker, Topology::Standalone);
        let empty: [&str; 0] = [];
        assert!(matches!(
            client.subscribe(SubscriptionMode::Exact, empty),
            Err(PubSubError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_unsubscribe_nothing_returns_immediately() {
        let broker = MemoryBroker::new();
        let client = client(&broker, Topology::Standalone);
        let empty: [&str; 0] = [];
        client
            .unsubscribe_blocking(SubscriptionMode::Pattern, empty, 0)
            .unwrap();
    }

    #[test]
    fn test_calls_after_close() {
        let broker = MemoryBroker::new();
        let client = client(&broker, Topology::Cluster);
        client.close();
        client.close();

        assert!(client.is_closed());
        assert_eq!(client.subscribe(SubscriptionMode::Exact, ["a"]), Err(PubSubError::Closed));
        assert_eq!(client.publish("a", "x"), Err(PubSubError::Closed));
        assert!(matches!(client.get_queue(), Err(PubSubError::Closed)));
    }

    #[test]
    fn test_invalid_initial_subscriptions() {
        let broker = MemoryBroker::new();
        let result = PubSubClient::new(
            Arc::new(broker.connect()),
            Topology::Standalone,
            PubSubConfig::default().with_initial(SubscriptionMode::Sharded, ["x"]),
            Delivery::Queue,
        );
        assert!(matches!(
            result,
            Err(PubSubError::InvalidModeForTopology { .. })
        ));
    }
}
