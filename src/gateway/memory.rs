//! In-process broker and gateway.

use super::{CommandGateway, GatewayError};
use crate::glob::glob_match;
use crate::types::{OperationKind, PubSubCommand, PushFrame, SubscriptionMode, Topic};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Server-side state of one connection.
struct Connection {
    reachable: bool,
    push: Option<Sender<PushFrame>>,
    subscriptions: HashMap<SubscriptionMode, BTreeSet<Topic>>,
    commands_sent: u64,
}

impl Connection {
    fn new() -> Self {
        Self {
            reachable: true,
            push: None,
            subscriptions: HashMap::new(),
            commands_sent: 0,
        }
    }

    fn subscribed(&self, mode: SubscriptionMode) -> impl Iterator<Item = &Topic> {
        self.subscriptions.get(&mode).into_iter().flatten()
    }

    fn is_subscribed(&self, mode: SubscriptionMode, topic: &str) -> bool {
        self.subscriptions
            .get(&mode)
            .is_some_and(|topics| topics.contains(topic))
    }

    fn push(&self, frame: PushFrame) -> bool {
        match &self.push {
            Some(sender) => sender.send(frame).is_ok(),
            None => false,
        }
    }
}

#[derive(Default)]
struct BrokerState {
    next_id: u64,
    connections: BTreeMap<u64, Connection>,
    /// Globs of topics subscribers may not use.
    rejected: Vec<String>,
}

/// A process-local stand-in for a pub/sub server.
///
/// Every [`MemoryGateway`] obtained from [`MemoryBroker::connect`] behaves like
/// one client connection: it holds its own server-side subscription set and
/// push stream. Publication order is preserved per connection.
#[derive(Default)]
pub struct MemoryBroker {
    state: Mutex<BrokerState>,
}

impl MemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Open a new connection to this broker.
    pub fn connect(self: &Arc<Self>) -> MemoryGateway {
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.connections.insert(id, Connection::new());

        MemoryGateway {
            broker: Arc::clone(self),
            id,
        }
    }

    /// Refuse subscriptions to topics matching `pattern`.
    pub fn reject_topics(&self, pattern: impl Into<String>) {
        self.state.lock().rejected.push(pattern.into());
    }

    /// Lift all rejections.
    pub fn clear_rejections(&self) {
        self.state.lock().rejected.clear();
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().connections.len()
    }

    /// Deliver a publication to every matching subscription and return the
    /// receiver count. A connection with both an exact and a pattern match
    /// receives one frame per match.
    pub fn publish(&self, channel: &str, payload: &[u8], sharded: bool) -> i64 {
        let state = self.state.lock();
        let mut receivers = 0;

        for conn in state.connections.values().filter(|c| c.reachable) {
            if sharded {
                if conn.is_subscribed(SubscriptionMode::Sharded, channel)
                    && conn.push(PushFrame::smessage(channel, payload))
                {
                    receivers += 1;
                }
                continue;
            }

            if conn.is_subscribed(SubscriptionMode::Exact, channel)
                && conn.push(PushFrame::message(channel, payload))
            {
                receivers += 1;
            }
            for pattern in conn.subscribed(SubscriptionMode::Pattern) {
                if glob_match(pattern, channel)
                    && conn.push(PushFrame::pmessage(pattern.as_str(), channel, payload))
                {
                    receivers += 1;
                }
            }
        }

        receivers
    }

    fn with_connection<T>(
        &self,
        id: u64,
        f: impl FnOnce(&mut Connection, &[String]) -> Result<T, GatewayError>,
    ) -> Result<T, GatewayError> {
        let mut state = self.state.lock();
        let BrokerState {
            connections,
            rejected,
            ..
        } = &mut *state;

        let conn = connections
            .get_mut(&id)
            .ok_or_else(|| GatewayError::Unavailable("connection closed".to_string()))?;
        if !conn.reachable {
            return Err(GatewayError::Unavailable("server unreachable".to_string()));
        }
        f(conn, rejected.as_slice())
    }

    fn channels(&self, pattern: Option<&str>, sharded: bool) -> Vec<String> {
        let mode = if sharded {
            SubscriptionMode::Sharded
        } else {
            SubscriptionMode::Exact
        };
        let state = self.state.lock();
        let channels: BTreeSet<&Topic> = state
            .connections
            .values()
            .filter(|c| c.reachable)
            .flat_map(|c| c.subscribed(mode))
            .filter(|channel| pattern.map_or(true, |p| glob_match(p, channel)))
            .collect();
        channels.into_iter().cloned().collect()
    }

    fn num_pat(&self) -> i64 {
        let state = self.state.lock();
        let patterns: BTreeSet<&Topic> = state
            .connections
            .values()
            .filter(|c| c.reachable)
            .flat_map(|c| c.subscribed(SubscriptionMode::Pattern))
            .collect();
        patterns.len() as i64
    }

    fn num_sub(&self, channels: &[String], sharded: bool) -> Vec<(String, i64)> {
        let mode = if sharded {
            SubscriptionMode::Sharded
        } else {
            SubscriptionMode::Exact
        };
        let state = self.state.lock();
        channels
            .iter()
            .map(|channel| {
                let count = state
                    .connections
                    .values()
                    .filter(|c| c.reachable && c.is_subscribed(mode, channel))
                    .count();
                (channel.clone(), count as i64)
            })
            .collect()
    }
}

/// One connection to a [`MemoryBroker`].
pub struct MemoryGateway {
    broker: Arc<MemoryBroker>,
    id: u64,
}

impl MemoryGateway {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn broker(&self) -> &Arc<MemoryBroker> {
        &self.broker
    }

    /// Simulate losing or regaining the connection. Losing it ends the push
    /// stream and drops every server-side subscription.
    pub fn set_reachable(&self, reachable: bool) {
        let mut state = self.broker.state.lock();
        if let Some(conn) = state.connections.get_mut(&self.id) {
            conn.reachable = reachable;
            if !reachable {
                conn.push = None;
                conn.subscriptions.clear();
            }
            debug!(connection = self.id, reachable, "Memory gateway reachability changed");
        }
    }

    /// Subscriptions the broker holds for this connection.
    pub fn server_subscriptions(&self, mode: SubscriptionMode) -> BTreeSet<Topic> {
        let state = self.broker.state.lock();
        state
            .connections
            .get(&self.id)
            .map(|c| c.subscribed(mode).cloned().collect())
            .unwrap_or_default()
    }

    /// Commands accepted or refused by the broker for this connection.
    pub fn commands_sent(&self) -> u64 {
        let state = self.broker.state.lock();
        state
            .connections
            .get(&self.id)
            .map_or(0, |c| c.commands_sent)
    }
}

impl CommandGateway for MemoryGateway {
    fn send_command(
        &self,
        command: PubSubCommand,
        topics: &[Topic],
        _timeout: Option<Duration>,
    ) -> Result<(), GatewayError> {
        self.broker.with_connection(self.id, |conn, rejected| {
            conn.commands_sent += 1;
            let mode = command.mode();

            match command.kind() {
                OperationKind::Subscribe => {
                    if let Some(topic) = topics
                        .iter()
                        .find(|topic| rejected.iter().any(|r| glob_match(r, topic)))
                    {
                        warn!(connection = self.id, %command, topic = %topic, "Broker refused subscription");
                        return Err(GatewayError::Rejected(format!(
                            "NOPERM no permissions to access the '{topic}' channel"
                        )));
                    }
                    conn.subscriptions
                        .entry(mode)
                        .or_default()
                        .extend(topics.iter().cloned());
                }
                OperationKind::Unsubscribe => {
                    let entry = conn.subscriptions.entry(mode).or_default();
                    if topics.is_empty() {
                        entry.clear();
                    } else {
                        for topic in topics {
                            entry.remove(topic);
                        }
                    }
                }
            }
            Ok(())
        })
    }

    fn push_stream(&self) -> Result<Receiver<PushFrame>, GatewayError> {
        self.broker.with_connection(self.id, |conn, _| {
            let (sender, receiver) = unbounded();
            conn.push = Some(sender);
            Ok(receiver)
        })
    }

    fn publish(&self, channel: &str, payload: &[u8], sharded: bool) -> Result<i64, GatewayError> {
        self.broker.with_connection(self.id, |_, _| Ok(()))?;
        Ok(self.broker.publish(channel, payload, sharded))
    }

    fn channels(&self, pattern: Option<&str>, sharded: bool) -> Result<Vec<String>, GatewayError> {
        self.broker.with_connection(self.id, |_, _| Ok(()))?;
        Ok(self.broker.channels(pattern, sharded))
    }

    fn num_pat(&self) -> Result<i64, GatewayError> {
        self.broker.with_connection(self.id, |_, _| Ok(()))?;
        Ok(self.broker.num_pat())
    }

    fn num_sub(
        &self,
        channels: &[String],
        sharded: bool,
    ) -> Result<Vec<(String, i64)>, GatewayError> {
        self.broker.with_connection(self.id, |_, _| Ok(()))?;
        Ok(self.broker.num_sub(channels, sharded))
    }
}

impl Drop for MemoryGateway {
    fn drop(&mut self) {
        self.broker.state.lock().connections.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topics(names: &[&str]) -> Vec<Topic> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_publish_reaches_exact_and_pattern() {
        let broker = MemoryBroker::new();
        let gateway = broker.connect();
        let stream = gateway.push_stream().unwrap();

        gateway
            .send_command(PubSubCommand::Subscribe, &topics(&["news.sports"]), None)
            .unwrap();
        gateway
            .send_command(PubSubCommand::PSubscribe, &topics(&["news.*"]), None)
            .unwrap();

        assert_eq!(broker.publish("news.sports", b"goal", false), 2);

        let first = stream.try_recv().unwrap();
        let second = stream.try_recv().unwrap();
        assert_eq!(first, PushFrame::message("news.sports", b"goal".to_vec()));
        assert_eq!(
            second,
            PushFrame::pmessage("news.*", "news.sports", b"goal".to_vec())
        );
    }

    #[test]
    fn test_sharded_publish_is_separate() {
        let broker = MemoryBroker::new();
        let gateway = broker.connect();
        let stream = gateway.push_stream().unwrap();

        gateway
            .send_command(PubSubCommand::SSubscribe, &topics(&["orders"]), None)
            .unwrap();

        assert_eq!(broker.publish("orders", b"x", false), 0);
        assert_eq!(broker.publish("orders", b"x", true), 1);
        assert_eq!(stream.try_recv().unwrap().kind, crate::types::PushKind::SMessage);
    }

    #[test]
    fn test_unreachable_drops_state() {
        let broker = MemoryBroker::new();
        let gateway = broker.connect();
        let stream = gateway.push_stream().unwrap();
        gateway
            .send_command(PubSubCommand::Subscribe, &topics(&["a"]), None)
            .unwrap();

        gateway.set_reachable(false);

        assert!(stream.recv().is_err());
        assert!(gateway.server_subscriptions(SubscriptionMode::Exact).is_empty());
        assert!(matches!(
            gateway.send_command(PubSubCommand::Subscribe, &topics(&["a"]), None),
            Err(GatewayError::Unavailable(_))
        ));
        assert!(gateway.push_stream().is_err());

        gateway.set_reachable(true);
        assert!(gateway
            .send_command(PubSubCommand::Subscribe, &topics(&["a"]), None)
            .is_ok());
    }

    #[test]
    fn test_rejected_topics() {
        let broker = MemoryBroker::new();
        broker.reject_topics("secret.*");
        let gateway = broker.connect();

        let result = gateway.send_command(
            PubSubCommand::Subscribe,
            &topics(&["public", "secret.plans"]),
            None,
        );
        assert!(matches!(result, Err(GatewayError::Rejected(_))));
        assert!(gateway.server_subscriptions(SubscriptionMode::Exact).is_empty());
        assert_eq!(gateway.commands_sent(), 1);
    }

    #[test]
    fn test_introspection() {
        let broker = MemoryBroker::new();
        let first = broker.connect();
        let second = broker.connect();

        first
            .send_command(PubSubCommand::Subscribe, &topics(&["a", "b"]), None)
            .unwrap();
        second
            .send_command(PubSubCommand::Subscribe, &topics(&["b"]), None)
            .unwrap();
        second
            .send_command(PubSubCommand::PSubscribe, &topics(&["a*", "b*"]), None)
            .unwrap();
        first
            .send_command(PubSubCommand::PSubscribe, &topics(&["a*"]), None)
            .unwrap();

        assert_eq!(first.channels(None, false).unwrap(), topics(&["a", "b"]));
        assert_eq!(first.channels(Some("a*"), false).unwrap(), topics(&["a"]));
        assert_eq!(first.num_pat().unwrap(), 2);
        assert_eq!(
            first.num_sub(&topics(&["a", "b", "c"]), false).unwrap(),
            vec![("a".to_string(), 1), ("b".to_string(), 2), ("c".to_string(), 0)]
        );
    }

    #[test]
    fn test_drop_disconnects() {
        let broker = MemoryBroker::new();
        let gateway = broker.connect();
        assert_eq!(broker.connection_count(), 1);
        drop(gateway);
        assert_eq!(broker.connection_count(), 0);
    }
}
