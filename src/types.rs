//! Core types for subscription management.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// A channel name or glob pattern.
pub type Topic = String;

/// How a topic is matched against published channels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SubscriptionMode {
    /// Exact channel name.
    Exact,
    /// Glob pattern over channel names.
    Pattern,
    /// Cluster-sharded channel, bound to the shard owning its slot.
    Sharded,
}

impl fmt::Display for SubscriptionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SubscriptionMode::Exact => "exact",
            SubscriptionMode::Pattern => "pattern",
            SubscriptionMode::Sharded => "sharded",
        };
        f.write_str(name)
    }
}

/// Deployment topology of the client. Fixed at construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topology {
    Standalone,
    Cluster,
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topology::Standalone => f.write_str("standalone"),
            Topology::Cluster => f.write_str("cluster"),
        }
    }
}

/// Identity of a subscription intent.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubscriptionKey {
    pub mode: SubscriptionMode,
    pub topic: Topic,
}

impl SubscriptionKey {
    pub fn new(mode: SubscriptionMode, topic: impl Into<Topic>) -> Self {
        Self {
            mode,
            topic: topic.into(),
        }
    }
}

impl fmt::Debug for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.mode, self.topic)
    }
}

/// Direction of a reconciliation step.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Subscribe,
    Unsubscribe,
}

/// Protocol command issued through the gateway.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PubSubCommand {
    Subscribe,
    Unsubscribe,
    PSubscribe,
    PUnsubscribe,
    SSubscribe,
    SUnsubscribe,
}

impl PubSubCommand {
    pub fn new(mode: SubscriptionMode, kind: OperationKind) -> Self {
        match (mode, kind) {
            (SubscriptionMode::Exact, OperationKind::Subscribe) => PubSubCommand::Subscribe,
            (SubscriptionMode::Exact, OperationKind::Unsubscribe) => PubSubCommand::Unsubscribe,
            (SubscriptionMode::Pattern, OperationKind::Subscribe) => PubSubCommand::PSubscribe,
            (SubscriptionMode::Pattern, OperationKind::Unsubscribe) => PubSubCommand::PUnsubscribe,
            (SubscriptionMode::Sharded, OperationKind::Subscribe) => PubSubCommand::SSubscribe,
            (SubscriptionMode::Sharded, OperationKind::Unsubscribe) => PubSubCommand::SUnsubscribe,
        }
    }

    pub fn mode(&self) -> SubscriptionMode {
        match self {
            PubSubCommand::Subscribe | PubSubCommand::Unsubscribe => SubscriptionMode::Exact,
            PubSubCommand::PSubscribe | PubSubCommand::PUnsubscribe => SubscriptionMode::Pattern,
            PubSubCommand::SSubscribe | PubSubCommand::SUnsubscribe => SubscriptionMode::Sharded,
        }
    }

    pub fn kind(&self) -> OperationKind {
        match self {
            PubSubCommand::Subscribe | PubSubCommand::PSubscribe | PubSubCommand::SSubscribe => {
                OperationKind::Subscribe
            }
            _ => OperationKind::Unsubscribe,
        }
    }

    /// Wire name of the command.
    pub fn name(&self) -> &'static str {
        match self {
            PubSubCommand::Subscribe => "SUBSCRIBE",
            PubSubCommand::Unsubscribe => "UNSUBSCRIBE",
            PubSubCommand::PSubscribe => "PSUBSCRIBE",
            PubSubCommand::PUnsubscribe => "PUNSUBSCRIBE",
            PubSubCommand::SSubscribe => "SSUBSCRIBE",
            PubSubCommand::SUnsubscribe => "SUNSUBSCRIBE",
        }
    }
}

impl fmt::Display for PubSubCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Kind of an inbound push frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PushKind {
    /// Publication on an exactly subscribed channel.
    Message,
    /// Publication matched by a pattern subscription.
    PMessage,
    /// Publication on a sharded channel.
    SMessage,
}

/// An unsolicited publish notification from the server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PushFrame {
    pub kind: PushKind,
    pub channel: String,
    pub payload: Vec<u8>,
    /// Pattern that matched, when the server reports it.
    pub pattern: Option<String>,
}

impl PushFrame {
    pub fn message(channel: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: PushKind::Message,
            channel: channel.into(),
            payload: payload.into(),
            pattern: None,
        }
    }

    pub fn pmessage(
        pattern: impl Into<String>,
        channel: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            kind: PushKind::PMessage,
            channel: channel.into(),
            payload: payload.into(),
            pattern: Some(pattern.into()),
        }
    }

    pub fn smessage(channel: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: PushKind::SMessage,
            channel: channel.into(),
            payload: payload.into(),
            pattern: None,
        }
    }
}

/// A message delivered to application code.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PubSubMessage {
    pub channel: String,
    /// Set only for pattern-mode matches.
    pub matched_pattern: Option<String>,
    pub payload: Vec<u8>,
    pub sharded: bool,
}

impl PubSubMessage {
    /// Payload as UTF-8, replacing invalid sequences.
    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// Topics grouped by mode, ordered for stable output.
pub type SubscriptionMap = BTreeMap<SubscriptionMode, BTreeSet<Topic>>;

/// Point-in-time view of desired and confirmed subscriptions.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionState {
    pub desired: SubscriptionMap,
    pub confirmed: SubscriptionMap,
}

impl SubscriptionState {
    /// Topics desired under `mode`.
    pub fn desired_topics(&self, mode: SubscriptionMode) -> BTreeSet<Topic> {
        self.desired.get(&mode).cloned().unwrap_or_default()
    }

    /// Topics confirmed under `mode`.
    pub fn confirmed_topics(&self, mode: SubscriptionMode) -> BTreeSet<Topic> {
        self.confirmed.get(&mode).cloned().unwrap_or_default()
    }

    pub fn is_desired(&self, key: &SubscriptionKey) -> bool {
        self.desired
            .get(&key.mode)
            .is_some_and(|topics| topics.contains(&key.topic))
    }

    pub fn is_confirmed(&self, key: &SubscriptionKey) -> bool {
        self.confirmed
            .get(&key.mode)
            .is_some_and(|topics| topics.contains(&key.topic))
    }

    /// Number of desired keys across all modes.
    pub fn desired_len(&self) -> usize {
        self.desired.values().map(BTreeSet::len).sum()
    }

    /// True when every desired key is confirmed.
    pub fn is_synchronized(&self) -> bool {
        self.desired_len() == self.confirmed.values().map(BTreeSet::len).sum::<usize>()
    }
}
