//! Client configuration.

use crate::error::Result;
use crate::types::{SubscriptionMode, Topic};
use backon::ExponentialBuilder;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Configuration for a pub/sub client.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PubSubConfig {
    /// Name used for thread names and log fields.
    pub client_name: String,

    /// Subscriptions applied as a lazy batch at construction.
    pub initial_subscriptions: BTreeMap<SubscriptionMode, Vec<Topic>>,

    /// Message queue settings (ignored when a handler is registered).
    pub queue: QueueConfig,

    /// Backoff for transient command failures.
    pub retry: RetryConfig,

    /// Periodic reconciliation interval.
    /// Default: 3000
    pub reconcile_interval_ms: u64,

    /// Timeout passed to the gateway for each command (None = gateway default).
    pub command_timeout_ms: Option<u64>,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            client_name: "courier".to_string(),
            initial_subscriptions: BTreeMap::new(),
            queue: QueueConfig::default(),
            retry: RetryConfig::default(),
            reconcile_interval_ms: 3000,
            command_timeout_ms: None,
        }
    }
}

impl PubSubConfig {
    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Add topics to the initial subscription batch.
    pub fn with_initial<I, T>(mut self, mode: SubscriptionMode, topics: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Topic>,
    {
        self.initial_subscriptions
            .entry(mode)
            .or_default()
            .extend(topics.into_iter().map(Into::into));
        self
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms.max(1))
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout_ms.map(Duration::from_millis)
    }
}

/// What a bounded queue does when it is full.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Discard the oldest queued message to make room.
    #[default]
    DropOldest,
    /// Block the router until the consumer makes room.
    BlockProducer,
}

/// Message queue settings.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Max buffered messages (None = unbounded).
    pub capacity: Option<usize>,

    /// Applied only when `capacity` is set.
    pub overflow: OverflowPolicy,
}

/// Exponential backoff for transient failures.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub factor: f32,
    /// Growth steps before the delay sticks at `max_delay_ms`.
    pub max_times: usize,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: 10,
            max_delay_ms: 2000,
            factor: 2.0,
            max_times: 16,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Backoff builder for one retry sequence.
    pub fn backoff(&self) -> ExponentialBuilder {
        let builder = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(self.min_delay_ms))
            .with_max_delay(self.max_delay())
            .with_factor(self.factor)
            .with_max_times(self.max_times);
        if self.jitter {
            builder.with_jitter()
        } else {
            builder
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PubSubConfig::default();
        assert_eq!(config.reconcile_interval(), Duration::from_secs(3));
        assert!(config.queue.capacity.is_none());
        assert_eq!(config.queue.overflow, OverflowPolicy::DropOldest);
        assert!(config.initial_subscriptions.is_empty());
    }

    #[test]
    fn test_from_json_partial() {
        let config = PubSubConfig::from_json(
            r#"{
                "client_name": "orders",
                "initial_subscriptions": { "Exact": ["a", "b"], "Pattern": ["news.*"] },
                "queue": { "capacity": 8, "overflow": "block_producer" }
            }"#,
        )
        .unwrap();

        assert_eq!(config.client_name, "orders");
        assert_eq!(
            config.initial_subscriptions[&SubscriptionMode::Exact],
            vec!["a".to_string(), "b".to_string()]
        );
        assert_eq!(config.queue.capacity, Some(8));
        assert_eq!(config.queue.overflow, OverflowPolicy::BlockProducer);
        assert_eq!(config.retry.min_delay_ms, 10);
        assert_eq!(config.reconcile_interval_ms, 3000);
    }

    #[test]
    fn test_from_json_invalid() {
        let result = PubSubConfig::from_json("{ \"queue\": 3 }");
        assert!(matches!(result, Err(crate::PubSubError::Config(_))));
    }

    #[test]
    fn test_backoff_grows_and_is_bounded() {
        use backon::BackoffBuilder;

        let retry = RetryConfig {
            jitter: false,
            max_times: 4,
            ..Default::default()
        };
        let delays: Vec<Duration> = retry.backoff().build().collect();
        assert_eq!(delays.len(), 4);
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert!(delays.iter().all(|d| *d <= retry.max_delay()));
    }

    #[test]
    fn test_with_initial() {
        let config = PubSubConfig::default()
            .with_initial(SubscriptionMode::Pattern, ["a*"])
            .with_initial(SubscriptionMode::Pattern, ["b*"]);
        assert_eq!(config.initial_subscriptions[&SubscriptionMode::Pattern].len(), 2);
    }
}
