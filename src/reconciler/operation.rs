//! In-flight reconciliation steps.

use crate::config::RetryConfig;
use crate::types::{OperationKind, SubscriptionKey};
use backon::{BackoffBuilder, ExponentialBackoff};
use std::time::{Duration, Instant};
use tracing::debug;

/// One step toward the desired state for a single key.
///
/// Dispatch is synchronous, so an operation is either waiting to be sent or
/// gone: a confirmed, failed or superseded operation is dropped.
pub(crate) struct PendingOperation {
    pub key: SubscriptionKey,
    pub kind: OperationKind,
    pub attempts: u32,
    /// Earliest time the next attempt may be sent.
    pub retry_at: Option<Instant>,
    /// Send alone instead of batched with its mode.
    pub isolated: bool,
    backoff: ExponentialBackoff,
    max_delay: Duration,
}

impl PendingOperation {
    pub fn new(key: SubscriptionKey, kind: OperationKind, retry: &RetryConfig) -> Self {
        debug!(key = ?key, ?kind, "Operation created");
        Self {
            key,
            kind,
            attempts: 0,
            retry_at: None,
            isolated: false,
            backoff: retry.backoff().build(),
            max_delay: retry.max_delay(),
        }
    }

    pub fn is_ready(&self, now: Instant) -> bool {
        self.retry_at.map_or(true, |at| at <= now)
    }

    pub fn record_attempt(&mut self) {
        self.attempts += 1;
    }

    /// Delay the next attempt after a transient failure. Returns the delay.
    pub fn schedule_retry(&mut self, now: Instant) -> Duration {
        let delay = self.backoff.next().unwrap_or(self.max_delay);
        self.retry_at = Some(now + delay);
        delay
    }

    /// Send on its own, right away.
    pub fn isolate(&mut self) {
        self.retry_at = None;
        self.isolated = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SubscriptionMode;

    fn retry() -> RetryConfig {
        RetryConfig {
            min_delay_ms: 5,
            max_delay_ms: 20,
            max_times: 2,
            jitter: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_lifecycle() {
        let mut op = PendingOperation::new(
            SubscriptionKey::new(SubscriptionMode::Exact, "a"),
            OperationKind::Subscribe,
            &retry(),
        );
        let now = Instant::now();
        assert!(op.is_ready(now));

        op.record_attempt();
        let delay = op.schedule_retry(now);
        assert!(!op.is_ready(now));
        assert!(op.is_ready(now + delay));
        assert_eq!(op.attempts, 1);
    }

    #[test]
    fn test_retry_delay_sticks_at_max() {
        let config = retry();
        let mut op = PendingOperation::new(
            SubscriptionKey::new(SubscriptionMode::Exact, "a"),
            OperationKind::Subscribe,
            &config,
        );
        let now = Instant::now();
        let delays: Vec<Duration> = (0..5).map(|_| op.schedule_retry(now)).collect();
        assert_eq!(delays[4], config.max_delay());
        assert!(delays.iter().all(|d| *d <= config.max_delay()));
    }

    #[test]
    fn test_isolate() {
        let mut op = PendingOperation::new(
            SubscriptionKey::new(SubscriptionMode::Pattern, "a*"),
            OperationKind::Subscribe,
            &retry(),
        );
        op.record_attempt();
        op.schedule_retry(Instant::now());
        op.isolate();
        assert!(op.isolated);
        assert!(op.is_ready(Instant::now()));
    }
}
