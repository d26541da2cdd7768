//! Blocked callers waiting on reconciliation outcomes.
//!
//! Kept apart from the registry lock so a blocked caller never holds anything
//! that mutations or routing need.

use crate::error::{PubSubError, Result};
use crate::registry::Registry;
use crate::types::{OperationKind, SubscriptionKey};
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use std::collections::HashMap;

/// How a waited-on operation ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Outcome {
    Confirmed,
    /// A later opposite request made the operation moot.
    Superseded,
    Failed(PubSubError),
    Cancelled,
}

struct Waiter {
    call: u64,
    kind: OperationKind,
    notify: Sender<Outcome>,
}

impl Waiter {
    /// Decide whether the registry already satisfies this waiter.
    fn resolve(&self, key: &SubscriptionKey, registry: &Registry) -> Option<Outcome> {
        match self.kind {
            OperationKind::Subscribe => {
                if registry.is_confirmed(key) {
                    Some(Outcome::Confirmed)
                } else if !registry.is_desired(key) {
                    Some(Outcome::Superseded)
                } else {
                    None
                }
            }
            OperationKind::Unsubscribe => {
                if registry.is_desired(key) {
                    Some(Outcome::Superseded)
                } else if !registry.is_acknowledged(key) {
                    Some(Outcome::Confirmed)
                } else {
                    None
                }
            }
        }
    }
}

#[derive(Default)]
struct WaiterState {
    closed: bool,
    by_key: HashMap<SubscriptionKey, Vec<Waiter>>,
}

#[derive(Default)]
pub(crate) struct WaiterTable {
    state: Mutex<WaiterState>,
}

impl WaiterTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a registry mutation and register one waiter per key it returns,
    /// under the table lock. A pass settles or fails keys under the same
    /// lock, so it sees either neither change or both. Each resolution is
    /// sent once on `notify`.
    pub fn register<F>(
        &self,
        call: u64,
        kind: OperationKind,
        notify: &Sender<Outcome>,
        mutate: F,
    ) -> Result<Vec<SubscriptionKey>>
    where
        F: FnOnce() -> Vec<SubscriptionKey>,
    {
        let mut state = self.state.lock();
        if state.closed {
            return Err(PubSubError::Closed);
        }
        let keys = mutate();
        for key in &keys {
            state.by_key.entry(key.clone()).or_default().push(Waiter {
                call,
                kind,
                notify: notify.clone(),
            });
        }
        Ok(keys)
    }

    /// Remove every waiter of `call` without resolving it.
    pub fn detach(&self, call: u64) {
        let mut state = self.state.lock();
        state.by_key.retain(|_, waiters| {
            waiters.retain(|w| w.call != call);
            !waiters.is_empty()
        });
    }

    /// Release every waiter the registry now satisfies. Returns how many
    /// were released.
    pub fn settle(&self, registry: &Registry) -> usize {
        let mut state = self.state.lock();
        let mut released = 0;

        state.by_key.retain(|key, waiters| {
            waiters.retain(|waiter| match waiter.resolve(key, registry) {
                Some(outcome) => {
                    let _ = waiter.notify.send(outcome);
                    released += 1;
                    false
                }
                None => true,
            });
            !waiters.is_empty()
        });

        released
    }

    /// Fail the waiters of `kind` on `key`, then run `undo` before releasing
    /// the table lock, so no caller registers against the failed state.
    pub fn fail<F>(&self, key: &SubscriptionKey, kind: OperationKind, error: &PubSubError, undo: F)
    where
        F: FnOnce(),
    {
        let mut state = self.state.lock();
        if let Some(waiters) = state.by_key.get_mut(key) {
            waiters.retain(|waiter| {
                if waiter.kind != kind {
                    return true;
                }
                let _ = waiter.notify.send(Outcome::Failed(error.clone()));
                false
            });
            if waiters.is_empty() {
                state.by_key.remove(key);
            }
        }
        undo();
    }

    /// Cancel everything and refuse further registrations.
    pub fn cancel_all(&self) -> usize {
        let mut state = self.state.lock();
        state.closed = true;
        let mut cancelled = 0;
        for (_, waiters) in state.by_key.drain() {
            for waiter in waiters {
                let _ = waiter.notify.send(Outcome::Cancelled);
                cancelled += 1;
            }
        }
        cancelled
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.state.lock().by_key.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SubscriptionMode;
    use crossbeam_channel::unbounded;

    fn setup() -> (Registry, WaiterTable) {
        let (tx, _rx) = unbounded();
        (Registry::new(tx), WaiterTable::new())
    }

    fn key(topic: &str) -> SubscriptionKey {
        SubscriptionKey::new(SubscriptionMode::Exact, topic)
    }

    #[test]
    fn test_settle_subscribe() {
        let (registry, table) = setup();
        let (tx, rx) = unbounded();
        registry.add_desired(SubscriptionMode::Exact, &["a".to_string()]);
        table
            .register(1, OperationKind::Subscribe, &tx, || vec![key("a")])
            .unwrap();

        assert_eq!(table.settle(&registry), 0);
        registry.acknowledge(SubscriptionMode::Exact, &["a".to_string()]);
        assert_eq!(table.settle(&registry), 1);
        assert_eq!(rx.try_recv().unwrap(), Outcome::Confirmed);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_subscribe_superseded_by_unsubscribe() {
        let (registry, table) = setup();
        let (tx, rx) = unbounded();
        registry.add_desired(SubscriptionMode::Exact, &["a".to_string()]);
        table
            .register(1, OperationKind::Subscribe, &tx, || vec![key("a")])
            .unwrap();

        registry.remove_desired(SubscriptionMode::Exact, &["a".to_string()]);
        table.settle(&registry);
        assert_eq!(rx.try_recv().unwrap(), Outcome::Superseded);
    }

    #[test]
    fn test_unsubscribe_waits_for_release() {
        let (registry, table) = setup();
        let (tx, rx) = unbounded();
        registry.acknowledge(SubscriptionMode::Exact, &["a".to_string()]);
        table
            .register(1, OperationKind::Unsubscribe, &tx, || vec![key("a")])
            .unwrap();

        table.settle(&registry);
        assert!(rx.try_recv().is_err());

        registry.release(SubscriptionMode::Exact, &["a".to_string()]);
        table.settle(&registry);
        assert_eq!(rx.try_recv().unwrap(), Outcome::Confirmed);
    }

    #[test]
    fn test_fail_only_matching_kind() {
        let (registry, table) = setup();
        let (tx, rx) = unbounded();
        registry.add_desired(SubscriptionMode::Exact, &["a".to_string()]);
        table
            .register(1, OperationKind::Subscribe, &tx, || vec![key("a")])
            .unwrap();
        table
            .register(2, OperationKind::Unsubscribe, &tx, || vec![key("a")])
            .unwrap();

        let error = PubSubError::ServerRejected("nope".to_string());
        let mut undone = false;
        table.fail(&key("a"), OperationKind::Subscribe, &error, || undone = true);
        assert_eq!(rx.try_recv().unwrap(), Outcome::Failed(error));
        assert_eq!(table.len(), 1);
        assert!(undone);
    }

    #[test]
    fn test_register_skips_mutation_when_closed() {
        let (_registry, table) = setup();
        let (tx, _rx) = unbounded();
        table.cancel_all();

        let mut mutated = false;
        let result = table.register(1, OperationKind::Subscribe, &tx, || {
            mutated = true;
            vec![key("a")]
        });
        assert_eq!(result, Err(PubSubError::Closed));
        assert!(!mutated);
    }

    #[test]
    fn test_detach_and_cancel() {
        let (_registry, table) = setup();
        let (tx, rx) = unbounded();
        table
            .register(1, OperationKind::Subscribe, &tx, || vec![key("a"), key("b")])
            .unwrap();
        table
            .register(2, OperationKind::Subscribe, &tx, || vec![key("a")])
            .unwrap();

        table.detach(1);
        assert_eq!(table.len(), 1);

        assert_eq!(table.cancel_all(), 1);
        assert_eq!(rx.try_recv().unwrap(), Outcome::Cancelled);
        assert_eq!(
            table.register(3, OperationKind::Subscribe, &tx, || vec![key("c")]),
            Err(PubSubError::Closed)
        );
    }
}
