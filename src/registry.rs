//! Subscription registry: desired state and server-acknowledged state.
//!
//! The confirmed state is observed as `acknowledged ∩ desired`. Keys the
//! server still holds after the application dropped them are invisible to
//! readers and get unsubscribed by the reconciler.

use crate::reconciler::Control;
use crate::types::{
    OperationKind, SubscriptionKey, SubscriptionMap, SubscriptionMode, SubscriptionState, Topic,
};
use crossbeam_channel::Sender;
use parking_lot::{RwLock, RwLockReadGuard};
use std::collections::{HashMap, HashSet};

#[derive(Default)]
struct RegistryState {
    desired: HashMap<SubscriptionMode, HashSet<Topic>>,
    acknowledged: HashMap<SubscriptionMode, HashSet<Topic>>,
}

impl RegistryState {
    fn desires(&self, mode: SubscriptionMode, topic: &str) -> bool {
        self.desired
            .get(&mode)
            .is_some_and(|topics| topics.contains(topic))
    }

    fn acknowledges(&self, mode: SubscriptionMode, topic: &str) -> bool {
        self.acknowledged
            .get(&mode)
            .is_some_and(|topics| topics.contains(topic))
    }
}

/// Holds what the application wants and what the server has acknowledged.
pub struct Registry {
    state: RwLock<RegistryState>,
    wake: Sender<Control>,
}

impl Registry {
    pub(crate) fn new(wake: Sender<Control>) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            wake,
        }
    }

    fn signal(&self) {
        // The reconciler is gone once the client is closed.
        let _ = self.wake.send(Control::Wake);
    }

    /// Add topics to the desired set. Returns how many were new.
    pub fn add_desired(&self, mode: SubscriptionMode, topics: &[Topic]) -> usize {
        let added = {
            let mut state = self.state.write();
            let desired = state.desired.entry(mode).or_default();
            topics
                .iter()
                .filter(|topic| desired.insert((*topic).clone()))
                .count()
        };
        self.signal();
        added
    }

    /// Remove topics from the desired set. An empty slice removes every
    /// topic of `mode`.
    ///
    /// Returns the keys the caller should consider affected: the requested
    /// topics, or for a remove-all every topic desired or still acknowledged
    /// under `mode`.
    pub fn remove_desired(&self, mode: SubscriptionMode, topics: &[Topic]) -> Vec<SubscriptionKey> {
        let affected: Vec<SubscriptionKey> = {
            let mut state = self.state.write();
            if topics.is_empty() {
                let mut all: HashSet<Topic> = state.desired.remove(&mode).unwrap_or_default();
                if let Some(acked) = state.acknowledged.get(&mode) {
                    all.extend(acked.iter().cloned());
                }
                all.into_iter()
                    .map(|topic| SubscriptionKey::new(mode, topic))
                    .collect()
            } else {
                if let Some(desired) = state.desired.get_mut(&mode) {
                    for topic in topics {
                        desired.remove(topic);
                    }
                }
                topics
                    .iter()
                    .map(|topic| SubscriptionKey::new(mode, topic.as_str()))
                    .collect()
            }
        };
        self.signal();
        affected
    }

    /// Point-in-time copy of desired and confirmed state.
    pub fn snapshot(&self) -> SubscriptionState {
        let state = self.state.read();
        let mut desired = SubscriptionMap::new();
        let mut confirmed = SubscriptionMap::new();

        for (mode, topics) in &state.desired {
            if topics.is_empty() {
                continue;
            }
            desired.insert(*mode, topics.iter().cloned().collect());
            let acked: std::collections::BTreeSet<Topic> = topics
                .iter()
                .filter(|topic| state.acknowledges(*mode, topic))
                .cloned()
                .collect();
            if !acked.is_empty() {
                confirmed.insert(*mode, acked);
            }
        }

        SubscriptionState { desired, confirmed }
    }

    pub fn is_desired(&self, key: &SubscriptionKey) -> bool {
        self.state.read().desires(key.mode, &key.topic)
    }

    pub fn is_confirmed(&self, key: &SubscriptionKey) -> bool {
        let state = self.state.read();
        state.desires(key.mode, &key.topic) && state.acknowledges(key.mode, &key.topic)
    }

    pub(crate) fn is_acknowledged(&self, key: &SubscriptionKey) -> bool {
        self.state.read().acknowledges(key.mode, &key.topic)
    }

    /// Read access to the confirmed view, for routing.
    pub(crate) fn confirmed(&self) -> ConfirmedView<'_> {
        ConfirmedView {
            state: self.state.read(),
        }
    }

    // --- Reconciler-only mutations ---

    /// Steps needed to converge: subscribe what is desired but not
    /// acknowledged, unsubscribe what is acknowledged but not desired.
    pub(crate) fn plan(&self) -> Vec<(SubscriptionKey, OperationKind)> {
        let state = self.state.read();
        let mut steps = Vec::new();

        for (mode, topics) in &state.desired {
            for topic in topics {
                if !state.acknowledges(*mode, topic) {
                    steps.push((SubscriptionKey::new(*mode, topic.as_str()), OperationKind::Subscribe));
                }
            }
        }
        for (mode, topics) in &state.acknowledged {
            for topic in topics {
                if !state.desires(*mode, topic) {
                    steps.push((
                        SubscriptionKey::new(*mode, topic.as_str()),
                        OperationKind::Unsubscribe,
                    ));
                }
            }
        }

        steps
    }

    /// Record a successful subscribe reply.
    pub(crate) fn acknowledge(&self, mode: SubscriptionMode, topics: &[Topic]) {
        let mut state = self.state.write();
        state
            .acknowledged
            .entry(mode)
            .or_default()
            .extend(topics.iter().cloned());
    }

    /// Record a successful unsubscribe reply.
    pub(crate) fn release(&self, mode: SubscriptionMode, topics: &[Topic]) {
        let mut state = self.state.write();
        if let Some(acked) = state.acknowledged.get_mut(&mode) {
            for topic in topics {
                acked.remove(topic);
            }
        }
    }

    /// Drop a desired key that the server will never accept.
    pub(crate) fn rollback(&self, key: &SubscriptionKey) {
        let mut state = self.state.write();
        if let Some(desired) = state.desired.get_mut(&key.mode) {
            desired.remove(&key.topic);
        }
    }

    /// The server lost every subscription (reconnect).
    pub(crate) fn clear_acknowledged(&self) {
        self.state.write().acknowledged.clear();
    }
}

/// Read guard over the confirmed view.
pub(crate) struct ConfirmedView<'a> {
    state: RwLockReadGuard<'a, RegistryState>,
}

impl ConfirmedView<'_> {
    pub fn contains(&self, mode: SubscriptionMode, topic: &str) -> bool {
        self.state.desires(mode, topic) && self.state.acknowledges(mode, topic)
    }

    /// Confirmed pattern topics.
    pub fn patterns(&self) -> impl Iterator<Item = &Topic> {
        let mode = SubscriptionMode::Pattern;
        self.state
            .desired
            .get(&mode)
            .into_iter()
            .flatten()
            .filter(move |topic| self.state.acknowledges(mode, topic))
    }
}
