//! The reconciler loop.

use super::operation::PendingOperation;
use super::waiters::WaiterTable;
use super::Control;
use crate::config::RetryConfig;
use crate::error::PubSubError;
use crate::gateway::{CommandGateway, GatewayError};
use crate::registry::Registry;
use crate::types::{OperationKind, PubSubCommand, SubscriptionKey, Topic};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// One protocol command worth of topics.
struct Batch {
    command: PubSubCommand,
    topics: Vec<Topic>,
}

/// Drives the registry's acknowledged state toward its desired state.
pub(crate) struct Reconciler {
    name: String,
    registry: Arc<Registry>,
    waiters: Arc<WaiterTable>,
    gateway: Arc<dyn CommandGateway>,
    control: Receiver<Control>,
    pending: HashMap<SubscriptionKey, PendingOperation>,
    retry: RetryConfig,
    interval: Duration,
    command_timeout: Option<Duration>,
    /// Run another pass without waiting (isolated retries are queued).
    repass: bool,
}

impl Reconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: String,
        registry: Arc<Registry>,
        waiters: Arc<WaiterTable>,
        gateway: Arc<dyn CommandGateway>,
        control: Receiver<Control>,
        retry: RetryConfig,
        interval: Duration,
        command_timeout: Option<Duration>,
    ) -> Self {
        Self {
            name,
            registry,
            waiters,
            gateway,
            control,
            pending: HashMap::new(),
            retry,
            interval,
            command_timeout,
            repass: false,
        }
    }

    /// Start the reconciler on its own thread.
    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name(format!("{}-reconciler", self.name))
            .spawn(move || self.run())
    }

    fn run(mut self) {
        debug!(client = %self.name, "Reconciler started");

        loop {
            let mut reset = false;
            let mut shutdown = false;

            match self.control.recv_timeout(self.next_wait()) {
                Ok(Control::Shutdown) | Err(RecvTimeoutError::Disconnected) => shutdown = true,
                Ok(Control::ConnectionReset) => reset = true,
                Ok(Control::Wake) | Err(RecvTimeoutError::Timeout) => {}
            }
            // Coalesce everything that piled up.
            for signal in self.control.try_iter() {
                match signal {
                    Control::Shutdown => shutdown = true,
                    Control::ConnectionReset => reset = true,
                    Control::Wake => {}
                }
            }

            if shutdown {
                break;
            }
            if reset {
                info!(client = %self.name, "Connection reset, resubscribing desired topics");
                self.registry.clear_acknowledged();
            }
            self.reconcile();
        }

        let cancelled = self.waiters.cancel_all();
        self.pending.clear();
        debug!(client = %self.name, cancelled, "Reconciler stopped");
    }

    /// How long to sleep before the next pass.
    fn next_wait(&self) -> Duration {
        if self.repass {
            return Duration::ZERO;
        }
        let now = Instant::now();
        self.pending
            .values()
            .filter_map(|op| op.retry_at)
            .map(|at| at.saturating_duration_since(now))
            .min()
            .map_or(self.interval, |wait| wait.min(self.interval))
    }

    /// One reconciliation pass.
    pub(crate) fn reconcile(&mut self) {
        self.repass = false;

        let plan: HashMap<SubscriptionKey, OperationKind> =
            self.registry.plan().into_iter().collect();

        // A step that is no longer needed, or now needed the other way, is
        // superseded. Its waiters are released by `settle` below.
        self.pending.retain(|key, op| {
            let keep = plan.get(key) == Some(&op.kind);
            if !keep {
                debug!(key = ?key, kind = ?op.kind, "Operation superseded");
            }
            keep
        });
        for (key, kind) in plan {
            if !self.pending.contains_key(&key) {
                let op = PendingOperation::new(key.clone(), kind, &self.retry);
                self.pending.insert(key, op);
            }
        }

        for batch in self.ready_batches() {
            self.dispatch(batch);
        }

        self.waiters.settle(&self.registry);
    }

    /// Group ready operations into commands.
    fn ready_batches(&mut self) -> Vec<Batch> {
        let now = Instant::now();
        let mut batches = Vec::new();
        let mut grouped: HashMap<PubSubCommand, Vec<Topic>> = HashMap::new();

        for op in self.pending.values_mut().filter(|op| op.is_ready(now)) {
            op.record_attempt();
            let command = PubSubCommand::new(op.key.mode, op.kind);
            if op.isolated {
                batches.push(Batch {
                    command,
                    topics: vec![op.key.topic.clone()],
                });
            } else {
                grouped.entry(command).or_default().push(op.key.topic.clone());
            }
        }

        for (command, mut topics) in grouped {
            topics.sort();
            batches.push(Batch { command, topics });
        }
        batches
    }

    fn dispatch(&mut self, batch: Batch) {
        let Batch { command, topics } = batch;
        let mode = command.mode();
        let kind = command.kind();
        debug!(client = %self.name, %command, topics = ?topics, "Operation sent");

        match self.gateway.send_command(command, &topics, self.command_timeout) {
            Ok(()) => {
                match kind {
                    OperationKind::Subscribe => self.registry.acknowledge(mode, &topics),
                    OperationKind::Unsubscribe => self.registry.release(mode, &topics),
                }
                for topic in topics {
                    self.pending.remove(&SubscriptionKey::new(mode, topic));
                }
                debug!(client = %self.name, %command, "Operation confirmed");
            }
            Err(error) if error.is_transient() => {
                let now = Instant::now();
                let mut delay = Duration::ZERO;
                let mut attempts = 0;
                for topic in &topics {
                    if let Some(op) = self.pending.get_mut(&SubscriptionKey::new(mode, topic.as_str())) {
                        delay = delay.max(op.schedule_retry(now));
                        attempts = attempts.max(op.attempts);
                    }
                }
                warn!(
                    client = %self.name,
                    %command,
                    topics = ?topics,
                    %error,
                    attempts,
                    retry_ms = delay.as_millis() as u64,
                    "Operation failed, retrying after backoff"
                );
            }
            Err(error) if topics.len() > 1 => {
                // Find the offending topic by retrying each one alone.
                warn!(client = %self.name, %command, topics = ?topics, %error, "Batch rejected, isolating topics");
                for topic in &topics {
                    if let Some(op) = self.pending.get_mut(&SubscriptionKey::new(mode, topic.as_str())) {
                        op.isolate();
                    }
                }
                self.repass = true;
            }
            Err(error) => self.reject(command, topics, error),
        }
    }

    /// Permanent failure of a single-topic command.
    fn reject(&mut self, command: PubSubCommand, topics: Vec<Topic>, error: GatewayError) {
        let mode = command.mode();
        let kind = command.kind();
        let error = PubSubError::from(error);

        for topic in topics {
            let key = SubscriptionKey::new(mode, topic);
            self.pending.remove(&key);
            warn!(client = %self.name, %command, key = ?key, %error, "Operation failed");
            let registry = &self.registry;
            self.waiters.fail(&key, kind, &error, || match kind {
                // Never satisfiable: drop the desire.
                OperationKind::Subscribe => registry.rollback(&key),
                // Stop trying to release a subscription the server won't drop.
                OperationKind::Unsubscribe => {
                    registry.release(mode, std::slice::from_ref(&key.topic))
                }
            });
        }
    }
}
