use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::{broadcast, Mutex};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::backend::{FederationBackend, OperationUpdate};
use crate::core::operations::{PaymentStateMachine, ReceiveStateMachine};
use crate::error::ErrorCategory;
use crate::types::OperationId;

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// How often due receives are expired and finished operations pruned
    pub sweep_interval: Duration,
    /// How long a terminal operation is kept before it is forgotten
    pub terminal_retention: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(5),
            terminal_retention: Duration::from_secs(3600),
        }
    }
}

/// How long an update for an untracked operation is kept around in case the
/// operation is still being registered
const UNTRACKED_UPDATE_HOLD: Duration = Duration::from_secs(30);
const MAX_HELD_UPDATES: usize = 1024;

/// Updates that arrived before their operation was tracked, oldest first
#[derive(Debug, Default)]
struct HeldUpdates {
    queue: VecDeque<(Instant, OperationUpdate)>,
}

impl HeldUpdates {
    fn hold(&mut self, received_at: Instant, update: OperationUpdate) {
        if self.queue.len() >= MAX_HELD_UPDATES {
            if let Some((_, dropped)) = self.queue.pop_front() {
                debug!(operation_id = %dropped.operation_id(), "Held update dropped, queue full");
            }
        }
        self.queue.push_back((received_at, update));
    }

    fn take_for(&mut self, operation_id: &OperationId) -> Vec<(Instant, OperationUpdate)> {
        let (matching, rest): (VecDeque<_>, VecDeque<_>) = self
            .queue
            .drain(..)
            .partition(|(_, update)| update.operation_id() == operation_id);
        self.queue = rest;
        matching.into()
    }

    fn take_all(&mut self) -> Vec<(Instant, OperationUpdate)> {
        self.queue.drain(..).collect()
    }

    fn len(&self) -> usize {
        self.queue.len()
    }
}

/// Drives the state machines from what the federation observes.
///
/// Applies backend updates as they arrive and, on every sweep tick, expires
/// unpaid receives whose invoice ran out and prunes finished operations.
pub struct LifecycleDriver {
    backend: Arc<dyn FederationBackend>,
    payments: Arc<PaymentStateMachine>,
    receives: Arc<ReceiveStateMachine>,
    config: LifecycleConfig,
    shutdown_tx: Arc<Mutex<Option<broadcast::Sender<()>>>>,
}

impl std::fmt::Debug for LifecycleDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleDriver")
            .field("config", &self.config)
            .finish()
    }
}

impl LifecycleDriver {
    pub fn new(
        backend: Arc<dyn FederationBackend>,
        payments: Arc<PaymentStateMachine>,
        receives: Arc<ReceiveStateMachine>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            backend,
            payments,
            receives,
            config,
            shutdown_tx: Arc::new(Mutex::new(None)),
        }
    }

    /// Spawn the driver task. Starting an already running driver is a no-op.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<()> {
        let mut tx_guard = self.shutdown_tx.lock().await;
        if tx_guard.is_some() {
            debug!("Lifecycle driver already running");
            return Ok(());
        }
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        *tx_guard = Some(shutdown_tx.clone());
        drop(tx_guard);

        info!(
            sweep_interval_secs = self.config.sweep_interval.as_secs(),
            terminal_retention_secs = self.config.terminal_retention.as_secs(),
            "Starting lifecycle driver"
        );

        // Subscribe before spawning so no update emitted after start() is lost
        let mut updates = self.backend.subscribe_updates();
        let payments = self.payments.clone();
        let receives = self.receives.clone();
        let config = self.config.clone();
        let running = self.shutdown_tx.clone();

        tokio::spawn(async move {
            let mut sweep_timer = interval(config.sweep_interval.max(Duration::from_millis(100)));
            sweep_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut held = HeldUpdates::default();

            loop {
                tokio::select! {
                    update = updates.recv() => match update {
                        Ok(update) => {
                            Self::deliver(&payments, &receives, &mut held, update).await;
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Lifecycle driver lagged behind federation updates, states may be stale");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            info!("Federation update channel closed");
                            break;
                        }
                    },
                    _ = sweep_timer.tick() => {
                        Self::replay_held(&payments, &receives, &mut held).await;
                        Self::sweep(&payments, &receives, &config).await;
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Lifecycle driver received shutdown signal");
                        break;
                    }
                }
            }

            // Only clear our own run; a stop followed by a start installs a new sender
            let mut tx_guard = running.lock().await;
            if tx_guard
                .as_ref()
                .map_or(false, |current| current.same_channel(&shutdown_tx))
            {
                *tx_guard = None;
            }
            info!("Lifecycle driver stopped");
        });

        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        if let Some(shutdown_tx) = self.shutdown_tx.lock().await.take() {
            let _ = shutdown_tx.send(());
        }
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.shutdown_tx.lock().await.is_some()
    }

    /// Apply `update`, after any held updates of the same operation so their
    /// order is kept
    async fn deliver(
        payments: &PaymentStateMachine,
        receives: &ReceiveStateMachine,
        held: &mut HeldUpdates,
        update: OperationUpdate,
    ) {
        let mut queue = held.take_for(update.operation_id());
        queue.push((Instant::now(), update));

        let mut pending = queue.into_iter();
        while let Some((received_at, update)) = pending.next() {
            if let Some(untracked) = Self::apply_update(payments, receives, update).await {
                held.hold(received_at, untracked);
                for (received_at, rest) in pending.by_ref() {
                    held.hold(received_at, rest);
                }
            }
        }
    }

    /// Retry held updates, dropping those held longer than the hold window
    async fn replay_held(
        payments: &PaymentStateMachine,
        receives: &ReceiveStateMachine,
        held: &mut HeldUpdates,
    ) {
        let mut blocked: Vec<OperationId> = Vec::new();

        for (received_at, update) in held.take_all() {
            if received_at.elapsed() >= UNTRACKED_UPDATE_HOLD {
                // Pruned, or belongs to another client
                debug!(operation_id = %update.operation_id(), "Update for untracked operation ignored");
                continue;
            }
            if blocked.contains(update.operation_id()) {
                held.hold(received_at, update);
                continue;
            }
            if let Some(untracked) = Self::apply_update(payments, receives, update).await {
                blocked.push(untracked.operation_id().clone());
                held.hold(received_at, untracked);
            }
        }

        if !held.queue.is_empty() {
            debug!(held = held.len(), "Updates waiting for their operation");
        }
    }

    /// Apply one update. Hands the update back when its operation isn't tracked.
    pub(crate) async fn apply_update(
        payments: &PaymentStateMachine,
        receives: &ReceiveStateMachine,
        update: OperationUpdate,
    ) -> Option<OperationUpdate> {
        let operation_id = update.operation_id().clone();
        let result = match update.clone() {
            OperationUpdate::Payment { operation_id, state } => {
                payments.transition(&operation_id, state).await
            }
            OperationUpdate::Receive { operation_id, state } => {
                receives.transition(&operation_id, state).await
            }
        };

        match result {
            Ok(_) => None,
            Err(e) if e.category == ErrorCategory::NotFound => {
                debug!(operation_id = %operation_id, "Update for untracked operation held");
                Some(update)
            }
            Err(e) => {
                warn!(
                    operation_id = %operation_id,
                    error = %e,
                    "Federation update rejected by state machine"
                );
                None
            }
        }
    }

    pub(crate) async fn sweep(
        payments: &PaymentStateMachine,
        receives: &ReceiveStateMachine,
        config: &LifecycleConfig,
    ) {
        let now = Utc::now();
        let expired = receives.expire_due(now).await;

        let pruned = payments.prune(config.terminal_retention, now).await
            + receives.prune(config.terminal_retention, now).await;

        if !expired.is_empty() || pruned > 0 {
            debug!(
                expired = expired.len(),
                pruned,
                "Lifecycle sweep finished"
            );
        }
    }
}
