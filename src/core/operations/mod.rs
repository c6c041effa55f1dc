pub mod log;
pub mod payment;
pub mod receive;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, error, info};

pub use self::log::{Applied, LifecycleState, Transition, TransitionLog};
pub use self::payment::{OutgoingPayment, PayType, PaymentState, PaymentStateMachine};
pub use self::receive::{ReceiveKind, ReceiveOperation, ReceiveState, ReceiveStateMachine};
use crate::error::{EngineError, EngineResult};
use crate::events::{EngineEvent, EventBus};
use crate::types::OperationId;

#[cfg(test)]
#[path = "tests/state_machine_tests.rs"]
mod state_machine_tests;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Pay,
    Receive,
    Claim,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pay => "pay",
            Self::Receive => "receive",
            Self::Claim => "claim",
        }
    }
}

/// Immutable data describing an operation, stored next to its state log
pub trait OperationRecord: Clone + Send + Sync + 'static {
    fn kind(&self) -> OperationKind;
}

struct Entry<S, R> {
    record: R,
    log: TransitionLog<S>,
}

/// Registry of operations of one family and their transition logs.
///
/// Transitions are pushed by whoever observes the underlying facts (the
/// backend update loop, the expiry sweep, submission errors); every
/// subscriber of an operation sees the same ordered sequence.
pub struct StateMachine<S, R> {
    entries: RwLock<HashMap<OperationId, Arc<Entry<S, R>>>>,
    event_bus: Arc<EventBus>,
}

impl<S, R> std::fmt::Debug for StateMachine<S, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMachine")
            .field(
                "operations",
                &self.entries.try_read().map(|e| e.len()).unwrap_or(0),
            )
            .finish()
    }
}

impl<S, R> StateMachine<S, R>
where
    S: LifecycleState,
    R: OperationRecord,
{
    pub fn new(event_bus: Arc<EventBus>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            event_bus,
        }
    }

    /// Track a new operation starting in `initial`.
    ///
    /// Returns `false` and leaves the existing entry alone when the id is
    /// already tracked.
    pub async fn register(&self, operation_id: OperationId, record: R, initial: S) -> bool {
        let mut entries = self.entries.write().await;
        if entries.contains_key(&operation_id) {
            debug!(
                operation_id = %operation_id,
                "Operation already tracked, keeping existing entry"
            );
            return false;
        }

        debug!(
            operation_id = %operation_id,
            kind = record.kind().as_str(),
            state = initial.label(),
            "Tracking operation"
        );
        entries.insert(
            operation_id,
            Arc::new(Entry {
                record,
                log: TransitionLog::new(initial),
            }),
        );
        true
    }

    async fn entry(&self, operation_id: &OperationId) -> EngineResult<Arc<Entry<S, R>>> {
        self.entries
            .read()
            .await
            .get(operation_id)
            .cloned()
            .ok_or_else(|| {
                EngineError::not_found(format!("Operation {} not found", operation_id))
            })
    }

    pub async fn contains(&self, operation_id: &OperationId) -> bool {
        self.entries.read().await.contains_key(operation_id)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Apply a state to an operation
    pub async fn transition(&self, operation_id: &OperationId, next: S) -> EngineResult<Applied> {
        let entry = self.entry(operation_id).await?;
        let applied = entry.log.push(next.clone())?;

        if let Applied::Advanced { from } = applied {
            let kind = entry.record.kind();
            info!(
                operation_id = %operation_id,
                kind = kind.as_str(),
                from = from,
                to = next.label(),
                "Operation state changed"
            );

            let event = EngineEvent::OperationStateChanged {
                operation_id: operation_id.to_string(),
                kind,
                from: from.to_string(),
                to: next.label().to_string(),
                terminal: next.is_terminal(),
                timestamp: Utc::now(),
            };
            if let Err(e) = self.event_bus.publish(event).await {
                error!(error = ?e, "Failed to publish operation state changed event");
            }
        }

        Ok(applied)
    }

    /// Ordered state stream of one operation, starting at its current state
    pub async fn subscribe(&self, operation_id: &OperationId) -> EngineResult<BoxStream<'static, S>> {
        Ok(self.entry(operation_id).await?.log.subscribe())
    }

    pub async fn wait_until<F>(
        &self,
        operation_id: &OperationId,
        predicate: F,
        timeout: Duration,
    ) -> EngineResult<S>
    where
        F: Fn(&S) -> bool,
    {
        let entry = self.entry(operation_id).await?;
        entry.log.wait_until(predicate, timeout).await
    }

    pub async fn current(&self, operation_id: &OperationId) -> EngineResult<S> {
        Ok(self.entry(operation_id).await?.log.current())
    }

    pub async fn record(&self, operation_id: &OperationId) -> EngineResult<R> {
        Ok(self.entry(operation_id).await?.record.clone())
    }

    pub async fn history(&self, operation_id: &OperationId) -> EngineResult<Vec<Transition<S>>> {
        Ok(self.entry(operation_id).await?.log.history())
    }

    pub async fn subscriber_count(&self, operation_id: &OperationId) -> EngineResult<usize> {
        Ok(self.entry(operation_id).await?.log.subscriber_count())
    }

    /// First operation (in id order) whose record satisfies `predicate`
    pub async fn find<F>(&self, predicate: F) -> Option<OperationId>
    where
        F: Fn(&R) -> bool,
    {
        let entries = self.entries.read().await;
        entries
            .iter()
            .filter(|(_, entry)| predicate(&entry.record))
            .map(|(id, _)| id.clone())
            .min()
    }

    /// Point-in-time copy of every tracked operation and its current state
    pub async fn snapshot_entries(&self) -> Vec<(OperationId, R, S)> {
        let entries = self.entries.read().await;
        let mut listed: Vec<_> = entries
            .iter()
            .map(|(id, entry)| (id.clone(), entry.record.clone(), entry.log.current()))
            .collect();
        listed.sort_by(|a, b| a.0.cmp(&b.0));
        listed
    }

    /// Forget terminal operations that finished more than `retention` before
    /// `now` and have no live subscribers. Returns how many were removed.
    pub async fn prune(&self, retention: Duration, now: DateTime<Utc>) -> usize {
        let retention = chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::days(36_500));
        let mut entries = self.entries.write().await;
        let before = entries.len();

        entries.retain(|_, entry| {
            let finished_long_ago = entry.log.is_terminal()
                && entry
                    .log
                    .last_transition_at()
                    .checked_add_signed(retention)
                    .map_or(false, |cutoff| cutoff <= now);
            !(finished_long_ago && entry.log.subscriber_count() == 0)
        });

        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, remaining = entries.len(), "Pruned finished operations");
        }
        removed
    }
}
