use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::watch;

use crate::error::{EngineError, EngineResult};

/// A lifecycle state of an operation.
///
/// Transitions only move forward along the state graph. Once a terminal state
/// is reached nothing else can follow it.
pub trait LifecycleState: Clone + fmt::Debug + PartialEq + Send + Sync + 'static {
    fn is_terminal(&self) -> bool;

    /// Whether `next` may directly follow `self`
    fn can_transition_to(&self, next: &Self) -> bool;

    /// Short name used in logs and events
    fn label(&self) -> &'static str;
}

#[derive(Debug, Clone, Serialize)]
pub struct Transition<S> {
    pub state: S,
    pub at: DateTime<Utc>,
}

/// Result of applying a state to a log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// The state was appended after `from`
    Advanced { from: &'static str },
    /// The state equals the current one; nothing was appended
    Unchanged,
}

/// Ordered, append-only log of one operation's states.
///
/// The whole log lives inside a `watch` channel: every subscriber owns a
/// receiver plus its own cursor into the log, so all subscribers observe the
/// same sequence and dropping one has no effect on the others.
pub struct TransitionLog<S> {
    tx: watch::Sender<Vec<Transition<S>>>,
}

impl<S: LifecycleState> fmt::Debug for TransitionLog<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransitionLog")
            .field("current", &self.current())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl<S: LifecycleState> TransitionLog<S> {
    pub fn new(initial: S) -> Self {
        let (tx, _) = watch::channel(vec![Transition {
            state: initial,
            at: Utc::now(),
        }]);
        Self { tx }
    }

    pub fn current(&self) -> S {
        let log = self.tx.borrow();
        // The log is created with one entry and never shrinks
        log[log.len() - 1].state.clone()
    }

    pub fn history(&self) -> Vec<Transition<S>> {
        self.tx.borrow().clone()
    }

    pub fn last_transition_at(&self) -> DateTime<Utc> {
        let log = self.tx.borrow();
        log[log.len() - 1].at
    }

    pub fn is_terminal(&self) -> bool {
        self.current().is_terminal()
    }

    /// Number of live subscriptions on this log
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Append `next` if the state graph allows it.
    ///
    /// Re-applying the current state (including re-delivery of a terminal
    /// state) is accepted and appends nothing, so subscribers never see two
    /// identical adjacent states.
    pub fn push(&self, next: S) -> EngineResult<Applied> {
        let mut outcome = Ok(Applied::Unchanged);

        self.tx.send_if_modified(|log| {
            let current = &log[log.len() - 1].state;
            if *current == next {
                return false;
            }
            if !current.can_transition_to(&next) {
                outcome = Err(EngineError::invalid_transition(format!(
                    "Cannot move from {} to {}",
                    current.label(),
                    next.label()
                ))
                .with_details(serde_json::json!({
                    "from": current.label(),
                    "to": next.label(),
                })));
                return false;
            }
            outcome = Ok(Applied::Advanced {
                from: current.label(),
            });
            log.push(Transition {
                state: next.clone(),
                at: Utc::now(),
            });
            true
        });

        outcome
    }

    /// Stream of states starting with the current one.
    ///
    /// Yields every later transition in order and ends right after yielding a
    /// terminal state. Dropping the stream releases the subscription.
    pub fn subscribe(&self) -> BoxStream<'static, S> {
        let mut rx = self.tx.subscribe();
        // Fixed at subscription time, not at first poll
        let mut cursor = rx.borrow_and_update().len() - 1;

        let stream = async_stream::stream! {
            loop {
                let pending: Vec<S> = {
                    let log = rx.borrow_and_update();
                    log[cursor..].iter().map(|t| t.state.clone()).collect()
                };
                cursor += pending.len();

                for state in pending {
                    let terminal = state.is_terminal();
                    yield state;
                    if terminal {
                        return;
                    }
                }

                // Sender dropped: the operation was pruned
                if rx.changed().await.is_err() {
                    return;
                }
            }
        };

        stream.boxed()
    }

    /// Wait for the first state (current or future) satisfying `predicate`.
    ///
    /// Fails with `Timeout` when `timeout` elapses first, and also when the
    /// operation reaches a terminal state that does not satisfy the predicate,
    /// since nothing can follow it. The subscription is released on every path.
    pub async fn wait_until<F>(&self, predicate: F, timeout: Duration) -> EngineResult<S>
    where
        F: Fn(&S) -> bool,
    {
        let mut updates = self.subscribe();
        let mut last_seen: Option<S> = None;

        let outcome = tokio::time::timeout(timeout, async {
            while let Some(state) = updates.next().await {
                if predicate(&state) {
                    return Some(state);
                }
                last_seen = Some(state);
            }
            None
        })
        .await;

        drop(updates);

        match outcome {
            Ok(Some(state)) => Ok(state),
            Ok(None) => Err(EngineError::timeout(match last_seen {
                Some(state) => format!(
                    "Operation ended in {} without reaching the awaited state",
                    state.label()
                ),
                None => "Operation was removed before reaching the awaited state".to_string(),
            })),
            Err(_) => Err(EngineError::timeout(format!(
                "Awaited state not reached within {}s",
                timeout.as_secs()
            ))),
        }
    }
}
