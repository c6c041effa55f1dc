use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::core::operations::OperationKind;

pub mod handlers;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    // Gateway events
    GatewayCacheRefreshed {
        generation: u64,
        gateway_count: usize,
        timestamp: DateTime<Utc>,
    },
    GatewayRefreshFailed {
        reason: String,
        timestamp: DateTime<Utc>,
    },
    GatewaySelected {
        gateway_id: String,
        policy: String,
        generation: u64,
        timestamp: DateTime<Utc>,
    },

    // Invoice events
    InvoiceCreated {
        operation_id: String,
        amount_msat: u64,
        invoice: String,
        gateway_id: Option<String>,
        tweak_index: Option<u64>,
        timestamp: DateTime<Utc>,
    },

    // Payment events
    PaymentInitiated {
        operation_id: String,
        amount_msat: u64,
        fee_msat: u64,
        invoice: String,
        internal: bool,
        gateway_id: Option<String>,
        timestamp: DateTime<Utc>,
    },

    // Lifecycle events
    OperationStateChanged {
        operation_id: String,
        kind: OperationKind,
        from: String,
        to: String,
        terminal: bool,
        timestamp: DateTime<Utc>,
    },
    TweakScanCompleted {
        indices_scanned: usize,
        contracts_found: usize,
        operation_ids: Vec<String>,
        timestamp: DateTime<Utc>,
    },
}

impl EngineEvent {
    /// Generate a unique event ID
    pub fn event_id(&self) -> String {
        Uuid::new_v4().to_string()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            EngineEvent::GatewayCacheRefreshed { timestamp, .. } => *timestamp,
            EngineEvent::GatewayRefreshFailed { timestamp, .. } => *timestamp,
            EngineEvent::GatewaySelected { timestamp, .. } => *timestamp,
            EngineEvent::InvoiceCreated { timestamp, .. } => *timestamp,
            EngineEvent::PaymentInitiated { timestamp, .. } => *timestamp,
            EngineEvent::OperationStateChanged { timestamp, .. } => *timestamp,
            EngineEvent::TweakScanCompleted { timestamp, .. } => *timestamp,
        }
    }

    /// Operation the event belongs to, if any
    pub fn operation_id(&self) -> Option<&str> {
        match self {
            EngineEvent::InvoiceCreated { operation_id, .. }
            | EngineEvent::PaymentInitiated { operation_id, .. }
            | EngineEvent::OperationStateChanged { operation_id, .. } => Some(operation_id),
            _ => None,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            EngineEvent::GatewayCacheRefreshed { .. } => "gateway_cache_refreshed",
            EngineEvent::GatewayRefreshFailed { .. } => "gateway_refresh_failed",
            EngineEvent::GatewaySelected { .. } => "gateway_selected",
            EngineEvent::InvoiceCreated { .. } => "invoice_created",
            EngineEvent::PaymentInitiated { .. } => "payment_initiated",
            EngineEvent::OperationStateChanged { .. } => "operation_state_changed",
            EngineEvent::TweakScanCompleted { .. } => "tweak_scan_completed",
        }
    }
}

/// Trait for handling events asynchronously
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: EngineEvent) -> anyhow::Result<()>;

    /// Get the name of this handler for identification
    fn name(&self) -> &str;

    /// Critical handlers are awaited by `publish`; the rest run in the
    /// background
    fn is_critical(&self) -> bool {
        false
    }
}

/// Event bus for distributing events to multiple handlers
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
    handlers: Arc<RwLock<Vec<Arc<dyn EventHandler>>>>,
    max_capacity: usize,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("max_capacity", &self.max_capacity)
            .field(
                "handlers_count",
                &self.handlers.try_read().map(|h| h.len()).unwrap_or(0),
            )
            .finish()
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            handlers: Arc::new(RwLock::new(Vec::new())),
            max_capacity: capacity,
        }
    }

    pub async fn register_handler(&self, handler: Arc<dyn EventHandler>) {
        let mut handlers = self.handlers.write().await;
        let handler_name = handler.name().to_string();
        handlers.push(handler);
        info!(
            handler_name = %handler_name,
            total_handlers = handlers.len(),
            "Event handler registered successfully"
        );
    }

    /// Publish an event to the broadcast channel and all registered handlers
    pub async fn publish(&self, event: EngineEvent) -> anyhow::Result<()> {
        let event_id = event.event_id();
        let event_type = event.event_type();

        debug!(
            event_id = %event_id,
            event_type = %event_type,
            operation_id = ?event.operation_id(),
            timestamp = %event.timestamp(),
            "Publishing event"
        );

        // No active receivers is not an error
        if let Ok(subscriber_count) = self.sender.send(event.clone()) {
            debug!(
                event_id = %event_id,
                event_type = %event_type,
                subscriber_count,
                "Event broadcast to subscribers"
            );
        }

        let handlers = self.handlers.read().await;
        if handlers.is_empty() {
            return Ok(());
        }

        let mut critical_handler_futures = Vec::new();

        for handler in handlers.iter() {
            let handler = handler.clone();
            let event = event.clone();
            let event_id = event_id.clone();
            let critical = handler.is_critical();

            let run = async move {
                let handler_name = handler.name();
                if let Err(e) = handler.handle(event).await {
                    error!(
                        event_id = %event_id,
                        handler_name = %handler_name,
                        critical,
                        error = ?e,
                        "Event handler failed"
                    );
                }
            };

            if critical {
                critical_handler_futures.push(run);
            } else {
                tokio::spawn(run);
            }
        }

        futures::future::join_all(critical_handler_futures).await;

        Ok(())
    }

    /// Subscribe to the raw event stream
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    pub async fn handler_count(&self) -> usize {
        self.handlers.read().await.len()
    }

    pub async fn stats(&self) -> EventBusStats {
        let handlers = self.handlers.read().await;
        EventBusStats {
            capacity: self.max_capacity,
            handler_count: handlers.len(),
            critical_handler_count: handlers.iter().filter(|h| h.is_critical()).count(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventBusStats {
    pub capacity: usize,
    pub handler_count: usize,
    pub critical_handler_count: usize,
}

#[cfg(test)]
#[path = "tests/event_bus_tests.rs"]
mod event_bus_tests;
