use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::events::{EngineEvent, EventHandler};
use crate::observability::sanitization::sanitize_invoice;

/// Event handler that logs every event at a level matching its importance,
/// with invoices sanitized
pub struct LoggingEventHandler {
    include_debug_events: bool,
}

impl LoggingEventHandler {
    /// `include_debug_events` also logs gateway selections and non-terminal
    /// state changes
    pub fn new(include_debug_events: bool) -> Self {
        Self {
            include_debug_events,
        }
    }
}

#[async_trait]
impl EventHandler for LoggingEventHandler {
    async fn handle(&self, event: EngineEvent) -> anyhow::Result<()> {
        match event {
            EngineEvent::GatewayCacheRefreshed {
                generation,
                gateway_count,
                timestamp,
            } => {
                info!(
                    event_type = "gateway_cache_refreshed",
                    generation,
                    gateway_count,
                    timestamp = %timestamp,
                    "Gateway cache refreshed"
                );
            }
            EngineEvent::GatewayRefreshFailed { reason, timestamp } => {
                warn!(
                    event_type = "gateway_refresh_failed",
                    reason = %reason,
                    timestamp = %timestamp,
                    "Gateway cache refresh failed"
                );
            }
            EngineEvent::GatewaySelected {
                gateway_id,
                policy,
                generation,
                timestamp,
            } => {
                if self.include_debug_events {
                    debug!(
                        event_type = "gateway_selected",
                        gateway_id = %gateway_id,
                        policy = %policy,
                        generation,
                        timestamp = %timestamp,
                        "Gateway selected"
                    );
                }
            }
            EngineEvent::InvoiceCreated {
                operation_id,
                amount_msat,
                invoice,
                gateway_id,
                tweak_index,
                timestamp,
            } => {
                info!(
                    event_type = "invoice_created",
                    operation_id = %operation_id,
                    amount_msat,
                    invoice = %sanitize_invoice(&invoice),
                    gateway_id = ?gateway_id,
                    tweak_index = ?tweak_index,
                    timestamp = %timestamp,
                    "Invoice created"
                );
            }
            EngineEvent::PaymentInitiated {
                operation_id,
                amount_msat,
                fee_msat,
                invoice,
                internal,
                gateway_id,
                timestamp,
            } => {
                info!(
                    event_type = "payment_initiated",
                    operation_id = %operation_id,
                    amount_msat,
                    fee_msat,
                    invoice = %sanitize_invoice(&invoice),
                    internal,
                    gateway_id = ?gateway_id,
                    timestamp = %timestamp,
                    "Payment initiated"
                );
            }
            EngineEvent::OperationStateChanged {
                operation_id,
                kind,
                from,
                to,
                terminal,
                timestamp,
            } => {
                if to == "failed" || to == "refunded" {
                    warn!(
                        event_type = "operation_state_changed",
                        operation_id = %operation_id,
                        kind = kind.as_str(),
                        from = %from,
                        to = %to,
                        timestamp = %timestamp,
                        "Operation did not complete"
                    );
                } else if terminal {
                    info!(
                        event_type = "operation_state_changed",
                        operation_id = %operation_id,
                        kind = kind.as_str(),
                        from = %from,
                        to = %to,
                        timestamp = %timestamp,
                        "Operation finished"
                    );
                } else if self.include_debug_events {
                    debug!(
                        event_type = "operation_state_changed",
                        operation_id = %operation_id,
                        kind = kind.as_str(),
                        from = %from,
                        to = %to,
                        timestamp = %timestamp,
                        "Operation progressed"
                    );
                }
            }
            EngineEvent::TweakScanCompleted {
                indices_scanned,
                contracts_found,
                operation_ids,
                timestamp,
            } => {
                info!(
                    event_type = "tweak_scan_completed",
                    indices_scanned,
                    contracts_found,
                    operations = operation_ids.len(),
                    timestamp = %timestamp,
                    "Tweak scan completed"
                );
            }
        }

        Ok(())
    }

    fn name(&self) -> &str {
        "logging"
    }

    /// Logs are written before `publish` returns
    fn is_critical(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use tracing_test::traced_test;

    use super::*;
    use crate::core::operations::OperationKind;

    #[tokio::test]
    #[traced_test]
    async fn test_invoice_is_sanitized_in_logs() {
        let handler = LoggingEventHandler::new(false);
        let invoice = "lnbcrt10u1pjqqqqqpp5qqqsyqcyq5rqwzqfqqqsyqcyq5rqwzqfqqqsyqcyq5rqwzqfqypq";

        handler
            .handle(EngineEvent::InvoiceCreated {
                operation_id: "op-invoice".to_string(),
                amount_msat: 1_000_000,
                invoice: invoice.to_string(),
                gateway_id: None,
                tweak_index: Some(4),
                timestamp: Utc::now(),
            })
            .await
            .unwrap();

        assert!(logs_contain("Invoice created"));
        assert!(logs_contain("op-invoice"));
        assert!(!logs_contain(invoice));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_failed_operation_is_logged() {
        let handler = LoggingEventHandler::new(false);

        handler
            .handle(EngineEvent::OperationStateChanged {
                operation_id: "op-failed".to_string(),
                kind: OperationKind::Pay,
                from: "funded".to_string(),
                to: "failed".to_string(),
                terminal: true,
                timestamp: Utc::now(),
            })
            .await
            .unwrap();

        assert!(logs_contain("Operation did not complete"));
        assert!(logs_contain("op-failed"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_debug_events_are_gated() {
        let event = EngineEvent::OperationStateChanged {
            operation_id: "op-progress".to_string(),
            kind: OperationKind::Receive,
            from: "created".to_string(),
            to: "waiting_for_payment".to_string(),
            terminal: false,
            timestamp: Utc::now(),
        };

        LoggingEventHandler::new(false)
            .handle(event.clone())
            .await
            .unwrap();
        assert!(!logs_contain("Operation progressed"));

        LoggingEventHandler::new(true).handle(event).await.unwrap();
        assert!(logs_contain("Operation progressed"));
    }

    #[test]
    fn test_logging_handler_is_critical() {
        assert!(LoggingEventHandler::new(false).is_critical());
    }
}
