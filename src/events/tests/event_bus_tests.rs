use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::{timeout, Duration};

use crate::core::operations::OperationKind;
use crate::events::*;

struct TestEventHandler {
    name: String,
    call_count: Arc<AtomicUsize>,
    should_fail: bool,
    critical: bool,
}

impl TestEventHandler {
    fn new(name: &str, call_count: Arc<AtomicUsize>) -> Self {
        Self {
            name: name.to_string(),
            call_count,
            should_fail: false,
            critical: false,
        }
    }
}

#[async_trait]
impl EventHandler for TestEventHandler {
    async fn handle(&self, _event: EngineEvent) -> anyhow::Result<()> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        if self.should_fail {
            anyhow::bail!("Test handler failure");
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn is_critical(&self) -> bool {
        self.critical
    }
}

fn invoice_created() -> EngineEvent {
    EngineEvent::InvoiceCreated {
        operation_id: "op-1".to_string(),
        amount_msat: 2000,
        invoice: "lnbcrt20n1test".to_string(),
        gateway_id: Some("gw-1".to_string()),
        tweak_index: None,
        timestamp: Utc::now(),
    }
}

#[tokio::test]
async fn test_event_bus_creation() {
    let event_bus = EventBus::new(100);
    let stats = event_bus.stats().await;
    assert_eq!(stats.capacity, 100);
    assert_eq!(stats.handler_count, 0);
    assert_eq!(stats.critical_handler_count, 0);
}

#[tokio::test]
async fn test_publish_without_handlers_or_subscribers() {
    let event_bus = EventBus::new(4);
    event_bus.publish(invoice_created()).await.unwrap();
}

#[tokio::test]
async fn test_critical_handler_is_awaited() {
    let event_bus = EventBus::new(100);
    let call_count = Arc::new(AtomicUsize::new(0));
    let mut handler = TestEventHandler::new("critical", call_count.clone());
    handler.critical = true;
    event_bus.register_handler(Arc::new(handler)).await;

    event_bus.publish(invoice_created()).await.unwrap();

    // No sleep needed: critical handlers complete before publish returns
    assert_eq!(call_count.load(Ordering::SeqCst), 1);
    assert_eq!(event_bus.stats().await.critical_handler_count, 1);
}

#[tokio::test]
async fn test_handler_failure_doesnt_affect_others() {
    let event_bus = EventBus::new(100);
    let failing_count = Arc::new(AtomicUsize::new(0));
    let working_count = Arc::new(AtomicUsize::new(0));

    let mut failing = TestEventHandler::new("failing", failing_count.clone());
    failing.should_fail = true;
    event_bus.register_handler(Arc::new(failing)).await;
    event_bus
        .register_handler(Arc::new(TestEventHandler::new(
            "working",
            working_count.clone(),
        )))
        .await;
    assert_eq!(event_bus.handler_count().await, 2);

    event_bus
        .publish(EngineEvent::GatewayRefreshFailed {
            reason: "federation offline".to_string(),
            timestamp: Utc::now(),
        })
        .await
        .unwrap();

    // Give the background tasks time to run
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(failing_count.load(Ordering::SeqCst), 1);
    assert_eq!(working_count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_broadcast_subscription() {
    let event_bus = EventBus::new(100);
    let mut receiver = event_bus.subscribe();

    event_bus.publish(invoice_created()).await.unwrap();

    let received = match timeout(Duration::from_millis(100), receiver.recv()).await {
        Ok(Ok(event)) => event,
        Ok(Err(e)) => panic!("Failed to receive event: {}", e),
        Err(_) => panic!("Timeout waiting for event"),
    };

    match received {
        EngineEvent::InvoiceCreated {
            operation_id,
            amount_msat,
            ..
        } => {
            assert_eq!(operation_id, "op-1");
            assert_eq!(amount_msat, 2000);
        }
        other => panic!("Expected InvoiceCreated event, got {:?}", other),
    }
}

#[test]
fn test_event_metadata_and_serialization() {
    let event = EngineEvent::OperationStateChanged {
        operation_id: "op-2".to_string(),
        kind: OperationKind::Receive,
        from: "funded".to_string(),
        to: "claimed".to_string(),
        terminal: true,
        timestamp: Utc::now(),
    };

    assert_eq!(event.event_type(), "operation_state_changed");
    assert_eq!(event.operation_id(), Some("op-2"));
    assert!(!event.event_id().is_empty());

    let json = serde_json::to_value(&event).unwrap();
    assert_eq!(json["type"], "operation_state_changed");
    assert_eq!(json["kind"], "receive");

    let refreshed = EngineEvent::GatewayCacheRefreshed {
        generation: 3,
        gateway_count: 2,
        timestamp: Utc::now(),
    };
    assert_eq!(refreshed.operation_id(), None);
}
