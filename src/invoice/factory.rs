use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, instrument};

use super::tweak::{ReceiveKeyDeriver, TweakIndex};
use super::{CreateBolt11Response, Invoice};
use crate::backend::{FederationBackend, IssueInvoiceRequest};
use crate::core::operations::{ReceiveKind, ReceiveOperation, ReceiveState, ReceiveStateMachine};
use crate::error::{EngineError, EngineResult};
use crate::events::{EngineEvent, EventBus};
use crate::gateway::GatewayRecord;
use crate::observability::sanitization::sanitize_receive_key;
use crate::types::{ExtraMeta, MSats, OperationId, PublicKey};

/// Builds invoices and registers a receive operation for each one
pub struct InvoiceFactory {
    backend: Arc<dyn FederationBackend>,
    receives: Arc<ReceiveStateMachine>,
    deriver: ReceiveKeyDeriver,
    default_expiry_secs: u64,
    event_bus: Arc<EventBus>,
}

impl std::fmt::Debug for InvoiceFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvoiceFactory")
            .field("default_expiry_secs", &self.default_expiry_secs)
            .finish()
    }
}

/// Total bitcoin supply; BOLT11 refuses anything larger
pub const MAX_INVOICE_AMOUNT_MSAT: MSats = 21_000_000 * 100_000_000 * 1_000;

/// Longest description a BOLT11 `d` field can carry, in bytes
pub const MAX_DESCRIPTION_BYTES: usize = 639;

/// Reject invalid amount/description/expiry, returning the effective expiry
pub fn validate_invoice_params(
    amount_msat: MSats,
    description: &str,
    expiry_secs: Option<u64>,
    default_expiry_secs: u64,
) -> EngineResult<u64> {
    if amount_msat == 0 {
        return Err(EngineError::invalid_amount("Invoice amount must be greater than zero")
            .with_details(serde_json::json!({ "amountMsat": amount_msat })));
    }
    if amount_msat > MAX_INVOICE_AMOUNT_MSAT {
        return Err(EngineError::invalid_amount("Invoice amount exceeds the bitcoin supply")
            .with_details(serde_json::json!({ "amountMsat": amount_msat })));
    }
    if description.len() > MAX_DESCRIPTION_BYTES {
        return Err(EngineError::invalid_description(format!(
            "Invoice description is {} bytes, at most {} allowed",
            description.len(),
            MAX_DESCRIPTION_BYTES
        )));
    }
    match expiry_secs {
        Some(0) => Err(EngineError::invalid_expiry(
            "Invoice expiry must be greater than zero seconds",
        )),
        Some(expiry) => Ok(expiry),
        None => Ok(default_expiry_secs),
    }
}

struct IssueParams<'a> {
    amount_msat: MSats,
    description: &'a str,
    expiry_secs: u64,
    gateway: &'a GatewayRecord,
    extra_meta: ExtraMeta,
    receiving_key: PublicKey,
    kind: ReceiveKind,
}

impl InvoiceFactory {
    pub fn new(
        backend: Arc<dyn FederationBackend>,
        receives: Arc<ReceiveStateMachine>,
        default_expiry_secs: u64,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            backend,
            receives,
            deriver: ReceiveKeyDeriver::new(),
            default_expiry_secs,
            event_bus,
        }
    }

    pub fn deriver(&self) -> &ReceiveKeyDeriver {
        &self.deriver
    }

    /// Invoice paying into the client's own receive key
    #[instrument(skip(self, description, gateway, extra_meta), fields(gateway_id = %gateway.gateway_id()))]
    pub async fn create_invoice(
        &self,
        amount_msat: MSats,
        description: &str,
        expiry_secs: Option<u64>,
        gateway: &GatewayRecord,
        extra_meta: Option<ExtraMeta>,
    ) -> EngineResult<CreateBolt11Response> {
        let expiry_secs =
            validate_invoice_params(amount_msat, description, expiry_secs, self.default_expiry_secs)?;

        self.issue(IssueParams {
            amount_msat,
            description,
            expiry_secs,
            gateway,
            extra_meta: extra_meta.unwrap_or_default(),
            receiving_key: self.backend.client_receive_key(),
            kind: ReceiveKind::Invoice,
        })
        .await
    }

    /// Invoice paying into `base_key` tweaked by `index`. Without a base key
    /// the client's own receive key is tweaked.
    #[allow(clippy::too_many_arguments)]
    #[instrument(skip(self, description, gateway, extra_meta, base_key), fields(gateway_id = %gateway.gateway_id()))]
    pub async fn create_invoice_tweaked(
        &self,
        amount_msat: MSats,
        description: &str,
        index: i64,
        base_key: Option<PublicKey>,
        gateway: &GatewayRecord,
        expiry_secs: Option<u64>,
        extra_meta: Option<ExtraMeta>,
    ) -> EngineResult<CreateBolt11Response> {
        let expiry_secs =
            validate_invoice_params(amount_msat, description, expiry_secs, self.default_expiry_secs)?;
        let index = TweakIndex::try_from(index)?;

        let base_key = base_key.unwrap_or_else(|| self.backend.client_receive_key());
        let receiving_key = self.deriver.derive(&base_key, index)?;

        self.issue(IssueParams {
            amount_msat,
            description,
            expiry_secs,
            gateway,
            extra_meta: extra_meta.unwrap_or_default(),
            receiving_key,
            kind: ReceiveKind::TweakedInvoice {
                base_key,
                index: index.value(),
            },
        })
        .await
    }

    async fn issue(&self, params: IssueParams<'_>) -> EngineResult<CreateBolt11Response> {
        let operation_id = OperationId::new_random();
        let tweak_index = match &params.kind {
            ReceiveKind::TweakedInvoice { index, .. } => Some(*index),
            _ => None,
        };

        let issued = self
            .backend
            .issue_invoice(IssueInvoiceRequest {
                operation_id: operation_id.clone(),
                amount_msat: params.amount_msat,
                description: params.description.to_string(),
                expiry_secs: params.expiry_secs,
                receiving_key: params.receiving_key,
                gateway: params.gateway.info.clone(),
                tweaked: tweak_index.is_some(),
            })
            .await
            .map_err(|e| {
                // Encoding rejections are the caller's input, not a federation outage
                match e.downcast::<lightning_invoice::CreationError>() {
                    Ok(creation) => EngineError::from(creation),
                    Err(e) => EngineError::unreachable_federation(format!(
                        "Failed to issue invoice: {:#}",
                        e
                    )),
                }
                .logged()
            })?;

        let invoice = Invoice {
            bolt11: issued.bolt11.clone(),
            payment_hash: issued.payment_hash.clone(),
            amount_msat: params.amount_msat,
            description: params.description.to_string(),
            expiry_secs: params.expiry_secs,
            tweak_index,
            gateway_id: params.gateway.gateway_id().to_string(),
            extra_meta: params.extra_meta.clone(),
            created_at: Utc::now(),
        };

        let record = ReceiveOperation {
            operation_id: operation_id.clone(),
            kind: params.kind,
            receiving_key: params.receiving_key,
            payment_hash: issued.payment_hash.clone(),
            amount_msat: params.amount_msat,
            expires_at: Some(invoice.expires_at()),
            extra_meta: params.extra_meta,
            created_at: invoice.created_at,
            invoice: Some(invoice),
        };

        self.receives
            .register(operation_id.clone(), record, ReceiveState::Created)
            .await;
        self.receives
            .transition(&operation_id, ReceiveState::WaitingForPayment)
            .await?;

        info!(
            operation_id = %operation_id,
            amount_msat = params.amount_msat,
            expiry_secs = params.expiry_secs,
            tweak_index = ?tweak_index,
            receiving_key = %sanitize_receive_key(params.receiving_key),
            "Invoice created"
        );

        let event = EngineEvent::InvoiceCreated {
            operation_id: operation_id.to_string(),
            amount_msat: params.amount_msat,
            invoice: issued.bolt11.clone(),
            gateway_id: Some(params.gateway.gateway_id().to_string()),
            tweak_index,
            timestamp: Utc::now(),
        };
        if let Err(e) = self.event_bus.publish(event).await {
            error!(error = ?e, "Failed to publish invoice created event");
        }

        Ok(CreateBolt11Response {
            operation_id,
            invoice: issued.bolt11,
            receiving_key: params.receiving_key,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;
    use std::time::Duration;

    use lightning_invoice::Bolt11Invoice;

    use super::*;
    use crate::backend::memory::InMemoryFederation;
    use crate::error::ErrorCategory;
    use crate::gateway::test_support::{test_gateway, test_pubkey};

    struct Fixture {
        factory: InvoiceFactory,
        receives: Arc<ReceiveStateMachine>,
        gateway: GatewayRecord,
        federation: Arc<InMemoryFederation>,
    }

    fn fixture() -> Fixture {
        let federation = Arc::new(InMemoryFederation::regtest());
        let event_bus = Arc::new(EventBus::new(16));
        let receives = Arc::new(ReceiveStateMachine::new(event_bus.clone()));
        let factory = InvoiceFactory::new(federation.clone(), receives.clone(), 86_400, event_bus);
        let gateway =
            GatewayRecord::from_announcement(test_gateway("a", 1, 0, 0), Utc::now(), Duration::from_secs(600));
        Fixture {
            factory,
            receives,
            gateway,
            federation,
        }
    }

    #[test]
    fn test_validation() {
        assert_eq!(
            validate_invoice_params(0, "", None, 60).unwrap_err().category,
            ErrorCategory::InvalidAmount
        );
        assert_eq!(
            validate_invoice_params(1, "", Some(0), 60).unwrap_err().category,
            ErrorCategory::InvalidExpiry
        );
        assert_eq!(validate_invoice_params(1, "", None, 60).unwrap(), 60);
        assert_eq!(validate_invoice_params(1, "", Some(5), 60).unwrap(), 5);
    }

    #[test]
    fn test_amount_and_description_limits() {
        assert_eq!(
            validate_invoice_params(MAX_INVOICE_AMOUNT_MSAT + 1, "", None, 60)
                .unwrap_err()
                .category,
            ErrorCategory::InvalidAmount
        );
        assert_eq!(
            validate_invoice_params(u64::MAX, "", None, 60).unwrap_err().category,
            ErrorCategory::InvalidAmount
        );
        assert!(validate_invoice_params(MAX_INVOICE_AMOUNT_MSAT, "", None, 60).is_ok());

        let longest = "d".repeat(MAX_DESCRIPTION_BYTES);
        assert!(validate_invoice_params(1, &longest, None, 60).is_ok());
        let too_long = "d".repeat(MAX_DESCRIPTION_BYTES + 1);
        assert_eq!(
            validate_invoice_params(1, &too_long, None, 60).unwrap_err().category,
            ErrorCategory::InvalidDescription
        );
    }

    #[tokio::test]
    async fn test_oversized_invoice_is_rejected_before_issuing() {
        let fx = fixture();

        let err = fx
            .factory
            .create_invoice(u64::MAX, "test", None, &fx.gateway, None)
            .await
            .unwrap_err();
        assert_eq!(err.category, ErrorCategory::InvalidAmount);

        let err = fx
            .factory
            .create_invoice(1_000, &"d".repeat(700), None, &fx.gateway, None)
            .await
            .unwrap_err();
        assert_eq!(err.category, ErrorCategory::InvalidDescription);
        assert!(!err.category.is_retryable());

        assert!(fx.receives.is_empty().await);
    }

    #[tokio::test]
    async fn test_invoice_encodes_amount_and_expiry() {
        let fx = fixture();
        for (amount, expiry) in [(1u64, Some(1u64)), (1_500_000, Some(3_600)), (42_000, None)] {
            let response = fx
                .factory
                .create_invoice(amount, "test", expiry, &fx.gateway, None)
                .await
                .unwrap();

            let decoded = Bolt11Invoice::from_str(&response.invoice).unwrap();
            assert_eq!(decoded.amount_milli_satoshis(), Some(amount));
            assert_eq!(
                decoded.expiry_time(),
                Duration::from_secs(expiry.unwrap_or(86_400))
            );
            assert_eq!(response.receiving_key, fx.federation.client_receive_key());
        }
    }

    #[tokio::test]
    async fn test_invoice_registers_waiting_receive() {
        let fx = fixture();
        let mut meta = ExtraMeta::new();
        meta.insert("order".to_string(), serde_json::json!(17));

        let response = fx
            .factory
            .create_invoice(10_000, "order 17", Some(600), &fx.gateway, Some(meta))
            .await
            .unwrap();

        let state = fx.receives.current(&response.operation_id).await.unwrap();
        assert_eq!(state, ReceiveState::WaitingForPayment);

        let record = fx.receives.record(&response.operation_id).await.unwrap();
        assert_eq!(record.kind, ReceiveKind::Invoice);
        assert_eq!(record.extra_meta["order"], 17);
        let invoice = record.invoice.unwrap();
        assert_eq!(invoice.bolt11, response.invoice);
        assert_eq!(invoice.gateway_id, "a");
    }

    #[tokio::test]
    async fn test_tweaked_key_is_deterministic() {
        let fx = fixture();
        let base = test_pubkey(9);

        let first = fx
            .factory
            .create_invoice_tweaked(1_000, "t", 5, Some(base), &fx.gateway, None, None)
            .await
            .unwrap();
        let second = fx
            .factory
            .create_invoice_tweaked(1_000, "t", 5, Some(base), &fx.gateway, None, None)
            .await
            .unwrap();

        assert_eq!(first.receiving_key, second.receiving_key);
        assert_ne!(first.operation_id, second.operation_id);
        assert_ne!(first.receiving_key, base);
    }

    #[tokio::test]
    async fn test_negative_index_is_rejected_before_issuing() {
        let fx = fixture();
        let err = fx
            .factory
            .create_invoice_tweaked(1_000, "t", -1, None, &fx.gateway, None, None)
            .await
            .unwrap_err();

        assert_eq!(err.category, ErrorCategory::InvalidIndex);
        assert!(fx.receives.is_empty().await);
    }
}
