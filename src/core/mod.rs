pub mod operations;
pub mod services;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use futures::stream::BoxStream;
use sha2::{Digest, Sha256};
use tracing::{error, info, instrument, warn};

use self::operations::{
    OutgoingPayment, PayType, PaymentState, PaymentStateMachine, ReceiveState, ReceiveStateMachine,
};
use self::services::{LifecycleDriver, TweakScanRequest, TweakScanner};
use crate::backend::{FederationBackend, PayInvoiceRequest, PaymentRoute};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::events::handlers::LoggingEventHandler;
use crate::events::{EngineEvent, EventBus};
use crate::gateway::{GatewayRecord, GatewayRegistry, GatewaySelector, GatewaySnapshot};
use crate::invoice::factory::validate_invoice_params;
use crate::invoice::{CreateBolt11Response, InvoiceFactory, PayableInvoice, TweakIndex};
use crate::observability::sanitization::sanitize_invoice;
use crate::types::{ExtraMeta, MSats, OperationId, PublicKey};

/// Contract id of an outgoing payment: commits to the payment hash and the
/// operation paying it
pub fn outgoing_contract_id(payment_hash: &str, operation_id: &OperationId) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payment_hash.as_bytes());
    hasher.update(operation_id.as_str().as_bytes());
    hex::encode(hasher.finalize())
}

/// Main entry point for library consumers
pub struct LightningEngine {
    backend: Arc<dyn FederationBackend>,
    event_bus: Arc<EventBus>,
    registry: Arc<GatewayRegistry>,
    selector: GatewaySelector,
    factory: InvoiceFactory,
    scanner: TweakScanner,
    payments: Arc<PaymentStateMachine>,
    receives: Arc<ReceiveStateMachine>,
    driver: LifecycleDriver,
    config: EngineConfig,
    start_time: Instant,
}

impl std::fmt::Debug for LightningEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LightningEngine")
            .field("config", &self.config)
            .field("uptime", &self.uptime())
            .finish()
    }
}

impl LightningEngine {
    pub async fn new(config: EngineConfig, backend: Arc<dyn FederationBackend>) -> Result<Self> {
        config.validate()?;

        let event_bus = Arc::new(EventBus::new(config.event_bus_capacity));
        event_bus
            .register_handler(Arc::new(LoggingEventHandler::new(false)))
            .await;
        info!("Event bus initialized with all handlers");

        let registry = Arc::new(GatewayRegistry::new(
            backend.clone(),
            config.gateway_cache_ttl(),
            config.gateway_refresh_timeout(),
            event_bus.clone(),
        ));
        let selector = GatewaySelector::new(
            registry.clone(),
            config.selection_policy,
            event_bus.clone(),
        );

        let payments = Arc::new(PaymentStateMachine::new(event_bus.clone()));
        let receives = Arc::new(ReceiveStateMachine::new(event_bus.clone()));

        let factory = InvoiceFactory::new(
            backend.clone(),
            receives.clone(),
            config.default_invoice_expiry_secs,
            event_bus.clone(),
        );
        let scanner = TweakScanner::new(
            backend.clone(),
            receives.clone(),
            config.scan_timeout(),
            event_bus.clone(),
        );
        let driver = LifecycleDriver::new(
            backend.clone(),
            payments.clone(),
            receives.clone(),
            config.lifecycle(),
        );

        Ok(Self {
            backend,
            event_bus,
            registry,
            selector,
            factory,
            scanner,
            payments,
            receives,
            driver,
            config,
            start_time: Instant::now(),
        })
    }

    /// Get uptime since the engine was created
    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn payments(&self) -> &Arc<PaymentStateMachine> {
        &self.payments
    }

    pub fn receives(&self) -> &Arc<ReceiveStateMachine> {
        &self.receives
    }

    /// Start applying federation updates to the state machines
    pub async fn start(&self) -> Result<()> {
        self.driver.start().await?;
        info!("Lifecycle driver started successfully");
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        self.driver.stop().await?;
        info!("Lifecycle driver stopped successfully");
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.driver.is_running().await
    }

    /// Refresh the gateway cache from the federation
    pub async fn update_gateway_cache(&self) -> EngineResult<Arc<GatewaySnapshot>> {
        self.registry.refresh().await
    }

    /// Current gateway cache, possibly empty before the first refresh
    pub async fn list_gateways(&self) -> Vec<GatewayRecord> {
        self.registry.list().await
    }

    pub async fn get_gateway(
        &self,
        gateway_id: Option<&str>,
        force_internal: bool,
    ) -> EngineResult<Option<GatewayRecord>> {
        self.registry.get(gateway_id, force_internal).await
    }

    /// Gateway named by the caller, or the default one picked from a freshly
    /// refreshed cache
    async fn resolve_gateway(&self, gateway_id: Option<&str>) -> EngineResult<GatewayRecord> {
        match gateway_id {
            Some(id) => self.registry.get(Some(id), false).await?.ok_or_else(|| {
                warn!(gateway_id = %id, "Requested gateway is not in the gateway cache");
                EngineError::not_found(format!(
                    "Gateway {} is not registered with this federation",
                    id
                ))
            }),
            None => {
                self.registry.refresh().await?;
                self.selector.pick_default().await
            }
        }
    }

    /// Create an invoice paying into the client's own receive key
    #[instrument(skip(self, description, extra_meta))]
    pub async fn create_bolt11_invoice(
        &self,
        amount_msat: MSats,
        description: &str,
        expiry_time: Option<u64>,
        extra_meta: Option<ExtraMeta>,
        gateway_id: Option<&str>,
    ) -> EngineResult<CreateBolt11Response> {
        // Fail fast before touching the network
        validate_invoice_params(
            amount_msat,
            description,
            expiry_time,
            self.config.default_invoice_expiry_secs,
        )?;

        let gateway = self.resolve_gateway(gateway_id).await?;
        self.factory
            .create_invoice(amount_msat, description, expiry_time, &gateway, extra_meta)
            .await
    }

    /// Create an invoice paying into `user_key` (or the client's own receive
    /// key) tweaked by `index`
    #[allow(clippy::too_many_arguments)]
    #[instrument(skip(self, description, extra_meta, user_key))]
    pub async fn create_bolt11_invoice_for_user_tweaked(
        &self,
        amount_msat: MSats,
        description: &str,
        expiry_time: Option<u64>,
        index: i64,
        extra_meta: Option<ExtraMeta>,
        user_key: Option<PublicKey>,
        gateway_id: Option<&str>,
    ) -> EngineResult<CreateBolt11Response> {
        validate_invoice_params(
            amount_msat,
            description,
            expiry_time,
            self.config.default_invoice_expiry_secs,
        )?;
        TweakIndex::try_from(index)?;

        let gateway = self.resolve_gateway(gateway_id).await?;
        self.factory
            .create_invoice_tweaked(
                amount_msat,
                description,
                index,
                user_key,
                &gateway,
                expiry_time,
                extra_meta,
            )
            .await
    }

    /// Find and claim payments sent to `user_key` tweaked by any of `indices`
    pub async fn scan_receive_for_user_tweaks(
        &self,
        user_key: PublicKey,
        indices: Vec<i64>,
        extra_meta: Option<ExtraMeta>,
    ) -> EngineResult<Vec<OperationId>> {
        self.scanner
            .scan(TweakScanRequest {
                base_key: user_key,
                indices,
                extra_meta,
            })
            .await
    }

    /// Pay a BOLT11 invoice.
    ///
    /// Invoices issued by this engine are settled internally without a
    /// gateway or fee. A payment that the federation refuses is still
    /// returned; its failure is delivered through [`Self::subscribe_ln_pay`].
    #[instrument(skip(self, invoice, extra_meta))]
    pub async fn pay_bolt11_invoice(
        &self,
        invoice: &str,
        gateway_id: Option<&str>,
        extra_meta: Option<ExtraMeta>,
    ) -> EngineResult<OutgoingPayment> {
        let invoice = PayableInvoice::parse(invoice, Utc::now())?;

        info!(
            invoice = %sanitize_invoice(&invoice.bolt11),
            amount_msat = invoice.amount_msat,
            "Processing lightning payment"
        );

        let operation_id = OperationId::new_random();
        let payee = self
            .receives
            .find(|record| record.payment_hash == invoice.payment_hash && record.invoice.is_some())
            .await;

        let (payment_type, route, fee_msat, gateway_id) = match payee {
            Some(receive_operation) => {
                info!(
                    operation_id = %operation_id,
                    receive_operation = %receive_operation,
                    "Invoice belongs to this engine, paying internally"
                );
                (
                    PayType::Internal(operation_id.clone()),
                    PaymentRoute::Internal { receive_operation },
                    0,
                    None,
                )
            }
            None => {
                let gateway = self.resolve_gateway(gateway_id).await?;
                let fee_msat = gateway.info.fees.fee_for(invoice.amount_msat);
                (
                    PayType::Lightning(operation_id.clone()),
                    PaymentRoute::Gateway(gateway.info.clone()),
                    fee_msat,
                    Some(gateway.gateway_id().to_string()),
                )
            }
        };

        let contract_id = outgoing_contract_id(&invoice.payment_hash, &operation_id);
        let payment = OutgoingPayment {
            operation_id: operation_id.clone(),
            payment_type,
            contract_id: contract_id.clone(),
            amount_msat: invoice.amount_msat,
            fee_msat,
            payment_hash: invoice.payment_hash.clone(),
            gateway_id: gateway_id.clone(),
            extra_meta: extra_meta.unwrap_or_default(),
            created_at: Utc::now(),
        };

        // Registered before submission so no federation update is missed
        self.payments
            .register(operation_id.clone(), payment.clone(), PaymentState::Created)
            .await;

        let event = EngineEvent::PaymentInitiated {
            operation_id: operation_id.to_string(),
            amount_msat: invoice.amount_msat,
            fee_msat,
            invoice: invoice.bolt11.clone(),
            internal: gateway_id.is_none(),
            gateway_id,
            timestamp: Utc::now(),
        };
        if let Err(e) = self.event_bus.publish(event).await {
            error!(error = ?e, "Failed to publish payment initiated event");
        }

        let submitted = self
            .backend
            .pay_invoice(PayInvoiceRequest {
                operation_id: operation_id.clone(),
                bolt11: invoice.bolt11,
                payment_hash: invoice.payment_hash,
                amount_msat: invoice.amount_msat,
                fee_msat,
                contract_id,
                route,
            })
            .await;

        if let Err(e) = submitted {
            error!(
                operation_id = %operation_id,
                error = ?e,
                "Payment failed during submission"
            );
            let failed = PaymentState::Failed {
                reason: format!("{:#}", e),
            };
            if let Err(e) = self.payments.transition(&operation_id, failed).await {
                warn!(operation_id = %operation_id, error = %e, "Could not record payment failure");
            }
        } else {
            info!(
                operation_id = %operation_id,
                fee_msat,
                "Payment submitted to federation"
            );
        }

        Ok(payment)
    }

    pub async fn subscribe_ln_pay(
        &self,
        operation_id: &OperationId,
    ) -> EngineResult<BoxStream<'static, PaymentState>> {
        self.payments.subscribe(operation_id).await
    }

    /// State stream of an invoice-backed or claim receive operation
    pub async fn subscribe_ln_receive(
        &self,
        operation_id: &OperationId,
    ) -> EngineResult<BoxStream<'static, ReceiveState>> {
        self.receives.subscribe(operation_id).await
    }

    /// State stream of a claim operation created by a tweak scan
    pub async fn subscribe_ln_claim(
        &self,
        operation_id: &OperationId,
    ) -> EngineResult<BoxStream<'static, ReceiveState>> {
        let record = self.receives.record(operation_id).await?;
        if !record.is_claim() {
            return Err(EngineError::not_found(format!(
                "Operation {} is not a claim operation",
                operation_id
            )));
        }
        self.receives.subscribe(operation_id).await
    }

    /// Wait until a receive is claimed, for at most `timeout` (the configured
    /// receive wait timeout when absent)
    pub async fn wait_for_receive(
        &self,
        operation_id: &OperationId,
        timeout: Option<Duration>,
    ) -> EngineResult<ReceiveState> {
        let timeout = timeout.unwrap_or_else(|| self.config.receive_wait_timeout());
        self.receives.wait_for_claim(operation_id, timeout).await
    }

    /// Wait until a payment reaches a terminal state and turn it into the
    /// preimage or the failure reason
    pub async fn wait_for_payment(
        &self,
        operation_id: &OperationId,
        timeout: Duration,
    ) -> EngineResult<String> {
        use self::operations::LifecycleState;

        self.payments
            .wait_until(operation_id, |state| state.is_terminal(), timeout)
            .await?
            .into_outcome()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outgoing_contract_id_is_per_operation() {
        let first = OperationId::new_random();
        let second = OperationId::new_random();
        let hash = "ab".repeat(32);

        assert_eq!(
            outgoing_contract_id(&hash, &first),
            outgoing_contract_id(&hash, &first)
        );
        assert_ne!(
            outgoing_contract_id(&hash, &first),
            outgoing_contract_id(&hash, &second)
        );
        assert_eq!(outgoing_contract_id(&hash, &first).len(), 64);
    }
}
