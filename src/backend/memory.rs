//! In-process federation.
//!
//! Signs real BOLT11 invoices, keeps a mutable gateway list and settles
//! payments between invoices it issued itself. Everything a real federation
//! would observe asynchronously (incoming payments, external settlement) is
//! driven through the `simulate_*` methods.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use bitcoin::hashes::{sha256, Hash};
use bitcoin::secp256k1::{All, Secp256k1, SecretKey};
use lightning_invoice::{
    Bolt11Invoice, Currency, InvoiceBuilder, PaymentSecret, RouteHint as LdkRouteHint,
    RouteHintHop as LdkRouteHintHop, RoutingFees, DEFAULT_MIN_FINAL_CLTV_EXPIRY_DELTA,
};
use rand::RngCore;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::{
    FederationBackend, IncomingContract, IssueInvoiceRequest, IssuedInvoice, OperationUpdate,
    PayInvoiceRequest, PaymentRoute,
};
use crate::core::operations::{PaymentState, ReceiveState};
use crate::gateway::{GatewayAnnouncement, GatewayFees, GatewayInfo, RouteHint, RouteHintHop};
use crate::types::{MSats, Network, OperationId, PublicKey};

const UPDATE_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct IssuedRecord {
    operation_id: OperationId,
    receiving_key: PublicKey,
    amount_msat: MSats,
    preimage: [u8; 32],
    tweaked: bool,
    paid: bool,
}

#[derive(Debug)]
struct FederationState {
    gateways: Vec<GatewayAnnouncement>,
    reachable: bool,
    fetch_delay: Duration,
    reject_payments: Option<String>,
    /// Keyed by payment hash
    issued: HashMap<String, IssuedRecord>,
    incoming: Vec<IncomingContract>,
    claimed: HashSet<String>,
}

pub struct InMemoryFederation {
    network: Network,
    secp: Secp256k1<All>,
    /// Signs every invoice issued by this federation
    node_secret: SecretKey,
    client_key: PublicKey,
    state: RwLock<FederationState>,
    updates: broadcast::Sender<OperationUpdate>,
}

impl std::fmt::Debug for InMemoryFederation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryFederation")
            .field("network", &self.network)
            .field("client_key", &self.client_key)
            .finish()
    }
}

fn random_bytes() -> [u8; 32] {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

fn random_secret() -> SecretKey {
    loop {
        // Out-of-range values are astronomically rare; just draw again
        if let Ok(secret) = SecretKey::from_slice(&random_bytes()) {
            return secret;
        }
    }
}

/// Announcement for a gateway whose node key is derived from `seed`.
/// Used by the demo and by tests.
pub fn sample_gateway(id: &str, seed: u8, fees: GatewayFees) -> anyhow::Result<GatewayAnnouncement> {
    let secp = Secp256k1::signing_only();
    let node_secret = SecretKey::from_slice(&[seed.max(1); 32])?;
    let node_pub_key = PublicKey::from_secret_key(&secp, &node_secret);

    Ok(GatewayAnnouncement {
        info: GatewayInfo {
            gateway_id: id.to_string(),
            node_pub_key,
            lightning_alias: format!("gateway-{}", id),
            api: Url::from_str(&format!("https://{}.gateway.invalid/", id))?,
            fees,
            route_hints: vec![RouteHint(vec![RouteHintHop {
                src_node_id: node_pub_key,
                short_channel_id: 0x0100_0000_0000_0000 | seed as u64,
                base_msat: fees.base_msat,
                proportional_millionths: fees.proportional_millionths,
                cltv_expiry_delta: 144,
                htlc_minimum_msat: Some(1_000),
                htlc_maximum_msat: None,
            }])],
            supports_private_payments: true,
        },
        vetted: true,
        internal: false,
        reachable: true,
        ttl: Duration::from_secs(3600),
    })
}

fn to_ldk_route_hint(hint: &RouteHint) -> LdkRouteHint {
    LdkRouteHint(
        hint.0
            .iter()
            .map(|hop| LdkRouteHintHop {
                src_node_id: hop.src_node_id,
                short_channel_id: hop.short_channel_id,
                fees: RoutingFees {
                    base_msat: hop.base_msat,
                    proportional_millionths: hop.proportional_millionths,
                },
                cltv_expiry_delta: hop.cltv_expiry_delta,
                htlc_minimum_msat: hop.htlc_minimum_msat,
                htlc_maximum_msat: hop.htlc_maximum_msat,
            })
            .collect(),
    )
}

impl InMemoryFederation {
    pub fn new(network: Network) -> Self {
        let secp = Secp256k1::new();
        let client_key = PublicKey::from_secret_key(&secp, &random_secret());
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);

        Self {
            network,
            node_secret: random_secret(),
            secp,
            client_key,
            state: RwLock::new(FederationState {
                gateways: Vec::new(),
                reachable: true,
                fetch_delay: Duration::ZERO,
                reject_payments: None,
                issued: HashMap::new(),
                incoming: Vec::new(),
                claimed: HashSet::new(),
            }),
            updates,
        }
    }

    pub fn regtest() -> Self {
        Self::new(Network::Regtest)
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub async fn add_gateway(&self, announcement: GatewayAnnouncement) {
        self.state.write().await.gateways.push(announcement);
    }

    pub async fn remove_gateway(&self, gateway_id: &str) {
        self.state
            .write()
            .await
            .gateways
            .retain(|gw| gw.info.gateway_id != gateway_id);
    }

    /// An unreachable federation fails every gateway fetch
    pub async fn set_reachable(&self, reachable: bool) {
        self.state.write().await.reachable = reachable;
    }

    pub async fn set_fetch_delay(&self, delay: Duration) {
        self.state.write().await.fetch_delay = delay;
    }

    /// Make every following payment submission fail with `reason`
    pub async fn reject_payments(&self, reason: Option<String>) {
        self.state.write().await.reject_payments = reason;
    }

    fn emit(&self, update: OperationUpdate) {
        debug!(
            operation_id = %update.operation_id(),
            update = ?update,
            "Federation emitted operation update"
        );
        // Nobody listening is fine
        let _ = self.updates.send(update);
    }

    fn emit_receive(&self, operation_id: &OperationId, state: ReceiveState) {
        self.emit(OperationUpdate::Receive {
            operation_id: operation_id.clone(),
            state,
        });
    }

    fn emit_payment(&self, operation_id: &OperationId, state: PaymentState) {
        self.emit(OperationUpdate::Payment {
            operation_id: operation_id.clone(),
            state,
        });
    }

    /// Fund an invoice issued by this federation. Plain invoices are claimed
    /// right away; funds for tweaked invoices wait for a scan.
    fn settle_issued(
        &self,
        state: &mut FederationState,
        payment_hash: &str,
        contract_id: String,
    ) -> anyhow::Result<[u8; 32]> {
        let record = state
            .issued
            .get_mut(payment_hash)
            .ok_or_else(|| anyhow!("Unknown invoice {}", payment_hash))?;
        if record.paid {
            bail!("Invoice {} was already paid", payment_hash);
        }
        record.paid = true;
        let record = record.clone();

        self.emit_receive(&record.operation_id, ReceiveState::Funded);

        if record.tweaked {
            state.incoming.push(IncomingContract {
                contract_id,
                payment_hash: payment_hash.to_string(),
                amount_msat: record.amount_msat,
                receiving_key: record.receiving_key,
            });
        } else {
            state.claimed.insert(contract_id);
            self.emit_receive(&record.operation_id, ReceiveState::AwaitingClaim);
            self.emit_receive(&record.operation_id, ReceiveState::Claimed);
        }

        Ok(record.preimage)
    }

    /// A payer outside the federation paid `bolt11`
    #[instrument(skip(self, bolt11))]
    pub async fn simulate_invoice_paid(&self, bolt11: &str) -> anyhow::Result<()> {
        let invoice = Bolt11Invoice::from_str(bolt11)
            .map_err(|e| anyhow!("Failed to parse invoice: {}", e))?;
        let payment_hash = invoice.payment_hash().to_string();

        let mut state = self.state.write().await;
        let contract_id = hex::encode(random_bytes());
        self.settle_issued(&mut state, &payment_hash, contract_id)?;

        info!(payment_hash = %payment_hash, "Simulated external payment of invoice");
        Ok(())
    }

    /// Lock `amount_msat` to `receiving_key` without any invoice issued here
    pub async fn simulate_incoming_payment(
        &self,
        receiving_key: PublicKey,
        amount_msat: MSats,
    ) -> IncomingContract {
        let preimage = random_bytes();
        let contract = IncomingContract {
            contract_id: hex::encode(random_bytes()),
            payment_hash: sha256::Hash::hash(&preimage).to_string(),
            amount_msat,
            receiving_key,
        };
        self.state.write().await.incoming.push(contract.clone());
        contract
    }

    /// The gateway reported the preimage for an outgoing payment
    pub fn simulate_payment_succeeded(&self, operation_id: &OperationId, preimage: &str) {
        self.emit_payment(
            operation_id,
            PaymentState::Succeeded {
                preimage: preimage.to_string(),
            },
        );
    }

    pub fn simulate_payment_failed(&self, operation_id: &OperationId, reason: &str) {
        self.emit_payment(
            operation_id,
            PaymentState::Failed {
                reason: reason.to_string(),
            },
        );
    }

    pub fn simulate_payment_refunded(&self, operation_id: &OperationId) {
        self.emit_payment(operation_id, PaymentState::Refunded);
    }
}

#[async_trait]
impl FederationBackend for InMemoryFederation {
    async fn fetch_gateways(&self) -> anyhow::Result<Vec<GatewayAnnouncement>> {
        let delay = self.state.read().await.fetch_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let state = self.state.read().await;
        if !state.reachable {
            bail!("Federation guardians did not respond");
        }
        Ok(state.gateways.clone())
    }

    fn client_receive_key(&self) -> PublicKey {
        self.client_key
    }

    #[instrument(skip(self, request), fields(operation_id = %request.operation_id))]
    async fn issue_invoice(&self, request: IssueInvoiceRequest) -> anyhow::Result<IssuedInvoice> {
        let preimage = random_bytes();
        let payment_hash = sha256::Hash::hash(&preimage);

        let mut builder = InvoiceBuilder::new(Currency::from(self.network))
            .description(request.description.clone())
            .payment_hash(payment_hash)
            .payment_secret(PaymentSecret(random_bytes()))
            .current_timestamp()
            .min_final_cltv_expiry_delta(DEFAULT_MIN_FINAL_CLTV_EXPIRY_DELTA)
            .amount_milli_satoshis(request.amount_msat)
            .expiry_time(Duration::from_secs(request.expiry_secs));
        for hint in &request.gateway.route_hints {
            builder = builder.private_route(to_ldk_route_hint(hint));
        }

        let invoice = builder
            .build_signed(|message| self.secp.sign_ecdsa_recoverable(message, &self.node_secret))
            .context("Failed to build invoice")?;

        let payment_hash = payment_hash.to_string();
        self.state.write().await.issued.insert(
            payment_hash.clone(),
            IssuedRecord {
                operation_id: request.operation_id.clone(),
                receiving_key: request.receiving_key,
                amount_msat: request.amount_msat,
                preimage,
                tweaked: request.tweaked,
                paid: false,
            },
        );

        debug!(
            payment_hash = %payment_hash,
            gateway_id = %request.gateway.gateway_id,
            "Issued invoice"
        );

        Ok(IssuedInvoice {
            bolt11: invoice.to_string(),
            payment_hash,
        })
    }

    #[instrument(skip(self, request), fields(operation_id = %request.operation_id))]
    async fn pay_invoice(&self, request: PayInvoiceRequest) -> anyhow::Result<()> {
        let mut state = self.state.write().await;
        if let Some(reason) = &state.reject_payments {
            bail!("Federation rejected the payment: {}", reason);
        }

        self.emit_payment(&request.operation_id, PaymentState::Funded);

        let known = state.issued.contains_key(&request.payment_hash);
        match (&request.route, known) {
            (PaymentRoute::Internal { .. }, _) | (PaymentRoute::Gateway(_), true) => {
                if matches!(request.route, PaymentRoute::Gateway(_)) {
                    self.emit_payment(&request.operation_id, PaymentState::AwaitingConfirmation);
                }
                match self.settle_issued(&mut state, &request.payment_hash, request.contract_id.clone())
                {
                    Ok(preimage) => self.emit_payment(
                        &request.operation_id,
                        PaymentState::Succeeded {
                            preimage: hex::encode(preimage),
                        },
                    ),
                    Err(e) => {
                        warn!(error = %e, "Payment could not be settled");
                        self.emit_payment(
                            &request.operation_id,
                            PaymentState::Failed {
                                reason: e.to_string(),
                            },
                        );
                    }
                }
            }
            (PaymentRoute::Gateway(gateway), false) => {
                // Settled later through simulate_payment_*
                debug!(gateway_id = %gateway.gateway_id, "Payment handed to gateway");
                self.emit_payment(&request.operation_id, PaymentState::AwaitingConfirmation);
            }
        }

        Ok(())
    }

    async fn find_incoming(&self, receiving_key: &PublicKey) -> anyhow::Result<Vec<IncomingContract>> {
        let state = self.state.read().await;
        if !state.reachable {
            bail!("Federation guardians did not respond");
        }
        Ok(state
            .incoming
            .iter()
            .filter(|c| c.receiving_key == *receiving_key && !state.claimed.contains(&c.contract_id))
            .cloned()
            .collect())
    }

    #[instrument(skip(self, contract), fields(contract_id = %contract.contract_id))]
    async fn claim_incoming(
        &self,
        operation_id: &OperationId,
        contract: &IncomingContract,
    ) -> anyhow::Result<()> {
        let mut state = self.state.write().await;
        if !state.incoming.iter().any(|c| c.contract_id == contract.contract_id) {
            bail!("Unknown incoming contract {}", contract.contract_id);
        }
        if !state.claimed.insert(contract.contract_id.clone()) {
            bail!("Incoming contract {} was already claimed", contract.contract_id);
        }
        state.incoming.retain(|c| c.contract_id != contract.contract_id);

        self.emit_receive(operation_id, ReceiveState::AwaitingClaim);
        self.emit_receive(operation_id, ReceiveState::Claimed);
        Ok(())
    }

    fn subscribe_updates(&self) -> broadcast::Receiver<OperationUpdate> {
        self.updates.subscribe()
    }
}
