//! Boundary to the federation.
//!
//! The engine never talks to the network directly: gateway discovery,
//! invoice encoding, payment submission and contract claiming all go through
//! a [`FederationBackend`]. The backend reports what it observes about
//! operations as [`OperationUpdate`]s, which the lifecycle driver applies to
//! the state machines.

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::core::operations::{PaymentState, ReceiveState};
use crate::gateway::{GatewayAnnouncement, GatewayInfo};
use crate::types::{MSats, OperationId, PublicKey};

/// Everything the backend needs to encode one invoice
#[derive(Debug, Clone)]
pub struct IssueInvoiceRequest {
    pub operation_id: OperationId,
    pub amount_msat: MSats,
    pub description: String,
    pub expiry_secs: u64,
    /// Key the incoming contract will be locked to
    pub receiving_key: PublicKey,
    /// Gateway whose route hints are embedded
    pub gateway: Arc<GatewayInfo>,
    /// Funds for tweaked keys are only claimed once a scan finds them
    pub tweaked: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedInvoice {
    pub bolt11: String,
    /// Hex encoded
    pub payment_hash: String,
}

/// How an outgoing payment reaches its payee
#[derive(Debug, Clone)]
pub enum PaymentRoute {
    /// The payee is a receive operation of this client
    Internal { receive_operation: OperationId },
    Gateway(Arc<GatewayInfo>),
}

#[derive(Debug, Clone)]
pub struct PayInvoiceRequest {
    pub operation_id: OperationId,
    pub bolt11: String,
    pub payment_hash: String,
    pub amount_msat: MSats,
    pub fee_msat: MSats,
    pub contract_id: String,
    pub route: PaymentRoute,
}

/// Funds locked to a receive key, waiting to be claimed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingContract {
    pub contract_id: String,
    pub payment_hash: String,
    pub amount_msat: MSats,
    pub receiving_key: PublicKey,
}

/// A state observed by the federation for one operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationUpdate {
    Payment {
        operation_id: OperationId,
        state: PaymentState,
    },
    Receive {
        operation_id: OperationId,
        state: ReceiveState,
    },
}

impl OperationUpdate {
    pub fn operation_id(&self) -> &OperationId {
        match self {
            Self::Payment { operation_id, .. } | Self::Receive { operation_id, .. } => operation_id,
        }
    }
}

#[async_trait]
pub trait FederationBackend: Send + Sync + 'static {
    /// Authoritative gateway set announced by the federation
    async fn fetch_gateways(&self) -> anyhow::Result<Vec<GatewayAnnouncement>>;

    /// The client's own receive key
    fn client_receive_key(&self) -> PublicKey;

    async fn issue_invoice(&self, request: IssueInvoiceRequest) -> anyhow::Result<IssuedInvoice>;

    /// Submit an outgoing payment. Progress is reported through
    /// [`FederationBackend::subscribe_updates`].
    async fn pay_invoice(&self, request: PayInvoiceRequest) -> anyhow::Result<()>;

    /// Unclaimed incoming contracts locked to `receiving_key`
    async fn find_incoming(&self, receiving_key: &PublicKey) -> anyhow::Result<Vec<IncomingContract>>;

    /// Start claiming `contract` on behalf of receive operation `operation_id`
    async fn claim_incoming(
        &self,
        operation_id: &OperationId,
        contract: &IncomingContract,
    ) -> anyhow::Result<()>;

    fn subscribe_updates(&self) -> broadcast::Receiver<OperationUpdate>;
}
