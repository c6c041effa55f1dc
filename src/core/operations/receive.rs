use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::log::LifecycleState;
use super::{OperationKind, OperationRecord, StateMachine};
use crate::error::EngineResult;
use crate::invoice::Invoice;
use crate::types::{ExtraMeta, MSats, OperationId, PublicKey};

/// Lifecycle of an incoming payment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiveState {
    Created,
    WaitingForPayment,
    Funded,
    AwaitingClaim,
    Claimed,
    Expired,
    Failed { reason: String },
}

impl ReceiveState {
    fn rank(&self) -> u8 {
        match self {
            Self::Created => 0,
            Self::WaitingForPayment => 1,
            Self::Funded => 2,
            Self::AwaitingClaim => 3,
            Self::Claimed | Self::Expired | Self::Failed { .. } => 4,
        }
    }

    /// Still waiting for the payer
    pub fn is_unpaid(&self) -> bool {
        matches!(self, Self::Created | Self::WaitingForPayment)
    }
}

impl LifecycleState for ReceiveState {
    fn is_terminal(&self) -> bool {
        matches!(self, Self::Claimed | Self::Expired | Self::Failed { .. })
    }

    fn can_transition_to(&self, next: &Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        // Once funded, the invoice can no longer expire
        if matches!(next, Self::Expired) && !self.is_unpaid() {
            return false;
        }
        next.rank() > self.rank()
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::WaitingForPayment => "waiting_for_payment",
            Self::Funded => "funded",
            Self::AwaitingClaim => "awaiting_claim",
            Self::Claimed => "claimed",
            Self::Expired => "expired",
            Self::Failed { .. } => "failed",
        }
    }
}

/// What a receive operation was created for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum ReceiveKind {
    /// Invoice locked to the client's own receive key
    Invoice,
    /// Invoice locked to a key tweaked from a base key
    TweakedInvoice { base_key: PublicKey, index: u64 },
    /// Claim of an incoming contract discovered by a tweak scan, with no
    /// invoice issued by this engine
    Claim { contract_id: String, index: u64 },
}

/// Receive operation record
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiveOperation {
    pub operation_id: OperationId,
    pub kind: ReceiveKind,
    /// Present for invoice-backed receives
    pub invoice: Option<Invoice>,
    pub receiving_key: PublicKey,
    pub payment_hash: String,
    pub amount_msat: MSats,
    pub expires_at: Option<DateTime<Utc>>,
    pub extra_meta: ExtraMeta,
    pub created_at: DateTime<Utc>,
}

impl ReceiveOperation {
    pub fn is_claim(&self) -> bool {
        matches!(self.kind, ReceiveKind::Claim { .. })
    }
}

impl OperationRecord for ReceiveOperation {
    fn kind(&self) -> OperationKind {
        if self.is_claim() {
            OperationKind::Claim
        } else {
            OperationKind::Receive
        }
    }
}

pub type ReceiveStateMachine = StateMachine<ReceiveState, ReceiveOperation>;

impl StateMachine<ReceiveState, ReceiveOperation> {
    /// Wait until the receive is claimed
    pub async fn wait_for_claim(
        &self,
        operation_id: &OperationId,
        timeout: Duration,
    ) -> EngineResult<ReceiveState> {
        self.wait_until(operation_id, |state| *state == ReceiveState::Claimed, timeout)
            .await
    }

    /// Receive operation whose invoice or contract carries `payment_hash`
    /// and is locked to `receiving_key`
    pub async fn find_locked_to(
        &self,
        payment_hash: &str,
        receiving_key: &PublicKey,
    ) -> Option<OperationId> {
        self.find(|record| {
            record.payment_hash == payment_hash && record.receiving_key == *receiving_key
        })
        .await
    }

    /// Move every unpaid receive whose invoice expired at or before `now` to
    /// `expired`. Returns the ids that were expired.
    pub async fn expire_due(&self, now: DateTime<Utc>) -> Vec<OperationId> {
        let mut expired = Vec::new();

        for (operation_id, record, state) in self.snapshot_entries().await {
            let due = record.expires_at.map_or(false, |at| at <= now);
            if !due || !state.is_unpaid() {
                continue;
            }

            match self.transition(&operation_id, ReceiveState::Expired).await {
                Ok(_) => {
                    info!(
                        operation_id = %operation_id,
                        "Receive operation expired before payment"
                    );
                    expired.push(operation_id);
                }
                Err(e) => {
                    // Raced with a funding update; the funding wins
                    warn!(
                        operation_id = %operation_id,
                        error = %e,
                        "Skipped expiring receive operation"
                    );
                }
            }
        }

        expired
    }
}
