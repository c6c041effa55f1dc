use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::log::LifecycleState;
use super::{OperationKind, OperationRecord, StateMachine};
use crate::error::{EngineError, EngineResult};
use crate::types::{ExtraMeta, MSats, OperationId};

/// Lifecycle of an outgoing payment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentState {
    Created,
    Funded,
    AwaitingConfirmation,
    Succeeded { preimage: String },
    Failed { reason: String },
    Refunded,
}

impl PaymentState {
    fn rank(&self) -> u8 {
        match self {
            Self::Created => 0,
            Self::Funded => 1,
            Self::AwaitingConfirmation => 2,
            Self::Succeeded { .. } | Self::Failed { .. } | Self::Refunded => 3,
        }
    }

    /// Turn a terminal payment fact into a caller-side result carrying the
    /// preimage. Non-terminal states are reported as not finished.
    pub fn into_outcome(self) -> EngineResult<String> {
        match self {
            Self::Succeeded { preimage } => Ok(preimage),
            Self::Failed { reason } => Err(EngineError::operation_failed(reason)),
            Self::Refunded => Err(EngineError::operation_failed(
                "Payment was refunded by the gateway",
            )),
            other => Err(EngineError::invalid_transition(format!(
                "Payment is still {}",
                other.label()
            ))),
        }
    }
}

impl LifecycleState for PaymentState {
    fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded { .. } | Self::Failed { .. } | Self::Refunded
        )
    }

    fn can_transition_to(&self, next: &Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        // Funds must have been locked before they can be refunded
        if matches!(next, Self::Refunded) && matches!(self, Self::Created) {
            return false;
        }
        next.rank() > self.rank()
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Funded => "funded",
            Self::AwaitingConfirmation => "awaiting_confirmation",
            Self::Succeeded { .. } => "succeeded",
            Self::Failed { .. } => "failed",
            Self::Refunded => "refunded",
        }
    }
}

/// How an outgoing payment is settled
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayType {
    /// Invoice issued by this engine; settled inside the federation
    Internal(OperationId),
    /// Routed over Lightning through a gateway
    Lightning(OperationId),
}

impl PayType {
    pub fn operation_id(&self) -> &OperationId {
        match self {
            Self::Internal(id) | Self::Lightning(id) => id,
        }
    }
}

/// Outgoing payment record returned by `pay_bolt11_invoice`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingPayment {
    pub operation_id: OperationId,
    pub payment_type: PayType,
    pub contract_id: String,
    pub amount_msat: MSats,
    pub fee_msat: MSats,
    pub payment_hash: String,
    pub gateway_id: Option<String>,
    pub extra_meta: ExtraMeta,
    pub created_at: DateTime<Utc>,
}

impl OperationRecord for OutgoingPayment {
    fn kind(&self) -> OperationKind {
        OperationKind::Pay
    }
}

pub type PaymentStateMachine = StateMachine<PaymentState, OutgoingPayment>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payment_graph_is_monotonic() {
        use PaymentState::*;

        assert!(Created.can_transition_to(&Funded));
        assert!(Funded.can_transition_to(&AwaitingConfirmation));
        assert!(AwaitingConfirmation.can_transition_to(&Succeeded {
            preimage: "00".into()
        }));
        assert!(Created.can_transition_to(&Failed {
            reason: "no route".into()
        }));
        assert!(Funded.can_transition_to(&Refunded));

        assert!(!Created.can_transition_to(&Refunded));
        assert!(!AwaitingConfirmation.can_transition_to(&Funded));
        assert!(!Refunded.can_transition_to(&Succeeded {
            preimage: "00".into()
        }));
        assert!(!Failed {
            reason: "x".into()
        }
        .can_transition_to(&Refunded));
    }

    #[test]
    fn test_into_outcome() {
        let ok = PaymentState::Succeeded {
            preimage: "ab".into(),
        }
        .into_outcome()
        .unwrap();
        assert_eq!(ok, "ab");

        let err = PaymentState::Failed {
            reason: "gateway offline".into(),
        }
        .into_outcome()
        .unwrap_err();
        assert_eq!(err.category, crate::error::ErrorCategory::OperationFailed);
        assert_eq!(err.message, "gateway offline");

        assert!(PaymentState::Funded.into_outcome().is_err());
    }

    #[test]
    fn test_payment_state_serialization() {
        assert_eq!(
            serde_json::to_string(&PaymentState::AwaitingConfirmation).unwrap(),
            "\"awaiting_confirmation\""
        );
        assert_eq!(
            serde_json::to_value(PaymentState::Succeeded {
                preimage: "ff".into()
            })
            .unwrap(),
            serde_json::json!({ "succeeded": { "preimage": "ff" } })
        );
    }
}
