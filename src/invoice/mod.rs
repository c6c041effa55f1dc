pub mod factory;
pub mod tweak;

use std::str::FromStr;

use chrono::{DateTime, Utc};
use lightning_invoice::Bolt11Invoice;
use serde::{Deserialize, Serialize};

pub use self::factory::InvoiceFactory;
pub use self::tweak::{ReceiveKeyDeriver, TweakIndex};
use crate::error::{EngineError, EngineResult};
use crate::types::{ExtraMeta, MSats, OperationId, PublicKey};

/// Invoice expiry used when the caller gives none
pub const DEFAULT_INVOICE_EXPIRY_SECS: u64 = 86_400;

/// An invoice issued by this engine. Immutable once issued; dropped together
/// with its receive operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invoice {
    pub bolt11: String,
    pub payment_hash: String,
    pub amount_msat: MSats,
    pub description: String,
    pub expiry_secs: u64,
    pub tweak_index: Option<u64>,
    pub gateway_id: String,
    pub extra_meta: ExtraMeta,
    pub created_at: DateTime<Utc>,
}

impl Invoice {
    pub fn expires_at(&self) -> DateTime<Utc> {
        let expiry = i64::try_from(self.expiry_secs).unwrap_or(i64::MAX);
        self.created_at
            .checked_add_signed(chrono::Duration::seconds(expiry.min(i64::MAX / 1_000)))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBolt11Response {
    pub operation_id: OperationId,
    pub invoice: String,
    pub receiving_key: PublicKey,
}

/// A BOLT11 invoice that passed the checks needed before paying it
#[derive(Debug, Clone)]
pub struct PayableInvoice {
    pub bolt11: String,
    pub payment_hash: String,
    pub amount_msat: MSats,
    pub expires_at: DateTime<Utc>,
}

impl PayableInvoice {
    pub fn parse(bolt11: &str, now: DateTime<Utc>) -> EngineResult<Self> {
        let bolt11 = bolt11.trim();
        let invoice = Bolt11Invoice::from_str(bolt11)?;

        let amount_msat = match invoice.amount_milli_satoshis() {
            Some(amount) if amount > 0 => amount,
            Some(_) => return Err(EngineError::invalid_amount("Invoice amount is zero")),
            None => {
                return Err(EngineError::invalid_amount(
                    "Amountless invoices are not supported",
                ))
            }
        };

        let expiry_at_secs = invoice
            .duration_since_epoch()
            .saturating_add(invoice.expiry_time())
            .as_secs();
        let expires_at = i64::try_from(expiry_at_secs)
            .ok()
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        if expires_at <= now {
            return Err(EngineError::invalid_expiry(format!(
                "Invoice expired at {}",
                expires_at.to_rfc3339()
            ))
            .with_details(serde_json::json!({ "expiresAt": expires_at })));
        }

        Ok(Self {
            bolt11: bolt11.to_string(),
            payment_hash: invoice.payment_hash().to_string(),
            amount_msat,
            expires_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;

    #[test]
    fn test_garbage_is_invalid_invoice() {
        let err = PayableInvoice::parse("lnbc-not-an-invoice", Utc::now()).unwrap_err();
        assert_eq!(err.category, ErrorCategory::InvalidInvoice);
    }

    #[test]
    fn test_expires_at() {
        let created_at = Utc::now();
        let invoice = Invoice {
            bolt11: String::new(),
            payment_hash: String::new(),
            amount_msat: 1,
            description: String::new(),
            expiry_secs: 600,
            tweak_index: None,
            gateway_id: "a".to_string(),
            extra_meta: ExtraMeta::new(),
            created_at,
        };
        assert_eq!(invoice.expires_at(), created_at + chrono::Duration::seconds(600));
    }
}
