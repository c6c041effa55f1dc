// Common types used across the library and the CLI

use std::fmt;
use std::str::FromStr;

pub use bitcoin::secp256k1::PublicKey;
pub use bitcoin::Network;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::EngineError;

/// Millisatoshis. All amounts handled by the engine are non-negative integers.
pub type MSats = u64;

/// Implementation-opaque key/value metadata attached to invoices, payments
/// and scans. Stored and forwarded, never interpreted.
pub type ExtraMeta = serde_json::Map<String, serde_json::Value>;

/// Opaque identifier of a payment, receive or claim operation
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(String);

impl OperationId {
    /// Fresh random id: 32 random bytes, hex encoded
    pub fn new_random() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    /// Deterministic id for the given parts, so that re-deriving the same
    /// operation (e.g. on a repeated scan) yields the same id
    pub fn derive(parts: &[&[u8]]) -> Self {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update((part.len() as u64).to_be_bytes());
            hasher.update(part);
        }
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 8 characters, for log lines
    pub fn fmt_short(&self) -> &str {
        let end = self.0.len().min(8);
        &self.0[..end]
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for OperationId {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(EngineError::not_found("Empty operation id"));
        }
        Ok(Self(trimmed.to_string()))
    }
}

/// Compute the fee charged for routing `amount_msat` under a
/// base + proportional fee schedule
pub fn routing_fee_msat(amount_msat: MSats, base_msat: u32, proportional_millionths: u32) -> MSats {
    let proportional = (amount_msat as u128 * proportional_millionths as u128) / 1_000_000;
    base_msat as u64 + proportional as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_id_random_is_unique_hex() {
        let a = OperationId::new_random();
        let b = OperationId::new_random();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 64);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(a.fmt_short().len(), 8);
    }

    #[test]
    fn test_operation_id_derive_is_deterministic() {
        let a = OperationId::derive(&[b"claim", b"contract-1"]);
        let b = OperationId::derive(&[b"claim", b"contract-1"]);
        let c = OperationId::derive(&[b"claimcontract-1"]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_operation_id_serializes_as_string() {
        let id: OperationId = "abc123".parse().unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"abc123\"");
        assert!(OperationId::from_str("  ").is_err());
    }

    #[test]
    fn test_routing_fee() {
        assert_eq!(routing_fee_msat(1_000_000, 1_000, 0), 1_000);
        assert_eq!(routing_fee_msat(1_000_000, 0, 100), 100);
        assert_eq!(routing_fee_msat(1_000_000, 1_000, 2_500), 3_500);
        assert_eq!(routing_fee_msat(0, 0, 0), 0);
    }
}
