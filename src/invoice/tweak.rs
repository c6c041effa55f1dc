//! Per-index receive key derivation.
//!
//! A receive key for `(base_key, index)` is `base_key + t·G` where
//!
//! ```text
//! t = HMAC-SHA256(key = base_key (33-byte compressed), msg = TAG || index (u64 BE))
//! ```
//!
//! The derivation is a pure function of its inputs: the same base key and
//! index always give the same receive key, so an invoice can be re-derived
//! without keeping any state. The holder of the base secret key can compute
//! the matching secret as `base_secret + t`.

use bitcoin::secp256k1::{Scalar, Secp256k1, SecretKey, VerifyOnly};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{EngineError, EngineResult};
use crate::types::PublicKey;

type HmacSha256 = Hmac<Sha256>;

const TWEAK_TAG: &[u8] = b"fmln/receive-tweak/v1";

/// Index of a tweaked receive key. Only constructible from a non-negative
/// value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TweakIndex(u64);

impl TweakIndex {
    pub fn value(self) -> u64 {
        self.0
    }
}

impl From<u64> for TweakIndex {
    fn from(index: u64) -> Self {
        Self(index)
    }
}

impl TryFrom<i64> for TweakIndex {
    type Error = EngineError;

    fn try_from(index: i64) -> Result<Self, Self::Error> {
        u64::try_from(index).map(Self).map_err(|_| {
            EngineError::invalid_index(format!("Tweak index must be non-negative, got {}", index))
                .with_details(serde_json::json!({ "index": index }))
        })
    }
}

/// Tweak scalar bytes for `(base_key, index)`
pub fn tweak_bytes(base_key: &PublicKey, index: TweakIndex) -> EngineResult<[u8; 32]> {
    let mut mac = HmacSha256::new_from_slice(&base_key.serialize())
        .map_err(|e| EngineError::internal_error(format!("Invalid HMAC key: {}", e)))?;
    mac.update(TWEAK_TAG);
    mac.update(&index.value().to_be_bytes());

    let mut tweak = [0u8; 32];
    tweak.copy_from_slice(&mac.finalize().into_bytes());
    Ok(tweak)
}

fn tweak_scalar(base_key: &PublicKey, index: TweakIndex) -> EngineResult<Scalar> {
    Scalar::from_be_bytes(tweak_bytes(base_key, index)?).map_err(|_| {
        EngineError::internal_error(format!(
            "Tweak for index {} is outside the curve order",
            index.value()
        ))
    })
}

#[derive(Debug, Clone)]
pub struct ReceiveKeyDeriver {
    secp: Secp256k1<VerifyOnly>,
}

impl Default for ReceiveKeyDeriver {
    fn default() -> Self {
        Self::new()
    }
}

impl ReceiveKeyDeriver {
    pub fn new() -> Self {
        Self {
            secp: Secp256k1::verification_only(),
        }
    }

    pub fn derive(&self, base_key: &PublicKey, index: TweakIndex) -> EngineResult<PublicKey> {
        let scalar = tweak_scalar(base_key, index)?;

        base_key.add_exp_tweak(&self.secp, &scalar).map_err(|e| {
            EngineError::internal_error(format!(
                "Failed to tweak receive key for index {}: {}",
                index.value(),
                e
            ))
        })
    }

    /// Secret counterpart of [`ReceiveKeyDeriver::derive`], for the holder of
    /// the base secret key
    pub fn derive_secret(
        &self,
        base_secret: &SecretKey,
        index: TweakIndex,
    ) -> EngineResult<SecretKey> {
        let secp = Secp256k1::signing_only();
        let base_key = PublicKey::from_secret_key(&secp, base_secret);
        let scalar = tweak_scalar(&base_key, index)?;

        base_secret.add_tweak(&scalar).map_err(|e| {
            EngineError::internal_error(format!(
                "Failed to tweak receive secret for index {}: {}",
                index.value(),
                e
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::error::ErrorCategory;
    use crate::gateway::test_support::test_pubkey;

    #[test]
    fn test_derivation_is_deterministic() {
        let deriver = ReceiveKeyDeriver::new();
        let base = test_pubkey(7);

        let first = deriver.derive(&base, TweakIndex::from(5)).unwrap();
        let second = deriver.derive(&base, TweakIndex::from(5)).unwrap();
        assert_eq!(first, second);
        assert_ne!(first, base);
    }

    #[test]
    fn test_distinct_indices_and_bases_give_distinct_keys() {
        let deriver = ReceiveKeyDeriver::new();
        let mut seen = HashSet::new();

        for seed in 1..4u8 {
            let base = test_pubkey(seed);
            for index in 0..50u64 {
                let key = deriver.derive(&base, TweakIndex::from(index)).unwrap();
                assert!(seen.insert(key), "collision at seed {} index {}", seed, index);
            }
        }
    }

    #[test]
    fn test_secret_derivation_matches_public() {
        let secp = Secp256k1::new();
        let deriver = ReceiveKeyDeriver::new();
        let secret = SecretKey::from_slice(&[9u8; 32]).unwrap();
        let base = PublicKey::from_secret_key(&secp, &secret);

        let tweaked_secret = deriver.derive_secret(&secret, TweakIndex::from(3)).unwrap();
        let tweaked_public = deriver.derive(&base, TweakIndex::from(3)).unwrap();
        assert_eq!(PublicKey::from_secret_key(&secp, &tweaked_secret), tweaked_public);
    }

    #[test]
    fn test_negative_index_is_rejected() {
        let err = TweakIndex::try_from(-1i64).unwrap_err();
        assert_eq!(err.category, ErrorCategory::InvalidIndex);
        assert_eq!(TweakIndex::try_from(0i64).unwrap().value(), 0);
    }
}
