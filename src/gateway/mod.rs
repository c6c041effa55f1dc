pub mod registry;
pub mod selector;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

pub use self::registry::{GatewayRegistry, GatewaySnapshot};
pub use self::selector::{GatewaySelector, SelectionPolicy};
use crate::types::{routing_fee_msat, MSats, PublicKey};

/// Fee schedule a gateway charges for routing a payment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayFees {
    pub base_msat: u32,
    pub proportional_millionths: u32,
}

impl GatewayFees {
    pub fn fee_for(&self, amount_msat: MSats) -> MSats {
        routing_fee_msat(amount_msat, self.base_msat, self.proportional_millionths)
    }
}

/// One hop of a private route leading to the gateway's node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteHintHop {
    pub src_node_id: PublicKey,
    pub short_channel_id: u64,
    pub base_msat: u32,
    pub proportional_millionths: u32,
    pub cltv_expiry_delta: u16,
    pub htlc_minimum_msat: Option<u64>,
    pub htlc_maximum_msat: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteHint(pub Vec<RouteHintHop>);

/// Identity, address, fee schedule and routing hints of one gateway.
/// Immutable once announced; shared as `Arc<GatewayInfo>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayInfo {
    pub gateway_id: String,
    pub node_pub_key: PublicKey,
    pub lightning_alias: String,
    pub api: Url,
    pub fees: GatewayFees,
    pub route_hints: Vec<RouteHint>,
    pub supports_private_payments: bool,
}

/// A gateway as announced by the federation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayAnnouncement {
    pub info: GatewayInfo,
    pub vetted: bool,
    /// Gateway is run by (or co-located with) the running node
    pub internal: bool,
    pub reachable: bool,
    /// How long the federation vouches for this announcement
    pub ttl: Duration,
}

/// Cached view of one gateway
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayRecord {
    pub info: Arc<GatewayInfo>,
    pub vetted: bool,
    pub internal: bool,
    pub reachable: bool,
    pub last_refreshed: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl GatewayRecord {
    pub(crate) fn from_announcement(
        announcement: GatewayAnnouncement,
        refreshed_at: DateTime<Utc>,
        policy_ttl: Duration,
    ) -> Self {
        let ttl = policy_ttl.min(announcement.ttl);
        let expires_at = refreshed_at
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero());

        Self {
            info: Arc::new(announcement.info),
            vetted: announcement.vetted,
            internal: announcement.internal,
            reachable: announcement.reachable,
            last_refreshed: refreshed_at,
            expires_at,
        }
    }

    pub fn gateway_id(&self) -> &str {
        &self.info.gateway_id
    }

    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    /// Whether this record may be handed out as a default gateway
    pub fn is_selectable(&self, now: DateTime<Utc>) -> bool {
        self.reachable && self.is_fresh(now)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::str::FromStr;

    use bitcoin::secp256k1::{Secp256k1, SecretKey};

    use super::*;

    pub fn test_pubkey(seed: u8) -> PublicKey {
        let secp = Secp256k1::new();
        let secret = SecretKey::from_slice(&[seed.max(1); 32]).expect("valid secret key");
        PublicKey::from_secret_key(&secp, &secret)
    }

    pub fn test_gateway(id: &str, seed: u8, base_msat: u32, ppm: u32) -> GatewayAnnouncement {
        let node_pub_key = test_pubkey(seed);
        GatewayAnnouncement {
            info: GatewayInfo {
                gateway_id: id.to_string(),
                node_pub_key,
                lightning_alias: format!("gw-{}", id),
                api: Url::from_str(&format!("https://{}.example.com/", id)).expect("valid url"),
                fees: GatewayFees {
                    base_msat,
                    proportional_millionths: ppm,
                },
                route_hints: vec![RouteHint(vec![RouteHintHop {
                    src_node_id: node_pub_key,
                    short_channel_id: seed as u64,
                    base_msat,
                    proportional_millionths: ppm,
                    cltv_expiry_delta: 144,
                    htlc_minimum_msat: None,
                    htlc_maximum_msat: None,
                }])],
                supports_private_payments: true,
            },
            vetted: true,
            internal: false,
            reachable: true,
            ttl: Duration::from_secs(3600),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_gateway_fees() {
        let fees = GatewayFees {
            base_msat: 1_000,
            proportional_millionths: 100,
        };
        assert_eq!(fees.fee_for(10_000_000), 2_000);
    }

    #[test]
    fn test_record_expiry_uses_shorter_ttl() {
        let now = Utc::now();
        let mut announcement = test_gateway("a", 1, 0, 0);
        announcement.ttl = Duration::from_secs(60);

        let record = GatewayRecord::from_announcement(announcement, now, Duration::from_secs(600));
        assert!(record.is_fresh(now + chrono::Duration::seconds(59)));
        assert!(!record.is_fresh(now + chrono::Duration::seconds(60)));
    }

    #[test]
    fn test_unreachable_record_is_not_selectable() {
        let now = Utc::now();
        let mut announcement = test_gateway("a", 1, 0, 0);
        announcement.reachable = false;

        let record = GatewayRecord::from_announcement(announcement, now, Duration::from_secs(600));
        assert!(record.is_fresh(now));
        assert!(!record.is_selectable(now));
    }
}
