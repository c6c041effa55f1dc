use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument};

use super::{GatewayRecord, GatewayRegistry, GatewaySnapshot};
use crate::error::{EngineError, EngineResult};
use crate::events::{EngineEvent, EventBus};
use crate::types::MSats;

/// How a default gateway is chosen among the selectable (reachable and
/// fresh) records of a snapshot. Every policy breaks ties by registry order,
/// so repeated picks against an unchanged snapshot return the same gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "kind")]
pub enum SelectionPolicy {
    /// First selectable gateway in registry order
    RegistryOrder,
    /// Cheapest selectable gateway for a payment of `reference_amount_msat`
    LowestFee { reference_amount_msat: MSats },
}

impl Default for SelectionPolicy {
    fn default() -> Self {
        Self::RegistryOrder
    }
}

impl SelectionPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RegistryOrder => "registry_order",
            Self::LowestFee { .. } => "lowest_fee",
        }
    }

    /// Pure selection over a snapshot
    pub fn choose(
        &self,
        snapshot: &GatewaySnapshot,
        now: DateTime<Utc>,
    ) -> EngineResult<GatewayRecord> {
        if snapshot.is_empty() {
            return Err(EngineError::no_gateway_available(
                "Gateway registry is empty; refresh the gateway cache first",
            ));
        }

        let mut candidates = snapshot
            .gateways
            .iter()
            .enumerate()
            .filter(|(_, gw)| gw.is_selectable(now));

        let chosen = match self {
            Self::RegistryOrder => candidates.next(),
            Self::LowestFee {
                reference_amount_msat,
            } => candidates.min_by_key(|(position, gw)| {
                (gw.info.fees.fee_for(*reference_amount_msat), *position)
            }),
        };

        chosen.map(|(_, gw)| gw.clone()).ok_or_else(|| {
            EngineError::no_gateway_available(format!(
                "None of the {} registered gateways is reachable with a fresh cache entry",
                snapshot.len()
            ))
        })
    }
}

/// Picks the default gateway for operations that were not given one
#[derive(Debug)]
pub struct GatewaySelector {
    registry: Arc<GatewayRegistry>,
    policy: SelectionPolicy,
    event_bus: Arc<EventBus>,
}

impl GatewaySelector {
    pub fn new(
        registry: Arc<GatewayRegistry>,
        policy: SelectionPolicy,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            registry,
            policy,
            event_bus,
        }
    }

    pub fn policy(&self) -> SelectionPolicy {
        self.policy
    }

    #[instrument(skip(self), fields(policy = self.policy.as_str()))]
    pub async fn pick_default(&self) -> EngineResult<GatewayRecord> {
        let snapshot = self.registry.snapshot().await;
        let gateway = self.policy.choose(&snapshot, Utc::now())?;

        info!(
            gateway_id = %gateway.gateway_id(),
            generation = snapshot.generation,
            "Selected default gateway"
        );

        let event = EngineEvent::GatewaySelected {
            gateway_id: gateway.gateway_id().to_string(),
            policy: self.policy.as_str().to_string(),
            generation: snapshot.generation,
            timestamp: Utc::now(),
        };
        if let Err(e) = self.event_bus.publish(event).await {
            error!(error = ?e, "Failed to publish gateway selected event");
        }

        Ok(gateway)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::error::ErrorCategory;
    use crate::gateway::test_support::test_gateway;
    use crate::gateway::GatewayAnnouncement;

    fn snapshot_of(announcements: Vec<GatewayAnnouncement>) -> GatewaySnapshot {
        let now = Utc::now();
        GatewaySnapshot {
            generation: 1,
            refreshed_at: Some(now),
            gateways: announcements
                .into_iter()
                .map(|a| GatewayRecord::from_announcement(a, now, Duration::from_secs(600)))
                .collect(),
        }
    }

    #[test]
    fn test_empty_snapshot_has_no_gateway() {
        let snapshot = snapshot_of(vec![]);
        let err = SelectionPolicy::RegistryOrder
            .choose(&snapshot, Utc::now())
            .unwrap_err();
        assert_eq!(err.category, ErrorCategory::NoGatewayAvailable);
    }

    #[test]
    fn test_registry_order_skips_unreachable() {
        let mut down = test_gateway("a", 1, 0, 0);
        down.reachable = false;
        let snapshot = snapshot_of(vec![down, test_gateway("b", 2, 0, 0), test_gateway("c", 3, 0, 0)]);

        let chosen = SelectionPolicy::RegistryOrder
            .choose(&snapshot, Utc::now())
            .unwrap();
        assert_eq!(chosen.gateway_id(), "b");
    }

    #[test]
    fn test_registry_order_is_reproducible() {
        let snapshot = snapshot_of(vec![test_gateway("a", 1, 0, 0), test_gateway("b", 2, 0, 0)]);
        let now = Utc::now();
        for _ in 0..5 {
            let chosen = SelectionPolicy::RegistryOrder.choose(&snapshot, now).unwrap();
            assert_eq!(chosen.gateway_id(), "a");
        }
    }

    #[test]
    fn test_stale_records_are_not_selected() {
        let snapshot = snapshot_of(vec![test_gateway("a", 1, 0, 0)]);
        let later = Utc::now() + chrono::Duration::seconds(601);
        let err = SelectionPolicy::RegistryOrder
            .choose(&snapshot, later)
            .unwrap_err();
        assert_eq!(err.category, ErrorCategory::NoGatewayAvailable);
    }

    #[test]
    fn test_lowest_fee_breaks_ties_by_registry_order() {
        let snapshot = snapshot_of(vec![
            test_gateway("expensive", 1, 5_000, 0),
            test_gateway("cheap-1", 2, 1_000, 0),
            test_gateway("cheap-2", 3, 1_000, 0),
        ]);
        let policy = SelectionPolicy::LowestFee {
            reference_amount_msat: 100_000,
        };

        let chosen = policy.choose(&snapshot, Utc::now()).unwrap();
        assert_eq!(chosen.gateway_id(), "cheap-1");
    }

    #[test]
    fn test_lowest_fee_accounts_for_proportional_part() {
        let snapshot = snapshot_of(vec![
            test_gateway("flat", 1, 2_000, 0),
            test_gateway("proportional", 2, 0, 10_000),
        ]);

        // 1% of 1_000_000 msat = 10_000 msat > 2_000 msat flat
        let large = SelectionPolicy::LowestFee {
            reference_amount_msat: 1_000_000,
        };
        assert_eq!(large.choose(&snapshot, Utc::now()).unwrap().gateway_id(), "flat");

        // 1% of 100_000 msat = 1_000 msat < 2_000 msat flat
        let small = SelectionPolicy::LowestFee {
            reference_amount_msat: 100_000,
        };
        assert_eq!(
            small.choose(&snapshot, Utc::now()).unwrap().gateway_id(),
            "proportional"
        );
    }
}
