use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, instrument, warn};

use super::{GatewayAnnouncement, GatewayRecord};
use crate::backend::FederationBackend;
use crate::error::{EngineError, EngineResult};
use crate::events::{EngineEvent, EventBus};

/// Immutable view of the gateway set produced by one successful refresh.
///
/// Readers hold an `Arc` to a snapshot; a refresh builds a new snapshot and
/// swaps the pointer, so a reader sees either the old or the new set, never a
/// mix of both.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewaySnapshot {
    /// 0 before the first refresh, strictly increasing afterwards
    pub generation: u64,
    pub refreshed_at: Option<DateTime<Utc>>,
    pub gateways: Vec<GatewayRecord>,
}

impl GatewaySnapshot {
    fn empty() -> Self {
        Self {
            generation: 0,
            refreshed_at: None,
            gateways: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.gateways.is_empty()
    }

    pub fn len(&self) -> usize {
        self.gateways.len()
    }

    /// A snapshot is stale when it was never refreshed or when none of its
    /// records may still be trusted
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.refreshed_at.is_none() || !self.gateways.iter().any(|gw| gw.is_fresh(now))
    }

    pub fn find(&self, gateway_id: &str) -> Option<&GatewayRecord> {
        self.gateways.iter().find(|gw| gw.gateway_id() == gateway_id)
    }
}

/// Owner of the gateway cache.
///
/// Staleness never triggers a refresh on its own; callers that need fresh data
/// call [`GatewayRegistry::refresh`] first.
pub struct GatewayRegistry {
    backend: Arc<dyn FederationBackend>,
    snapshot: RwLock<Arc<GatewaySnapshot>>,
    refresh_lock: Mutex<()>,
    ttl: Duration,
    refresh_timeout: Duration,
    event_bus: Arc<EventBus>,
}

impl std::fmt::Debug for GatewayRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayRegistry")
            .field("ttl", &self.ttl)
            .field("refresh_timeout", &self.refresh_timeout)
            .finish()
    }
}

impl GatewayRegistry {
    pub fn new(
        backend: Arc<dyn FederationBackend>,
        ttl: Duration,
        refresh_timeout: Duration,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            backend,
            snapshot: RwLock::new(Arc::new(GatewaySnapshot::empty())),
            refresh_lock: Mutex::new(()),
            ttl,
            refresh_timeout,
            event_bus,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Fetch the authoritative gateway set and replace the cache with it.
    ///
    /// The cache is only replaced when the fetch succeeds; on failure or timeout
    /// the previous snapshot stays in place untouched.
    #[instrument(skip(self))]
    pub async fn refresh(&self) -> EngineResult<Arc<GatewaySnapshot>> {
        // Serialize refreshes so generations are handed out in swap order
        let _guard = self.refresh_lock.lock().await;

        let fetched = tokio::time::timeout(self.refresh_timeout, self.backend.fetch_gateways()).await;

        let announcements = match fetched {
            Ok(Ok(announcements)) => announcements,
            Ok(Err(e)) => {
                let reason = format!("Failed to fetch gateways from federation: {:#}", e);
                return Err(self.refresh_failed(reason).await);
            }
            Err(_) => {
                let reason = format!(
                    "Timed out after {}s fetching gateways from federation",
                    self.refresh_timeout.as_secs()
                );
                return Err(self.refresh_failed(reason).await);
            }
        };

        let refreshed_at = Utc::now();
        let gateways = self.build_records(announcements, refreshed_at);

        let next = {
            let mut current = self.snapshot.write().await;
            let next = Arc::new(GatewaySnapshot {
                generation: current.generation + 1,
                refreshed_at: Some(refreshed_at),
                gateways,
            });
            *current = next.clone();
            next
        };

        info!(
            generation = next.generation,
            gateway_count = next.len(),
            "Gateway cache refreshed"
        );

        let event = EngineEvent::GatewayCacheRefreshed {
            generation: next.generation,
            gateway_count: next.len(),
            timestamp: refreshed_at,
        };
        if let Err(e) = self.event_bus.publish(event).await {
            error!(error = ?e, "Failed to publish gateway cache refreshed event");
        }

        Ok(next)
    }

    fn build_records(
        &self,
        announcements: Vec<GatewayAnnouncement>,
        refreshed_at: DateTime<Utc>,
    ) -> Vec<GatewayRecord> {
        let mut seen = HashSet::new();
        let mut records = Vec::with_capacity(announcements.len());

        for announcement in announcements {
            if !seen.insert(announcement.info.gateway_id.clone()) {
                warn!(
                    gateway_id = %announcement.info.gateway_id,
                    "Duplicate gateway announcement ignored"
                );
                continue;
            }
            records.push(GatewayRecord::from_announcement(
                announcement,
                refreshed_at,
                self.ttl,
            ));
        }

        records
    }

    async fn refresh_failed(&self, reason: String) -> EngineError {
        warn!(reason = %reason, "Gateway cache refresh failed, keeping previous snapshot");

        let event = EngineEvent::GatewayRefreshFailed {
            reason: reason.clone(),
            timestamp: Utc::now(),
        };
        if let Err(e) = self.event_bus.publish(event).await {
            error!(error = ?e, "Failed to publish gateway refresh failed event");
        }

        EngineError::unreachable_federation(reason)
    }

    /// Current snapshot; empty before the first refresh. Never waits on the
    /// network.
    pub async fn snapshot(&self) -> Arc<GatewaySnapshot> {
        self.snapshot.read().await.clone()
    }

    /// Current gateway records in registry order
    pub async fn list(&self) -> Vec<GatewayRecord> {
        self.snapshot().await.gateways.clone()
    }

    /// Look up a single gateway.
    ///
    /// Without an id the first gateway in registry order is returned. With
    /// `force_internal` only gateways flagged internal are considered and a
    /// miss is an error rather than `None`.
    pub async fn get(
        &self,
        gateway_id: Option<&str>,
        force_internal: bool,
    ) -> EngineResult<Option<GatewayRecord>> {
        let snapshot = self.snapshot().await;

        let found = snapshot
            .gateways
            .iter()
            .filter(|gw| !force_internal || gw.internal)
            .find(|gw| gateway_id.map_or(true, |id| gw.gateway_id() == id))
            .cloned();

        debug!(
            gateway_id = ?gateway_id,
            force_internal,
            found = found.is_some(),
            generation = snapshot.generation,
            "Gateway lookup"
        );

        match found {
            None if force_internal => Err(EngineError::not_found(match gateway_id {
                Some(id) => format!("No internal gateway with id {}", id),
                None => "No internal gateway registered".to_string(),
            })),
            found => Ok(found),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::backend::memory::InMemoryFederation;
    use crate::gateway::test_support::test_gateway;

    fn registry_with(federation: Arc<InMemoryFederation>) -> GatewayRegistry {
        GatewayRegistry::new(
            federation,
            Duration::from_secs(600),
            Duration::from_secs(2),
            Arc::new(EventBus::new(16)),
        )
    }

    #[tokio::test]
    async fn test_list_is_empty_before_refresh() {
        let federation = Arc::new(InMemoryFederation::regtest());
        federation.add_gateway(test_gateway("a", 1, 0, 0)).await;
        let registry = registry_with(federation);

        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot.generation, 0);
        assert!(snapshot.is_empty());
        assert!(snapshot.is_stale(Utc::now()));
    }

    #[tokio::test]
    async fn test_refresh_replaces_snapshot() {
        let federation = Arc::new(InMemoryFederation::regtest());
        federation.add_gateway(test_gateway("a", 1, 0, 0)).await;
        federation.add_gateway(test_gateway("b", 2, 0, 0)).await;
        let registry = registry_with(federation.clone());

        let first = registry.refresh().await.unwrap();
        assert_eq!(first.generation, 1);
        let ids: Vec<_> = first.gateways.iter().map(|gw| gw.gateway_id().to_string()).collect();
        assert_eq!(ids, vec!["a", "b"]);

        federation.remove_gateway("a").await;
        let second = registry.refresh().await.unwrap();
        assert_eq!(second.generation, 2);
        assert_eq!(second.len(), 1);

        // Earlier readers keep their consistent view
        assert_eq!(first.len(), 2);
    }

    #[tokio::test]
    async fn test_refresh_failure_keeps_previous_snapshot() {
        let federation = Arc::new(InMemoryFederation::regtest());
        federation.add_gateway(test_gateway("a", 1, 0, 0)).await;
        let registry = registry_with(federation.clone());
        registry.refresh().await.unwrap();

        federation.set_reachable(false).await;
        let err = registry.refresh().await.unwrap_err();
        assert_eq!(err.category, crate::error::ErrorCategory::UnreachableFederation);

        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot.generation, 1);
        assert_eq!(snapshot.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_timeout_is_unreachable_federation() {
        let federation = Arc::new(InMemoryFederation::regtest());
        federation.set_fetch_delay(Duration::from_secs(30)).await;
        let registry = registry_with(federation);

        let err = registry.refresh().await.unwrap_err();
        assert_eq!(err.category, crate::error::ErrorCategory::UnreachableFederation);
        assert!(registry.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_announcements_keep_first() {
        let federation = Arc::new(InMemoryFederation::regtest());
        federation.add_gateway(test_gateway("a", 1, 10, 0)).await;
        federation.add_gateway(test_gateway("a", 2, 99, 0)).await;
        let registry = registry_with(federation);

        let snapshot = registry.refresh().await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.gateways[0].info.fees.base_msat, 10);
    }

    #[tokio::test]
    async fn test_get_gateway() {
        let federation = Arc::new(InMemoryFederation::regtest());
        federation.add_gateway(test_gateway("a", 1, 0, 0)).await;
        let mut internal = test_gateway("b", 2, 0, 0);
        internal.internal = true;
        federation.add_gateway(internal).await;
        let registry = registry_with(federation);
        registry.refresh().await.unwrap();

        let first = registry.get(None, false).await.unwrap().unwrap();
        assert_eq!(first.gateway_id(), "a");

        assert!(registry.get(Some("zzz"), false).await.unwrap().is_none());

        let forced = registry.get(None, true).await.unwrap().unwrap();
        assert_eq!(forced.gateway_id(), "b");

        let err = registry.get(Some("a"), true).await.unwrap_err();
        assert_eq!(err.category, crate::error::ErrorCategory::NotFound);
    }
}
