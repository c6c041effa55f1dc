use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use crate::backend::{FederationBackend, IncomingContract};
use crate::core::operations::{
    LifecycleState, ReceiveKind, ReceiveOperation, ReceiveState, ReceiveStateMachine,
};
use crate::error::{EngineError, EngineResult};
use crate::events::{EngineEvent, EventBus};
use crate::invoice::{ReceiveKeyDeriver, TweakIndex};
use crate::observability::sanitization::sanitize_receive_key;
use crate::types::{ExtraMeta, OperationId, PublicKey};

/// Ephemeral request; lives only for the duration of one scan
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TweakScanRequest {
    pub base_key: PublicKey,
    pub indices: Vec<i64>,
    #[serde(default)]
    pub extra_meta: Option<ExtraMeta>,
}

/// Reconciles payments locked to tweaked receive keys with receive
/// operations, claiming whatever it finds
pub struct TweakScanner {
    backend: Arc<dyn FederationBackend>,
    receives: Arc<ReceiveStateMachine>,
    deriver: ReceiveKeyDeriver,
    scan_timeout: Duration,
    event_bus: Arc<EventBus>,
}

impl std::fmt::Debug for TweakScanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TweakScanner")
            .field("scan_timeout", &self.scan_timeout)
            .finish()
    }
}

/// Deterministic id for the claim of an incoming contract, so repeated scans
/// resolve to the same operation
pub fn claim_operation_id(contract_id: &str) -> OperationId {
    OperationId::derive(&[b"claim", contract_id.as_bytes()])
}

impl TweakScanner {
    pub fn new(
        backend: Arc<dyn FederationBackend>,
        receives: Arc<ReceiveStateMachine>,
        scan_timeout: Duration,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            backend,
            receives,
            deriver: ReceiveKeyDeriver::new(),
            scan_timeout,
            event_bus,
        }
    }

    /// Operation ids whose receiving key is `base_key` tweaked by one of
    /// `indices`, deduplicated, in ascending index order. Indices without a
    /// matching payment are left out.
    #[instrument(skip(self, request), fields(base_key = %sanitize_receive_key(request.base_key), indices = request.indices.len()))]
    pub async fn scan(&self, request: TweakScanRequest) -> EngineResult<Vec<OperationId>> {
        let indices: Vec<TweakIndex> = request
            .indices
            .iter()
            .map(|&index| TweakIndex::try_from(index))
            .collect::<EngineResult<Vec<_>>>()?
            .into_iter()
            .sorted()
            .dedup()
            .collect();

        if indices.is_empty() {
            debug!("Nothing to scan");
            return Ok(Vec::new());
        }

        let found = self.find_contracts(&request.base_key, &indices).await?;
        let contracts_found: usize = found.iter().map(|(_, _, contracts)| contracts.len()).sum();

        let mut seen = HashSet::new();
        let mut operation_ids = Vec::new();
        for (index, receiving_key, contracts) in found {
            for contract in contracts {
                let operation_id = self
                    .reconcile(index, receiving_key, &contract, request.extra_meta.as_ref())
                    .await;
                if seen.insert(operation_id.clone()) {
                    operation_ids.push(operation_id);
                }
            }
        }

        info!(
            indices_scanned = indices.len(),
            contracts_found,
            operations = operation_ids.len(),
            "Tweak scan completed"
        );

        let event = EngineEvent::TweakScanCompleted {
            indices_scanned: indices.len(),
            contracts_found,
            operation_ids: operation_ids.iter().map(ToString::to_string).collect(),
            timestamp: Utc::now(),
        };
        if let Err(e) = self.event_bus.publish(event).await {
            error!(error = ?e, "Failed to publish tweak scan completed event");
        }

        Ok(operation_ids)
    }

    /// Look up contracts for every index, bounded by the scan timeout.
    /// Results stay in index order.
    async fn find_contracts(
        &self,
        base_key: &PublicKey,
        indices: &[TweakIndex],
    ) -> EngineResult<Vec<(TweakIndex, PublicKey, Vec<IncomingContract>)>> {
        let mut keyed = Vec::with_capacity(indices.len());
        for &index in indices {
            keyed.push((index, self.deriver.derive(base_key, index)?));
        }

        let lookups = keyed.into_iter().map(|(index, key)| async move {
            let mut contracts = self.backend.find_incoming(&key).await?;
            contracts.sort_by(|a, b| a.contract_id.cmp(&b.contract_id));
            anyhow::Ok((index, key, contracts))
        });

        match tokio::time::timeout(self.scan_timeout, futures::future::try_join_all(lookups)).await {
            Ok(Ok(found)) => Ok(found),
            Ok(Err(e)) => Err(EngineError::unreachable_federation(format!(
                "Failed to look up incoming payments: {:#}",
                e
            ))
            .logged()),
            Err(_) => Err(EngineError::timeout(format!(
                "Tweak scan did not finish within {}s",
                self.scan_timeout.as_secs()
            ))
            .logged()),
        }
    }

    /// Attach a found contract to its receive operation (creating a claim
    /// operation when there is none) and start claiming it
    async fn reconcile(
        &self,
        index: TweakIndex,
        receiving_key: PublicKey,
        contract: &IncomingContract,
        extra_meta: Option<&ExtraMeta>,
    ) -> OperationId {
        let operation_id = match self
            .receives
            .find_locked_to(&contract.payment_hash, &receiving_key)
            .await
        {
            Some(existing) => existing,
            None => {
                let operation_id = claim_operation_id(&contract.contract_id);
                let record = ReceiveOperation {
                    operation_id: operation_id.clone(),
                    kind: ReceiveKind::Claim {
                        contract_id: contract.contract_id.clone(),
                        index: index.value(),
                    },
                    invoice: None,
                    receiving_key,
                    payment_hash: contract.payment_hash.clone(),
                    amount_msat: contract.amount_msat,
                    expires_at: None,
                    extra_meta: extra_meta.cloned().unwrap_or_default(),
                    created_at: Utc::now(),
                };
                self.receives
                    .register(operation_id.clone(), record, ReceiveState::Funded)
                    .await;
                operation_id
            }
        };

        let already_done = self
            .receives
            .current(&operation_id)
            .await
            .map(|state| state.is_terminal())
            .unwrap_or(false);
        if already_done {
            return operation_id;
        }

        debug!(
            operation_id = %operation_id,
            index = index.value(),
            contract_id = %contract.contract_id,
            "Claiming incoming contract"
        );

        if let Err(e) = self.backend.claim_incoming(&operation_id, contract).await {
            warn!(
                operation_id = %operation_id,
                error = ?e,
                "Failed to claim incoming contract"
            );
            let failed = ReceiveState::Failed {
                reason: format!("Claim failed: {:#}", e),
            };
            if let Err(e) = self.receives.transition(&operation_id, failed).await {
                warn!(operation_id = %operation_id, error = %e, "Could not record claim failure");
            }
        }

        operation_id
    }
}
