#![allow(clippy::unwrap_used)]
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use fmln::backend::memory::{sample_gateway, InMemoryFederation};
use fmln::gateway::GatewayFees;
use fmln::{EngineConfig, LightningEngine};

/// Engine wired to an in-process federation, plus a handle on the
/// federation for simulating what happens outside the client
pub struct TestEngine {
    pub engine: LightningEngine,
    pub federation: Arc<InMemoryFederation>,
}

pub fn test_config() -> EngineConfig {
    EngineConfig {
        gateway_refresh_timeout_secs: 2,
        scan_timeout_secs: 2,
        sweep_interval_secs: 1,
        ..EngineConfig::default()
    }
}

pub fn fees(base_msat: u32, proportional_millionths: u32) -> GatewayFees {
    GatewayFees {
        base_msat,
        proportional_millionths,
    }
}

/// Engine over a federation announcing gateways `alpha` and `beta`, started
/// but with an empty gateway cache
pub async fn engine_with_gateways() -> TestEngine {
    let federation = Arc::new(InMemoryFederation::regtest());
    federation
        .add_gateway(sample_gateway("alpha", 1, fees(1_000, 100)).unwrap())
        .await;
    federation
        .add_gateway(sample_gateway("beta", 2, fees(0, 500)).unwrap())
        .await;
    start_engine(federation).await
}

pub async fn start_engine(federation: Arc<InMemoryFederation>) -> TestEngine {
    let engine = LightningEngine::new(test_config(), federation.clone())
        .await
        .unwrap();
    engine.start().await.unwrap();
    TestEngine { engine, federation }
}

/// Bound for waits in tests that must not hang on a regression
pub const WAIT: Duration = Duration::from_secs(5);
