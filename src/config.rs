use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::core::services::LifecycleConfig;
use crate::gateway::SelectionPolicy;
use crate::invoice::DEFAULT_INVOICE_EXPIRY_SECS;
use crate::types::Network;

/// Engine configuration, stored as TOML with kebab-case keys
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Bitcoin network the federation runs on
    #[serde(default = "default_network")]
    pub network: Network,

    /// How long a refreshed gateway record may be trusted as default
    #[serde(rename = "gateway-cache-ttl-secs", default = "default_gateway_cache_ttl_secs")]
    pub gateway_cache_ttl_secs: u64,

    /// Upper bound on one gateway refresh round trip
    #[serde(
        rename = "gateway-refresh-timeout-secs",
        default = "default_gateway_refresh_timeout_secs"
    )]
    pub gateway_refresh_timeout_secs: u64,

    /// Expiry used for invoices created without one
    #[serde(
        rename = "default-invoice-expiry-secs",
        default = "default_invoice_expiry_secs"
    )]
    pub default_invoice_expiry_secs: u64,

    /// Default bound for `wait_for_receive`
    #[serde(
        rename = "receive-wait-timeout-secs",
        default = "default_receive_wait_timeout_secs"
    )]
    pub receive_wait_timeout_secs: u64,

    /// Upper bound on one tweak scan
    #[serde(rename = "scan-timeout-secs", default = "default_scan_timeout_secs")]
    pub scan_timeout_secs: u64,

    #[serde(rename = "sweep-interval-secs", default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// How long finished operations stay subscribable
    #[serde(
        rename = "terminal-retention-secs",
        default = "default_terminal_retention_secs"
    )]
    pub terminal_retention_secs: u64,

    #[serde(rename = "event-bus-capacity", default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,

    /// Log filter directive, overridden by RUST_LOG
    #[serde(rename = "log-level", default = "default_log_level")]
    pub log_level: String,

    // Kept last: it serializes as a TOML table
    #[serde(rename = "selection-policy", default)]
    pub selection_policy: SelectionPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            network: default_network(),
            gateway_cache_ttl_secs: default_gateway_cache_ttl_secs(),
            gateway_refresh_timeout_secs: default_gateway_refresh_timeout_secs(),
            default_invoice_expiry_secs: default_invoice_expiry_secs(),
            receive_wait_timeout_secs: default_receive_wait_timeout_secs(),
            scan_timeout_secs: default_scan_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            terminal_retention_secs: default_terminal_retention_secs(),
            event_bus_capacity: default_event_bus_capacity(),
            log_level: default_log_level(),
            selection_policy: SelectionPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let config: EngineConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file atomically
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;

        // Write to temporary file first so the config is never half written
        let temp_path = path.with_extension("tmp");
        std::fs::write(&temp_path, contents)?;

        match std::fs::rename(&temp_path, path) {
            Ok(_) => Ok(()),
            Err(e) => {
                let _ = std::fs::remove_file(&temp_path);
                Err(e.into())
            }
        }
    }

    /// Load the configuration at `path`, writing the defaults there when the
    /// file does not exist yet. The flag tells whether the file was created.
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<(Self, bool)> {
        let path = path.as_ref();

        if path.exists() {
            return Ok((Self::load_from_file(path)?, false));
        }

        let config = Self::default();
        config.save_to_file(path)?;
        Ok((config, true))
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        let non_zero = [
            ("gateway-refresh-timeout-secs", self.gateway_refresh_timeout_secs),
            ("default-invoice-expiry-secs", self.default_invoice_expiry_secs),
            ("receive-wait-timeout-secs", self.receive_wait_timeout_secs),
            ("scan-timeout-secs", self.scan_timeout_secs),
            ("sweep-interval-secs", self.sweep_interval_secs),
            ("event-bus-capacity", self.event_bus_capacity as u64),
        ];
        for (key, value) in non_zero {
            if value == 0 {
                bail!("Configuration value {} must be greater than zero", key);
            }
        }
        Ok(())
    }

    pub fn gateway_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.gateway_cache_ttl_secs)
    }

    pub fn gateway_refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.gateway_refresh_timeout_secs)
    }

    pub fn receive_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.receive_wait_timeout_secs)
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }

    pub fn lifecycle(&self) -> LifecycleConfig {
        LifecycleConfig {
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            terminal_retention: Duration::from_secs(self.terminal_retention_secs),
        }
    }
}

// Default value functions
fn default_network() -> Network {
    Network::Regtest
}

fn default_gateway_cache_ttl_secs() -> u64 {
    600
}

fn default_gateway_refresh_timeout_secs() -> u64 {
    10
}

fn default_invoice_expiry_secs() -> u64 {
    DEFAULT_INVOICE_EXPIRY_SECS
}

fn default_receive_wait_timeout_secs() -> u64 {
    10
}

fn default_scan_timeout_secs() -> u64 {
    30
}

fn default_sweep_interval_secs() -> u64 {
    5
}

fn default_terminal_retention_secs() -> u64 {
    3600
}

fn default_event_bus_capacity() -> usize {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}
