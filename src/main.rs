use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use console::{style, Term};
use futures::StreamExt;
use tracing::info;

use fmln::backend::memory::{sample_gateway, InMemoryFederation};
use fmln::config::EngineConfig;
use fmln::gateway::GatewayFees;
use fmln::invoice::{ReceiveKeyDeriver, TweakIndex};
use fmln::observability::{init_logging, LoggingConfig};
use fmln::types::PublicKey;
use fmln::{FederationBackend, LightningEngine};

const CONFIG_FILE_NAME: &str = "fmln.toml";

#[derive(Subcommand)]
enum Commands {
    /// Write the default configuration into the data directory
    Init,
    /// Print the receive key derived from a user key and a tweak index
    DeriveKey {
        /// Compressed public key, hex encoded
        #[clap(long)]
        user_key: String,
        #[clap(long)]
        index: i64,
    },
    /// Run the engine against an in-process federation
    Demo {
        /// Invoice amount in millisatoshis
        #[clap(long, default_value = "50000")]
        amount_msat: u64,
    },
}

#[derive(Parser)]
#[clap(version, about = "Lightning invoice lifecycle and gateway routing engine")]
struct Cli {
    /// Data directory path (contains config and logs)
    #[clap(long, env = "FMLN_DATA_DIR", default_value = ".")]
    data_dir: PathBuf,

    /// Log to files under <data-dir>/logs as well
    #[clap(long)]
    file_log: bool,

    #[clap(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    let cli: Cli = Cli::parse();
    let term = Term::stdout();

    std::fs::create_dir_all(&cli.data_dir)?;
    let config_path = cli.data_dir.join(CONFIG_FILE_NAME);
    let (config, created) = EngineConfig::load_or_create(&config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;

    let mut log_config = LoggingConfig::console(
        std::env::var("LOG_LEVEL").unwrap_or_else(|_| config.log_level.clone()),
    );
    if cli.file_log {
        log_config = log_config.with_file_output(cli.data_dir.join("logs"));
    }
    init_logging(log_config)?;

    if created {
        term.write_line(&format!(
            "{}{}",
            style("Writing default configuration...").yellow(),
            style("done").white()
        ))?;
    }

    match cli.command {
        Commands::Init => {
            term.write_line(&format!(
                "Configuration at {}",
                style(config_path.display()).cyan()
            ))?;
            Ok(())
        }
        Commands::DeriveKey { user_key, index } => derive_key(&term, &user_key, index),
        Commands::Demo { amount_msat } => run_demo(&term, config, amount_msat).await,
    }
}

fn derive_key(term: &Term, user_key: &str, index: i64) -> Result<()> {
    let base_key = PublicKey::from_str(user_key.trim()).context("Invalid user key")?;
    let index = TweakIndex::try_from(index)?;
    let derived = ReceiveKeyDeriver::new().derive(&base_key, index)?;

    term.write_line(&derived.to_string())?;
    Ok(())
}

async fn run_demo(term: &Term, config: EngineConfig, amount_msat: u64) -> Result<()> {
    let federation = Arc::new(InMemoryFederation::new(config.network));
    federation
        .add_gateway(sample_gateway(
            "alpha",
            1,
            GatewayFees {
                base_msat: 1_000,
                proportional_millionths: 100,
            },
        )?)
        .await;
    federation
        .add_gateway(sample_gateway(
            "beta",
            2,
            GatewayFees {
                base_msat: 0,
                proportional_millionths: 500,
            },
        )?)
        .await;

    let engine = LightningEngine::new(config, federation.clone()).await?;
    engine.start().await?;
    info!("Demo engine started");

    let snapshot = engine.update_gateway_cache().await?;
    term.write_line(&format!(
        "{} generation {}",
        style("Gateway cache refreshed").green(),
        snapshot.generation
    ))?;
    for gateway in engine.list_gateways().await {
        term.write_line(&format!(
            "  {} base={}msat ppm={}",
            style(gateway.gateway_id()).cyan(),
            gateway.info.fees.base_msat,
            gateway.info.fees.proportional_millionths
        ))?;
    }

    // Plain invoice, paid from the same client
    let created = engine
        .create_bolt11_invoice(amount_msat, "fmln demo", Some(600), None, None)
        .await?;
    term.write_line(&format!(
        "{} {}",
        style("Invoice").bold(),
        style(&created.invoice).dim()
    ))?;

    let receive_stream = engine.subscribe_ln_receive(&created.operation_id).await?;
    let payment = engine.pay_bolt11_invoice(&created.invoice, None, None).await?;
    let preimage = engine
        .wait_for_payment(&payment.operation_id, Duration::from_secs(10))
        .await?;
    engine
        .wait_for_receive(&created.operation_id, None)
        .await?;

    let payment_states: Vec<_> = engine
        .payments()
        .history(&payment.operation_id)
        .await?
        .into_iter()
        .map(|transition| transition.state)
        .collect();
    let receive_states: Vec<_> = receive_stream.collect().await;

    term.write_line(&format!(
        "{} fee={}msat preimage={}",
        style("Payment settled internally").green(),
        payment.fee_msat,
        preimage
    ))?;
    term.write_line(&format!("  payment: {:?}", payment_states))?;
    term.write_line(&format!("  receive: {:?}", receive_states))?;

    // Tweaked invoice, found and claimed by a scan
    let tweaked = engine
        .create_bolt11_invoice_for_user_tweaked(
            amount_msat,
            "fmln demo tweaked",
            Some(600),
            3,
            None,
            None,
            Some("beta"),
        )
        .await?;
    federation.simulate_invoice_paid(&tweaked.invoice).await?;

    let found = engine
        .scan_receive_for_user_tweaks(federation.client_receive_key(), vec![0, 1, 2, 3], None)
        .await?;
    for operation_id in &found {
        let state = engine.wait_for_receive(operation_id, None).await?;
        term.write_line(&format!(
            "{} {} -> {:?}",
            style("Scan found").green(),
            operation_id.fmt_short(),
            state
        ))?;
    }

    engine.stop().await?;
    Ok(())
}
