//! # GlucoseCheck CLI
//!
//! Deploy and drive the GlucoseCheck contract on the local devnet:
//!
//! ```text
//! glucose-check deploy
//! glucose-check submit-glucose --value 150
//! glucose-check check-risk
//! glucose-check decrypt-risk
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use glucose_check::blockchain::deployments::Deployment;
use glucose_check::config::ClientConfig;
use glucose_check::fhe::storage::FileStringStorage;
use glucose_check::telemetry;
use glucose_check::{
    Address, FhevmInstance, LocalFhevmNode, LocalWallet, PipelineOutcome, SkipReason, TxHash, WorkflowCoordinator,
};

#[derive(Parser)]
#[command(name = "glucose-check")]
#[command(about = "GlucoseCheck - encrypted glucose risk checks over FHE")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true, default_value = "config/glucose-check.toml")]
    config: PathBuf,

    /// Network to use (hardhat, anvil, sepolia, custom)
    #[arg(short, long, global = true)]
    network: Option<String>,

    /// GlucoseCheck contract address (defaults to the deployments book)
    #[arg(short, long, global = true)]
    address: Option<Address>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Deploy a GlucoseCheck contract to the devnet and record it in the deployments book
    Deploy,

    /// Print the GlucoseCheck address
    Address,

    /// Print the devnet accounts
    Accounts {
        #[arg(long, default_value_t = 5)]
        count: u32,
    },

    /// Encrypt and submit a glucose reading
    SubmitGlucose {
        #[arg(long)]
        value: u64,
    },

    /// Compute the encrypted risk flag for the submitted reading (> 140)
    CheckRisk,

    /// Decrypt the risk flag
    DecryptRisk,

    /// Keep the mirrored handles fresh and print them when they change
    Watch {
        /// Stop after this many poll intervals
        #[arg(long)]
        ticks: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = ClientConfig::load(&cli.config)?;
    if let Some(network) = &cli.network {
        config.network.name = network.parse()?;
        config.network.chain_id = None;
    }

    let level = telemetry::level_for_verbosity(cli.verbose, &config.logging.level);
    telemetry::init_logging(&level, config.logging.json)?;

    if !config.network.name.is_local() {
        bail!(
            "Network '{}' ({}) needs a remote relayer transport, which this build does not include; use --network hardhat",
            config.network.name,
            config.network.rpc_url()
        );
    }

    let node = Arc::new(
        LocalFhevmNode::open(&config.network.state_file)
            .with_context(|| format!("Failed to open devnet state {}", config.network.state_file.display()))?,
    );
    let wallet = Arc::new(config.wallet()?);

    match cli.command {
        Commands::Deploy => deploy(&config, &node, &wallet),
        Commands::Accounts { count } => {
            for index in 0..count {
                println!("{}", LocalWallet::devnet_account(index).address());
            }
            Ok(())
        }
        Commands::Address => {
            let coordinator = build_coordinator(&config, cli.address, &node, &wallet)?;
            let contract = require_contract(&coordinator, &node)?;
            println!("GlucoseCheck address is {}", contract);
            Ok(())
        }
        Commands::SubmitGlucose { value } => {
            if value == 0 {
                bail!("Argument --value must be a positive integer");
            }
            let coordinator = build_coordinator(&config, cli.address, &node, &wallet)?;
            let contract = require_contract(&coordinator, &node)?;
            println!("GlucoseCheck: {}", contract);

            let outcome = coordinator.submit_glucose(value).await;
            let tx_hash = finish("submitGlucose", outcome, &coordinator)?;
            print_tx(&node, tx_hash).await?;
            println!("GlucoseCheck submitGlucose({}) succeeded!", value);
            Ok(())
        }
        Commands::CheckRisk => {
            let coordinator = build_coordinator(&config, cli.address, &node, &wallet)?;
            let contract = require_contract(&coordinator, &node)?;
            println!("GlucoseCheck: {}", contract);

            coordinator.refresh_handles().await?;
            let outcome = coordinator.check_risk().await;
            let tx_hash = finish("checkRisk", outcome, &coordinator)?;
            print_tx(&node, tx_hash).await?;
            println!("GlucoseCheck checkRisk() succeeded!");
            Ok(())
        }
        Commands::DecryptRisk => {
            let coordinator = build_coordinator(&config, cli.address, &node, &wallet)?;
            let contract = require_contract(&coordinator, &node)?;
            println!("GlucoseCheck: {}", contract);

            coordinator.refresh_handles().await?;
            let handle = coordinator
                .risk_result_handle()
                .ok_or_else(|| anyhow!("risk result handle unavailable"))?;
            if handle.is_zero() {
                println!("Encrypted risk result: {}", handle);
                println!("Clear risk result    : Not available (check risk first)");
                return Ok(());
            }

            let outcome = coordinator.decrypt_risk_result().await;
            finish("userDecrypt", outcome, &coordinator)?;
            let clear = coordinator
                .clear_risk_result()
                .ok_or_else(|| anyhow!("decryption produced no cleartext"))?;
            println!("Encrypted risk result: {}", handle);
            println!("Clear risk result    : {} (true = high glucose, false = normal)", clear);
            Ok(())
        }
        Commands::Watch { ticks } => {
            let coordinator = build_coordinator(&config, cli.address, &node, &wallet)?;
            let contract = require_contract(&coordinator, &node)?;
            watch(&coordinator, contract, ticks).await
        }
    }
}

fn deploy(config: &ClientConfig, node: &LocalFhevmNode, wallet: &LocalWallet) -> Result<()> {
    let chain_id = node.chain_id();
    info!("🚀 Deploying GlucoseCheck from {}...", wallet.address());
    let (contract, tx_hash) = node.deploy(wallet.address())?;

    let mut deployments = glucose_check::Deployments::load(&config.contract.deployments_file)?;
    deployments.insert(Deployment {
        address: contract,
        chain_id,
        chain_name: Some(config.network.name.to_string()),
    });
    deployments
        .save(&config.contract.deployments_file)
        .with_context(|| format!("Failed to write {}", config.contract.deployments_file.display()))?;

    println!("deploying \"GlucoseCheck\" (tx: {})...: deployed at {}", tx_hash, contract);
    println!("GlucoseCheck contract: {}", contract);
    Ok(())
}

fn build_coordinator(
    config: &ClientConfig,
    address: Option<Address>,
    node: &Arc<LocalFhevmNode>,
    wallet: &Arc<LocalWallet>,
) -> Result<WorkflowCoordinator> {
    let storage = FileStringStorage::open(&config.decryption.storage_file)
        .with_context(|| format!("Failed to open {}", config.decryption.storage_file.display()))?;

    let chain_id = node.chain_id();
    if config.network.chain_id() != chain_id {
        warn!(
            "Configured chain id {} differs from devnet chain id {}; using {}",
            config.network.chain_id(),
            chain_id,
            chain_id
        );
    }

    let coordinator = WorkflowCoordinator::new(config.coordinator_options(), config.deployments()?, Arc::new(storage));
    coordinator.set_contract_override(address.or(config.contract.address));
    coordinator.set_signer(Some(wallet.clone()));
    coordinator.set_instance(Some(node.clone()));
    coordinator.connect_chain(chain_id, node.clone());
    Ok(coordinator)
}

fn require_contract(coordinator: &WorkflowCoordinator, node: &LocalFhevmNode) -> Result<Address> {
    let contract = coordinator
        .session()
        .contract_address
        .ok_or_else(|| anyhow!("{} Run `glucose-check deploy` first.", coordinator.message()))?;
    if !node.is_deployed(contract) {
        bail!("No GlucoseCheck contract code at {}", contract);
    }
    Ok(contract)
}

/// Turn a pipeline outcome into a CLI result
fn finish(what: &str, outcome: PipelineOutcome, coordinator: &WorkflowCoordinator) -> Result<Option<TxHash>> {
    match outcome {
        PipelineOutcome::Completed { tx_hash } => Ok(tx_hash),
        PipelineOutcome::Skipped(SkipReason::AlreadyDecrypted) => Ok(None),
        PipelineOutcome::Skipped(SkipReason::NotReady) if what == "checkRisk" => {
            bail!("No glucose value submitted yet; run `glucose-check submit-glucose --value N` first")
        }
        PipelineOutcome::Skipped(reason) => bail!("{} skipped: {:?}", what, reason),
        PipelineOutcome::Ignored(message) => bail!("{} ignored: {}", what, message),
        PipelineOutcome::Failed(_) => bail!("{}", coordinator.message()),
    }
}

async fn print_tx(node: &LocalFhevmNode, tx_hash: Option<TxHash>) -> Result<()> {
    use glucose_check::GlucoseCheckContract;

    if let Some(tx_hash) = tx_hash {
        let receipt = node.wait_for_receipt(tx_hash).await?;
        println!("tx:{} status={}", tx_hash, receipt.status.as_u8());
    }
    Ok(())
}

async fn watch(coordinator: &WorkflowCoordinator, contract: Address, ticks: Option<u32>) -> Result<()> {
    info!("👀 Watching GlucoseCheck {} (Ctrl+C to stop)", contract);
    let poller = coordinator.start_auto_refresh();
    let mut ticker = tokio::time::interval(poller.interval());
    let mut last = None;
    let mut seen = 0u32;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                // Let the poller's tick land first
                tokio::time::sleep(Duration::from_millis(50)).await;
                let current = (coordinator.glucose_handle(), coordinator.risk_result_handle());
                if last != Some(current) {
                    println!(
                        "glucose={} risk={}",
                        current.0.map(|h| h.to_string()).unwrap_or_else(|| "-".into()),
                        current.1.map(|h| h.to_string()).unwrap_or_else(|| "-".into()),
                    );
                    last = Some(current);
                }
                seen += 1;
                if ticks.is_some_and(|limit| seen >= limit) {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    poller.stop();
    Ok(())
}
