use std::{
    fs,
    path::{Path, PathBuf},
    process::ExitCode,
    time::Duration,
};

use alloy_primitives::{Address, Bytes, B256};
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use launchpad_core::{
    aggregator::{write_report, AnalyticsReport, PurchaseAggregator, ScanConfig, DEFAULT_CHUNK_SIZE},
    contracts::DEFAULT_FEE_BPS,
    descriptor::{self, DescriptorCheckpoint},
    ledger::{ConfirmationPolicy, Finality, JsonRpcLedger},
    orchestrator::{DeploymentOrchestrator, FactoryDeployment},
    units::format_units,
    LaunchpadError,
};
use serde_json::Value;
use tracing::info;
use tracing_subscriber::EnvFilter;

//==================== CLI ====================//

/// Create, fund and analyse launchpad token sales.
#[derive(Parser, Debug)]
#[command(name = "launchpad", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Deploy a launchpad factory and record it as the descriptor's factory.
    DeployFactory {
        descriptor: PathBuf,
        /// Artifact JSON or raw hex with the factory creation code.
        #[arg(long)]
        factory_artifact: PathBuf,
        /// Receiver of platform fees; the sender when omitted.
        #[arg(long)]
        treasury: Option<Address>,
        /// Platform fee in basis points.
        #[arg(long, default_value_t = DEFAULT_FEE_BPS)]
        fee_bps: u16,
        #[command(flatten)]
        tx: TxArgs,
    },
    /// Deploy the sale through the factory and record its address.
    Create {
        descriptor: PathBuf,
        /// Hardhat/Foundry artifact JSON or raw hex with the sale creation code.
        #[arg(long)]
        sale_artifact: Option<PathBuf>,
        #[command(flatten)]
        tx: TxArgs,
    },
    /// Transfer the cap of tokens to the created sale.
    Fund {
        descriptor: PathBuf,
        #[command(flatten)]
        tx: TxArgs,
    },
    /// Aggregate purchase events into an analytics report.
    Aggregate {
        descriptor: PathBuf,
        #[command(flatten)]
        scan: ScanArgs,
        #[arg(long, default_value = "analytics-output.json")]
        out: PathBuf,
    },
    /// Show the lifecycle state of a sale.
    Status {
        descriptor: PathBuf,
        #[command(flatten)]
        rpc: RpcArgs,
    },
    /// Record the outcome of a transaction left uncertain by an earlier step.
    Recover {
        descriptor: PathBuf,
        /// Hash of the transaction to reconcile.
        #[arg(long)]
        tx: B256,
        #[command(flatten)]
        args: TxArgs,
    },
}

#[derive(Args, Debug)]
struct RpcArgs {
    /// JSON-RPC endpoint of the ledger node.
    #[arg(long, env = "RPC_URL", hide_env_values = true)]
    rpc_url: String,
    #[arg(long, default_value_t = 30)]
    request_timeout_secs: u64,
}

impl RpcArgs {
    fn ledger(&self) -> Result<JsonRpcLedger, LaunchpadError> {
        JsonRpcLedger::new(&self.rpc_url, Duration::from_secs(self.request_timeout_secs))
    }
}

#[derive(Args, Debug)]
struct TxArgs {
    #[command(flatten)]
    rpc: RpcArgs,
    /// Sender account; the node signs for it.
    #[arg(long, env = "DEPLOYER_ADDRESS")]
    from: Address,
    /// How long to wait for a submitted transaction before reporting it uncertain.
    #[arg(long, default_value_t = 300)]
    confirm_timeout_secs: u64,
    #[arg(long, default_value_t = 2)]
    poll_interval_secs: u64,
}

impl TxArgs {
    fn orchestrator(&self) -> Result<DeploymentOrchestrator<JsonRpcLedger>, LaunchpadError> {
        let confirmation = ConfirmationPolicy {
            timeout: Duration::from_secs(self.confirm_timeout_secs),
            poll_interval: Duration::from_secs(self.poll_interval_secs.max(1)),
        };
        Ok(DeploymentOrchestrator::new(self.rpc.ledger()?, self.from).with_confirmation(confirmation))
    }
}

#[derive(Args, Debug)]
struct ScanArgs {
    #[command(flatten)]
    rpc: RpcArgs,
    /// First block to scan, e.g. the sale's creation block.
    #[arg(long, default_value_t = 0)]
    from_block: u64,
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
    chunk_size: u64,
    /// Use `latest - N` instead of the node's finalized block.
    #[arg(long)]
    confirmations: Option<u64>,
}

impl ScanArgs {
    fn config(&self) -> ScanConfig {
        ScanConfig {
            from_block: self.from_block,
            chunk_size: self.chunk_size,
            finality: self
                .confirmations
                .map_or(Finality::Finalized, Finality::Confirmations),
        }
    }
}

//==================== Contract artifacts ====================//

/// Creation code from a Hardhat artifact (`bytecode`), a Foundry artifact
/// (`bytecode.object`) or a file holding just the hex.
fn load_creation_code(path: &Path) -> Result<Bytes, LaunchpadError> {
    let raw = fs::read_to_string(path).map_err(|err| {
        LaunchpadError::Config(format!("artifact {}: {err}", path.display()))
    })?;
    let raw = raw.trim();
    if !raw.starts_with('{') {
        return parse_creation_code(raw);
    }
    let artifact: Value = serde_json::from_str(raw).map_err(|err| {
        LaunchpadError::Config(format!("artifact {}: {err}", path.display()))
    })?;
    let code = match &artifact["bytecode"] {
        Value::String(code) => Some(code.as_str()),
        Value::Object(object) => object.get("object").and_then(Value::as_str),
        _ => None,
    };
    let code = code.ok_or_else(|| {
        LaunchpadError::Config(format!("artifact {} has no bytecode", path.display()))
    })?;
    parse_creation_code(code)
}

fn parse_creation_code(code: &str) -> Result<Bytes, LaunchpadError> {
    let code = code.trim();
    let digits = code.strip_prefix("0x").unwrap_or(code);
    let bytes = hex::decode(digits)
        .map_err(|err| LaunchpadError::Config(format!("creation code is not hex: {err}")))?;
    if bytes.is_empty() {
        return Err(LaunchpadError::Config("creation code is empty".into()));
    }
    Ok(Bytes::from(bytes))
}

//==================== Commands ====================//

async fn deploy_factory_cmd(
    path: &Path,
    factory_artifact: &Path,
    treasury: Option<Address>,
    fee_bps: u16,
    tx: &TxArgs,
) -> Result<()> {
    info!(descriptor = %path.display(), "deploy-factory");
    let mut checkpoint = DescriptorCheckpoint::acquire(path)?;
    let deployment = FactoryDeployment {
        creation_code: load_creation_code(factory_artifact)?,
        treasury: treasury.unwrap_or(tx.from),
        fee_bps,
    };
    let factory = tx
        .orchestrator()?
        .deploy_factory(&mut checkpoint, &deployment)
        .await?;
    println!("Factory address: {factory}");
    println!("Saved into: {}", path.display());
    Ok(())
}

async fn create_cmd(path: &Path, sale_artifact: Option<&Path>, tx: &TxArgs) -> Result<()> {
    info!(descriptor = %path.display(), "create");
    let mut checkpoint = DescriptorCheckpoint::acquire(path)?;
    let mut orchestrator = tx.orchestrator()?;
    if let Some(artifact) = sale_artifact {
        orchestrator = orchestrator.with_creation_code(load_creation_code(artifact)?);
    }
    let sale = orchestrator.create(&mut checkpoint).await?;
    println!("Sale address: {sale}");
    println!("Saved into: {}", path.display());
    Ok(())
}

async fn fund_cmd(path: &Path, tx: &TxArgs) -> Result<()> {
    info!(descriptor = %path.display(), "fund");
    let mut checkpoint = DescriptorCheckpoint::acquire(path)?;
    let funding_tx = tx.orchestrator()?.fund(&mut checkpoint).await?;
    let descriptor = checkpoint.descriptor();
    println!(
        "Funded sale {} with {} tokens (tx {funding_tx})",
        descriptor.sale.unwrap_or_default(),
        descriptor.cap_tokens_human
    );
    Ok(())
}

async fn aggregate_cmd(path: &Path, scan: &ScanArgs, out: &Path) -> Result<()> {
    let descriptor = descriptor::load(path)?;
    let sale = descriptor.sale.ok_or_else(|| {
        LaunchpadError::Precondition(format!("no sale address in {}; run create first", path.display()))
    })?;
    let aggregator = PurchaseAggregator::new(scan.rpc.ledger()?, scan.config());
    let stats = aggregator.compute(sale).await?;
    let report = AnalyticsReport::from_stats(&stats, descriptor.settlement_decimals);
    print!("{}", report.summary(descriptor.settlement_decimals));
    write_report(out, &report).with_context(|| format!("writing {}", out.display()))?;
    println!("Exported {}", out.display());
    Ok(())
}

async fn status_cmd(path: &Path, rpc: &RpcArgs) -> Result<()> {
    let descriptor = descriptor::load(path)?;
    // status never submits, so no sender is needed
    let orchestrator = DeploymentOrchestrator::new(rpc.ledger()?, Address::ZERO);
    let status = orchestrator
        .status(&descriptor, descriptor::load_pending(path)?)
        .await?;
    let decimals = descriptor.token_decimals;

    println!("Descriptor: {} (revision {})", path.display(), descriptor.revision);
    println!("State: {}", status.state);
    if let Some(factory) = status.factory {
        println!("Factory: {factory}");
    }
    if let Some(sale) = status.sale {
        println!("Sale: {sale}");
    }
    if let Some(tx) = descriptor.creation_tx {
        println!("Creation tx: {tx}");
    }
    if let Some(tx) = descriptor.funding_tx {
        println!("Funding tx: {tx}");
    }
    println!(
        "Funding amount: {} tokens ({} base units)",
        format_units(status.funding_amount_base, decimals),
        status.funding_amount_base
    );
    if let Some(balance) = status.sale_balance_base {
        println!("Sale token balance: {}", format_units(balance, decimals));
    }
    if let Some(pending) = status.pending {
        println!("Unsettled {} transaction: {}", pending.step, pending.tx);
    }
    Ok(())
}

async fn recover_cmd(path: &Path, tx: B256, args: &TxArgs) -> Result<()> {
    info!(descriptor = %path.display(), %tx, "recover");
    let mut checkpoint = DescriptorCheckpoint::acquire(path)?;
    let state = args.orchestrator()?.reconcile(&mut checkpoint, tx).await?;
    println!("Reconciled {tx}: descriptor is now {state}");
    Ok(())
}

//==================== main ====================//

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn exit_code(err: &anyhow::Error) -> u8 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<LaunchpadError>())
        .map_or(1, LaunchpadError::exit_code)
}

async fn run(cli: Cli) -> Result<()> {
    match &cli.command {
        Command::DeployFactory {
            descriptor,
            factory_artifact,
            treasury,
            fee_bps,
            tx,
        } => deploy_factory_cmd(descriptor, factory_artifact, *treasury, *fee_bps, tx).await,
        Command::Create {
            descriptor,
            sale_artifact,
            tx,
        } => create_cmd(descriptor, sale_artifact.as_deref(), tx).await,
        Command::Fund { descriptor, tx } => fund_cmd(descriptor, tx).await,
        Command::Aggregate {
            descriptor,
            scan,
            out,
        } => aggregate_cmd(descriptor, scan, out).await,
        Command::Status { descriptor, rpc } => status_cmd(descriptor, rpc).await,
        Command::Recover {
            descriptor,
            tx,
            args,
        } => recover_cmd(descriptor, *tx, args).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(exit_code(&err))
        }
    }
}
