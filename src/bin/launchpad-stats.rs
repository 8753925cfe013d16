use std::{path::PathBuf, process::ExitCode, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use launchpad_core::{
    aggregator::{write_report, AnalyticsReport, PurchaseAggregator, ScanConfig, DEFAULT_CHUNK_SIZE},
    descriptor,
    ledger::{Finality, JsonRpcLedger},
    LaunchpadError,
};
use tracing_subscriber::EnvFilter;

/// Purchase statistics for the sale recorded in a launch descriptor.
#[derive(Parser, Debug)]
#[command(name = "launchpad-stats", version, about)]
struct Opts {
    /// Launch descriptor, e.g. launches/usdc-launch.json.
    descriptor: PathBuf,
    #[arg(long, env = "RPC_URL", hide_env_values = true)]
    rpc_url: String,
    #[arg(long, default_value = "analytics-output.json")]
    out: PathBuf,
    #[arg(long, default_value_t = 0)]
    from_block: u64,
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
    chunk_size: u64,
    /// Use `latest - N` instead of the node's finalized block.
    #[arg(long)]
    confirmations: Option<u64>,
    #[arg(long, default_value_t = 30)]
    request_timeout_secs: u64,
}

async fn run(opts: Opts) -> Result<()> {
    let launch = descriptor::load(&opts.descriptor)?;
    let sale = launch.sale.ok_or_else(|| {
        LaunchpadError::Precondition("no sale address found in launch JSON".into())
    })?;
    let ledger = JsonRpcLedger::new(&opts.rpc_url, Duration::from_secs(opts.request_timeout_secs))?;
    let config = ScanConfig {
        from_block: opts.from_block,
        chunk_size: opts.chunk_size,
        finality: opts
            .confirmations
            .map_or(Finality::Finalized, Finality::Confirmations),
    };

    let stats = PurchaseAggregator::new(ledger, config).compute(sale).await?;
    let report = AnalyticsReport::from_stats(&stats, launch.settlement_decimals);
    println!();
    print!("{}", report.summary(launch.settlement_decimals));
    println!();
    write_report(&opts.out, &report).with_context(|| format!("writing {}", opts.out.display()))?;
    println!("Exported {}", opts.out.display());
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    match run(Opts::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            let code = err
                .chain()
                .find_map(|cause| cause.downcast_ref::<LaunchpadError>())
                .map_or(1, LaunchpadError::exit_code);
            ExitCode::from(code)
        }
    }
}
