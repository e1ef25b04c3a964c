//! Runs the blob granule ranges workload with several clients against one
//! shared in-memory blob store.

use std::collections::HashMap;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use blob_granule_ranges::memory::{MemoryBlobStore, MemoryStoreConfig};
use blob_granule_ranges::{BlobGranuleRangesWorkload, WorkloadConfig, WorkloadContext, WorkloadError};
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Stress the blob range API of an in-memory blob store")]
struct Args {
    /// Number of workload clients
    #[arg(long, default_value = "2")]
    clients: u32,
    /// Duration of the timed run, in seconds
    #[arg(long, default_value = "10")]
    duration_secs: f64,
    /// Mean driver operations per second before division by client count
    #[arg(long)]
    ops_per_second: Option<u32>,
    /// Seed for the shared random number and the per-client streams
    #[arg(long)]
    seed: Option<u64>,
    /// Also run RANGES_MISALIGNED and RE_BLOBBIFY
    #[arg(long)]
    enable_buggy_scenarios: bool,
    /// Delay between range-check polls, in seconds
    #[arg(long, default_value = "0.05")]
    poll_interval_secs: f64,
    /// Pause between unit scenarios, in seconds
    #[arg(long, default_value = "0.1")]
    unit_delay_secs: f64,
    /// Give up on a range check after this many seconds
    #[arg(long)]
    check_timeout_secs: Option<f64>,
    /// Time from blobbify until the range is readable, in milliseconds
    #[arg(long, default_value = "20")]
    provision_delay_ms: u64,
    /// Probability that a granule read fails with a retryable error
    #[arg(long, default_value = "0.05")]
    transient_error_rate: f64,
}

impl Args {
    /// Renders the workload settings as harness options.
    fn options(&self) -> HashMap<String, String> {
        let mut options = HashMap::from([
            ("testDuration".to_string(), self.duration_secs.to_string()),
            ("checkPollInterval".to_string(), self.poll_interval_secs.to_string()),
            ("unitDelay".to_string(), self.unit_delay_secs.to_string()),
            (
                "enableKnownBuggyScenarios".to_string(),
                self.enable_buggy_scenarios.to_string(),
            ),
        ]);
        if let Some(ops) = self.ops_per_second {
            options.insert("opsPerSecond".to_string(), ops.to_string());
        }
        if let Some(timeout) = self.check_timeout_secs {
            options.insert("checkTimeout".to_string(), timeout.to_string());
        }
        options
    }
}

fn run(args: &Args) -> Result<(), WorkloadError> {
    let config = WorkloadConfig::from_options(&args.options())?;
    let seed = args.seed.unwrap_or_else(|| rand::rng().random());
    let mut seeds = StdRng::seed_from_u64(seed);

    let store = Arc::new(MemoryBlobStore::open(MemoryStoreConfig {
        provision_delay: Duration::from_millis(args.provision_delay_ms),
        transient_error_rate: args.transient_error_rate,
        seed,
        ..MemoryStoreConfig::default()
    })?);
    info!(seed, clients = args.clients, "simulation starting");

    let workloads = (0..args.clients)
        .map(|client_id| {
            let ctx = WorkloadContext {
                client_id,
                client_count: args.clients,
                shared_random_number: seed,
                seed: seeds.random(),
            };
            BlobGranuleRangesWorkload::new(Arc::clone(&store), ctx, config.clone())
        })
        .collect::<Result<Vec<_>, _>>()?;

    for workload in &workloads {
        workload.setup()?;
    }
    let mut duration = Duration::ZERO;
    for workload in &workloads {
        duration = duration.max(workload.start()?);
    }
    thread::sleep(duration);

    for (client_id, workload) in workloads.iter().enumerate() {
        workload.check()?;
        let metrics: Vec<String> = workload
            .metrics()
            .iter()
            .map(|m| format!("{}={}", m.name, m.value))
            .collect();
        info!(client_id, metrics = %metrics.join(" "), "client passed");
    }

    drop(workloads);
    store.close();
    Ok(())
}

fn main() -> ExitCode {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init();
    let args = Args::parse();

    match run(&args) {
        Ok(()) => {
            info!("simulation passed");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("simulation failed: {e}");
            ExitCode::FAILURE
        }
    }
}
