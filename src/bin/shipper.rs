//! Shipper process entrypoint. Acquires the singleton lock, reconciles the tracker
//! against on-disk state, and runs the discover/upload and housekeeper loops until
//! the Collector's shutdown marker appears and the final drain completes.

use clap::Parser;
use cost_telemetry_agent::clock::Clock;
use cost_telemetry_agent::config::Config;
use cost_telemetry_agent::lock::SingletonLock;
use cost_telemetry_agent::shipper::Shipper;
use cost_telemetry_agent::store::Store;
use cost_telemetry_agent::tracker::Tracker;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Kubernetes cost-telemetry agent: Shipper")]
struct Args {
    /// Path to a TOML config file. May be repeated; later files override earlier ones.
    #[arg(long = "config", value_name = "FILE")]
    config: Vec<PathBuf>,
}

const WORKER_POOL_SIZE: usize = 4;

fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(c) => c,
        Err(err) => {
            eprintln!("config error: {err}");
            return std::process::ExitCode::from(1);
        }
    };
    init_tracing(&config.logging.level);
    let config = Arc::new(config);

    let shipper_id = std::env::var("HOSTNAME").unwrap_or_else(|_| "shipper".to_string());

    let lock = match SingletonLock::try_acquire(&config.storage_path) {
        Ok(Some(l)) => l,
        Ok(None) => {
            tracing::info!("another shipper process holds the singleton lock, exiting");
            return std::process::ExitCode::SUCCESS;
        }
        Err(err) => {
            tracing::error!(%err, "failed to acquire singleton lock");
            return std::process::ExitCode::from(1);
        }
    };

    let tracker = match Tracker::open(&config.storage_path.join("tracker.db")) {
        Ok(t) => Arc::new(t),
        Err(err) => {
            tracing::error!(%err, "failed to open tracker");
            return std::process::ExitCode::from(1);
        }
    };

    let store = match Store::new(
        config.storage_path.clone(),
        Arc::new(Clock::new()),
        Arc::clone(&tracker),
        shipper_id.clone(),
        config.max_records,
        config.compression_level,
    ) {
        Ok(s) => Arc::new(s),
        Err(err) => {
            tracing::error!(%err, "failed to open artifact store");
            return std::process::ExitCode::from(1);
        }
    };

    if let Err(err) = store.reconcile_tracker() {
        tracing::error!(%err, "startup tracker reconciliation failed");
        return std::process::ExitCode::from(1);
    }

    let shipper = match Shipper::new(Arc::clone(&config), Arc::clone(&store), Arc::clone(&tracker), shipper_id) {
        Ok(s) => Arc::new(s),
        Err(err) => {
            tracing::error!(%err, "failed to initialize shipper");
            return std::process::ExitCode::from(1);
        }
    };

    let refresh_interval = Duration::from_secs(30);
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel();
    let refresh_handle = tokio::spawn(run_refresh(lock, refresh_interval, stop_rx));

    let rotate_interval = config.cloudzero.rotate_interval;
    let shutdown_marker = config.storage_path.join("collector-shutdown-complete");

    loop {
        if let Err(err) = shipper.run_once(WORKER_POOL_SIZE).await {
            tracing::warn!(%err, "ship pass failed");
        }
        if let Err(err) = shipper.run_housekeeper() {
            tracing::warn!(%err, "housekeeper pass failed");
        }

        if shutdown_marker.exists() {
            let remaining = shipper.discover_new().unwrap_or_default();
            if remaining.is_empty() {
                tracing::info!("collector drained and all artifacts shipped, exiting");
                break;
            }
        }

        tokio::time::sleep(rotate_interval.min(Duration::from_secs(30))).await;
    }

    let _ = stop_tx.send(());
    let _ = refresh_handle.await;
    std::process::ExitCode::SUCCESS
}

async fn run_refresh(lock: SingletonLock, interval: Duration, stop: tokio::sync::oneshot::Receiver<()>) {
    lock.run_refresh_loop(interval, stop).await;
}
