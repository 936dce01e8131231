//! Collector process entrypoint. Wires config, classifier, store, and the remote-write
//! HTTP surface together, the way node-forwarder/src/main.rs wires its spool + mqtt +
//! http modules.

use clap::Parser;
use cost_telemetry_agent::classify::Classifier;
use cost_telemetry_agent::clock::Clock;
use cost_telemetry_agent::collector::{router, run_drain, CollectorState};
use cost_telemetry_agent::config::Config;
use cost_telemetry_agent::diagnostics::Health;
use cost_telemetry_agent::store::Store;
use cost_telemetry_agent::tracker::Tracker;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Kubernetes cost-telemetry agent: Collector")]
struct Args {
    /// Path to a TOML config file. May be repeated; later files override earlier ones.
    #[arg(long = "config", value_name = "FILE")]
    config: Vec<PathBuf>,
}

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

    if config.logging.capture {
        std::panic::set_hook(Box::new(|info| {
            tracing::error!(%info, "panic captured");
        }));
    }

    let config = Arc::new(config);
    let clock = Arc::new(Clock::new());

    let tracker = match Tracker::open(&config.storage_path.join("tracker.db")) {
        Ok(t) => Arc::new(t),
        Err(err) => {
            tracing::error!(%err, "failed to open tracker");
            return std::process::ExitCode::from(1);
        }
    };

    let shipper_id = hostname_or_default();

    let store = match Store::new(
        config.storage_path.clone(),
        Arc::clone(&clock),
        Arc::clone(&tracker),
        shipper_id,
        config.max_records,
        config.compression_level,
    ) {
        Ok(s) => Arc::new(s),
        Err(err) => {
            tracing::error!(%err, "failed to open artifact store");
            return std::process::ExitCode::from(1);
        }
    };

    if let Err(err) = store.clean_tmp_files() {
        tracing::warn!(%err, "failed to clean leftover temp files at startup");
    }

    let classifier = Arc::new(Classifier::new(config.filters.clone()));
    let health = Arc::new(Health::new(Arc::clone(&store)));

    let state = Arc::new(CollectorState {
        store: Arc::clone(&store),
        classifier,
        health: Arc::clone(&health),
        max_records: config.max_records,
        reconnect_frequency: config.server.reconnect_frequency,
    });

    let listener = match tokio::net::TcpListener::bind(("0.0.0.0", config.server.port)).await {
        Ok(l) => l,
        Err(err) => {
            tracing::error!(%err, "failed to bind collector listener");
            return std::process::ExitCode::from(1);
        }
    };

    tracing::info!(port = config.server.port, "collector listening");

    let storage_path = config.storage_path.clone();
    let serve_state = Arc::clone(&state);
    let server = tokio::spawn(async move { axum::serve(listener, router(serve_state)).await });

    let cost_batcher = spawn_interval_batcher(Arc::clone(&store), cost_telemetry_agent::classify::StreamClass::Cost, config.cost_max_interval);
    let observability_batcher = spawn_interval_batcher(Arc::clone(&store), cost_telemetry_agent::classify::StreamClass::Observability, config.observability_max_interval);

    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(s) => s,
        Err(err) => {
            tracing::error!(%err, "failed to install SIGTERM handler");
            return std::process::ExitCode::from(2);
        }
    };

    tokio::select! {
        res = server => {
            if let Err(err) = res {
                tracing::error!(%err, "http server task failed");
                return std::process::ExitCode::from(2);
            }
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, draining");
            cost_batcher.abort();
            observability_batcher.abort();
            if let Err(err) = run_drain(state, std::time::Duration::from_secs(10), &storage_path).await {
                tracing::error!(%err, "drain failed");
                return std::process::ExitCode::from(2);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT, draining");
            cost_batcher.abort();
            observability_batcher.abort();
            if let Err(err) = run_drain(state, std::time::Duration::from_secs(10), &storage_path).await {
                tracing::error!(%err, "drain failed");
                return std::process::ExitCode::from(2);
            }
        }
    }

    std::process::ExitCode::SUCCESS
}

fn hostname_or_default() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "collector".to_string())
}

/// Periodically seal `class`'s Active artifact once it has been open for
/// `max_interval`, independent of the row-count trigger handled inline in `Put`.
fn spawn_interval_batcher(store: Arc<Store>, class: cost_telemetry_agent::classify::StreamClass, max_interval: std::time::Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(max_interval.min(std::time::Duration::from_secs(5)));
        loop {
            ticker.tick().await;
            if let Err(err) = store.seal_if_due(class, max_interval) {
                tracing::warn!(%err, class = class.as_str(), "interval seal failed");
            }
        }
    })
}
