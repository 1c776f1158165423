//! Log Collector - ships fleet logs to an ingestion sink
//!
//! Watches every endpoint of the directory, streams new batch bytes and posts
//! each line to the sink. Progress is persisted per batch so a restart
//! resumes where the previous process stopped.
//!
//! ## Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! - `LOG_COLLECTOR_SINK_URL`: Sink URL (default: http://logstash:5000/)
//! - `LOG_COLLECTOR_WORKSPACE`: Offset ledger root (default: ./workspace)
//! - `LOG_COLLECTOR_POLL_INTERVAL_SECS`: Delay between ticks (default: 60)
//! - `LOG_COLLECTOR_START_JITTER_SECS`: Max delay before a pod's first tick (default: 30)
//! - `LOG_COLLECTOR_RETRY_BACKOFF_SECS`: Sink retry backoff (default: 5)
//! - `LOG_COLLECTOR_RECONCILE_INTERVAL_SECS`: Directory re-sync period (default: 86400)
//! - `LOG_COLLECTOR_REQUEST_TIMEOUT_SECS`: Discovery/sink request timeout (default: 30)
//! - `LOG_COLLECTOR_STATS_INTERVAL_SECS`: Stats report period (default: 5)
//! - `LOG_COLLECTOR_DIRECTORY_URL`: Network status service
//! - `LOG_COLLECTOR_DIRECTORY_FILE`: Static endpoint list, overrides the URL
//! - `LOG_COLLECTOR_NODE_PORT`: Log service port on nodes (default: 8666)
//! - `LOG_COLLECTOR_START_OFFSET`: Sources honour `&start=N` (default: true)
//! - `LOG_COLLECTOR_SKIP_HISTORY`: Skip existing backlog on first contact (default: false)
//! - `RUST_LOG`: Logging level filter (default: info)

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use log_collector::client::SinkClient;
use log_collector::config::Config;
use log_collector::directory::{EndpointDirectory, StaticDirectory, StatusDirectory};
use log_collector::stats::run_reporter;
use log_collector::supervisor::FleetSupervisor;

/// Grace period for the stats reporter after shutdown was requested
const REPORTER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() {
    // Initialize tracing subscriber with environment filter
    init_tracing();

    info!("Starting Log Collector service...");

    let config = match Config::from_env() {
        Ok(config) => {
            info!(
                sink_url = %config.sink_url,
                workspace = %config.workspace_path.display(),
                poll_interval_secs = config.poll_interval.as_secs(),
                retry_backoff_secs = config.retry_backoff.as_secs(),
                start_offset_supported = config.start_offset_supported,
                skip_history = config.skip_history,
                "Configuration loaded"
            );
            config
        }
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    let sink = match SinkClient::new(&config) {
        Ok(client) => {
            info!(sink_url = %client.sink_url(), "Sink client initialized");
            Arc::new(client)
        }
        Err(e) => {
            error!(error = %e, "Failed to create sink client");
            std::process::exit(1);
        }
    };

    let directory: Arc<dyn EndpointDirectory> = match &config.directory_file {
        Some(path) => {
            info!(path = %path.display(), "Using static endpoint list");
            Arc::new(StaticDirectory::from_file(path))
        }
        None => match StatusDirectory::new(
            config.directory_url.clone(),
            config.node_port,
            config.request_timeout,
        ) {
            Ok(directory) => {
                info!(url = %directory.url(), "Using network status directory");
                Arc::new(directory)
            }
            Err(e) => {
                error!(error = %e, "Failed to create directory client");
                std::process::exit(1);
            }
        },
    };

    let stats_interval = config.stats_interval;
    let supervisor = match FleetSupervisor::new(config, directory, sink) {
        Ok(supervisor) => supervisor,
        Err(e) => {
            error!(error = %e, "Failed to create fleet supervisor");
            std::process::exit(1);
        }
    };

    if let Err(e) = supervisor.start().await {
        error!(error = %e, "Could not determine the endpoints to collect, exiting");
        std::process::exit(1);
    }

    let reporter_cancel = CancellationToken::new();
    let reporter_handle = tokio::spawn(run_reporter(
        supervisor.clone(),
        stats_interval,
        reporter_cancel.clone(),
    ));

    info!("Log Collector running. Press Ctrl+C to stop.");
    shutdown_signal().await;

    info!("Initiating graceful shutdown...");
    reporter_cancel.cancel();
    supervisor.stop().await;

    match tokio::time::timeout(REPORTER_SHUTDOWN_TIMEOUT, reporter_handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "Stats reporter panicked during shutdown"),
        Err(_) => warn!("Stats reporter shutdown timed out"),
    }

    info!("Log Collector stopped");
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();
}

/// Resolve on Ctrl+C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Ctrl+C received, stopping..."),
        _ = terminate => info!("SIGTERM received, stopping..."),
    }
}
