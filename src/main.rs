//! Telemetry Sidecar Binary

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use telemetry_sidecar::{Config, PartitionPolicy, QueueKind, Result, SidecarCollector};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "telemetry-sidecar", version, about = "Telemetry sidecar pipeline")]
struct Cli {
    /// Directory of the durable queue
    #[arg(long, env = "QUEUE_DIR")]
    queue_dir: Option<PathBuf>,

    /// Number of queue partitions
    #[arg(long, env = "PARTITION_COUNT")]
    partitions: Option<usize>,

    /// Queue storage: memory or file
    #[arg(long)]
    queue_kind: Option<QueueKind>,

    /// Partition routing: round-robin or key-hash
    #[arg(long)]
    policy: Option<PartitionPolicy>,

    /// Listen address of the /metrics endpoint
    #[arg(long)]
    metrics_addr: Option<SocketAddr>,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    initialize_tracing();

    info!("Starting telemetry sidecar v{}", env!("CARGO_PKG_VERSION"));

    let mut config = Config::from_env();
    if let Some(queue_dir) = cli.queue_dir {
        config.queue_dir = queue_dir;
    }
    if let Some(partitions) = cli.partitions {
        config.partition_count = partitions;
    }
    if let Some(kind) = cli.queue_kind {
        config.queue_kind = kind;
    }
    if let Some(policy) = cli.policy {
        config.partition_policy = policy;
    }
    if let Some(addr) = cli.metrics_addr {
        config.metrics_addr = Some(addr);
    }

    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {}", e);
        std::process::exit(1);
    }

    info!(
        "Sidecar configuration - Service: {}, Pod: {}, Namespace: {}, Gateway: {}, Queue: {:?} x{} ({})",
        config.service_name,
        config.pod_name,
        config.namespace,
        config.gateway_url,
        config.queue_kind,
        config.partition_count,
        config.partition_policy
    );

    if cli.check {
        info!("Configuration is valid");
        return Ok(());
    }

    let collector = SidecarCollector::new(config)?;

    if let Err(e) = collector.start().await {
        error!("Sidecar failed: {}", e);
        std::process::exit(1);
    }

    Ok(())
}

/// Initialize structured logging
fn initialize_tracing() {
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(false)
        .with_line_number(false)
        .json();

    let filter_layer = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&log_level))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();
}
