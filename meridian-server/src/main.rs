use anyhow::Result;
use clap::Parser;
use meridian_cluster::{ClusterConfig, Node};
use std::path::Path;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug, Clone)]
#[command(name = "meridian-server")]
#[command(about = "Meridian distributed search node")]
#[command(version)]
struct Args {
    /// Configuration file path (env: MERIDIAN_CONFIG_PATH)
    #[arg(short, long, default_value = "meridian.toml", env = "MERIDIAN_CONFIG_PATH")]
    config: String,

    /// Transport bind address - overrides config (env: MERIDIAN_BIND_ADDR)
    #[arg(long, env = "MERIDIAN_BIND_ADDR")]
    bind_addr: Option<String>,

    /// Data directory path - overrides config (env: MERIDIAN_DATA_DIR)
    #[arg(long, env = "MERIDIAN_DATA_DIR")]
    data_dir: Option<String>,

    /// Comma-separated seed addresses - overrides config (env: MERIDIAN_SEEDS)
    #[arg(long, env = "MERIDIAN_SEEDS")]
    seeds: Option<String>,

    /// Log format: text or json (env: LOG_FORMAT)
    #[arg(long, default_value = "text", env = "LOG_FORMAT")]
    log_format: String,

    /// Disable the Prometheus metrics recorder
    #[arg(long)]
    no_metrics: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Log level: RUST_LOG wins, info otherwise.
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let env_filter = tracing_subscriber::EnvFilter::new(&log_level);
    let registry = tracing_subscriber::registry().with(env_filter);
    if args.log_format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    if !args.no_metrics {
        let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
        builder
            .install_recorder()
            .expect("Failed to install Prometheus metrics recorder");
        tracing::info!("Prometheus metrics recorder installed");
    }

    let config_path = Path::new(&args.config);
    let mut config = if config_path.exists() {
        ClusterConfig::load(config_path).map_err(|e| anyhow::anyhow!(e.to_string()))?
    } else {
        tracing::info!(path = %args.config, "no config file, using defaults");
        ClusterConfig::default()
    };
    if let Some(bind_addr) = args.bind_addr {
        config.bind_addr = bind_addr;
    }
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir.into();
    }
    if let Some(seeds) = args.seeds {
        config.seed_addresses = seeds
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }

    tracing::info!(
        cluster = %config.cluster_name,
        bind = %config.bind_addr,
        data_dir = %config.data_dir.display(),
        "starting meridian node"
    );

    let node = Node::start(config)
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;
    tracing::info!(
        node_id = %node.node_id(),
        address = %node.address(),
        "node is up"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    node.stop();
    Ok(())
}
