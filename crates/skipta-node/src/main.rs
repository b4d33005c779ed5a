use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;

use skipta_consensus::LocalLog;
use skipta_ctrl::CtrlClerk;
use skipta_server::{serve_client, serve_peer, GrpcTransport, NodeConfig, ShardNode};

#[derive(clap::Parser, Debug)]
#[command(name = "skipta-node", about = "Skipta sharded KV replica-group node")]
struct Cli {
    /// Replica group this node belongs to.
    #[arg(long)]
    gid: u64,
    #[arg(long, default_value = "0.0.0.0:17000")]
    client_addr: String,
    #[arg(long, default_value = "0.0.0.0:17001")]
    peer_addr: String,
    /// Shard controller endpoints, repeatable.
    #[arg(long = "ctrl")]
    ctrl: Vec<String>,
    #[arg(long)]
    config: Option<std::path::PathBuf>,
    #[arg(long, default_value = "/var/lib/skipta")]
    data_dir: std::path::PathBuf,
}

#[derive(Debug, Deserialize)]
struct ServerConfig {
    request_timeout_ms: u64,
    snapshot_threshold: u64,
}

#[derive(Debug, Deserialize)]
struct ShardsConfig {
    poll_interval_ms: u64,
    migration_interval_ms: u64,
    gc_interval_ms: u64,
}

#[derive(Debug, Deserialize)]
struct ObservabilityConfig {
    log_level: String,
    log_format: String,
}

#[derive(Debug, Deserialize)]
struct Config {
    server: ServerConfig,
    shards: ShardsConfig,
    observability: ObservabilityConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use clap::Parser;
    let cli = Cli::parse();

    let mut figment = Figment::new()
        .merge(Toml::string(include_str!("../../../config/default.toml")));

    if let Some(ref config_path) = cli.config {
        figment = figment.merge(Toml::file_exact(config_path));
    }

    let config: Config = figment
        .merge(Env::prefixed("SKIPTA_").split("__"))
        .extract()
        .context("failed to load configuration")?;

    match config.observability.log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(&config.observability.log_level)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .pretty()
                .with_env_filter(&config.observability.log_level)
                .init();
        }
    }

    tracing::info!(
        gid = cli.gid,
        client_addr = %cli.client_addr,
        peer_addr = %cli.peer_addr,
        data_dir = %cli.data_dir.display(),
        "node starting"
    );

    let client_addr: SocketAddr = cli
        .client_addr
        .parse()
        .with_context(|| format!("invalid client_addr: {}", cli.client_addr))?;
    let peer_addr: SocketAddr = cli
        .peer_addr
        .parse()
        .with_context(|| format!("invalid peer_addr: {}", cli.peer_addr))?;

    let mut node_config = NodeConfig::new(cli.gid);
    node_config.request_timeout = Duration::from_millis(config.server.request_timeout_ms);
    node_config.snapshot_threshold = config.server.snapshot_threshold;
    node_config.poll_interval = Duration::from_millis(config.shards.poll_interval_ms);
    node_config.migration_interval = Duration::from_millis(config.shards.migration_interval_ms);
    node_config.gc_interval = Duration::from_millis(config.shards.gc_interval_ms);

    let (log, decisions) =
        LocalLog::open(cli.data_dir.clone()).context("failed to open consensus log")?;

    let clerk = CtrlClerk::connect(&cli.ctrl).context("failed to set up controller clerk")?;
    let node = ShardNode::new(node_config, log);
    node.spawn(decisions, Arc::new(clerk), Arc::new(GrpcTransport::new()));

    tokio::try_join!(
        serve_client(client_addr, node.clone()),
        serve_peer(peer_addr, node.clone()),
    )?;

    Ok(())
}
