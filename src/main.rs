use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use drover::config::ServerConfig;
use drover::server::Server;
use drover::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "drover")]
#[command(about = "A cluster scheduling core with a leader-elected evaluation pipeline")]
struct Args {
    /// Unique name for this server
    #[arg(long, default_value = "drover-1")]
    node_name: String,

    /// Region this server participates in
    #[arg(long, default_value = "global")]
    region: String,

    /// Address advertised to peers (host:port)
    #[arg(long, default_value = "127.0.0.1:4647")]
    advertise: String,

    /// Run a single in-memory bootstrap node
    #[arg(long)]
    dev: bool,

    /// Allow this node to self-elect into a new cluster
    #[arg(long)]
    bootstrap: bool,

    /// Directory for durable raft state
    #[arg(long, default_value = "/var/lib/drover")]
    data_dir: PathBuf,

    /// Number of scheduling workers
    #[arg(long, default_value = "4")]
    workers: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = ServerConfig {
        node_name: args.node_name,
        region: args.region,
        advertise_addr: args.advertise,
        bootstrap: args.bootstrap || args.dev,
        dev_mode: args.dev,
        data_dir: args.data_dir,
        num_workers: args.workers,
        ..Default::default()
    };

    tracing::info!(
        node_name = %config.node_name,
        region = %config.region,
        dev = config.dev_mode,
        workers = config.num_workers,
        "Starting drover server"
    );

    let shutdown = install_shutdown_handler();
    let (server, _raft, _membership) = Server::standalone(config, shutdown.clone())?;

    shutdown.cancelled().await;
    server.shutdown().await;

    Ok(())
}
