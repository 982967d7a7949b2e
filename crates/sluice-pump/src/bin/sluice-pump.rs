//! Pump service entry point.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use sluice_pump::{ClockOracle, PumpConfig, Server};
use sluice_registry::{MemKvStore, NodeRegistry};

#[derive(Parser)]
#[command(name = "sluice-pump")]
#[command(about = "Write-side binlog service of the sluice pipeline", version)]
struct Cli {
    /// Path to a TOML config file; flags override its values.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Log level (error, warn, info, debug, trace).
    #[arg(long, default_value = "info")]
    log: String,
    /// gRPC listen address, host:port.
    #[arg(long)]
    addr: Option<String>,
    /// Root directory for binlog data.
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// Stable node identifier.
    #[arg(long)]
    node_id: Option<String>,
    /// Consensus KV endpoints (repeatable). Empty runs standalone.
    #[arg(long = "kv-endpoint")]
    kv_endpoints: Vec<String>,
    /// Binlog retention in days; 0 disables GC.
    #[arg(long)]
    gc_days: Option<u64>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cli.log))
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "pump exited with error");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut cfg = match &cli.config {
        Some(path) => PumpConfig::from_file(path)?,
        None => PumpConfig::default(),
    };
    if let Some(addr) = cli.addr {
        cfg.listen_addr = addr;
    }
    if let Some(dir) = cli.data_dir {
        cfg.data_dir = dir;
    }
    if let Some(node_id) = cli.node_id {
        cfg.node_id = node_id;
    }
    if !cli.kv_endpoints.is_empty() {
        cfg.kv_endpoints = cli.kv_endpoints;
    }
    if let Some(days) = cli.gc_days {
        cfg.gc_days = days;
    }
    if cfg.node_id.is_empty() {
        cfg.node_id = format!("pump-{}", cfg.listen_addr.replace(':', "-"));
    }
    cfg.validate()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(serve(cfg))
}

async fn serve(cfg: PumpConfig) -> Result<(), Box<dyn std::error::Error>> {
    // The consensus KV client is an external collaborator; without
    // endpoints the pump runs standalone on the in-process store.
    if !cfg.kv_endpoints.is_empty() {
        tracing::warn!(
            endpoints = ?cfg.kv_endpoints,
            "external KV endpoints configured but no adapter is linked; running standalone"
        );
    }
    let kv = Arc::new(MemKvStore::new());
    let registry = Arc::new(NodeRegistry::new(kv, std::time::Duration::from_secs(10)));

    let listener = tokio::net::TcpListener::bind(&cfg.listen_addr).await?;
    let server = Arc::new(Server::new(cfg, Arc::new(ClockOracle::new()), Some(registry))?);

    let shutdown = Arc::clone(&server);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
            shutdown.shutdown();
        }
    });

    server.run(listener).await?;
    Ok(())
}
