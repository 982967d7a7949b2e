//! Drainer service entry point.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use sluice_drainer::checkpoint::{CheckPoint, FileCheckpoint, SqliteCheckpoint};
use sluice_drainer::sync::{FileSyncer, LoaderSyncer, PrintSyncer, Syncer};
use sluice_drainer::{DestinationType, Drainer, DrainerConfig, DrainerError};
use sluice_loader::{LoaderConfig, SqliteExecutor};
use sluice_registry::{MemKvStore, NodeRegistry};

#[derive(Parser)]
#[command(name = "sluice-drainer")]
#[command(about = "Read-side replay service of the sluice pipeline", version)]
struct Cli {
    /// Path to a TOML config file; flags override its values.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Log level (error, warn, info, debug, trace).
    #[arg(long, default_value = "info")]
    log: String,
    /// Advertised address, host:port.
    #[arg(long)]
    addr: Option<String>,
    /// Directory for checkpoint and sink state.
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// Consensus KV endpoints (repeatable). Empty runs standalone.
    #[arg(long = "kv-endpoint")]
    kv_endpoints: Vec<String>,
    /// Cluster whose binlog is replayed.
    #[arg(long)]
    cluster_id: Option<u64>,
    /// Parallel loader workers.
    #[arg(long)]
    worker_count: Option<usize>,
    /// Transactions per downstream commit.
    #[arg(long)]
    batch_size: Option<usize>,
    /// Replay starts here when no checkpoint exists.
    #[arg(long)]
    initial_commit_ts: Option<i64>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cli.log))
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "drainer exited with error");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut cfg = match &cli.config {
        Some(path) => DrainerConfig::from_file(path)?,
        None => DrainerConfig::default(),
    };
    if let Some(addr) = cli.addr {
        cfg.listen_addr = addr;
    }
    if let Some(dir) = cli.data_dir {
        cfg.data_dir = dir;
    }
    if !cli.kv_endpoints.is_empty() {
        cfg.kv_endpoints = cli.kv_endpoints;
    }
    if let Some(id) = cli.cluster_id {
        cfg.cluster_id = id;
    }
    if let Some(n) = cli.worker_count {
        cfg.worker_count = n;
    }
    if let Some(n) = cli.batch_size {
        cfg.batch_size = n;
    }
    if let Some(ts) = cli.initial_commit_ts {
        cfg.initial_commit_ts = ts;
    }
    cfg.validate()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(serve(cfg))
}

fn build_syncer(cfg: &DrainerConfig) -> Result<Box<dyn Syncer>, DrainerError> {
    let loader_cfg = LoaderConfig {
        worker_count: cfg.worker_count,
        batch_size: cfg.batch_size,
        disable_dispatch: cfg.disable_dispatch,
        ..LoaderConfig::default()
    };
    match &cfg.dest {
        DestinationType::File { dir } => Ok(Box::new(FileSyncer::new(dir.clone())?)),
        DestinationType::Sqlite { path } => {
            let executor = SqliteExecutor::open(path)
                .map_err(|e| DrainerError::Config(e.to_string()))?;
            Ok(Box::new(LoaderSyncer::new(Arc::new(executor), loader_cfg)))
        }
        DestinationType::Kafka { brokers, topic } => {
            #[cfg(feature = "kafka")]
            {
                Ok(Box::new(sluice_drainer::sync::KafkaSyncer::new(
                    brokers,
                    topic.clone(),
                )?))
            }
            #[cfg(not(feature = "kafka"))]
            {
                let _ = (brokers, topic);
                Err(DrainerError::Config(
                    "kafka destination requires the `kafka` feature".into(),
                ))
            }
        }
        DestinationType::Print => Ok(Box::new(PrintSyncer::new())),
    }
}

async fn serve(cfg: DrainerConfig) -> Result<(), Box<dyn std::error::Error>> {
    if !cfg.kv_endpoints.is_empty() {
        tracing::warn!(
            endpoints = ?cfg.kv_endpoints,
            "external KV endpoints configured but no adapter is linked; running standalone"
        );
    }
    std::fs::create_dir_all(&cfg.data_dir)?;

    let kv = Arc::new(MemKvStore::new());
    let registry = Arc::new(NodeRegistry::new(kv, std::time::Duration::from_secs(10)));

    // SQL destinations store their progress next to the data; everything
    // else uses the atomic checkpoint file.
    let checkpoint: Arc<dyn CheckPoint> = match &cfg.dest {
        DestinationType::Sqlite { path } => Arc::new(SqliteCheckpoint::open(
            path,
            "sluice_checkpoint",
            cfg.cluster_id.to_string(),
        )?),
        _ => Arc::new(FileCheckpoint::new(cfg.checkpoint_path())),
    };

    let syncer = build_syncer(&cfg)?;
    let drainer = Drainer::new(cfg, registry, checkpoint, syncer, Vec::new())?;
    let token = drainer.token();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
            token.cancel();
        }
    });

    drainer.run().await?;
    Ok(())
}
