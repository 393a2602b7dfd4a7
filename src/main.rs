//! podvisord - runs the VM lifecycle core until interrupted
//!
//! Startup builds the Firecracker driver, the optional warm pool, and the
//! VM manager. On Ctrl-C every registered VM is released and the pool is
//! drained before exit.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};

use podvisor::metadata::{DirMetadataStore, MetadataStore};
use podvisor::telemetry::{init_tracing, shutdown_tracing};
use podvisor::vm::{
    FirecrackerDriver, HypervisorDriver, VmFactory, VmManager, VmPool, VmRegistry, WarmPool,
};
use podvisor::DaemonConfig;

#[derive(Parser, Debug)]
#[command(name = "podvisord", version, about = "VM lifecycle daemon")]
struct Args {
    /// Path to the TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// OTLP collector endpoint (overrides the config file)
    #[arg(long)]
    otlp_endpoint: Option<String>,

    /// Print Prometheus metrics on shutdown
    #[arg(long)]
    dump_metrics: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => DaemonConfig::from_file(path)?,
        None => DaemonConfig::default(),
    };

    let otlp_endpoint = args
        .otlp_endpoint
        .clone()
        .or_else(|| config.telemetry.otlp_endpoint.clone());
    init_tracing(&config.telemetry.service_name, otlp_endpoint.as_deref())
        .map_err(|e| anyhow::anyhow!(e))
        .context("failed to initialize tracing")?;

    let registry = Arc::new(VmRegistry::new());
    let driver: Arc<dyn HypervisorDriver> =
        Arc::new(FirecrackerDriver::new(config.firecracker.clone()));
    let metadata: Arc<dyn MetadataStore> = Arc::new(
        DirMetadataStore::new(&config.metadata_dir)
            .with_context(|| format!("failed to open {}", config.metadata_dir.display()))?,
    );

    let mut factory = VmFactory::new(Arc::clone(&registry), Arc::clone(&driver), config.images.clone());
    let mut pool = None;
    if config.pool.enabled {
        let warm = Arc::new(WarmPool::new(
            Arc::clone(&driver),
            config.images.clone(),
            config.pool.clone(),
        ));
        warm.initialize().await;
        let replenisher = WarmPool::start_replenisher(Arc::clone(&warm));
        let reuse: Arc<dyn VmPool> = warm.clone();
        factory = factory.with_pool(reuse);
        pool = Some((warm, replenisher));
    }

    let manager = VmManager::new(factory, Arc::clone(&metadata), config.manager_config());

    match metadata.list_vms().await {
        Ok(ids) if !ids.is_empty() => {
            info!(count = ids.len(), "Persisted VMs awaiting pod re-association");
        }
        Ok(_) => {}
        Err(e) => warn!(error = %e, "Failed to list persisted VMs"),
    }

    info!(pool = config.pool.enabled, "podvisord ready");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutting down");

    if let Some((warm, replenisher)) = pool {
        replenisher.abort();
        warm.shutdown().await;
    }

    match manager.release_all_vms().await {
        Ok(code) => info!(code, "Released all VMs"),
        Err(e) => error!(error = %e, remaining = manager.vms().len(), "Failed to release all VMs"),
    }

    if args.dump_metrics {
        print!("{}", podvisor::metrics::encode_metrics());
    }

    shutdown_tracing();
    Ok(())
}
