//! gpufleet daemon
//!
//! Main daemon process: loads configuration, builds the store, spot
//! providers, executor and scheduler, runs the background loops and serves
//! the REST API until interrupted.

use anyhow::Context;
use clap::Parser;
use gpufleet_api::create_router;
use gpufleet_core::{DaemonConfig, ExecutorKind, LoggingConfig};
use gpufleet_scheduler::{Executor, ManualExecutor, Scheduler, SimulatedExecutor};
use gpufleet_spot::{ProviderRegistry, SpotProvisioner};
use gpufleet_store::{GpuLocks, MemoryStore, Store};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// gpufleet daemon - multi-tenant GPU job scheduler
#[derive(Parser, Debug)]
#[command(name = "gpufleetd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to bind the API server
    #[arg(long)]
    address: Option<String>,

    /// Port for the REST API server
    #[arg(long)]
    port: Option<u16>,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,
}

fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},tower_http=warn", config.level)));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    if config.format.eq_ignore_ascii_case("json") {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(args: &Args) -> anyhow::Result<DaemonConfig> {
    let mut config = match &args.config {
        Some(path) => DaemonConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => DaemonConfig::default(),
    };
    if let Some(address) = &args.address {
        config.api.address = address.clone();
    }
    if let Some(port) = args.port {
        config.api.port = port;
    }
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    init_logging(&config.logging);

    info!("Starting gpufleet daemon v{}", env!("CARGO_PKG_VERSION"));

    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let locks = Arc::new(GpuLocks::new());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Executor; the simulated one reports completions on a channel
    let (executor, completions) = match config.scheduler.executor.kind {
        ExecutorKind::Simulated => {
            let run_time = Duration::from_secs(config.scheduler.executor.run_secs);
            let (executor, rx) = SimulatedExecutor::new(run_time);
            (Arc::new(executor) as Arc<dyn Executor>, Some(rx))
        }
        ExecutorKind::Manual => (Arc::new(ManualExecutor::new()) as Arc<dyn Executor>, None),
    };

    let mut scheduler = Scheduler::new(store.clone(), locks.clone(), executor, &config);

    let spot = if config.spot.enabled {
        let providers = ProviderRegistry::from_config(&config.spot.providers)
            .context("building spot providers")?;
        if providers.is_empty() {
            warn!("Spot fallback enabled but no providers configured");
        }
        info!(
            providers = providers.len(),
            max_instances = config.spot.max_spot_instances,
            "Spot fallback enabled"
        );
        let spot = Arc::new(SpotProvisioner::new(
            store.clone(),
            locks.clone(),
            providers,
            config.spot.clone(),
        ));
        scheduler = scheduler.with_spot(spot.clone());
        Some(spot)
    } else {
        None
    };
    let scheduler = Arc::new(scheduler);

    for org in &config.organizations {
        let name = org.name.as_deref().unwrap_or(&org.id);
        scheduler
            .register_organization(&org.id, name)
            .await
            .with_context(|| format!("registering organization {}", org.id))?;
    }
    for gpu in &config.gpus {
        scheduler
            .register_gpu(gpu.clone())
            .await
            .with_context(|| {
                format!("registering GPU {} for {}", gpu.name, gpu.organization_id)
            })?;
    }

    // Background tasks
    let mut handles = Vec::new();
    {
        let scheduler = scheduler.clone();
        let shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move { scheduler.run(shutdown).await }));
    }
    if let Some(rx) = completions {
        let scheduler = scheduler.clone();
        let shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            scheduler.run_completions(rx, shutdown).await
        }));
    }
    if let Some(spot) = spot {
        let interval = config.spot.watch_interval();
        let shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            spot.run_watch(interval, shutdown).await
        }));
    }

    let router = create_router(scheduler);
    let addr: SocketAddr = format!("{}:{}", config.api.address, config.api.port)
        .parse()
        .context("invalid API address")?;

    info!(%addr, "API server listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for ctrl-c");
            }
            info!("Shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await
        .context("API server error")?;

    for handle in handles {
        let _ = handle.await;
    }
    info!("gpufleet daemon stopped");
    Ok(())
}
