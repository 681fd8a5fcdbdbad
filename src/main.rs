//! # volpop
//!
//! Entry point of the volume populator controller.
//!
//! ## Startup
//!
//! 1. **Configuration** - file, then `VOLPOP_*` environment, then flags
//! 2. **Cluster client** - default kubeconfig or in-cluster credentials
//! 3. **Reconciler** - cluster store and event recorder behind the reconciler
//! 4. **Populator loop** - cluster watches feeding the work queue
//!
//! ## Shutdown
//!
//! Ctrl+C stops the loop; in-flight passes finish before the process exits.

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::panic)]
#![deny(clippy::expect_used)]

mod cli;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use volpop_core::PopulatorConfig;
use volpop_reconciler::shadow::shadow_claim_name;
use volpop_reconciler::{
    KubeRecorder, KubeStore, LoopConfig, PopulatorLoop, ReconcilerBuilder, ReconcilerConfig,
    cluster_changes,
};

use crate::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            namespace,
            max_concurrent,
            log_level,
        } => {
            init_tracing(log_level.as_deref());
            let config = load_config(config.as_deref(), namespace, max_concurrent)?;
            run(config).await
        }
        Commands::ShadowName { uid, prefix } => {
            println!("{}", shadow_claim_name(&prefix, &uid));
            Ok(())
        }
        Commands::CheckConfig { config } => {
            let config = load_config(Some(config.as_path()), None, None)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&config).context("Failed to render configuration")?
            );
            Ok(())
        }
    }
}

/// Initialize tracing subscriber with environment filter.
fn init_tracing(level: Option<&str>) {
    let filter = level
        .map(EnvFilter::new)
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Resolve the configuration: file, then environment, then flags.
fn load_config(
    path: Option<&Path>,
    namespace: Option<String>,
    max_concurrent: Option<usize>,
) -> Result<PopulatorConfig> {
    let config = match path {
        Some(path) => PopulatorConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => PopulatorConfig::default(),
    };
    let mut config = config
        .with_env()
        .context("Invalid VOLPOP_* environment override")?;

    if let Some(namespace) = namespace {
        config = config.namespace(namespace);
    }
    if let Some(max) = max_concurrent {
        config = config.max_concurrent(max);
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

async fn run(config: PopulatorConfig) -> Result<()> {
    info!(
        controller = %config.controller_name,
        namespace = config.namespace.as_deref().unwrap_or("*"),
        max_concurrent = config.max_concurrent_reconciles,
        "volpop starting"
    );

    let client = kube::Client::try_default()
        .await
        .context("Failed to create Kubernetes client. Check kubeconfig or in-cluster credentials")?;

    let store = Arc::new(KubeStore::new(client.clone()));
    let recorder = Arc::new(KubeRecorder::new(client.clone(), config.controller_name.clone()));
    let reconciler = ReconcilerBuilder::new()
        .with_store(store.clone())
        .with_recorder(recorder)
        .with_config(ReconcilerConfig::from(&config))
        .build()
        .context("Failed to build reconciler")?;

    let changes = cluster_changes(client, store.claim_index(), config.namespace.as_deref());
    let populator = PopulatorLoop::new(Arc::new(reconciler), LoopConfig::from(&config));

    let stopper = populator.stopper();
    tokio::spawn(async move {
        wait_for_shutdown().await;
        stopper.stop();
    });

    let stats = populator
        .run(changes)
        .await
        .context("Populator loop failed")?;

    info!(
        events = stats.events,
        reconciled = stats.reconciled,
        progressed = stats.progressed,
        failed = stats.failed,
        "volpop stopped gracefully"
    );
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C).
async fn wait_for_shutdown() {
    match signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, initiating graceful shutdown"),
        Err(err) => error!("Failed to listen for shutdown signal: {}", err),
    }
}
