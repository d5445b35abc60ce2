// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Forkwatch Node
//!
//! Entry point for the `forkwatch-node` binary. Parses CLI arguments,
//! initializes logging and metrics, activates the configured chains, and
//! runs the fork monitor and fork cleaner until shutdown.
//!
//! The binary supports three subcommands:
//!
//! - `run`     — start the node
//! - `init`    — write a default configuration file
//! - `version` — print build version information

mod cli;
mod config;
mod gate;
mod logging;
mod metrics;
mod simulator;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio::sync::watch;

use forkwatch_protocol::context::ContextManager;
use forkwatch_protocol::monitor::{
    CleanerConfig, ForkChainsCleaner, ForkChainsMonitor, MonitorConfig,
};
use forkwatch_protocol::storage::{ChainRegistry, JournalExecutor};

use cli::{Commands, ForkwatchCli, DEFAULT_CONFIG_PATH};
use config::NodeConfig;
use gate::TracingGate;
use logging::LogFormat;
use metrics::NodeMetrics;
use simulator::BlockFeed;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = ForkwatchCli::parse();

    match cli.command {
        Commands::Run(args) => run_node(args).await,
        Commands::Init(args) => init_config(args),
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

/// Starts the node: chain activation, background tasks, metrics endpoint.
async fn run_node(args: cli::RunArgs) -> Result<()> {
    logging::init_logging(logging::DEFAULT_FILTER, args.log_format);

    let config = load_config(args.config.as_deref())?;
    tracing::info!(
        chains = config.chains.len(),
        monitor_interval_ms = config.monitor_interval_ms,
        cleaner_interval_ms = config.cleaner_interval_ms,
        metrics_port = args.metrics_port,
        simulate = args.simulate,
        "starting forkwatch-node"
    );

    // --- Chains ---
    let registry = Arc::new(ChainRegistry::new(Arc::new(JournalExecutor::new())));
    let contexts = Arc::new(ContextManager::new());
    for chain in &config.chains {
        contexts
            .activate(&registry, chain.chain_id, chain.parameters.clone())
            .with_context(|| format!("failed to activate chain {}", chain.chain_id))?;
    }

    // --- Metrics ---
    let node_metrics = Arc::new(NodeMetrics::new().context("failed to register metrics")?);
    node_metrics.observe(&registry);

    // --- Background tasks ---
    let gate = Arc::new(TracingGate::new());
    let monitor = ForkChainsMonitor::new(
        Arc::clone(&contexts),
        Arc::clone(&registry),
        gate.clone(),
        MonitorConfig {
            interval_ms: config.monitor_interval_ms,
            optimistic_retry_limit: config.optimistic_retry_limit,
        },
    );
    let cleaner = ForkChainsCleaner::new(
        Arc::clone(&contexts),
        Arc::clone(&registry),
        CleanerConfig {
            interval_ms: config.cleaner_interval_ms,
        },
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();

    {
        let metrics = Arc::clone(&node_metrics);
        let registry = Arc::clone(&registry);
        let shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            monitor
                .run_with(shutdown, |report| {
                    metrics.record_cycle(report);
                    metrics.observe(&registry);
                })
                .await
        }));
    }

    {
        let metrics = Arc::clone(&node_metrics);
        let registry = Arc::clone(&registry);
        let shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            cleaner
                .run_with(shutdown, |report| {
                    metrics.record_clean(report);
                    metrics.observe(&registry);
                })
                .await
        }));
    }

    if args.simulate {
        let feed = BlockFeed::new(Arc::clone(&contexts), Arc::clone(&registry), gate);
        tasks.push(tokio::spawn(
            feed.run(args.block_interval_ms, shutdown_rx.clone()),
        ));
    }

    // --- Metrics server ---
    let metrics_addr = format!("0.0.0.0:{}", args.metrics_port);
    let metrics_listener = tokio::net::TcpListener::bind(&metrics_addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {}", metrics_addr))?;
    tracing::info!("metrics server listening on {}", metrics_addr);

    // --- Serve ---
    tokio::select! {
        res = axum::serve(metrics_listener, metrics::router(Arc::clone(&node_metrics))) => {
            if let Err(e) = res {
                tracing::error!("metrics server error: {}", e);
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received, stopping background tasks");
        }
    }

    // Receivers may already be gone if every task exited on its own.
    let _ = shutdown_tx.send(true);
    for task in tasks {
        if let Err(e) = task.await {
            tracing::warn!(error = %e, "background task ended abnormally");
        }
    }

    tracing::info!("forkwatch-node stopped");
    Ok(())
}

/// Reads the configuration named on the command line, or the default file
/// if it exists, or falls back to built-in defaults.
fn load_config(path: Option<&Path>) -> Result<NodeConfig> {
    match path {
        Some(path) => NodeConfig::load(path),
        None => {
            let default_path = Path::new(DEFAULT_CONFIG_PATH);
            if default_path.exists() {
                NodeConfig::load(default_path)
            } else {
                tracing::info!("no config file found, using defaults");
                Ok(NodeConfig::default())
            }
        }
    }
}

/// Writes a default configuration file.
fn init_config(args: cli::InitArgs) -> Result<()> {
    logging::init_logging("forkwatch_node=info", LogFormat::Pretty);

    let config = NodeConfig::write_default(&args.config, args.force)?;
    tracing::info!(path = %args.config.display(), "configuration written");

    println!("Configuration written.");
    println!("  File              : {}", args.config.display());
    println!("  Chains            : {}", config.chains.len());
    println!("  Monitor interval  : {} ms", config.monitor_interval_ms);
    println!("  Cleaner interval  : {} ms", config.cleaner_interval_ms);

    Ok(())
}

/// Prints version information to stdout.
fn print_version() {
    println!("forkwatch-node {}", env!("CARGO_PKG_VERSION"));
    println!("rustc          {}", rustc_version());
}

/// Returns the Rust compiler version used to build this binary.
fn rustc_version() -> &'static str {
    option_env!("RUSTC_VERSION").unwrap_or("unknown")
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
///
/// On non-Unix platforms, only Ctrl+C is supported. If a handler cannot be
/// installed, that signal is ignored rather than shutting the node down.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
