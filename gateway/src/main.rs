//! Dispatch gateway - emergency alert dispatch with a tamper-evident audit ledger

use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dispatch::DispatchEngine;
use gateway::{config::Args, notify, server, AppState, LoggingNotifier};
use ledger::{AuditLedger, FileLedgerStore, LedgerStore, MemoryLedgerStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    // Initialize tracing/logging
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!(
            "gateway={level},dispatch={level},ledger={level},info",
            level = args.log_level
        )
        .into()
    });
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    // Validate configuration
    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    let engine_config = args.load_engine_config()?;
    let identity = args.identity_provider()?;

    info!("======================================");
    info!("  Dispatch Gateway");
    info!("======================================");
    info!("Engine ID: {}", engine_config.engine_id);
    info!("Listen: {}", args.listen);
    info!("Mode: {}", if args.dev_mode { "DEVELOPMENT" } else { "PRODUCTION" });
    info!("Zones: {}", engine_config.zones.len());
    info!("Ack timeout: {}s", engine_config.timing.ack_timeout_secs);
    info!("======================================");

    // Open the audit ledger; a broken chain refuses to start
    let store: Arc<dyn LedgerStore> = match &args.ledger_path {
        Some(path) => {
            info!("Ledger: {} (sync writes: {})", path.display(), args.sync_writes);
            Arc::new(FileLedgerStore::new(path).with_sync_writes(args.sync_writes))
        }
        None => {
            warn!("Ledger: in-memory, entries are lost on exit");
            Arc::new(MemoryLedgerStore::new())
        }
    };
    let ledger = AuditLedger::open_verified(store)
        .await
        .context("opening audit ledger")?;
    info!("Ledger opened with {} entries", ledger.len().await);

    let engine = DispatchEngine::new(engine_config, Arc::new(ledger))
        .await
        .context("starting dispatch engine")?;

    // Background work
    let sweeper = engine.spawn_sweeper();
    let notifier = notify::spawn_notifier(engine.subscribe(), Arc::new(LoggingNotifier));

    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("binding {}", args.listen))?;

    server::run(listener, AppState::new(engine.clone(), identity), shutdown_signal()).await?;

    sweeper.abort();
    notifier.abort();
    engine.shutdown();
    info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
