//! Tether agent - runs the sync services for one device until interrupted.
//!
//! Opens the local SQLite store, wires the queue, incremental, mirror and
//! orchestrator services, and keeps auto-sync running in the background.

use std::sync::Arc;

use tether_client::{
    db, MemoryMirror, SqliteStore, StoreExecutor, SyncConfig, SyncOrchestrator,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tether_client=debug,tether_agent=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = SyncConfig::from_env()?;

    tracing::info!(
        device_id = %config.device_id,
        collections = ?config.collections,
        strategy = %config.conflict_strategy,
        "Starting Tether agent"
    );

    // Open the local store
    let pool = db::create_pool(&config.database_url).await?;

    tracing::info!("Running database migrations...");
    db::run_migrations(&pool).await?;

    let store = Arc::new(SqliteStore::new(pool));
    let executor = Arc::new(StoreExecutor::new(store.clone()));
    let mirror = Arc::new(MemoryMirror::new());

    let orchestrator = Arc::new(SyncOrchestrator::from_config(
        &config, store, mirror, executor,
    ));
    let _status = orchestrator.on_status_change(|status| {
        tracing::debug!(
            online = status.is_online,
            pending = status.offline.pending_items_count,
            conflicts = status.unresolved_conflicts,
            "Sync status changed"
        );
    });

    orchestrator.start().await;

    let initial = orchestrator.sync_all(false).await?;
    tracing::info!(
        success = initial.success,
        errors = initial.errors.len(),
        "Initial sync finished"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    orchestrator.shutdown().await;

    Ok(())
}
