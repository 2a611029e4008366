// Copyright (C) 2025 The groundseg Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Groundseg Planner - Production Planner Server
//!
//! Runs the dispatch loop, the progress monitor and the order cleanup worker
//! against the configured database and processing facilities.

use std::sync::Arc;

use groundseg_core::persistence::Persistence;
use groundseg_core::{MissionCatalog, PostgresPersistence, SqlitePersistence, migrations};
use groundseg_planner::config::Config;
use groundseg_planner::context::PlannerSettings;
use groundseg_planner::dispatch::DispatchLoopConfig;
use groundseg_planner::facility::FacilityRegistry;
use groundseg_planner::ingestor::CatalogIngestor;
use groundseg_planner::notifier::LogNotifier;
use groundseg_planner::order_cleanup_worker::OrderCleanupWorkerConfig;
use groundseg_planner::progress_monitor::ProgressMonitorConfig;
use groundseg_planner::runtime::PlannerRuntime;
use groundseg_planner::storage::PosixStorage;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "groundseg_planner=info,groundseg_core=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        mission_file = %config.mission_file.display(),
        facilities_file = %config.facilities_file.display(),
        storage_root = %config.storage_root.display(),
        "Starting Groundseg Planner"
    );

    let persistence: Arc<dyn Persistence> = if config.database_url.starts_with("sqlite:") {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&config.database_url)
            .await?;
        migrations::run_sqlite(&pool).await?;
        Arc::new(SqlitePersistence::new(pool))
    } else {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(10)
            .connect(&config.database_url)
            .await?;
        migrations::run_postgres(&pool).await?;
        Arc::new(PostgresPersistence::new(pool))
    };

    info!("Database schema verified");

    let catalog = MissionCatalog::load(&config.mission_file).await?;
    info!(mission = %catalog.mission_code, "Mission catalog loaded");

    let facility_configs = FacilityRegistry::load_configs(&config.facilities_file).await?;
    let facilities = FacilityRegistry::from_configs(facility_configs).await?;
    if facilities.is_empty() {
        warn!("No processing facilities configured");
    }

    let runtime = PlannerRuntime::builder()
        .ingestor(Arc::new(CatalogIngestor::new(persistence.clone())))
        .persistence(persistence)
        .catalog(Arc::new(catalog))
        .facilities(Arc::new(facilities))
        .storage(Arc::new(PosixStorage::new(&config.storage_root)))
        .notifier(Arc::new(LogNotifier))
        .retry_policy(config.retry)
        .settings(PlannerSettings::from(&config))
        .dispatch_config(DispatchLoopConfig {
            cycle_interval: config.cycle_interval,
        })
        .progress_config(ProgressMonitorConfig {
            poll_interval: config.progress_interval,
        })
        .cleanup_config(OrderCleanupWorkerConfig::from_env())
        .build()?
        .start()
        .await?;

    info!("Planner ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;

    info!("Groundseg Planner shut down");

    Ok(())
}
