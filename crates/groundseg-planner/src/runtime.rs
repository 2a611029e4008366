// Copyright (C) 2025 The groundseg Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for groundseg-planner.
//!
//! [`PlannerRuntime`] wires the shared [`PlannerContext`] and spawns the
//! background workers: the dispatch loop, the progress monitor and the order
//! cleanup worker. Order control is reachable through
//! [`PlannerRuntime::control`].
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use groundseg_core::SqlitePersistence;
//! use groundseg_planner::runtime::PlannerRuntime;
//! use groundseg_planner::storage::PosixStorage;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let persistence = Arc::new(SqlitePersistence::from_path("planner.db").await?);
//!
//!     let runtime = PlannerRuntime::builder()
//!         .persistence(persistence)
//!         .catalog(Arc::new(catalog))
//!         .facilities(Arc::new(facilities))
//!         .storage(Arc::new(PosixStorage::new(".data/storage")))
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     let order = runtime.control().submit(new_order).await?;
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use anyhow::Result;
use groundseg_core::{MissionCatalog, Persistence, RetryCoordinator, RetryPolicy};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::context::{PlannerContext, PlannerSettings};
use crate::dispatch::{DispatchLoop, DispatchLoopConfig};
use crate::facility::FacilityRegistry;
use crate::ingestor::{CatalogIngestor, Ingestor};
use crate::notifier::{LogNotifier, Notifier};
use crate::order_cleanup_worker::{OrderCleanupWorker, OrderCleanupWorkerConfig};
use crate::order_control::OrderControl;
use crate::progress_monitor::{ProgressMonitor, ProgressMonitorConfig};
use crate::storage::StorageManager;

/// Builder for creating a [`PlannerRuntime`].
#[derive(Default)]
pub struct PlannerRuntimeBuilder {
    persistence: Option<Arc<dyn Persistence>>,
    catalog: Option<Arc<MissionCatalog>>,
    facilities: Option<Arc<FacilityRegistry>>,
    storage: Option<Arc<dyn StorageManager>>,
    ingestor: Option<Arc<dyn Ingestor>>,
    notifier: Option<Arc<dyn Notifier>>,
    retry_policy: RetryPolicy,
    settings: PlannerSettings,
    dispatch_config: DispatchLoopConfig,
    progress_config: ProgressMonitorConfig,
    cleanup_config: OrderCleanupWorkerConfig,
}

impl PlannerRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the persistence layer (required).
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Set the mission catalog (required).
    pub fn catalog(mut self, catalog: Arc<MissionCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Set the facility registry (required).
    pub fn facilities(mut self, facilities: Arc<FacilityRegistry>) -> Self {
        self.facilities = Some(facilities);
        self
    }

    /// Set the storage manager for job order descriptors (required).
    pub fn storage(mut self, storage: Arc<dyn StorageManager>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Set the product ingestor.
    ///
    /// Default: a [`CatalogIngestor`] writing to the persistence layer.
    pub fn ingestor(mut self, ingestor: Arc<dyn Ingestor>) -> Self {
        self.ingestor = Some(ingestor);
        self
    }

    /// Set the operator notifier.
    ///
    /// Default: [`LogNotifier`]
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Set the bounds for replaying conflicting writes.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Set the planner behaviour settings.
    pub fn settings(mut self, settings: PlannerSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Set the dispatch loop configuration.
    pub fn dispatch_config(mut self, config: DispatchLoopConfig) -> Self {
        self.dispatch_config = config;
        self
    }

    /// Set the progress monitor configuration.
    pub fn progress_config(mut self, config: ProgressMonitorConfig) -> Self {
        self.progress_config = config;
        self
    }

    /// Set the order cleanup worker configuration.
    pub fn cleanup_config(mut self, config: OrderCleanupWorkerConfig) -> Self {
        self.cleanup_config = config;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<PlannerRuntimeConfig> {
        let persistence = self
            .persistence
            .ok_or_else(|| anyhow::anyhow!("persistence is required"))?;
        let catalog = self
            .catalog
            .ok_or_else(|| anyhow::anyhow!("catalog is required"))?;
        let facilities = self
            .facilities
            .ok_or_else(|| anyhow::anyhow!("facilities is required"))?;
        let storage = self
            .storage
            .ok_or_else(|| anyhow::anyhow!("storage is required"))?;
        if self.retry_policy.max_attempts == 0 {
            anyhow::bail!("retry policy needs at least one attempt");
        }

        let ingestor = self
            .ingestor
            .unwrap_or_else(|| Arc::new(CatalogIngestor::new(persistence.clone())));
        let notifier = self.notifier.unwrap_or_else(|| Arc::new(LogNotifier));

        let context = PlannerContext::new(
            persistence,
            catalog,
            facilities,
            storage,
            ingestor,
            notifier,
            RetryCoordinator::new(self.retry_policy),
            self.settings,
        );

        Ok(PlannerRuntimeConfig {
            context: Arc::new(context),
            dispatch_config: self.dispatch_config,
            progress_config: self.progress_config,
            cleanup_config: self.cleanup_config,
        })
    }
}

/// Configuration for a [`PlannerRuntime`].
pub struct PlannerRuntimeConfig {
    context: Arc<PlannerContext>,
    dispatch_config: DispatchLoopConfig,
    progress_config: ProgressMonitorConfig,
    cleanup_config: OrderCleanupWorkerConfig,
}

impl PlannerRuntimeConfig {
    /// Shared context the workers will use.
    pub fn context(&self) -> &Arc<PlannerContext> {
        &self.context
    }

    /// Start the runtime, spawning the background workers.
    pub async fn start(self) -> Result<PlannerRuntime> {
        let dispatch_loop = DispatchLoop::new(self.context.clone(), self.dispatch_config);
        let dispatch_shutdown = dispatch_loop.shutdown_handle();
        let dispatch_handle = tokio::spawn(async move {
            dispatch_loop.run().await;
        });

        let progress_monitor = ProgressMonitor::new(self.context.clone(), self.progress_config);
        let progress_shutdown = progress_monitor.shutdown_handle();
        let progress_handle = tokio::spawn(async move {
            progress_monitor.run().await;
        });

        let cleanup_worker =
            OrderCleanupWorker::new(self.context.persistence.clone(), self.cleanup_config);
        let cleanup_shutdown = cleanup_worker.shutdown_handle();
        let cleanup_handle = tokio::spawn(async move {
            cleanup_worker.run().await;
        });

        info!(
            facilities = self.context.facilities.len(),
            "PlannerRuntime started"
        );

        Ok(PlannerRuntime {
            control: OrderControl::new(self.context.clone()),
            context: self.context,
            dispatch_handle,
            progress_handle,
            cleanup_handle,
            dispatch_shutdown,
            progress_shutdown,
            cleanup_shutdown,
        })
    }
}

/// A running planner that can be embedded in an application.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct PlannerRuntime {
    context: Arc<PlannerContext>,
    control: OrderControl,
    dispatch_handle: JoinHandle<()>,
    progress_handle: JoinHandle<()>,
    cleanup_handle: JoinHandle<()>,
    dispatch_shutdown: Arc<Notify>,
    progress_shutdown: Arc<Notify>,
    cleanup_shutdown: Arc<Notify>,
}

impl PlannerRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> PlannerRuntimeBuilder {
        PlannerRuntimeBuilder::new()
    }

    /// Operator commands on orders.
    pub fn control(&self) -> &OrderControl {
        &self.control
    }

    pub fn context(&self) -> &Arc<PlannerContext> {
        &self.context
    }

    /// Signal every worker to stop and wait for them.
    ///
    /// A dispatch cycle in flight runs to completion first.
    pub async fn shutdown(self) -> Result<()> {
        info!("PlannerRuntime shutting down...");

        self.dispatch_shutdown.notify_one();
        self.progress_shutdown.notify_one();
        self.cleanup_shutdown.notify_one();

        let mut panicked = false;
        if let Err(e) = self.dispatch_handle.await {
            error!("Dispatch loop task panicked: {}", e);
            panicked = true;
        }
        if let Err(e) = self.progress_handle.await {
            error!("Progress monitor task panicked: {}", e);
            panicked = true;
        }
        if let Err(e) = self.cleanup_handle.await {
            error!("Order cleanup worker task panicked: {}", e);
            panicked = true;
        }

        if panicked {
            anyhow::bail!("planner worker task panicked");
        }
        info!("PlannerRuntime shutdown complete");
        Ok(())
    }

    /// Check if every worker is still running.
    ///
    /// A disabled cleanup worker returns immediately and does not count.
    pub fn is_running(&self) -> bool {
        !self.dispatch_handle.is_finished() && !self.progress_handle.is_finished()
    }
}
