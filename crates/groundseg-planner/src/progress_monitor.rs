// Copyright (C) 2025 The groundseg Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker appending periodic progress snapshots of active orders.

use std::sync::Arc;
use std::time::Duration;

use groundseg_core::OrderState;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::context::PlannerContext;
use crate::error::Result;
use crate::order_machine;

/// Configuration for the progress monitor.
#[derive(Debug, Clone)]
pub struct ProgressMonitorConfig {
    /// How often to take snapshots.
    pub poll_interval: Duration,
}

impl Default for ProgressMonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
        }
    }
}

impl ProgressMonitorConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `GROUNDSEG_PROGRESS_INTERVAL_SECS`: seconds between snapshots (default: 60)
    pub fn from_env() -> Self {
        let poll_interval_secs = std::env::var("GROUNDSEG_PROGRESS_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(60);

        Self {
            poll_interval: Duration::from_secs(poll_interval_secs),
        }
    }
}

/// Background worker recording order progress.
pub struct ProgressMonitor {
    ctx: Arc<PlannerContext>,
    config: ProgressMonitorConfig,
    shutdown: Arc<Notify>,
}

impl ProgressMonitor {
    pub fn new(ctx: Arc<PlannerContext>, config: ProgressMonitorConfig) -> Self {
        Self {
            ctx,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "Progress monitor started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Progress monitor received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.run_cycle().await {
                        error!(error = %e, "Failed to record order progress");
                    }
                }
            }
        }

        info!("Progress monitor stopped");
    }

    /// Snapshot every active order. Returns the number of snapshots taken.
    pub async fn run_cycle(&self) -> Result<usize> {
        let orders = self
            .ctx
            .persistence
            .list_orders(&OrderState::ACTIVE)
            .await?;

        let mut recorded = 0;
        for order in &orders {
            match order_machine::record_progress(&self.ctx, order).await {
                Ok(()) => recorded += 1,
                Err(e) => warn!(order_id = %order.id, error = %e, "Failed to snapshot order"),
            }
        }

        debug!(recorded, "Progress snapshots recorded");
        Ok(recorded)
    }
}
