// Copyright (C) 2025 The groundseg Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker evicting closed orders.
//!
//! Closing an order stamps it with an eviction time. Once that time has
//! passed, this worker deletes the order together with its jobs, job steps
//! and progress snapshots, in batches to keep transactions short.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use groundseg_core::Persistence;
use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::error::Result;

/// Configuration for the order cleanup worker.
#[derive(Debug, Clone)]
pub struct OrderCleanupWorkerConfig {
    /// Whether eviction is enabled.
    pub enabled: bool,
    /// How often to run cleanup.
    pub poll_interval: Duration,
    /// Maximum orders to delete per batch.
    pub batch_size: i64,
}

impl Default for OrderCleanupWorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval: Duration::from_secs(3600), // 1 hour
            batch_size: 100,
        }
    }
}

impl OrderCleanupWorkerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `GROUNDSEG_ORDER_CLEANUP_ENABLED`: "false" or "0" to disable (default: true)
    /// - `GROUNDSEG_ORDER_CLEANUP_POLL_INTERVAL_SECS`: seconds between runs (default: 3600)
    /// - `GROUNDSEG_ORDER_CLEANUP_BATCH_SIZE`: max orders per batch (default: 100)
    pub fn from_env() -> Self {
        let enabled = std::env::var("GROUNDSEG_ORDER_CLEANUP_ENABLED")
            .map(|v| !(v == "false" || v == "0"))
            .unwrap_or(true);

        let poll_interval_secs = std::env::var("GROUNDSEG_ORDER_CLEANUP_POLL_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(3600);

        let batch_size = std::env::var("GROUNDSEG_ORDER_CLEANUP_BATCH_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|n: &i64| *n > 0)
            .unwrap_or(100);

        Self {
            enabled,
            poll_interval: Duration::from_secs(poll_interval_secs),
            batch_size,
        }
    }
}

/// Background worker deleting evicted orders.
pub struct OrderCleanupWorker {
    persistence: Arc<dyn Persistence>,
    config: OrderCleanupWorkerConfig,
    shutdown: Arc<Notify>,
}

impl OrderCleanupWorker {
    pub fn new(persistence: Arc<dyn Persistence>, config: OrderCleanupWorkerConfig) -> Self {
        Self {
            persistence,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    pub async fn run(&self) {
        if !self.config.enabled {
            info!("Order cleanup worker disabled");
            return;
        }

        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            batch_size = self.config.batch_size,
            "Order cleanup worker started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Order cleanup worker received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.run_cycle().await {
                        error!(error = %e, "Failed to evict closed orders");
                    }
                }
            }
        }

        info!("Order cleanup worker stopped");
    }

    /// Delete every order past its eviction time. Returns the number deleted.
    pub async fn run_cycle(&self) -> Result<u64> {
        let now = Utc::now();
        let mut total_deleted = 0u64;

        loop {
            let order_ids = self
                .persistence
                .get_evictable_orders(now, self.config.batch_size)
                .await?;
            if order_ids.is_empty() {
                break;
            }

            let batch_size = order_ids.len();
            let deleted = self.persistence.delete_orders_batch(&order_ids).await?;
            total_deleted += deleted;

            debug!(batch_size, deleted, total_deleted, "Evicted batch of orders");

            if batch_size < self.config.batch_size as usize || deleted == 0 {
                break;
            }
        }

        if total_deleted > 0 {
            info!(total_deleted, "Order cleanup cycle completed");
        } else {
            debug!("Order cleanup cycle completed, no evictable orders");
        }
        Ok(total_deleted)
    }
}
