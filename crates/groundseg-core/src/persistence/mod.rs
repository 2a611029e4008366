// Copyright (C) 2025 The groundseg Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for groundseg-core.
//!
//! Every update of an order, job or job step is a compare-and-set on its
//! `version` column: the write only lands if the row still carries the
//! version the caller read, and bumps it by one. A lost race surfaces as
//! [`CoreError::Conflict`], to be replayed through the
//! [`RetryCoordinator`](crate::retry::RetryCoordinator).

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresPersistence;
pub use self::sqlite::SqlitePersistence;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::CoreError;
use crate::model::{
    Job, JobStep, MonOrderProgress, OrderState, ProcessingOrder, Product, SensingWindow,
    StepCounts,
};
use crate::planning::Plan;

/// Product lookup within one mission and product class.
///
/// Windows are compared the way [`SensingWindow`] does: intersection is
/// strict, containment is inclusive. Ties on generation time go to the
/// lower id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProductQuery {
    /// Products intersecting the window, by sensing start.
    Intersecting(SensingWindow),
    /// The newest generation among products intersecting the window.
    NewestIntersecting(SensingWindow),
    /// The newest generation among products containing the window.
    NewestCovering(SensingWindow),
    /// The product with the latest sensing start, newest generation first.
    LatestStart,
    /// For each side of the instant, the product whose sensing start is
    /// nearest to it. At most two products.
    NearestStart(DateTime<Utc>),
}

/// Persistence interface used by the planner.
#[allow(missing_docs)]
#[async_trait]
pub trait Persistence: Send + Sync {
    // ========================================================================
    // Orders
    // ========================================================================

    async fn insert_order(&self, order: &ProcessingOrder) -> Result<(), CoreError>;

    async fn get_order(&self, order_id: &str) -> Result<Option<ProcessingOrder>, CoreError>;

    /// Orders in any of `states`, oldest first.
    async fn list_orders(&self, states: &[OrderState]) -> Result<Vec<ProcessingOrder>, CoreError>;

    /// Versioned update. Returns the stored row with its new version.
    async fn update_order(&self, order: &ProcessingOrder) -> Result<ProcessingOrder, CoreError>;

    /// Versioned update of `order` plus insertion of its jobs and steps, in
    /// one transaction.
    async fn store_plan(
        &self,
        order: &ProcessingOrder,
        plan: &Plan,
    ) -> Result<ProcessingOrder, CoreError>;

    /// Versioned update of `order` plus removal of its jobs and steps, in one
    /// transaction.
    async fn discard_plan(&self, order: &ProcessingOrder) -> Result<ProcessingOrder, CoreError>;

    // ========================================================================
    // Jobs and job steps
    // ========================================================================

    /// Jobs of an order by slice.
    async fn list_jobs(&self, order_id: &str) -> Result<Vec<Job>, CoreError>;

    async fn update_job(&self, job: &Job) -> Result<Job, CoreError>;

    async fn get_job_step(&self, job_step_id: &str) -> Result<Option<JobStep>, CoreError>;

    /// Steps of an order, by slice then step index.
    async fn list_job_steps(&self, order_id: &str) -> Result<Vec<JobStep>, CoreError>;

    async fn update_job_step(&self, step: &JobStep) -> Result<JobStep, CoreError>;

    /// Versioned step update that only lands while the step's order is in
    /// one of `order_states`, checked atomically with the write.
    ///
    /// Returns `None` when the order was in another state.
    async fn update_job_step_guarded(
        &self,
        step: &JobStep,
        order_states: &[OrderState],
    ) -> Result<Option<JobStep>, CoreError>;

    /// Consistent per-state step counts, read at repeatable-read isolation.
    async fn count_job_steps(&self, order_id: &str) -> Result<StepCounts, CoreError>;

    // ========================================================================
    // Products
    // ========================================================================

    /// Insert a product. Inserting an existing ID is a no-op; returns whether
    /// a row was added.
    async fn insert_product(&self, product: &Product) -> Result<bool, CoreError>;

    async fn find_products(
        &self,
        mission_code: &str,
        product_class: &str,
        query: &ProductQuery,
    ) -> Result<Vec<Product>, CoreError>;

    async fn get_products(&self, product_ids: &[String]) -> Result<Vec<Product>, CoreError>;

    // ========================================================================
    // Progress
    // ========================================================================

    async fn append_progress(&self, progress: &MonOrderProgress) -> Result<(), CoreError>;

    /// Snapshots of an order, oldest first.
    async fn list_progress(&self, order_id: &str) -> Result<Vec<MonOrderProgress>, CoreError>;

    /// Most recent snapshot of an order.
    async fn latest_progress(
        &self,
        order_id: &str,
    ) -> Result<Option<MonOrderProgress>, CoreError>;

    // ========================================================================
    // Health / Cleanup
    // ========================================================================

    async fn health_check_db(&self) -> Result<bool, CoreError>;

    /// Closed orders whose eviction time has passed, oldest first.
    async fn get_evictable_orders(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<String>, CoreError>;

    /// Delete orders with their jobs, steps and progress. Returns the number
    /// of orders deleted.
    async fn delete_orders_batch(&self, order_ids: &[String]) -> Result<u64, CoreError>;
}
