// Copyright (C) 2025 The groundseg Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Registration of produced outputs in the product catalog.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use groundseg_core::joborder::output_file_name;
use groundseg_core::{Job, JobStep, Persistence, ProcessingOrder, Product};
use tracing::{debug, info};

use crate::error::Result;

/// Ingestion callback run when a job step completes.
#[async_trait]
pub trait Ingestor: Send + Sync {
    /// Register the outputs of `step`. Must be idempotent: the same step may
    /// be reported more than once.
    async fn register_outputs(
        &self,
        order: &ProcessingOrder,
        job: &Job,
        step: &JobStep,
    ) -> Result<Vec<Product>>;
}

/// Ingestor writing straight into the planner's product catalog.
pub struct CatalogIngestor {
    persistence: Arc<dyn Persistence>,
}

impl CatalogIngestor {
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self { persistence }
    }
}

/// Catalog record of the single output of `step`.
pub fn output_product(order: &ProcessingOrder, job: &Job, step: &JobStep) -> Product {
    let now = Utc::now();
    Product {
        id: format!("{}:{}", step.id, step.product_class),
        product_class: step.product_class.clone(),
        mission_code: order.mission_code.clone(),
        sensing_start: job.start_time,
        sensing_stop: job.stop_time,
        generation_time: step.finished_at.unwrap_or(now),
        file_name: output_file_name(step, job),
        facility: job.facility.clone(),
        job_step_id: Some(step.id.clone()),
        created_at: now,
    }
}

#[async_trait]
impl Ingestor for CatalogIngestor {
    async fn register_outputs(
        &self,
        order: &ProcessingOrder,
        job: &Job,
        step: &JobStep,
    ) -> Result<Vec<Product>> {
        let product = output_product(order, job, step);
        if self.persistence.insert_product(&product).await? {
            info!(
                product_id = %product.id,
                product_class = %product.product_class,
                job_step_id = %step.id,
                "Output product registered"
            );
        } else {
            debug!(product_id = %product.id, "Output product already registered");
        }
        Ok(vec![product])
    }
}
