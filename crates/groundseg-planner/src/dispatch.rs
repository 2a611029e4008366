// Copyright (C) 2025 The groundseg Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Dispatch loop.
//!
//! Each cycle reads the active orders, advances every job step that is not
//! closed by one state machine step, then refreshes the order states.
//!
//! Steps are grouped by facility and the groups run concurrently, so a
//! facility whose cluster hangs only holds back its own steps. Once a
//! facility reports a transient gateway error, its remaining gateway work
//! is skipped until the next cycle; input resolution still runs.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use groundseg_core::lifecycle::OrderAssessment;
use groundseg_core::{Job, JobStep, JobStepState, OrderState, ProcessingOrder};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::context::PlannerContext;
use crate::error::{Error, Result};
use crate::job_step_machine::{self, StepOutcome};
use crate::order_machine;

/// Configuration for the dispatch loop.
#[derive(Debug, Clone)]
pub struct DispatchLoopConfig {
    /// Pause between cycles.
    pub cycle_interval: Duration,
}

impl Default for DispatchLoopConfig {
    fn default() -> Self {
        Self {
            cycle_interval: Duration::from_secs(10),
        }
    }
}

impl DispatchLoopConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `GROUNDSEG_CYCLE_INTERVAL_SECS`: seconds between cycles (default: 10)
    pub fn from_env() -> Self {
        let cycle_interval_secs = std::env::var("GROUNDSEG_CYCLE_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10);

        Self {
            cycle_interval: Duration::from_secs(cycle_interval_secs),
        }
    }
}

/// Counters of one cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Active orders looked at.
    pub orders: usize,
    /// Steps that changed state.
    pub advanced: usize,
    /// Steps left for the next cycle after an error.
    pub errors: usize,
    /// Steps skipped because their facility was unavailable.
    pub skipped: usize,
}

impl CycleReport {
    fn merge(&mut self, other: CycleReport) {
        self.advanced += other.advanced;
        self.errors += other.errors;
        self.skipped += other.skipped;
    }
}

struct WorkItem {
    order: Arc<ProcessingOrder>,
    job: Arc<Job>,
    step: JobStep,
    accepts_submissions: bool,
}

impl WorkItem {
    fn needs_gateway(&self) -> bool {
        match self.step.state {
            JobStepState::Ready => self.accepts_submissions,
            JobStepState::Running | JobStepState::Completed => true,
            JobStepState::Failed => self.step.execution_handle.is_some(),
            _ => false,
        }
    }
}

/// Periodic coordinator of all active orders.
pub struct DispatchLoop {
    ctx: Arc<PlannerContext>,
    config: DispatchLoopConfig,
    shutdown: Arc<Notify>,
}

impl DispatchLoop {
    pub fn new(ctx: Arc<PlannerContext>, config: DispatchLoopConfig) -> Self {
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

    /// Run cycles until the shutdown signal is received.
    pub async fn run(&self) {
        info!(
            cycle_interval_secs = self.config.cycle_interval.as_secs(),
            facilities = self.ctx.facilities.len(),
            "Dispatch loop started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Dispatch loop received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.cycle_interval) => {
                    if let Err(e) = self.run_cycle().await {
                        error!(error = %e, "Dispatch cycle failed");
                    }
                }
            }
        }

        info!("Dispatch loop stopped");
    }

    /// One pass over all active orders.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let orders = self
            .ctx
            .persistence
            .list_orders(&OrderState::ACTIVE)
            .await?;

        let mut report = CycleReport {
            orders: orders.len(),
            ..Default::default()
        };
        if orders.is_empty() {
            return Ok(report);
        }

        let mut by_facility: BTreeMap<String, Vec<WorkItem>> = BTreeMap::new();
        for order in &orders {
            match self.collect(order).await {
                Ok(items) => {
                    for item in items {
                        by_facility
                            .entry(item.job.facility.clone())
                            .or_default()
                            .push(item);
                    }
                }
                Err(e) => {
                    warn!(order_id = %order.id, error = %e, "Failed to load order steps");
                    report.errors += 1;
                }
            }
        }

        let groups = by_facility
            .into_iter()
            .map(|(facility, items)| self.run_facility(facility, items));
        for group in join_all(groups).await {
            report.merge(group);
        }

        for order in &orders {
            if let Err(e) = order_machine::refresh(&self.ctx, &order.id).await {
                warn!(order_id = %order.id, error = %e, "Failed to refresh order state");
                report.errors += 1;
            }
        }

        debug!(
            orders = report.orders,
            advanced = report.advanced,
            errors = report.errors,
            skipped = report.skipped,
            "Dispatch cycle completed"
        );
        Ok(report)
    }

    /// Open steps of an order, each with its job.
    async fn collect(&self, order: &ProcessingOrder) -> Result<Vec<WorkItem>> {
        let jobs = self.ctx.persistence.list_jobs(&order.id).await?;
        let steps = self.ctx.persistence.list_job_steps(&order.id).await?;
        let accepts_submissions = OrderAssessment::of(&steps).accepts_submissions(order);

        let order = Arc::new(order.clone());
        let jobs: BTreeMap<String, Arc<Job>> = jobs
            .into_iter()
            .map(|job| (job.id.clone(), Arc::new(job)))
            .collect();

        Ok(steps
            .into_iter()
            .filter(|step| step.state != JobStepState::Closed)
            .filter_map(|step| {
                let job = jobs.get(&step.job_id)?.clone();
                Some(WorkItem {
                    order: order.clone(),
                    job,
                    step,
                    accepts_submissions,
                })
            })
            .collect())
    }

    async fn run_facility(&self, facility: String, items: Vec<WorkItem>) -> CycleReport {
        let mut report = CycleReport::default();
        let mut unavailable = false;

        for item in items {
            if unavailable && item.needs_gateway() {
                report.skipped += 1;
                continue;
            }

            let outcome = job_step_machine::advance(
                &self.ctx,
                &item.order,
                &item.job,
                &item.step,
                item.accepts_submissions,
            )
            .await;

            match outcome {
                Ok(StepOutcome::Advanced(state)) => {
                    debug!(job_step_id = %item.step.id, from = %item.step.state, to = %state, "Job step advanced");
                    report.advanced += 1;
                }
                Ok(StepOutcome::Unchanged) => {}
                Err(e) => {
                    report.errors += 1;
                    if matches!(&e, Error::Gateway(g) if g.is_transient()) {
                        warn!(facility = %facility, error = %e, "Facility unavailable, deferring its steps");
                        unavailable = true;
                    } else if e.is_transient() {
                        debug!(job_step_id = %item.step.id, error = %e, "Job step deferred");
                    } else {
                        warn!(job_step_id = %item.step.id, error = %e, "Failed to advance job step");
                    }
                }
            }
        }
        report
    }
}
