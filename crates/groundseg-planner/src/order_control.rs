// Copyright (C) 2025 The groundseg Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Order control operations.
//!
//! The entry points an order submission interface calls. Each request is
//! checked against the order transition table; an illegal request fails
//! with [`CoreError::InvalidStateTransition`] and changes nothing.

use std::sync::Arc;

use chrono::Utc;
use groundseg_core::error::Result as CoreResult;
use groundseg_core::lifecycle::StepTransition;
use groundseg_core::planning::decompose;
use groundseg_core::{
    CoreError, Diagnostic, ErrorKind, JobStep, JobStepState, NewOrder, OrderState,
    ProcessingOrder,
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::context::PlannerContext;
use crate::error::{Error, Result};
use crate::job_step_machine::{self, StepOutcome, dispose, write_step};
use crate::order_machine;

/// Outcome of a planning attempt inside the retried section.
enum Planning {
    Planned(ProcessingOrder),
    Rejected(ProcessingOrder, CoreError),
}

/// Order lifecycle operations.
#[derive(Clone)]
pub struct OrderControl {
    ctx: Arc<PlannerContext>,
}

impl OrderControl {
    pub fn new(ctx: Arc<PlannerContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<PlannerContext> {
        &self.ctx
    }

    /// Create an order in INITIAL.
    pub async fn submit(&self, new: NewOrder) -> Result<ProcessingOrder> {
        if new.identifier.trim().is_empty() {
            return Err(CoreError::ValidationError {
                field: "identifier".to_string(),
                message: "identifier must not be empty".to_string(),
            }
            .into());
        }
        if new.stop_time <= new.start_time {
            return Err(CoreError::ValidationError {
                field: "stop_time".to_string(),
                message: "stop time must be after start time".to_string(),
            }
            .into());
        }
        if !self.ctx.facilities.contains(&new.facility) {
            return Err(Error::UnknownFacility(new.facility));
        }

        let max_step_attempts = new
            .max_step_attempts
            .unwrap_or(self.ctx.settings.max_step_attempts);
        if max_step_attempts < 1 {
            return Err(CoreError::ValidationError {
                field: "max_step_attempts".to_string(),
                message: "at least one attempt is required".to_string(),
            }
            .into());
        }

        let now = Utc::now();
        let order = ProcessingOrder {
            id: Uuid::new_v4().to_string(),
            identifier: new.identifier,
            mission_code: new.mission_code,
            state: OrderState::Initial,
            version: 1,
            start_time: new.start_time,
            stop_time: new.stop_time,
            slicing_type: new.slicing_type,
            slice_duration_secs: new.slice_duration_secs,
            slice_overlap_secs: new.slice_overlap_secs,
            requested_product_classes: new.requested_product_classes,
            facility: new.facility,
            processing_mode: new.processing_mode,
            dynamic_parameters: new.dynamic_parameters,
            tolerate_partial_failure: new.tolerate_partial_failure,
            max_step_attempts,
            state_message: None,
            diagnostic_kind: None,
            diagnostic_code: None,
            failed_job_step_id: None,
            created_at: now,
            updated_at: now,
            eviction_time: None,
        };
        self.ctx.persistence.insert_order(&order).await?;

        info!(order_id = %order.id, order = %order.identifier, "Order submitted");
        Ok(order)
    }

    /// INITIAL -> APPROVED.
    pub async fn approve(&self, order_id: &str) -> Result<ProcessingOrder> {
        self.transition(order_id, OrderState::Approved).await
    }

    /// APPROVED or PLANNED -> INITIAL, dropping the plan.
    ///
    /// Refused while any step is RUNNING. Units still held by other steps
    /// are disposed before their rows go.
    pub async fn reset(&self, order_id: &str) -> Result<ProcessingOrder> {
        let order = self.load(order_id).await?;
        resettable(&order)?;

        let jobs = self.ctx.persistence.list_jobs(order_id).await?;
        let steps = self.ctx.persistence.list_job_steps(order_id).await?;
        no_running_steps(order_id, &steps)?;
        for step in &steps {
            let (Some(handle), Some(job)) = (
                step.execution_handle.as_deref(),
                jobs.iter().find(|j| j.id == step.job_id),
            ) else {
                continue;
            };
            dispose(&self.ctx, job, handle).await?;
            info!(
                order_id = %order_id,
                job_step_id = %step.id,
                unit = %handle,
                "Execution unit disposed on reset"
            );
        }

        let persistence = self.ctx.persistence.as_ref();
        let order = self
            .ctx
            .retry
            .run("order reset", move || async move {
                let order = load(persistence, order_id).await?;
                resettable(&order)?;
                no_running_steps(order_id, &persistence.list_job_steps(order_id).await?)?;

                let mut next = order.transition(OrderState::Initial)?;
                next.clear_diagnostic();
                persistence.discard_plan(&next).await
            })
            .await?;

        info!(order_id = %order.id, "Order reset");
        Ok(order)
    }

    /// APPROVED -> PLANNED, storing the jobs and job steps.
    ///
    /// A plan that cannot be built moves the order to FAILED with a
    /// diagnostic and returns the planning error.
    pub async fn plan(&self, order_id: &str) -> Result<ProcessingOrder> {
        let persistence = self.ctx.persistence.as_ref();
        let catalog = self.ctx.catalog.as_ref();

        let outcome = self
            .ctx
            .retry
            .run("order planning", move || async move {
                let order = load(persistence, order_id).await?;
                if order.state != OrderState::Approved {
                    return Err(CoreError::invalid_transition(
                        "order",
                        order_id,
                        order.state,
                        OrderState::Planned,
                    ));
                }

                match decompose(&order, catalog, Utc::now()) {
                    Ok(plan) => {
                        let planned = order.transition(OrderState::Planned)?;
                        let stored = persistence.store_plan(&planned, &plan).await?;
                        Ok(Planning::Planned(stored))
                    }
                    Err(e) => {
                        let mut failed = order.transition(OrderState::Failed)?;
                        failed.set_diagnostic(&Diagnostic::from_error(&e));
                        let stored = persistence.update_order(&failed).await?;
                        Ok(Planning::Rejected(stored, e))
                    }
                }
            })
            .await?;

        match outcome {
            Planning::Planned(order) => {
                info!(order_id = %order.id, "Order planned");
                order_machine::record_progress(&self.ctx, &order).await?;
                Ok(order)
            }
            Planning::Rejected(order, e) => {
                warn!(order_id = %order.id, error = %e, "Order could not be planned");
                if let Some(diagnostic) = order.diagnostic() {
                    self.ctx.notifier.order_failed(&order, &diagnostic).await;
                }
                Err(e.into())
            }
        }
    }

    /// PLANNED -> RELEASED. The dispatch loop takes over from here.
    pub async fn release(&self, order_id: &str) -> Result<ProcessingOrder> {
        self.transition(order_id, OrderState::Released).await
    }

    /// RELEASED or RUNNING -> SUSPENDING. No unit is submitted from here
    /// on. Running steps finish, and the next dispatch cycle that finds
    /// none left moves the order back to PLANNED.
    pub async fn suspend(&self, order_id: &str) -> Result<ProcessingOrder> {
        self.transition(order_id, OrderState::Suspending).await
    }

    /// PLANNED -> RELEASED for a suspended order.
    pub async fn resume(&self, order_id: &str) -> Result<ProcessingOrder> {
        let steps = self.ctx.persistence.list_job_steps(order_id).await?;
        if steps.is_empty() {
            return Err(CoreError::ValidationError {
                field: "order".to_string(),
                message: format!("order {} has no plan to resume", order_id),
            }
            .into());
        }
        self.transition(order_id, OrderState::Released).await
    }

    /// Forced stop: fail the order, then dispose running units and fail
    /// every unfinished step.
    ///
    /// The order moves first, so no dispatcher can record a new RUNNING
    /// step once the step list below has been read.
    pub async fn cancel(&self, order_id: &str) -> Result<ProcessingOrder> {
        let cancelled = Diagnostic::new(
            ErrorKind::Validation,
            "ORDER_CANCELLED",
            "order cancelled by operator",
        );
        let order = self
            .update(order_id, |order| {
                let mut next = order.transition(OrderState::Failed)?;
                next.set_diagnostic(&cancelled);
                Ok(next)
            })
            .await?;

        let jobs = self.ctx.persistence.list_jobs(order_id).await?;
        let steps = self.ctx.persistence.list_job_steps(order_id).await?;
        for step in steps.iter().filter(|s| !is_finished(s)) {
            let Some(job) = jobs.iter().find(|j| j.id == step.job_id) else {
                continue;
            };
            if let Some(handle) = step.execution_handle.as_deref() {
                dispose(&self.ctx, job, handle).await?;
            }

            let diagnostic = cancelled.clone().for_job_step(step.id.clone());
            let at = Utc::now();
            write_step(&self.ctx, &step.id, step.state, |s| {
                let mut next = if s.state == JobStepState::Failed {
                    s.clone()
                } else {
                    s.apply(StepTransition::Failed {
                        diagnostic: diagnostic.clone(),
                        at,
                    })?
                };
                next.set_diagnostic(&diagnostic);
                Ok(next.without_handle())
            })
            .await?;
        }

        order_machine::sync_jobs(&self.ctx, order_id).await?;
        order_machine::record_progress(&self.ctx, &order).await?;

        info!(order_id = %order.id, "Order cancelled");
        Ok(order)
    }

    /// FAILED -> PLANNED with a fresh attempt budget for every failed step.
    pub async fn retry(&self, order_id: &str) -> Result<ProcessingOrder> {
        let order = self.load(order_id).await?;
        if order.state != OrderState::Failed {
            return Err(CoreError::invalid_transition(
                "order",
                order_id,
                order.state,
                OrderState::Planned,
            )
            .into());
        }

        let steps = self.ctx.persistence.list_job_steps(order_id).await?;
        if steps.is_empty() {
            return Err(CoreError::ValidationError {
                field: "order".to_string(),
                message: format!("order {} was never planned", order_id),
            }
            .into());
        }

        for step in steps.iter().filter(|s| s.state == JobStepState::Failed) {
            write_step(&self.ctx, &step.id, JobStepState::Failed, |s| s.restart()).await?;
        }

        let order = self
            .update(order_id, |order| {
                let mut next = order.transition(OrderState::Planned)?;
                next.clear_diagnostic();
                Ok(next)
            })
            .await?;
        order_machine::sync_jobs(&self.ctx, order_id).await?;

        info!(order_id = %order.id, "Order reset for retry");
        Ok(order)
    }

    /// COMPLETED or FAILED -> CLOSED. All steps are closed and the order is
    /// scheduled for eviction.
    pub async fn close(&self, order_id: &str) -> Result<ProcessingOrder> {
        let order = self.load(order_id).await?;
        if !order.state.can_transition_to(OrderState::Closed) {
            return Err(CoreError::invalid_transition(
                "order",
                order_id,
                order.state,
                OrderState::Closed,
            )
            .into());
        }

        let jobs = self.ctx.persistence.list_jobs(order_id).await?;
        let steps = self.ctx.persistence.list_job_steps(order_id).await?;
        for step in steps.iter().filter(|s| s.state != JobStepState::Closed) {
            if let Some(job) = jobs.iter().find(|j| j.id == step.job_id) {
                if let Some(handle) = step.execution_handle.as_deref() {
                    dispose(&self.ctx, job, handle).await?;
                }
                if step.state == JobStepState::Completed {
                    self.ctx.ingestor.register_outputs(&order, job, step).await?;
                }
            }
            write_step(&self.ctx, &step.id, step.state, |s| {
                s.apply(StepTransition::Close)
            })
            .await?;
        }

        let retention = chrono::Duration::from_std(self.ctx.settings.order_retention)
            .unwrap_or_else(|_| chrono::Duration::days(30));
        let eviction_time = Utc::now() + retention;
        let order = self
            .update(order_id, |order| order.close(eviction_time))
            .await?;
        order_machine::sync_jobs(&self.ctx, order_id).await?;

        info!(order_id = %order.id, eviction_time = %eviction_time, "Order closed");
        Ok(order)
    }

    /// Apply a completion report sent by a processor for a running step.
    ///
    /// A success report for a step that already finished successfully is
    /// accepted and changes nothing.
    pub async fn record_callback(
        &self,
        job_step_id: &str,
        success: bool,
        message: Option<&str>,
    ) -> Result<JobStep> {
        let step = self
            .ctx
            .persistence
            .get_job_step(job_step_id)
            .await?
            .ok_or_else(|| CoreError::JobStepNotFound {
                job_step_id: job_step_id.to_string(),
            })?;

        match step.state {
            JobStepState::Running => {}
            JobStepState::Completed | JobStepState::Closed if success => return Ok(step),
            state => {
                let to = if success {
                    JobStepState::Completed
                } else {
                    JobStepState::Failed
                };
                return Err(CoreError::invalid_transition("job step", job_step_id, state, to).into());
            }
        }

        let order = self.load(&step.order_id).await?;
        let jobs = self.ctx.persistence.list_jobs(&step.order_id).await?;
        let job = jobs
            .iter()
            .find(|j| j.id == step.job_id)
            .ok_or_else(|| CoreError::JobNotFound {
                job_id: step.job_id.clone(),
            })?;

        let outcome = job_step_machine::report(&self.ctx, &order, job, &step, success, message).await?;
        if outcome != StepOutcome::Unchanged {
            order_machine::refresh(&self.ctx, &order.id).await?;
        }

        let step = self
            .ctx
            .persistence
            .get_job_step(job_step_id)
            .await?
            .ok_or_else(|| CoreError::JobStepNotFound {
                job_step_id: job_step_id.to_string(),
            })?;
        Ok(step)
    }

    async fn load(&self, order_id: &str) -> Result<ProcessingOrder> {
        Ok(load(self.ctx.persistence.as_ref(), order_id).await?)
    }

    async fn transition(&self, order_id: &str, to: OrderState) -> Result<ProcessingOrder> {
        let order = self.update(order_id, |order| order.transition(to)).await?;
        info!(order_id = %order.id, state = %order.state, "Order state changed");
        if to != OrderState::Approved {
            order_machine::record_progress(&self.ctx, &order).await?;
        }
        Ok(order)
    }

    /// Versioned read-modify-write of an order.
    async fn update<F>(&self, order_id: &str, change: F) -> Result<ProcessingOrder>
    where
        F: Fn(&ProcessingOrder) -> CoreResult<ProcessingOrder> + Send + Sync,
    {
        let persistence = self.ctx.persistence.as_ref();
        let change = &change;
        let order = self
            .ctx
            .retry
            .run("order update", move || async move {
                let order = load(persistence, order_id).await?;
                let next = change(&order)?;
                persistence.update_order(&next).await
            })
            .await?;
        Ok(order)
    }
}

async fn load(
    persistence: &dyn groundseg_core::Persistence,
    order_id: &str,
) -> CoreResult<ProcessingOrder> {
    persistence
        .get_order(order_id)
        .await?
        .ok_or_else(|| CoreError::OrderNotFound {
            order_id: order_id.to_string(),
        })
}

fn resettable(order: &ProcessingOrder) -> CoreResult<()> {
    if matches!(order.state, OrderState::Approved | OrderState::Planned) {
        Ok(())
    } else {
        Err(CoreError::invalid_transition(
            "order",
            &order.id,
            order.state,
            OrderState::Initial,
        ))
    }
}

fn no_running_steps(order_id: &str, steps: &[JobStep]) -> CoreResult<()> {
    match steps.iter().find(|s| s.state == JobStepState::Running) {
        Some(running) => Err(CoreError::ValidationError {
            field: "order".to_string(),
            message: format!(
                "order {} cannot be reset while job step {} is running",
                order_id, running.id
            ),
        }),
        None => Ok(()),
    }
}

fn is_finished(step: &JobStep) -> bool {
    matches!(step.state, JobStepState::Completed | JobStepState::Closed)
        || step.is_permanently_failed()
}
