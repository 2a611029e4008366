// Copyright (C) 2025 The groundseg Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job step state machine driver.
//!
//! Moves one job step forward per call, depending on its current state:
//!
//! | State | Action |
//! |-------|--------|
//! | INITIAL, WAITING_INPUT | Resolve inputs, move to WAITING_INPUT or READY |
//! | READY | Store the job order, submit the execution unit, move to RUNNING while the order still accepts submissions |
//! | RUNNING | Poll the unit, move to COMPLETED or FAILED |
//! | COMPLETED | Dispose the unit, register outputs, move to CLOSED |
//! | FAILED | Dispose the unit, move back to READY while attempts are left |
//!
//! Every write is a versioned update of a freshly read row, replayed by the
//! retry coordinator on conflict. If the re-read row is no longer in the
//! state this driver acted on, another writer got there first and the
//! call ends without side effects. Side effects bound to a new state run
//! only after the write that entered it has landed.

use chrono::{DateTime, Utc};
use groundseg_core::error::Result as CoreResult;
use groundseg_core::joborder::JobOrderInput;
use groundseg_core::lifecycle::StepTransition;
use groundseg_core::selection::InputResolution;
use groundseg_core::{
    CoreError, Diagnostic, ErrorKind, Job, JobStep, JobStepState, OrderState, ProcessingOrder,
};
use tracing::{debug, info, warn};

use crate::context::PlannerContext;
use crate::error::Result;
use crate::gateway::{ExecutionStatus, GatewayError, SubmitRequest, execution_unit_name, with_timeout};

/// Result of one [`advance`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// The step is now in this state.
    Advanced(JobStepState),
    /// Nothing happened, the step waits for the next cycle.
    Unchanged,
}

/// Drive `step` one step further.
///
/// READY steps are only submitted when `accepts_submissions` is set; the
/// caller derives it from the order state.
pub async fn advance(
    ctx: &PlannerContext,
    order: &ProcessingOrder,
    job: &Job,
    step: &JobStep,
    accepts_submissions: bool,
) -> Result<StepOutcome> {
    match step.state {
        JobStepState::Initial | JobStepState::WaitingInput => {
            check_inputs(ctx, order, job, step).await
        }
        JobStepState::Ready if accepts_submissions => dispatch(ctx, order, job, step).await,
        JobStepState::Running => poll(ctx, order, job, step).await,
        JobStepState::Completed => finish_completed(ctx, order, job, step).await,
        JobStepState::Failed => settle_failed(ctx, job, step).await,
        JobStepState::Ready | JobStepState::Closed => Ok(StepOutcome::Unchanged),
    }
}

/// Apply a completion report for a RUNNING step, as sent by the processor
/// through the callback endpoint.
pub(crate) async fn report(
    ctx: &PlannerContext,
    order: &ProcessingOrder,
    job: &Job,
    step: &JobStep,
    success: bool,
    message: Option<&str>,
) -> Result<StepOutcome> {
    if success {
        complete(ctx, order, job, step).await
    } else {
        let diagnostic = Diagnostic::new(
            ErrorKind::Execution,
            "PROCESSOR_FAILED",
            message.unwrap_or("processor reported failure"),
        );
        fail_running(ctx, order, job, step, diagnostic).await
    }
}

/// Versioned write of `change` applied to the current row of `step_id`.
///
/// Returns `None` when the row has left `expected` in the meantime.
pub(crate) async fn write_step<F>(
    ctx: &PlannerContext,
    step_id: &str,
    expected: JobStepState,
    change: F,
) -> Result<Option<JobStep>>
where
    F: Fn(&JobStep) -> CoreResult<JobStep> + Send + Sync,
{
    let persistence = ctx.persistence.as_ref();
    let change = &change;

    let written = ctx
        .retry
        .run("job step transition", move || async move {
            let current = persistence.get_job_step(step_id).await?.ok_or_else(|| {
                CoreError::JobStepNotFound {
                    job_step_id: step_id.to_string(),
                }
            })?;
            if current.state != expected {
                return Ok(None);
            }
            let next = change(&current)?;
            persistence.update_job_step(&next).await.map(Some)
        })
        .await?;
    Ok(written)
}

/// Dispose an execution unit on the job's facility.
pub(crate) async fn dispose(ctx: &PlannerContext, job: &Job, handle: &str) -> Result<()> {
    let facility = ctx.facilities.require(&job.facility)?;
    with_timeout(ctx.settings.gateway_timeout, facility.gateway.dispose(handle)).await?;
    Ok(())
}

// ============================================================================
// Input resolution
// ============================================================================

async fn check_inputs(
    ctx: &PlannerContext,
    order: &ProcessingOrder,
    job: &Job,
    step: &JobStep,
) -> Result<StepOutcome> {
    let rules = match ctx.catalog.selection_rules(&step.product_class) {
        Ok(rules) => rules,
        Err(e) => return fail_step(ctx, order, step, Diagnostic::from_error(&e)).await,
    };

    let resolution = ctx
        .evaluator
        .resolve_all(&order.mission_code, &job.sensing_window(), &rules)
        .await?;

    match resolution {
        InputResolution::Satisfied(products) => {
            let input_products: Vec<String> = products.into_iter().map(|p| p.id).collect();
            let written = write_step(ctx, &step.id, step.state, |s| {
                s.apply(StepTransition::InputsResolved {
                    input_products: input_products.clone(),
                })
            })
            .await?;

            Ok(match written {
                Some(_) => {
                    debug!(
                        job_step_id = %step.id,
                        inputs = input_products.len(),
                        "Job step inputs resolved"
                    );
                    StepOutcome::Advanced(JobStepState::Ready)
                }
                None => StepOutcome::Unchanged,
            })
        }
        InputResolution::Unsatisfied(missing) => {
            debug!(
                job_step_id = %step.id,
                missing = ?missing,
                "Job step waiting for inputs"
            );
            if step.state != JobStepState::Initial {
                return Ok(StepOutcome::Unchanged);
            }
            let written = write_step(ctx, &step.id, JobStepState::Initial, |s| {
                s.apply(StepTransition::AwaitInputs)
            })
            .await?;
            Ok(match written {
                Some(_) => StepOutcome::Advanced(JobStepState::WaitingInput),
                None => StepOutcome::Unchanged,
            })
        }
    }
}

// ============================================================================
// Submission
// ============================================================================

/// How a submitted unit ended up on its step.
enum Recording {
    /// The step is RUNNING on the unit.
    Running(JobStep),
    /// Another writer moved the step first. Holds the current row.
    Moved(JobStep),
    /// The order stopped accepting submissions.
    Refused,
}

async fn dispatch(
    ctx: &PlannerContext,
    order: &ProcessingOrder,
    job: &Job,
    step: &JobStep,
) -> Result<StepOutcome> {
    // The cycle read the order before any step ran; it may have been
    // suspended or cancelled since.
    if !still_accepting(ctx, &order.id).await? {
        debug!(order_id = %order.id, job_step_id = %step.id, "Order no longer accepts submissions");
        return Ok(StepOutcome::Unchanged);
    }

    let (handle, location) = match submit(ctx, order, job, step).await {
        Ok(submitted) => submitted,
        Err(e) if e.is_transient() => return Err(e),
        Err(e) => return fail_step(ctx, order, step, e.diagnostic()).await,
    };

    let at = Utc::now();
    match record_dispatch(ctx, &step.id, &handle, &location, at).await? {
        Recording::Running(running) => {
            info!(
                order_id = %order.id,
                job_step_id = %step.id,
                facility = %job.facility,
                unit = %handle,
                attempt = running.attempt(),
                "Job step dispatched"
            );
            Ok(StepOutcome::Advanced(JobStepState::Running))
        }
        // The unit name is derived from step and attempt, so a concurrent
        // dispatcher submitted the very same unit.
        Recording::Moved(current)
            if current.execution_handle.as_deref() == Some(handle.as_str()) =>
        {
            debug!(job_step_id = %step.id, unit = %handle, "Job step dispatched concurrently");
            Ok(StepOutcome::Unchanged)
        }
        Recording::Moved(_) | Recording::Refused => {
            dispose(ctx, job, &handle).await?;
            info!(
                order_id = %order.id,
                job_step_id = %step.id,
                unit = %handle,
                "Submission withdrawn, job step is no longer dispatchable"
            );
            Ok(StepOutcome::Unchanged)
        }
    }
}

async fn still_accepting(ctx: &PlannerContext, order_id: &str) -> Result<bool> {
    let order = ctx
        .persistence
        .get_order(order_id)
        .await?
        .ok_or_else(|| CoreError::OrderNotFound {
            order_id: order_id.to_string(),
        })?;
    Ok(OrderState::ACCEPTING.contains(&order.state))
}

/// READY -> RUNNING on `handle`, written only while the order is RELEASED
/// or RUNNING.
async fn record_dispatch(
    ctx: &PlannerContext,
    step_id: &str,
    handle: &str,
    location: &str,
    at: DateTime<Utc>,
) -> Result<Recording> {
    let persistence = ctx.persistence.as_ref();

    let recording = ctx
        .retry
        .run("job step dispatch", move || async move {
            let current = persistence.get_job_step(step_id).await?.ok_or_else(|| {
                CoreError::JobStepNotFound {
                    job_step_id: step_id.to_string(),
                }
            })?;
            if current.state != JobStepState::Ready {
                return Ok(Recording::Moved(current));
            }
            let next = current.apply(StepTransition::Dispatched {
                handle: handle.to_string(),
                joborder_location: location.to_string(),
                at,
            })?;
            Ok(
                match persistence
                    .update_job_step_guarded(&next, &OrderState::ACCEPTING)
                    .await?
                {
                    Some(running) => Recording::Running(running),
                    None => Recording::Refused,
                },
            )
        })
        .await?;
    Ok(recording)
}

/// Store the job order and create the execution unit. Returns the unit
/// handle and the job order location.
async fn submit(
    ctx: &PlannerContext,
    order: &ProcessingOrder,
    job: &Job,
    step: &JobStep,
) -> Result<(String, String)> {
    let facility = ctx.facilities.require(&job.facility)?;
    let processor = ctx
        .catalog
        .processor(&step.processor)
        .ok_or_else(|| CoreError::Configuration {
            context: format!("job step {}", step.id),
            message: format!("unknown processor '{}'", step.processor),
        })?;

    let products = ctx.persistence.get_products(&step.input_products).await?;
    if products.len() != step.input_products.len() {
        warn!(
            job_step_id = %step.id,
            expected = step.input_products.len(),
            found = products.len(),
            "Some resolved inputs are no longer catalogued"
        );
    }

    let joborder = ctx.joborders.build(&JobOrderInput {
        order,
        job,
        step,
        processor,
        inputs: products
            .iter()
            .map(|p| (p, ctx.storage.product_path(p)))
            .collect(),
        output_directory: ctx
            .storage
            .output_directory(&job.facility, &step.product_class),
    })?;
    let xml = joborder.to_xml()?;

    let attempt = step.attempt();
    let location = ctx
        .storage
        .put_descriptor(
            &job.facility,
            &format!("{}-{}.xml", step.id, attempt),
            xml.as_bytes(),
        )
        .await?;

    let request = SubmitRequest {
        job_step_id: step.id.clone(),
        attempt,
        unit_name: execution_unit_name(&step.id, attempt),
        image: processor.image.clone(),
        command: processor.command.clone(),
        joborder_location: location.clone(),
        env: facility.config.execution_env(
            &step.id,
            &location,
            ctx.settings.callback_url.as_deref(),
        ),
    };

    let handle = with_timeout(ctx.settings.gateway_timeout, facility.gateway.submit(&request)).await?;
    Ok((handle, location))
}

// ============================================================================
// Execution tracking
// ============================================================================

async fn poll(
    ctx: &PlannerContext,
    order: &ProcessingOrder,
    job: &Job,
    step: &JobStep,
) -> Result<StepOutcome> {
    let Some(handle) = step.execution_handle.as_deref() else {
        let lost = GatewayError::NotFound(format!("(no handle for job step {})", step.id));
        return fail_running(ctx, order, job, step, lost.diagnostic()).await;
    };

    let facility = ctx.facilities.require(&job.facility)?;
    match with_timeout(ctx.settings.gateway_timeout, facility.gateway.poll(handle)).await {
        Ok(ExecutionStatus::Succeeded) => complete(ctx, order, job, step).await,
        Ok(ExecutionStatus::Failed { reason }) => {
            let diagnostic = Diagnostic::new(ErrorKind::Execution, "PROCESSOR_FAILED", reason);
            fail_running(ctx, order, job, step, diagnostic).await
        }
        Ok(ExecutionStatus::Pending | ExecutionStatus::Running) => Ok(StepOutcome::Unchanged),
        Err(e @ GatewayError::NotFound(_)) => {
            fail_running(ctx, order, job, step, e.diagnostic()).await
        }
        Err(e) => Err(e.into()),
    }
}

async fn complete(
    ctx: &PlannerContext,
    order: &ProcessingOrder,
    job: &Job,
    step: &JobStep,
) -> Result<StepOutcome> {
    let at = Utc::now();
    let Some(completed) = write_step(ctx, &step.id, JobStepState::Running, |s| {
        s.apply(StepTransition::Succeeded { at })
    })
    .await?
    else {
        return Ok(StepOutcome::Unchanged);
    };

    info!(
        order_id = %order.id,
        job_step_id = %step.id,
        facility = %job.facility,
        "Job step completed"
    );
    finish_completed(ctx, order, job, &completed).await
}

/// COMPLETED -> CLOSED, after disposal and output registration.
async fn finish_completed(
    ctx: &PlannerContext,
    order: &ProcessingOrder,
    job: &Job,
    step: &JobStep,
) -> Result<StepOutcome> {
    if let Some(handle) = step.execution_handle.as_deref() {
        dispose(ctx, job, handle).await?;
    }

    ctx.ingestor.register_outputs(order, job, step).await?;

    let written = write_step(ctx, &step.id, JobStepState::Completed, |s| {
        s.apply(StepTransition::Close)
    })
    .await?;
    Ok(match written {
        Some(_) => StepOutcome::Advanced(JobStepState::Closed),
        None => StepOutcome::Unchanged,
    })
}

// ============================================================================
// Failure handling
// ============================================================================

/// Persist FAILED with `diagnostic`. Returns the stored step if this call
/// made the transition.
async fn fail(
    ctx: &PlannerContext,
    order: &ProcessingOrder,
    step: &JobStep,
    diagnostic: Diagnostic,
) -> Result<Option<JobStep>> {
    let diagnostic = diagnostic.for_job_step(step.id.clone());
    let at = Utc::now();

    let Some(failed) = write_step(ctx, &step.id, step.state, |s| {
        s.apply(StepTransition::Failed {
            diagnostic: diagnostic.clone(),
            at,
        })
    })
    .await?
    else {
        return Ok(None);
    };

    warn!(
        order_id = %order.id,
        job_step_id = %step.id,
        attempt = failed.attempt(),
        max_attempts = failed.max_attempts,
        code = %diagnostic.code,
        reason = %diagnostic.message,
        "Job step failed"
    );

    if failed.is_permanently_failed() {
        ctx.notifier
            .job_step_exhausted(order, &failed, &diagnostic)
            .await;
    }
    Ok(Some(failed))
}

async fn fail_step(
    ctx: &PlannerContext,
    order: &ProcessingOrder,
    step: &JobStep,
    diagnostic: Diagnostic,
) -> Result<StepOutcome> {
    Ok(match fail(ctx, order, step, diagnostic).await? {
        Some(_) => StepOutcome::Advanced(JobStepState::Failed),
        None => StepOutcome::Unchanged,
    })
}

/// RUNNING -> FAILED, then disposal and a possible new attempt.
async fn fail_running(
    ctx: &PlannerContext,
    order: &ProcessingOrder,
    job: &Job,
    step: &JobStep,
    diagnostic: Diagnostic,
) -> Result<StepOutcome> {
    let Some(failed) = fail(ctx, order, step, diagnostic).await? else {
        return Ok(StepOutcome::Unchanged);
    };

    match settle_failed(ctx, job, &failed).await? {
        StepOutcome::Unchanged => Ok(StepOutcome::Advanced(JobStepState::Failed)),
        retried => Ok(retried),
    }
}

/// Clean up after a FAILED step and schedule the next attempt if the
/// budget allows it.
async fn settle_failed(ctx: &PlannerContext, job: &Job, step: &JobStep) -> Result<StepOutcome> {
    if let Some(handle) = step.execution_handle.as_deref() {
        dispose(ctx, job, handle).await?;
    }

    if step.is_permanently_failed() {
        if step.execution_handle.is_some() {
            write_step(ctx, &step.id, JobStepState::Failed, |s| Ok(s.without_handle())).await?;
        }
        return Ok(StepOutcome::Unchanged);
    }

    let written = write_step(ctx, &step.id, JobStepState::Failed, |s| s.retry()).await?;
    Ok(match written {
        Some(retried) => {
            info!(
                job_step_id = %step.id,
                attempt = retried.attempt(),
                max_attempts = retried.max_attempts,
                "Job step scheduled for another attempt"
            );
            StepOutcome::Advanced(JobStepState::Ready)
        }
        None => StepOutcome::Unchanged,
    })
}
