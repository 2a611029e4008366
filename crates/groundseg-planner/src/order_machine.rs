// Copyright (C) 2025 The groundseg Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Order state machine driver.
//!
//! Derives job and order states from the job steps, persists changes with
//! versioned writes and appends a progress snapshot whenever the order
//! state or its step figures differ from the last snapshot.

use chrono::Utc;
use groundseg_core::error::Result as CoreResult;
use groundseg_core::lifecycle::{OrderAssessment, derive_job_state};
use groundseg_core::{CoreError, OrderState, ProcessingOrder};
use tracing::{debug, info};

use crate::context::PlannerContext;
use crate::error::Result;

/// Stored order, the state it was read in and, for an active order, the
/// step assessment behind the refresh.
type Refreshed = (ProcessingOrder, OrderState, Option<OrderAssessment>);

/// Bring the jobs and the state of an active order in line with its steps.
///
/// Returns the order as stored after the call.
pub async fn refresh(ctx: &PlannerContext, order_id: &str) -> Result<ProcessingOrder> {
    sync_jobs(ctx, order_id).await?;

    let persistence = ctx.persistence.as_ref();
    let (order, from, assessment): Refreshed = ctx
        .retry
        .run("order state refresh", move || async move {
            let order = persistence
                .get_order(order_id)
                .await?
                .ok_or_else(|| CoreError::OrderNotFound {
                    order_id: order_id.to_string(),
                })?;
            let from = order.state;
            if !from.is_active() {
                return Ok((order, from, None));
            }

            let steps = persistence.list_job_steps(order_id).await?;
            let assessment = OrderAssessment::of(&steps);
            let Some(target) = assessment.target_state(&order) else {
                return Ok((order, from, Some(assessment)));
            };

            let mut next = order.transition(target)?;
            match target {
                OrderState::Failed => {
                    if let Some(diagnostic) = &assessment.first_failure {
                        next.set_diagnostic(diagnostic);
                    }
                }
                OrderState::Completed => next.clear_diagnostic(),
                _ => {}
            }
            let stored = persistence.update_order(&next).await?;
            Ok((stored, from, Some(assessment)))
        })
        .await?;

    let Some(assessment) = assessment else {
        return Ok(order);
    };

    if order.state != from {
        info!(
            order_id = %order.id,
            from = %from,
            to = %order.state,
            "Order state changed"
        );

        if order.state == OrderState::Failed {
            if let Some(diagnostic) = order.diagnostic() {
                ctx.notifier.order_failed(&order, &diagnostic).await;
            }
        }
    }

    let snapshot = assessment
        .counts
        .snapshot(&order.id, order.state, Utc::now());
    let latest = ctx.persistence.latest_progress(&order.id).await?;
    if latest.is_none_or(|last| !last.same_figures(&snapshot)) {
        ctx.persistence.append_progress(&snapshot).await?;
    }
    Ok(order)
}

/// Update every job whose derived state differs from the stored one.
pub async fn sync_jobs(ctx: &PlannerContext, order_id: &str) -> Result<usize> {
    let persistence = ctx.persistence.as_ref();
    let updated = ctx
        .retry
        .run("job state refresh", move || async move {
            let jobs = persistence.list_jobs(order_id).await?;
            let steps = persistence.list_job_steps(order_id).await?;

            let mut updated = 0;
            for job in jobs {
                let derived = derive_job_state(steps.iter().filter(|s| s.job_id == job.id));
                if derived == job.state {
                    continue;
                }
                let mut next = job.clone();
                next.state = derived;
                persistence.update_job(&next).await?;
                debug!(job_id = %job.id, from = %job.state, to = %derived, "Job state changed");
                updated += 1;
            }
            CoreResult::Ok(updated)
        })
        .await?;
    Ok(updated)
}

/// Append a progress snapshot of the order as it is now.
pub async fn record_progress(ctx: &PlannerContext, order: &ProcessingOrder) -> Result<()> {
    let counts = ctx.persistence.count_job_steps(&order.id).await?;
    let snapshot = counts.snapshot(&order.id, order.state, Utc::now());
    ctx.persistence.append_progress(&snapshot).await?;
    Ok(())
}
