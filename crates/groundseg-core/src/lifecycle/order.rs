// Copyright (C) 2025 The groundseg Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Order transitions and aggregation of job step states.

use chrono::{DateTime, Utc};

use crate::error::{CoreError, Diagnostic, ErrorKind, Result};
use crate::model::{JobState, JobStep, JobStepState, OrderState, ProcessingOrder, StepCounts};

impl ProcessingOrder {
    /// Move to `to` if the order lifecycle allows it.
    pub fn transition(&self, to: OrderState) -> Result<ProcessingOrder> {
        if !self.state.can_transition_to(to) {
            return Err(CoreError::invalid_transition("order", &self.id, self.state, to));
        }
        let mut next = self.clone();
        next.state = to;
        Ok(next)
    }

    /// Close the order and schedule it for eviction.
    pub fn close(&self, eviction_time: DateTime<Utc>) -> Result<ProcessingOrder> {
        let mut next = self.transition(OrderState::Closed)?;
        next.eviction_time = Some(eviction_time);
        Ok(next)
    }
}

/// Snapshot of an order's job steps, used to derive the order state.
#[derive(Debug, Clone)]
pub struct OrderAssessment {
    pub counts: StepCounts,
    /// Failed steps that will not be retried.
    pub permanent_failures: i64,
    /// Diagnostic of the first permanent failure, or of the first
    /// configuration failure when there is one.
    pub first_failure: Option<Diagnostic>,
    /// A step failed on a configuration error. Such an order fails whatever
    /// its partial-failure setting.
    pub fatal: bool,
}

impl OrderAssessment {
    pub fn of(steps: &[JobStep]) -> Self {
        let counts = StepCounts::from_steps(steps);
        let mut permanent_failures = 0;
        let mut first_failure = None;
        let mut fatal = false;
        for step in steps.iter().filter(|s| s.is_permanently_failed()) {
            permanent_failures += 1;
            let diagnostic = step.diagnostic().unwrap_or_else(|| {
                Diagnostic::new(ErrorKind::Execution, "JOB_STEP_FAILED", "job step failed")
                    .for_job_step(step.id.clone())
            });
            if diagnostic.kind == ErrorKind::Configuration && !fatal {
                fatal = true;
                first_failure = Some(diagnostic);
            } else if first_failure.is_none() {
                first_failure = Some(diagnostic);
            }
        }
        Self {
            counts,
            permanent_failures,
            first_failure,
            fatal,
        }
    }

    fn in_flight(&self) -> bool {
        self.counts.running > 0
    }

    /// Every step has reached an end: closed or permanently failed.
    fn settled(&self) -> bool {
        self.counts.total() == self.counts.closed + self.permanent_failures
    }

    fn blocked(&self, order: &ProcessingOrder) -> bool {
        self.permanent_failures > 0 && (self.fatal || !order.tolerate_partial_failure)
    }

    fn succeeded(&self, order: &ProcessingOrder) -> bool {
        self.permanent_failures == 0
            || (order.tolerate_partial_failure && !self.fatal && self.counts.closed > 0)
    }

    /// Whether READY steps of the order may be submitted.
    pub fn accepts_submissions(&self, order: &ProcessingOrder) -> bool {
        matches!(order.state, OrderState::Released | OrderState::Running) && !self.blocked(order)
    }

    /// State the order should move to, or `None` to stay.
    pub fn target_state(&self, order: &ProcessingOrder) -> Option<OrderState> {
        let target = match order.state {
            OrderState::Released | OrderState::Running => {
                if self.settled() {
                    if self.succeeded(order) {
                        OrderState::Completed
                    } else {
                        OrderState::Failed
                    }
                } else if self.blocked(order) && !self.in_flight() {
                    OrderState::Failed
                } else if self.in_flight()
                    || self.counts.ready > 0
                    || self.counts.completed > 0
                    || self.counts.closed > 0
                    || self.counts.failed > 0
                {
                    OrderState::Running
                } else {
                    order.state
                }
            }
            OrderState::Suspending => {
                if self.in_flight() {
                    OrderState::Suspending
                } else if self.settled() && self.succeeded(order) {
                    OrderState::Completed
                } else if self.blocked(order) || self.settled() {
                    OrderState::Failed
                } else {
                    OrderState::Planned
                }
            }
            _ => order.state,
        };
        (target != order.state).then_some(target)
    }
}

/// Job state derived from its steps.
pub fn derive_job_state<'a>(steps: impl IntoIterator<Item = &'a JobStep>) -> JobState {
    let steps: Vec<&JobStep> = steps.into_iter().collect();
    let all = |pred: &dyn Fn(&JobStep) -> bool| steps.iter().all(|s| pred(s));
    let any = |state: JobStepState| steps.iter().any(|s| s.state == state);

    if steps.is_empty() {
        JobStepState::Initial
    } else if all(&|s| s.state == JobStepState::Closed) {
        JobStepState::Closed
    } else if steps.iter().any(|s| s.is_permanently_failed()) {
        JobStepState::Failed
    } else if all(&|s| matches!(s.state, JobStepState::Completed | JobStepState::Closed)) {
        JobStepState::Completed
    } else if any(JobStepState::Running) {
        JobStepState::Running
    } else if any(JobStepState::Ready) || any(JobStepState::Failed) {
        JobStepState::Ready
    } else if any(JobStepState::WaitingInput) {
        JobStepState::WaitingInput
    } else {
        JobStepState::Initial
    }
}
