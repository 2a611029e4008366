// Copyright (C) 2025 The groundseg Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job step transitions.
//!
//! Transitions are computed on a copy of the step; the caller persists the
//! copy with a version check and only then runs the side effects bound to
//! the new state.

use chrono::{DateTime, Utc};

use crate::error::{CoreError, Diagnostic, Result};
use crate::model::{JobStep, JobStepState};

/// A requested change of a job step.
#[derive(Debug, Clone, PartialEq)]
pub enum StepTransition {
    /// Mandatory inputs are not yet available.
    AwaitInputs,
    /// All mandatory inputs resolved.
    InputsResolved { input_products: Vec<String> },
    /// The execution unit was accepted by the facility.
    Dispatched {
        handle: String,
        joborder_location: String,
        at: DateTime<Utc>,
    },
    Succeeded { at: DateTime<Utc> },
    Failed {
        diagnostic: Diagnostic,
        at: DateTime<Utc>,
    },
    Close,
}

impl StepTransition {
    pub fn target(&self) -> JobStepState {
        match self {
            Self::AwaitInputs => JobStepState::WaitingInput,
            Self::InputsResolved { .. } => JobStepState::Ready,
            Self::Dispatched { .. } => JobStepState::Running,
            Self::Succeeded { .. } => JobStepState::Completed,
            Self::Failed { .. } => JobStepState::Failed,
            Self::Close => JobStepState::Closed,
        }
    }
}

impl JobStep {
    /// Apply a forward transition.
    pub fn apply(&self, transition: StepTransition) -> Result<JobStep> {
        let target = transition.target();
        if !self.state.can_transition_to(target) {
            return Err(CoreError::invalid_transition(
                "job step",
                &self.id,
                self.state,
                target,
            ));
        }

        let mut next = self.clone();
        next.state = target;
        match transition {
            StepTransition::AwaitInputs => {}
            StepTransition::InputsResolved { input_products } => {
                next.input_products = input_products;
            }
            StepTransition::Dispatched {
                handle,
                joborder_location,
                at,
            } => {
                next.execution_handle = Some(handle);
                next.joborder_location = Some(joborder_location);
                next.started_at = Some(at);
                next.finished_at = None;
                next.clear_diagnostic();
            }
            StepTransition::Succeeded { at } => {
                next.finished_at = Some(at);
                next.clear_diagnostic();
            }
            StepTransition::Failed { diagnostic, at } => {
                next.finished_at = Some(at);
                next.set_diagnostic(&diagnostic);
            }
            StepTransition::Close => {
                next.execution_handle = None;
            }
        }
        Ok(next)
    }

    /// `FAILED -> READY`, consuming one attempt from the budget.
    pub fn retry(&self) -> Result<JobStep> {
        if self.state != JobStepState::Failed {
            return Err(CoreError::invalid_transition(
                "job step",
                &self.id,
                self.state,
                JobStepState::Ready,
            ));
        }
        if self.is_permanently_failed() {
            return Err(CoreError::ValidationError {
                field: "retry_count".to_string(),
                message: format!(
                    "job step {} has no attempts left ({} of {})",
                    self.id,
                    self.attempt(),
                    self.max_attempts
                ),
            });
        }

        let mut next = self.clone();
        next.state = JobStepState::Ready;
        next.retry_count += 1;
        next.execution_handle = None;
        next.started_at = None;
        next.finished_at = None;
        Ok(next)
    }

    /// `FAILED -> READY` with a fresh attempt budget, for an order-level retry.
    pub fn restart(&self) -> Result<JobStep> {
        if self.state != JobStepState::Failed {
            return Err(CoreError::invalid_transition(
                "job step",
                &self.id,
                self.state,
                JobStepState::Ready,
            ));
        }
        let mut next = self.clone();
        next.state = JobStepState::Ready;
        next.retry_count = 0;
        next.execution_handle = None;
        next.started_at = None;
        next.finished_at = None;
        next.clear_diagnostic();
        Ok(next)
    }

    /// Forget the execution unit after it was disposed.
    pub fn without_handle(&self) -> JobStep {
        let mut next = self.clone();
        next.execution_handle = None;
        next
    }
}
