// Copyright (C) 2025 The groundseg Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! State machines for job steps and orders.
//!
//! Everything here is pure. Persisting a transition and running its side
//! effects is the job of the planner, which only acts once its versioned
//! write has won.

mod job_step;
mod order;

pub use job_step::StepTransition;
pub use order::{OrderAssessment, derive_job_state};
