// Copyright (C) 2025 The groundseg Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Domain records: processing orders, jobs, job steps, products and
//! progress snapshots, together with their lifecycle state enums.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{Diagnostic, ErrorKind};

/// Raised when a state column holds an unknown value.
#[derive(Debug, Clone, Error)]
#[error("unknown {entity} state '{value}'")]
pub struct ParseStateError {
    entity: &'static str,
    value: String,
}

// ============================================================================
// Order state
// ============================================================================

/// Lifecycle state of a processing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderState {
    Initial,
    Approved,
    Planned,
    Released,
    Running,
    Suspending,
    Completed,
    Failed,
    Closed,
}

impl OrderState {
    /// All states, in lifecycle order.
    pub const ALL: [OrderState; 9] = [
        Self::Initial,
        Self::Approved,
        Self::Planned,
        Self::Released,
        Self::Running,
        Self::Suspending,
        Self::Completed,
        Self::Failed,
        Self::Closed,
    ];

    /// States in which the dispatch loop drives the order's job steps.
    pub const ACTIVE: [OrderState; 3] = [Self::Released, Self::Running, Self::Suspending];

    /// States in which READY job steps may be submitted to a cluster.
    pub const ACCEPTING: [OrderState; 2] = [Self::Released, Self::Running];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initial => "INITIAL",
            Self::Approved => "APPROVED",
            Self::Planned => "PLANNED",
            Self::Released => "RELEASED",
            Self::Running => "RUNNING",
            Self::Suspending => "SUSPENDING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Closed => "CLOSED",
        }
    }

    /// Legal successor states.
    pub fn successors(&self) -> &'static [OrderState] {
        use OrderState::*;
        match self {
            Initial => &[Approved],
            Approved => &[Initial, Planned, Failed],
            Planned => &[Initial, Released, Failed],
            Released => &[Planned, Running, Suspending, Completed, Failed],
            Running => &[Suspending, Completed, Failed],
            Suspending => &[Planned, Completed, Failed],
            Completed => &[Closed],
            Failed => &[Planned, Closed],
            Closed => &[],
        }
    }

    pub fn can_transition_to(&self, next: OrderState) -> bool {
        self.successors().contains(&next)
    }

    pub fn is_active(&self) -> bool {
        Self::ACTIVE.contains(self)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

impl fmt::Display for OrderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderState {
    type Err = ParseStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| ParseStateError {
                entity: "order",
                value: s.to_string(),
            })
    }
}

impl TryFrom<String> for OrderState {
    type Error = ParseStateError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

// ============================================================================
// Job step state
// ============================================================================

/// Lifecycle state of a job step. Jobs use the same vocabulary, derived
/// from the states of their steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStepState {
    Initial,
    WaitingInput,
    Ready,
    Running,
    Completed,
    Failed,
    Closed,
}

/// Jobs share the job step vocabulary.
pub type JobState = JobStepState;

impl JobStepState {
    pub const ALL: [JobStepState; 7] = [
        Self::Initial,
        Self::WaitingInput,
        Self::Ready,
        Self::Running,
        Self::Completed,
        Self::Failed,
        Self::Closed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initial => "INITIAL",
            Self::WaitingInput => "WAITING_INPUT",
            Self::Ready => "READY",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Closed => "CLOSED",
        }
    }

    /// Forward transitions. `FAILED -> READY` is deliberately absent: it is
    /// only reachable through an explicit retry.
    pub fn successors(&self) -> &'static [JobStepState] {
        use JobStepState::*;
        match self {
            Initial => &[WaitingInput, Ready, Failed, Closed],
            WaitingInput => &[Ready, Failed, Closed],
            Ready => &[Running, Failed, Closed],
            Running => &[Completed, Failed],
            Completed => &[Closed],
            Failed => &[Closed],
            Closed => &[],
        }
    }

    pub fn can_transition_to(&self, next: JobStepState) -> bool {
        self.successors().contains(&next)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

impl fmt::Display for JobStepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStepState {
    type Err = ParseStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| ParseStateError {
                entity: "job step",
                value: s.to_string(),
            })
    }
}

impl TryFrom<String> for JobStepState {
    type Error = ParseStateError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

// ============================================================================
// Slicing
// ============================================================================

/// How an order's sensing window is cut into jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SlicingType {
    /// One job for the whole window.
    None,
    CalendarDay,
    CalendarMonth,
    CalendarYear,
    /// Fixed-length slices, see `slice_duration_secs`.
    TimeSlice,
}

impl SlicingType {
    pub const ALL: [SlicingType; 5] = [
        Self::None,
        Self::CalendarDay,
        Self::CalendarMonth,
        Self::CalendarYear,
        Self::TimeSlice,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::CalendarDay => "CALENDAR_DAY",
            Self::CalendarMonth => "CALENDAR_MONTH",
            Self::CalendarYear => "CALENDAR_YEAR",
            Self::TimeSlice => "TIME_SLICE",
        }
    }
}

impl fmt::Display for SlicingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SlicingType {
    type Err = ParseStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ParseStateError {
                entity: "slicing type",
                value: s.to_string(),
            })
    }
}

impl TryFrom<String> for SlicingType {
    type Error = ParseStateError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

// ============================================================================
// Time windows
// ============================================================================

/// Closed-open sensing interval `[start, stop)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SensingWindow {
    pub start: DateTime<Utc>,
    pub stop: DateTime<Utc>,
}

impl SensingWindow {
    pub fn new(start: DateTime<Utc>, stop: DateTime<Utc>) -> Self {
        Self { start, stop }
    }

    pub fn duration(&self) -> Duration {
        self.stop - self.start
    }

    /// Strict overlap; touching intervals do not intersect.
    pub fn intersects(&self, other: &SensingWindow) -> bool {
        self.start < other.stop && self.stop > other.start
    }

    pub fn contains(&self, other: &SensingWindow) -> bool {
        self.start <= other.start && self.stop >= other.stop
    }

    pub fn centre(&self) -> DateTime<Utc> {
        self.start + (self.stop - self.start) / 2
    }
}

// ============================================================================
// Records
// ============================================================================

/// A user-submitted request to produce product classes over a window.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct ProcessingOrder {
    pub id: String,
    /// User-facing identifier, unique per mission.
    pub identifier: String,
    pub mission_code: String,
    #[sqlx(try_from = "String")]
    pub state: OrderState,
    /// Compare-and-set token, bumped on every write.
    pub version: i64,
    pub start_time: DateTime<Utc>,
    pub stop_time: DateTime<Utc>,
    #[sqlx(try_from = "String")]
    pub slicing_type: SlicingType,
    pub slice_duration_secs: Option<i64>,
    pub slice_overlap_secs: i64,
    #[sqlx(json)]
    pub requested_product_classes: Vec<String>,
    pub facility: String,
    pub processing_mode: Option<String>,
    #[sqlx(json)]
    pub dynamic_parameters: BTreeMap<String, String>,
    /// Complete with the successful steps when some steps fail permanently.
    pub tolerate_partial_failure: bool,
    pub max_step_attempts: i32,
    pub state_message: Option<String>,
    pub diagnostic_kind: Option<String>,
    pub diagnostic_code: Option<String>,
    pub failed_job_step_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set when the order is closed; the cleanup worker deletes it afterwards.
    pub eviction_time: Option<DateTime<Utc>>,
}

impl ProcessingOrder {
    pub fn sensing_window(&self) -> SensingWindow {
        SensingWindow::new(self.start_time, self.stop_time)
    }

    /// Last recorded failure, if any.
    pub fn diagnostic(&self) -> Option<Diagnostic> {
        let kind = self.diagnostic_kind.as_deref()?.parse::<ErrorKind>().ok()?;
        Some(Diagnostic {
            kind,
            code: self.diagnostic_code.clone().unwrap_or_default(),
            message: self.state_message.clone().unwrap_or_default(),
            job_step_id: self.failed_job_step_id.clone(),
        })
    }

    pub fn set_diagnostic(&mut self, diagnostic: &Diagnostic) {
        self.diagnostic_kind = Some(diagnostic.kind.as_str().to_string());
        self.diagnostic_code = Some(diagnostic.code.clone());
        self.state_message = Some(diagnostic.message.clone());
        self.failed_job_step_id = diagnostic.job_step_id.clone();
    }

    pub fn clear_diagnostic(&mut self) {
        self.diagnostic_kind = None;
        self.diagnostic_code = None;
        self.state_message = None;
        self.failed_job_step_id = None;
    }
}

/// Submission payload for a new order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewOrder {
    pub identifier: String,
    pub mission_code: String,
    pub start_time: DateTime<Utc>,
    pub stop_time: DateTime<Utc>,
    pub slicing_type: SlicingType,
    #[serde(default)]
    pub slice_duration_secs: Option<i64>,
    #[serde(default)]
    pub slice_overlap_secs: i64,
    pub requested_product_classes: Vec<String>,
    pub facility: String,
    #[serde(default)]
    pub processing_mode: Option<String>,
    #[serde(default)]
    pub dynamic_parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub tolerate_partial_failure: bool,
    #[serde(default)]
    pub max_step_attempts: Option<i32>,
}

/// One time slice of an order, executed on a single facility.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Job {
    pub id: String,
    pub order_id: String,
    pub facility: String,
    #[sqlx(try_from = "String")]
    pub state: JobState,
    pub version: i64,
    pub slice_index: i32,
    pub start_time: DateTime<Utc>,
    pub stop_time: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn sensing_window(&self) -> SensingWindow {
        SensingWindow::new(self.start_time, self.stop_time)
    }
}

/// Execution of one processor producing one output product class.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct JobStep {
    pub id: String,
    pub job_id: String,
    pub order_id: String,
    pub step_index: i32,
    pub product_class: String,
    /// Configured processor identifier.
    pub processor: String,
    #[sqlx(try_from = "String")]
    pub state: JobStepState,
    pub version: i64,
    /// Failed attempts so far.
    pub retry_count: i32,
    pub max_attempts: i32,
    /// Resolved input product IDs.
    #[sqlx(json)]
    pub input_products: Vec<String>,
    /// Name of the execution unit on the facility.
    pub execution_handle: Option<String>,
    pub joborder_location: Option<String>,
    pub diagnostic_kind: Option<String>,
    pub diagnostic_code: Option<String>,
    pub diagnostic_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobStep {
    /// 1-based number of the current attempt.
    pub fn attempt(&self) -> i32 {
        self.retry_count + 1
    }

    pub fn diagnostic(&self) -> Option<Diagnostic> {
        let kind = self.diagnostic_kind.as_deref()?.parse::<ErrorKind>().ok()?;
        Some(Diagnostic {
            kind,
            code: self.diagnostic_code.clone().unwrap_or_default(),
            message: self.diagnostic_message.clone().unwrap_or_default(),
            job_step_id: Some(self.id.clone()),
        })
    }

    pub fn set_diagnostic(&mut self, diagnostic: &Diagnostic) {
        self.diagnostic_kind = Some(diagnostic.kind.as_str().to_string());
        self.diagnostic_code = Some(diagnostic.code.clone());
        self.diagnostic_message = Some(diagnostic.message.clone());
    }

    pub fn clear_diagnostic(&mut self) {
        self.diagnostic_kind = None;
        self.diagnostic_code = None;
        self.diagnostic_message = None;
    }

    /// Whether another attempt is still within budget.
    pub fn has_attempts_left(&self) -> bool {
        self.attempt() < self.max_attempts
    }

    /// A failed step that will not be retried automatically.
    pub fn is_permanently_failed(&self) -> bool {
        if self.state != JobStepState::Failed {
            return false;
        }
        let retryable = self
            .diagnostic()
            .map(|d| d.is_retryable())
            .unwrap_or(true);
        !retryable || !self.has_attempts_left()
    }
}

/// Catalogued product (input or output of processing).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Product {
    pub id: String,
    pub product_class: String,
    pub mission_code: String,
    pub sensing_start: DateTime<Utc>,
    pub sensing_stop: DateTime<Utc>,
    pub generation_time: DateTime<Utc>,
    pub file_name: String,
    pub facility: String,
    /// Producing job step, absent for externally ingested products.
    pub job_step_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Product {
    pub fn sensing_window(&self) -> SensingWindow {
        SensingWindow::new(self.sensing_start, self.sensing_stop)
    }
}

/// Append-only progress snapshot of an order.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct MonOrderProgress {
    #[sqlx(default)]
    pub id: Option<i64>,
    pub order_id: String,
    pub recorded_at: DateTime<Utc>,
    #[sqlx(try_from = "String")]
    pub order_state: OrderState,
    pub total_steps: i64,
    pub waiting_steps: i64,
    pub ready_steps: i64,
    pub running_steps: i64,
    pub completed_steps: i64,
    pub failed_steps: i64,
}

impl MonOrderProgress {
    /// Same order state and step figures, ignoring identity and time.
    pub fn same_figures(&self, other: &MonOrderProgress) -> bool {
        self.order_state == other.order_state
            && self.total_steps == other.total_steps
            && self.waiting_steps == other.waiting_steps
            && self.ready_steps == other.ready_steps
            && self.running_steps == other.running_steps
            && self.completed_steps == other.completed_steps
            && self.failed_steps == other.failed_steps
    }
}

/// Job step counts for one order, by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepCounts {
    pub initial: i64,
    pub waiting_input: i64,
    pub ready: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    pub closed: i64,
}

impl StepCounts {
    pub fn add(&mut self, state: JobStepState, n: i64) {
        match state {
            JobStepState::Initial => self.initial += n,
            JobStepState::WaitingInput => self.waiting_input += n,
            JobStepState::Ready => self.ready += n,
            JobStepState::Running => self.running += n,
            JobStepState::Completed => self.completed += n,
            JobStepState::Failed => self.failed += n,
            JobStepState::Closed => self.closed += n,
        }
    }

    pub fn from_steps<'a>(steps: impl IntoIterator<Item = &'a JobStep>) -> Self {
        let mut counts = Self::default();
        for step in steps {
            counts.add(step.state, 1);
        }
        counts
    }

    pub fn total(&self) -> i64 {
        self.initial
            + self.waiting_input
            + self.ready
            + self.running
            + self.completed
            + self.failed
            + self.closed
    }

    pub fn snapshot(&self, order_id: &str, order_state: OrderState, at: DateTime<Utc>) -> MonOrderProgress {
        MonOrderProgress {
            id: None,
            order_id: order_id.to_string(),
            recorded_at: at,
            order_state,
            total_steps: self.total(),
            waiting_steps: self.initial + self.waiting_input,
            ready_steps: self.ready,
            running_steps: self.running,
            completed_steps: self.completed + self.closed,
            failed_steps: self.failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_order_transition_table() {
        use OrderState::*;
        assert!(Initial.can_transition_to(Approved));
        assert!(!Initial.can_transition_to(Planned));
        assert!(Approved.can_transition_to(Initial));
        assert!(Released.can_transition_to(Suspending));
        assert!(Suspending.can_transition_to(Planned));
        assert!(Failed.can_transition_to(Planned));
        assert!(Completed.can_transition_to(Closed));
        assert!(!Completed.can_transition_to(Running));
        assert!(Closed.successors().is_empty());
        assert!(Closed.is_terminal());
    }

    #[test]
    fn test_job_step_transition_table() {
        use JobStepState::*;
        assert!(Initial.can_transition_to(WaitingInput));
        assert!(WaitingInput.can_transition_to(Ready));
        assert!(Ready.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(Completed.can_transition_to(Closed));

        assert!(!Failed.can_transition_to(Ready));
        assert!(!Closed.can_transition_to(Initial));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Running.can_transition_to(Ready));
    }

    #[test]
    fn test_state_text_round_trip() {
        for state in OrderState::ALL {
            assert_eq!(state.as_str().parse::<OrderState>().unwrap(), state);
        }
        for state in JobStepState::ALL {
            assert_eq!(state.as_str().parse::<JobStepState>().unwrap(), state);
        }
        let err = "PAUSED".parse::<OrderState>().unwrap_err();
        assert_eq!(err.to_string(), "unknown order state 'PAUSED'");
    }

    #[test]
    fn test_window_intersection_is_strict() {
        let t = |h| Utc.with_ymd_and_hms(2024, 3, 1, h, 0, 0).unwrap();
        let a = SensingWindow::new(t(0), t(6));
        let b = SensingWindow::new(t(6), t(12));
        let c = SensingWindow::new(t(5), t(7));

        assert!(!a.intersects(&b));
        assert!(a.intersects(&c));
        assert!(SensingWindow::new(t(0), t(12)).contains(&c));
        assert_eq!(a.centre(), t(3));
    }

    #[test]
    fn test_step_counts_snapshot() {
        let mut counts = StepCounts::default();
        counts.add(JobStepState::WaitingInput, 2);
        counts.add(JobStepState::Running, 1);
        counts.add(JobStepState::Closed, 3);

        let at = Utc::now();
        let snapshot = counts.snapshot("o-1", OrderState::Running, at);
        assert_eq!(snapshot.total_steps, 6);
        assert_eq!(snapshot.waiting_steps, 2);
        assert_eq!(snapshot.completed_steps, 3);
        assert_eq!(snapshot.running_steps, 1);
    }
}
