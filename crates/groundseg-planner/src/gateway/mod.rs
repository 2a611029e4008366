// Copyright (C) 2025 The groundseg Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cluster gateways.
//!
//! One gateway per processing facility wraps that facility's cluster
//! scheduler. Gateways are pure execution clients: they never touch the
//! database, the caller records what they return.

pub mod kubernetes;
pub mod mock;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use groundseg_core::error::{Diagnostic, ErrorKind};
use thiserror::Error;

pub use kubernetes::KubernetesGateway;
pub use mock::{MockBehaviour, MockGateway};

/// Errors from gateway operations.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum GatewayError {
    /// The cluster API could not be reached.
    #[error("cluster unreachable: {0}")]
    Unreachable(String),

    /// The call did not finish in time.
    #[error("cluster call timed out after {0:?}")]
    Timeout(Duration),

    /// The cluster refused the request.
    #[error("cluster rejected request: {0}")]
    Rejected(String),

    /// The gateway itself is misconfigured.
    #[error("gateway misconfigured: {0}")]
    Configuration(String),

    /// The execution unit does not exist.
    #[error("execution unit not found: {0}")]
    NotFound(String),
}

impl GatewayError {
    /// Transient errors leave the job step untouched until the next cycle.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unreachable(_) | Self::Timeout(_))
    }

    pub fn diagnostic(&self) -> Diagnostic {
        match self {
            Self::Unreachable(_) | Self::Timeout(_) => Diagnostic::new(
                ErrorKind::Transient,
                "CLUSTER_UNAVAILABLE",
                "processing facility unavailable",
            ),
            Self::Rejected(reason) => {
                Diagnostic::new(ErrorKind::Execution, "SUBMISSION_REJECTED", reason.clone())
            }
            Self::Configuration(reason) => {
                Diagnostic::new(ErrorKind::Configuration, "GATEWAY_MISCONFIGURED", reason.clone())
            }
            Self::NotFound(name) => Diagnostic::new(
                ErrorKind::Execution,
                "EXECUTION_UNIT_LOST",
                format!("execution unit {} disappeared", name),
            ),
        }
    }
}

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Name of an execution unit on its facility.
pub type ExecutionHandle = String;

/// Outcome of [`ClusterGateway::connect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayHealth {
    Healthy,
    Degraded { reason: String },
}

/// Status of an execution unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionStatus {
    Pending,
    Running,
    Succeeded,
    Failed { reason: String },
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed { .. })
    }
}

/// One container invocation for a job step attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitRequest {
    pub job_step_id: String,
    pub attempt: i32,
    /// Deterministic unit name, see [`execution_unit_name`].
    pub unit_name: String,
    pub image: String,
    pub command: Vec<String>,
    pub joborder_location: String,
    pub env: BTreeMap<String, String>,
}

/// Client of one facility's cluster scheduler.
#[async_trait]
pub trait ClusterGateway: Send + Sync {
    /// Facility this gateway serves.
    fn facility(&self) -> &str;

    /// Gateway type identifier (e.g. "kubernetes", "mock").
    fn gateway_type(&self) -> &'static str;

    /// Check that the cluster API answers.
    async fn connect(&self) -> Result<GatewayHealth>;

    /// Create the execution unit named `request.unit_name`.
    ///
    /// A unit that already exists under that name is returned as is, so a
    /// repeated submission never starts a second container.
    async fn submit(&self, request: &SubmitRequest) -> Result<ExecutionHandle>;

    async fn poll(&self, handle: &str) -> Result<ExecutionStatus>;

    /// Delete the unit. Deleting a missing unit succeeds.
    async fn dispose(&self, handle: &str) -> Result<()>;
}

const MAX_NAME_LEN: usize = 63;

/// Execution unit name for a job step attempt: `gs-<job_step_id>-<attempt>`,
/// reduced to a lowercase DNS label.
pub fn execution_unit_name(job_step_id: &str, attempt: i32) -> String {
    let suffix = format!("-{}", attempt);
    let budget = MAX_NAME_LEN - "gs-".len() - suffix.len();

    let id: String = job_step_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .take(budget)
        .collect();
    let id = id.trim_matches('-');

    format!("gs-{}{}", id, suffix)
}

/// Run a gateway call with a deadline. An elapsed deadline is transient.
pub async fn with_timeout<T>(
    timeout: Duration,
    call: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(GatewayError::Timeout(timeout)),
    }
}
