// Copyright (C) 2025 The groundseg Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bounded retry of read-modify-write sequences on write conflicts.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{CoreError, Result};

/// Retry bounds for conflicting writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Fixed pause between attempts.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_millis(200),
        }
    }
}

/// Runs an operation again when it fails with [`CoreError::Conflict`].
///
/// The operation must re-read whatever it modifies on every attempt; a
/// retry replays the whole read-modify-write, never just the write. Any
/// other error is returned as is.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryCoordinator {
    policy: RetryPolicy,
}

impl RetryCoordinator {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub async fn run<T, F, Fut>(&self, operation: &str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match f().await {
                Err(err @ CoreError::Conflict { .. }) if attempt < max_attempts => {
                    debug!(
                        operation,
                        attempt,
                        max_attempts,
                        error = %err,
                        "Write conflict, retrying"
                    );
                    tokio::time::sleep(self.policy.delay).await;
                    attempt += 1;
                }
                Err(err @ CoreError::Conflict { .. }) => {
                    warn!(operation, attempts = attempt, error = %err, "Write conflict persisted");
                    return Err(err);
                }
                other => return other,
            }
        }
    }
}
