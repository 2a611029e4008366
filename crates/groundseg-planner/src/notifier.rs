// Copyright (C) 2025 The groundseg Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Failure notifications for order owners.

use async_trait::async_trait;
use groundseg_core::{Diagnostic, JobStep, ProcessingOrder};
use tracing::warn;

/// Delivery of failure notices. Called only after the transition that
/// triggers the notice has been persisted.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// A job step failed and will not be retried automatically.
    async fn job_step_exhausted(
        &self,
        order: &ProcessingOrder,
        step: &JobStep,
        diagnostic: &Diagnostic,
    );

    async fn order_failed(&self, order: &ProcessingOrder, diagnostic: &Diagnostic);
}

/// Notifier writing warnings to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn job_step_exhausted(
        &self,
        order: &ProcessingOrder,
        step: &JobStep,
        diagnostic: &Diagnostic,
    ) {
        warn!(
            order_id = %order.id,
            order = %order.identifier,
            job_step_id = %step.id,
            attempts = step.attempt(),
            code = %diagnostic.code,
            message = %diagnostic.message,
            "Job step failed permanently"
        );
    }

    async fn order_failed(&self, order: &ProcessingOrder, diagnostic: &Diagnostic) {
        warn!(
            order_id = %order.id,
            order = %order.identifier,
            code = %diagnostic.code,
            job_step_id = diagnostic.job_step_id.as_deref().unwrap_or("-"),
            message = %diagnostic.message,
            "Order failed"
        );
    }
}
