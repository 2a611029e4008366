// Copyright (C) 2025 The groundseg Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared planner state.
//!
//! Everything the state machines, order control and workers need, built
//! once at startup and passed explicitly.

use std::sync::Arc;
use std::time::Duration;

use groundseg_core::joborder::JobOrderBuilder;
use groundseg_core::selection::SelectionRuleEvaluator;
use groundseg_core::{MissionCatalog, Persistence, RetryCoordinator};

use crate::config::Config;
use crate::facility::FacilityRegistry;
use crate::ingestor::Ingestor;
use crate::notifier::Notifier;
use crate::storage::StorageManager;

/// Tunables of the planner behaviour.
#[derive(Debug, Clone)]
pub struct PlannerSettings {
    /// Deadline for every cluster gateway call.
    pub gateway_timeout: Duration,
    /// Base URL processors report completion to.
    pub callback_url: Option<String>,
    /// Time a closed order is kept before eviction.
    pub order_retention: Duration,
    /// Attempt budget for orders that do not set their own.
    pub max_step_attempts: i32,
}

impl Default for PlannerSettings {
    fn default() -> Self {
        Self {
            gateway_timeout: Duration::from_secs(30),
            callback_url: None,
            order_retention: Duration::from_secs(30 * 24 * 3600),
            max_step_attempts: 3,
        }
    }
}

impl From<&Config> for PlannerSettings {
    fn from(config: &Config) -> Self {
        Self {
            gateway_timeout: config.gateway_timeout,
            callback_url: config.callback_url.clone(),
            order_retention: config.order_retention,
            max_step_attempts: config.max_step_attempts,
        }
    }
}

/// Collaborators of the planner.
pub struct PlannerContext {
    pub persistence: Arc<dyn Persistence>,
    pub catalog: Arc<MissionCatalog>,
    pub facilities: Arc<FacilityRegistry>,
    pub storage: Arc<dyn StorageManager>,
    pub ingestor: Arc<dyn Ingestor>,
    pub notifier: Arc<dyn Notifier>,
    pub retry: RetryCoordinator,
    pub settings: PlannerSettings,
    /// Read-only view of the product catalog.
    pub evaluator: SelectionRuleEvaluator<dyn Persistence>,
    pub joborders: JobOrderBuilder,
}

impl PlannerContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        persistence: Arc<dyn Persistence>,
        catalog: Arc<MissionCatalog>,
        facilities: Arc<FacilityRegistry>,
        storage: Arc<dyn StorageManager>,
        ingestor: Arc<dyn Ingestor>,
        notifier: Arc<dyn Notifier>,
        retry: RetryCoordinator,
        settings: PlannerSettings,
    ) -> Self {
        Self {
            evaluator: SelectionRuleEvaluator::new(persistence.clone()),
            persistence,
            catalog,
            facilities,
            storage,
            ingestor,
            notifier,
            retry,
            settings,
            joborders: JobOrderBuilder::default(),
        }
    }
}
