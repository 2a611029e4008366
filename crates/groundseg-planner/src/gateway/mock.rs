// Copyright (C) 2025 The groundseg Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock gateway for testing.
//!
//! Simulates a facility cluster in memory, without any scheduler behind it.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::*;

/// How submitted units finish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockBehaviour {
    /// Units succeed on their first poll.
    AutoSucceed,
    /// Units fail on their first poll with the given reason.
    AutoFail(String),
    /// Units run until [`MockGateway::complete`] or [`MockGateway::fail`].
    Manual,
}

#[derive(Debug, Clone)]
struct MockUnit {
    request: SubmitRequest,
    status: ExecutionStatus,
}

/// In-memory cluster gateway.
pub struct MockGateway {
    facility: String,
    units: Arc<Mutex<HashMap<String, MockUnit>>>,
    behaviour: Mutex<MockBehaviour>,
    disposed: Mutex<Vec<String>>,
    unreachable: AtomicBool,
    created: AtomicUsize,
}

impl MockGateway {
    /// Create a mock gateway whose units succeed.
    pub fn new(facility: impl Into<String>) -> Self {
        Self::with_behaviour(facility, MockBehaviour::AutoSucceed)
    }

    pub fn with_behaviour(facility: impl Into<String>, behaviour: MockBehaviour) -> Self {
        Self {
            facility: facility.into(),
            units: Arc::new(Mutex::new(HashMap::new())),
            behaviour: Mutex::new(behaviour),
            disposed: Mutex::new(Vec::new()),
            unreachable: AtomicBool::new(false),
            created: AtomicUsize::new(0),
        }
    }

    pub async fn set_behaviour(&self, behaviour: MockBehaviour) {
        *self.behaviour.lock().await = behaviour;
    }

    /// Make every call fail as if the cluster API were down.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Finish a unit successfully.
    pub async fn complete(&self, name: &str) {
        if let Some(unit) = self.units.lock().await.get_mut(name) {
            unit.status = ExecutionStatus::Succeeded;
        }
    }

    /// Finish a unit with a failure.
    pub async fn fail(&self, name: &str, reason: &str) {
        if let Some(unit) = self.units.lock().await.get_mut(name) {
            unit.status = ExecutionStatus::Failed {
                reason: reason.to_string(),
            };
        }
    }

    /// Number of units ever created.
    pub fn created_units(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Names of units not yet disposed, sorted.
    pub async fn live_units(&self) -> Vec<String> {
        let mut names: Vec<String> = self.units.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn disposed_units(&self) -> Vec<String> {
        self.disposed.lock().await.clone()
    }

    /// The request a live unit was created from.
    pub async fn request(&self, name: &str) -> Option<SubmitRequest> {
        self.units
            .lock()
            .await
            .get(name)
            .map(|unit| unit.request.clone())
    }

    fn check_reachable(&self) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(GatewayError::Unreachable(format!(
                "mock facility {} is down",
                self.facility
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterGateway for MockGateway {
    fn facility(&self) -> &str {
        &self.facility
    }

    fn gateway_type(&self) -> &'static str {
        "mock"
    }

    async fn connect(&self) -> Result<GatewayHealth> {
        self.check_reachable()?;
        Ok(GatewayHealth::Healthy)
    }

    async fn submit(&self, request: &SubmitRequest) -> Result<ExecutionHandle> {
        self.check_reachable()?;

        let mut units = self.units.lock().await;
        if !units.contains_key(&request.unit_name) {
            units.insert(
                request.unit_name.clone(),
                MockUnit {
                    request: request.clone(),
                    status: ExecutionStatus::Running,
                },
            );
            self.created.fetch_add(1, Ordering::SeqCst);
        }
        Ok(request.unit_name.clone())
    }

    async fn poll(&self, handle: &str) -> Result<ExecutionStatus> {
        self.check_reachable()?;

        let behaviour = self.behaviour.lock().await.clone();
        let mut units = self.units.lock().await;
        let unit = units
            .get_mut(handle)
            .ok_or_else(|| GatewayError::NotFound(handle.to_string()))?;

        if unit.status == ExecutionStatus::Running {
            match behaviour {
                MockBehaviour::AutoSucceed => unit.status = ExecutionStatus::Succeeded,
                MockBehaviour::AutoFail(reason) => unit.status = ExecutionStatus::Failed { reason },
                MockBehaviour::Manual => {}
            }
        }
        Ok(unit.status.clone())
    }

    async fn dispose(&self, handle: &str) -> Result<()> {
        self.check_reachable()?;

        if self.units.lock().await.remove(handle).is_some() {
            self.disposed.lock().await.push(handle.to_string());
        }
        Ok(())
    }
}
