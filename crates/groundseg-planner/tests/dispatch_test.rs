// Copyright (C) 2025 The groundseg Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Dispatch loop scenarios against mock facilities.

mod common;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Duration;
use common::*;
use groundseg_core::{
    CoreError, ErrorKind, JobStepState, OrderState, ProductQuery, SensingWindow,
};
use groundseg_planner::Error;
use groundseg_planner::dispatch::{DispatchLoop, DispatchLoopConfig};
use groundseg_planner::gateway::{
    self, ClusterGateway, ExecutionHandle, ExecutionStatus, GatewayHealth, MockBehaviour,
    SubmitRequest,
};
use tokio::sync::Notify;

/// Gateway that parks the first submission, after the unit exists, until
/// the test lets it return.
struct HeldGateway {
    inner: Arc<dyn ClusterGateway>,
    held: AtomicBool,
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl ClusterGateway for HeldGateway {
    fn facility(&self) -> &str {
        self.inner.facility()
    }

    fn gateway_type(&self) -> &'static str {
        "held"
    }

    async fn connect(&self) -> gateway::Result<GatewayHealth> {
        self.inner.connect().await
    }

    async fn submit(&self, request: &SubmitRequest) -> gateway::Result<ExecutionHandle> {
        let handle = self.inner.submit(request).await?;
        if !self.held.swap(true, Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        Ok(handle)
    }

    async fn poll(&self, handle: &str) -> gateway::Result<ExecutionStatus> {
        self.inner.poll(handle).await
    }

    async fn dispose(&self, handle: &str) -> gateway::Result<()> {
        self.inner.dispose(handle).await
    }
}

/// Planner on facility "f1" whose first submission is held.
async fn held_planner() -> (TestPlanner, Arc<HeldGateway>) {
    let slot = Mutex::new(None);
    let tp = TestPlanner::with_gateway(&["f1"], |inner| {
        let held = Arc::new(HeldGateway {
            inner,
            held: AtomicBool::new(false),
            entered: Notify::new(),
            release: Notify::new(),
        });
        *slot.lock().unwrap() = Some(held.clone());
        held as Arc<dyn ClusterGateway>
    })
    .await;
    let held = slot.into_inner().unwrap().expect("gateway not wrapped");
    (tp, held)
}

#[tokio::test]
async fn test_steps_wait_for_inputs_then_run_to_completion() {
    let tp = TestPlanner::new(&["f1"]).await;
    let order = tp.released(sliced_order("O3-WAIT", "f1", &["L2_O3"], 2, 30)).await;

    tp.cycle().await;
    let steps = tp.steps(&order.id).await;
    assert_eq!(steps.len(), 2);
    assert!(steps.iter().all(|s| s.state == JobStepState::WaitingInput));
    assert_eq!(tp.order(&order.id).await.state, OrderState::Released);

    // Still nothing to run on the next cycle.
    tp.cycle().await;
    assert!(tp
        .steps(&order.id)
        .await
        .iter()
        .all(|s| s.state == JobStepState::WaitingInput));
    assert_eq!(tp.gateway("f1").created_units(), 0);

    let l1b = tp.ingest("L1B", t0(), t0() + Duration::hours(1)).await;

    tp.cycle().await;
    let steps = tp.steps(&order.id).await;
    for step in &steps {
        assert_eq!(step.state, JobStepState::Ready);
        assert_eq!(step.input_products, vec![l1b.id.clone()]);
    }
    assert_eq!(tp.order(&order.id).await.state, OrderState::Running);

    let order = tp.run_until(&order.id, OrderState::Completed, 5).await;
    assert!(order.diagnostic().is_none());
    assert_eq!(tp.gateway("f1").created_units(), 2);
    assert!(tp.gateway("f1").live_units().await.is_empty());
    assert!(tp
        .steps(&order.id)
        .await
        .iter()
        .all(|s| s.state == JobStepState::Closed && s.execution_handle.is_none()));
}

#[tokio::test]
async fn test_dispatch_writes_job_order_and_execution_env() {
    let tp = TestPlanner::new(&["f1"]).await;
    tp.set_behaviour("f1", MockBehaviour::Manual).await;
    let order = tp.released(new_order("NO2-ENV", "f1", &["L2_NO2"])).await;

    tp.cycle().await;
    tp.cycle().await;

    let step = tp.steps(&order.id).await.remove(0);
    assert_eq!(step.state, JobStepState::Running);
    assert!(step.started_at.is_some());

    let location = step.joborder_location.clone().expect("job order location");
    assert!(location.ends_with(&format!("{}-1.xml", step.id)));
    assert!(location.starts_with(&tp.storage_dir.path().display().to_string()));
    let xml = std::fs::read_to_string(Path::new(&location)).unwrap();
    assert!(xml.contains("TROPNRT_L2"));

    let handle = step.execution_handle.clone().expect("execution handle");
    let request = tp.gateway("f1").request(&handle).await.expect("unit created");
    assert_eq!(request.job_step_id, step.id);
    assert_eq!(request.attempt, 1);
    assert_eq!(request.image, "registry.local/l2:2.1");
    assert_eq!(request.command, vec!["/usr/bin/run-l2".to_string()]);
    assert_eq!(request.env["JOBORDER_FILE"], location);
    assert_eq!(request.env["STORAGE_ENDPOINT"], "/data/f1");
    assert_eq!(
        request.env["STATE_CALLBACK_ENDPOINT"],
        format!("{}/jobsteps/{}", CALLBACK_URL, step.id)
    );
    assert_eq!(request.env["SUCCESS_STATE"], "COMPLETED");

    // A running unit is polled, not resubmitted.
    tp.cycle().await;
    assert_eq!(tp.gateway("f1").created_units(), 1);
}

#[tokio::test]
async fn test_signal_kill_exhausts_attempts_and_fails_order() {
    let tp = TestPlanner::new(&["f1"]).await;
    tp.set_behaviour("f1", MockBehaviour::AutoFail("signal 9".to_string()))
        .await;
    let order = tp.released(new_order("NO2-KILL", "f1", &["L2_NO2"])).await;

    let order = tp.run_until(&order.id, OrderState::Failed, 12).await;

    let step = tp.steps(&order.id).await.remove(0);
    assert_eq!(step.state, JobStepState::Failed);
    assert_eq!(step.retry_count, 2);
    assert_eq!(step.attempt(), step.max_attempts);
    assert!(step.execution_handle.is_none());
    assert!(step.is_permanently_failed());

    let gateway = tp.gateway("f1");
    assert_eq!(gateway.created_units(), 3);
    assert_eq!(gateway.disposed_units().await.len(), 3);
    assert!(gateway.live_units().await.is_empty());

    let diagnostic = order.diagnostic().expect("order diagnostic");
    assert_eq!(diagnostic.kind, ErrorKind::Execution);
    assert_eq!(diagnostic.code, "PROCESSOR_FAILED");
    assert_eq!(diagnostic.message, "signal 9");
    assert_eq!(diagnostic.job_step_id.as_deref(), Some(step.id.as_str()));

    assert_eq!(
        tp.notifier.notices(),
        vec![
            Notice::StepExhausted {
                job_step_id: step.id.clone(),
                code: "PROCESSOR_FAILED".to_string(),
            },
            Notice::OrderFailed {
                order_id: order.id.clone(),
                code: "PROCESSOR_FAILED".to_string(),
                job_step_id: Some(step.id.clone()),
            },
        ]
    );

    // A failed order is no longer driven.
    tp.cycle().await;
    assert_eq!(tp.gateway("f1").created_units(), 3);
}

#[tokio::test]
async fn test_order_completes_only_when_every_step_closed() {
    let tp = TestPlanner::new(&["f1"]).await;
    tp.set_behaviour("f1", MockBehaviour::Manual).await;
    let order = tp
        .released(sliced_order("GRID", "f1", &["L1B", "L2_NO2"], 3, 20))
        .await;

    tp.cycle().await;
    tp.cycle().await;
    let steps = tp.steps(&order.id).await;
    assert_eq!(steps.len(), 6);
    assert!(steps.iter().all(|s| s.state == JobStepState::Running));

    let gateway = tp.gateway("f1");
    let units = gateway.live_units().await;
    assert_eq!(units.len(), 6);
    for unit in &units[1..] {
        gateway.complete(unit).await;
    }

    tp.cycle().await;
    let steps = tp.steps(&order.id).await;
    assert_eq!(
        steps.iter().filter(|s| s.state == JobStepState::Closed).count(),
        5
    );
    assert_eq!(tp.order(&order.id).await.state, OrderState::Running);

    gateway.complete(&units[0]).await;
    let order = tp.run_until(&order.id, OrderState::Completed, 1).await;

    let jobs = tp.persistence.list_jobs(&order.id).await.unwrap();
    assert_eq!(jobs.len(), 3);
    assert!(jobs.iter().all(|j| j.state == JobStepState::Closed));

    // Every L1B step registered its output exactly once.
    let whole = SensingWindow::new(t0(), t0() + Duration::hours(1));
    let outputs = tp
        .persistence
        .find_products("S5P", "L1B", &ProductQuery::Intersecting(whole))
        .await
        .unwrap();
    assert_eq!(outputs.len(), 3);
    assert!(outputs.iter().all(|p| p.job_step_id.is_some() && p.facility == "f1"));
}

#[tokio::test]
async fn test_concurrent_dispatchers_submit_each_unit_once() {
    let tp = TestPlanner::new(&["f1"]).await;
    tp.set_behaviour("f1", MockBehaviour::Manual).await;
    let order = tp
        .released(sliced_order("RACE", "f1", &["L1B"], 4, 15))
        .await;

    let other = DispatchLoop::new(tp.ctx.clone(), DispatchLoopConfig::default());
    for _ in 0..3 {
        let (a, b) = tokio::join!(tp.dispatch.run_cycle(), other.run_cycle());
        a.unwrap();
        b.unwrap();
    }

    let steps = tp.steps(&order.id).await;
    assert_eq!(steps.len(), 4);
    assert!(steps.iter().all(|s| s.state == JobStepState::Running));
    assert!(steps.iter().all(|s| s.retry_count == 0));
    assert_eq!(tp.gateway("f1").created_units(), 4);
}

#[tokio::test]
async fn test_suspend_during_submission_withdraws_unit() {
    let (tp, held) = held_planner().await;
    tp.set_behaviour("f1", MockBehaviour::Manual).await;
    let order = tp.released(new_order("SUSPEND-INFLIGHT", "f1", &["L2_NO2"])).await;
    tp.cycle().await;
    assert_eq!(tp.steps(&order.id).await[0].state, JobStepState::Ready);

    let (report, suspended) = tokio::join!(tp.cycle(), async {
        held.entered.notified().await;
        let suspended = tp.control.suspend(&order.id).await;
        held.release.notify_one();
        suspended
    });
    assert_eq!(suspended.unwrap().state, OrderState::Suspending);
    assert_eq!(report.advanced, 0);

    // The unit was created, then withdrawn once the write was refused.
    let step = tp.steps(&order.id).await.remove(0);
    assert_eq!(step.state, JobStepState::Ready);
    assert!(step.execution_handle.is_none());
    assert_eq!(step.retry_count, 0);
    let gateway = tp.gateway("f1");
    assert_eq!(gateway.created_units(), 1);
    assert_eq!(gateway.disposed_units().await.len(), 1);
    assert!(gateway.live_units().await.is_empty());

    // Nothing runs, so the same cycle let the order settle back.
    assert_eq!(tp.order(&order.id).await.state, OrderState::Planned);

    tp.set_behaviour("f1", MockBehaviour::AutoSucceed).await;
    tp.control.resume(&order.id).await.unwrap();
    tp.run_until(&order.id, OrderState::Completed, 3).await;
    assert_eq!(tp.gateway("f1").created_units(), 2);
}

#[tokio::test]
async fn test_cancel_during_submission_leaves_no_unit_behind() {
    let (tp, held) = held_planner().await;
    tp.set_behaviour("f1", MockBehaviour::Manual).await;
    let order = tp.released(new_order("CANCEL-INFLIGHT", "f1", &["L2_NO2"])).await;
    tp.cycle().await;

    let (_, cancelled) = tokio::join!(tp.cycle(), async {
        held.entered.notified().await;
        let cancelled = tp.control.cancel(&order.id).await;
        held.release.notify_one();
        cancelled
    });
    let cancelled = cancelled.unwrap();
    assert_eq!(cancelled.state, OrderState::Failed);
    assert_eq!(cancelled.diagnostic().unwrap().code, "ORDER_CANCELLED");

    let step = tp.steps(&order.id).await.remove(0);
    assert_eq!(step.state, JobStepState::Failed);
    assert!(step.execution_handle.is_none());
    assert_eq!(step.diagnostic().unwrap().code, "ORDER_CANCELLED");

    let gateway = tp.gateway("f1");
    assert!(gateway.live_units().await.is_empty());
    assert_eq!(gateway.disposed_units().await.len(), 1);

    tp.cycle().await;
    assert_eq!(tp.order(&order.id).await.state, OrderState::Failed);
    assert_eq!(gateway.created_units(), 1);
}

#[tokio::test]
async fn test_reset_refused_while_a_step_runs() {
    let tp = TestPlanner::new(&["f1"]).await;
    let order = tp.control.submit(new_order("RESET-BUSY", "f1", &["L2_NO2"])).await.unwrap();
    tp.control.approve(&order.id).await.unwrap();
    let planned = tp.control.plan(&order.id).await.unwrap();

    let mut running = tp.steps(&order.id).await.remove(0);
    running.state = JobStepState::Running;
    running.execution_handle = Some("gs-busy-1".to_string());
    tp.persistence.update_job_step(&running).await.unwrap();

    let result = tp.control.reset(&order.id).await;
    assert!(matches!(
        result,
        Err(Error::Core(CoreError::ValidationError { ref message, .. })) if message.contains("running")
    ));
    assert_eq!(tp.order(&order.id).await.state, OrderState::Planned);
    assert_eq!(tp.order(&order.id).await.version, planned.version);
    assert_eq!(tp.steps(&order.id).await.len(), 1);
}

#[tokio::test]
async fn test_reset_disposes_units_still_held() {
    let tp = TestPlanner::new(&["f1"]).await;
    let order = tp.control.submit(new_order("RESET-HELD", "f1", &["L2_NO2"])).await.unwrap();
    tp.control.approve(&order.id).await.unwrap();
    tp.control.plan(&order.id).await.unwrap();

    let mut failed = tp.steps(&order.id).await.remove(0);
    let unit = gateway::execution_unit_name(&failed.id, failed.attempt());
    tp.gateway("f1")
        .submit(&SubmitRequest {
            job_step_id: failed.id.clone(),
            attempt: failed.attempt(),
            unit_name: unit.clone(),
            image: "registry.local/l2:2.1".to_string(),
            command: vec![],
            joborder_location: "/tmp/unused.xml".to_string(),
            env: BTreeMap::new(),
        })
        .await
        .unwrap();
    failed.state = JobStepState::Failed;
    failed.execution_handle = Some(unit.clone());
    tp.persistence.update_job_step(&failed).await.unwrap();

    let reset = tp.control.reset(&order.id).await.unwrap();
    assert_eq!(reset.state, OrderState::Initial);
    assert!(tp.steps(&order.id).await.is_empty());

    let gateway = tp.gateway("f1");
    assert!(gateway.live_units().await.is_empty());
    assert_eq!(gateway.disposed_units().await, vec![unit]);
}

#[tokio::test]
async fn test_unreachable_facility_does_not_hold_back_others() {
    let tp = TestPlanner::new(&["f1", "f2"]).await;
    let healthy = tp.released(new_order("HEALTHY", "f1", &["L2_NO2"])).await;
    let stalled = tp.released(new_order("STALLED", "f2", &["L2_NO2"])).await;
    tp.gateway("f2").set_unreachable(true);

    let healthy = tp.run_until(&healthy.id, OrderState::Completed, 4).await;
    assert_eq!(healthy.state, OrderState::Completed);

    let report = tp.cycle().await;
    assert!(report.errors >= 1);

    let step = tp.steps(&stalled.id).await.remove(0);
    assert_eq!(step.state, JobStepState::Ready);
    assert_eq!(step.retry_count, 0);
    assert!(step.diagnostic().is_none());
    assert_eq!(tp.gateway("f2").created_units(), 0);

    tp.gateway("f2").set_unreachable(false);
    tp.run_until(&stalled.id, OrderState::Completed, 4).await;
}

#[tokio::test]
async fn test_lost_unit_counts_as_failed_attempt() {
    let tp = TestPlanner::new(&["f1"]).await;
    tp.set_behaviour("f1", MockBehaviour::Manual).await;
    let order = tp.released(new_order("LOST", "f1", &["L2_NO2"])).await;

    tp.cycle().await;
    tp.cycle().await;
    let step = tp.steps(&order.id).await.remove(0);
    let handle = step.execution_handle.clone().unwrap();

    // The unit disappears behind the planner's back.
    tp.gateway("f1").dispose(&handle).await.unwrap();

    tp.cycle().await;
    let step = tp.steps(&order.id).await.remove(0);
    assert_eq!(step.state, JobStepState::Ready);
    assert_eq!(step.retry_count, 1);
    assert_eq!(step.diagnostic().unwrap().code, "EXECUTION_UNIT_LOST");

    tp.set_behaviour("f1", MockBehaviour::AutoSucceed).await;
    tp.run_until(&order.id, OrderState::Completed, 3).await;
}

#[tokio::test]
async fn test_partial_failure_tolerated() {
    let tp = TestPlanner::new(&["f1"]).await;
    tp.set_behaviour("f1", MockBehaviour::Manual).await;
    let mut new = sliced_order("PARTIAL", "f1", &["L2_NO2"], 2, 30);
    new.tolerate_partial_failure = true;
    new.max_step_attempts = Some(1);
    let order = tp.released(new).await;

    tp.cycle().await;
    tp.cycle().await;
    let gateway = tp.gateway("f1");
    let units = gateway.live_units().await;
    assert_eq!(units.len(), 2);
    gateway.complete(&units[0]).await;
    gateway.fail(&units[1], "exit code 2").await;

    let order = tp.run_until(&order.id, OrderState::Completed, 2).await;
    assert_eq!(order.state, OrderState::Completed);

    let steps = tp.steps(&order.id).await;
    assert_eq!(
        steps.iter().filter(|s| s.state == JobStepState::Closed).count(),
        1
    );
    assert_eq!(
        steps.iter().filter(|s| s.is_permanently_failed()).count(),
        1
    );
}

#[tokio::test]
async fn test_empty_cycle() {
    let tp = TestPlanner::new(&["f1"]).await;
    let report = tp.cycle().await;
    assert_eq!(report.orders, 0);
    assert_eq!(report.advanced, 0);
}
