// Copyright (C) 2025 The groundseg Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background workers and the embeddable runtime.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use groundseg_core::{MissionCatalog, OrderState};
use groundseg_planner::context::PlannerSettings;
use groundseg_planner::dispatch::{DispatchLoop, DispatchLoopConfig};
use groundseg_planner::gateway::MockBehaviour;
use groundseg_planner::order_cleanup_worker::{OrderCleanupWorker, OrderCleanupWorkerConfig};
use groundseg_planner::progress_monitor::{ProgressMonitor, ProgressMonitorConfig};
use groundseg_planner::runtime::PlannerRuntime;

#[tokio::test]
async fn test_progress_monitor_snapshots_active_orders() {
    let tp = TestPlanner::new(&["f1"]).await;
    tp.set_behaviour("f1", MockBehaviour::Manual).await;
    let active = tp
        .released(sliced_order("PROGRESS", "f1", &["L2_NO2"], 2, 30))
        .await;
    let idle = tp
        .control
        .submit(new_order("IDLE", "f1", &["L2_NO2"]))
        .await
        .unwrap();
    tp.cycle().await;
    tp.cycle().await;

    let monitor = ProgressMonitor::new(tp.ctx.clone(), ProgressMonitorConfig::default());
    let before = tp.persistence.list_progress(&active.id).await.unwrap().len();
    assert_eq!(monitor.run_cycle().await.unwrap(), 1);

    let progress = tp.persistence.list_progress(&active.id).await.unwrap();
    assert_eq!(progress.len(), before + 1);
    let last = progress.last().unwrap();
    assert_eq!(last.order_state, OrderState::Running);
    assert_eq!(last.total_steps, 2);
    assert_eq!(last.running_steps, 2);
    assert_eq!(last.completed_steps, 0);

    assert!(tp.persistence.list_progress(&idle.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_progress_snapshot_whenever_figures_change() {
    let tp = TestPlanner::new(&["f1"]).await;
    let order = tp.released(new_order("HISTORY", "f1", &["L2_NO2"])).await;
    tp.run_until(&order.id, OrderState::Completed, 4).await;

    let progress = tp.persistence.list_progress(&order.id).await.unwrap();
    let states: Vec<OrderState> = progress.iter().map(|p| p.order_state).collect();
    assert_eq!(
        states,
        vec![
            OrderState::Planned,
            OrderState::Released,
            OrderState::Running,
            OrderState::Running,
            OrderState::Completed,
        ]
    );

    // Ready, then running, under the same order state.
    assert_eq!((progress[2].ready_steps, progress[2].running_steps), (1, 0));
    assert_eq!((progress[3].ready_steps, progress[3].running_steps), (0, 1));
    assert_eq!(progress[4].completed_steps, 1);
}

#[tokio::test]
async fn test_idle_cycles_add_no_progress() {
    let tp = TestPlanner::new(&["f1"]).await;
    tp.set_behaviour("f1", MockBehaviour::Manual).await;
    let order = tp.released(new_order("STEADY", "f1", &["L2_NO2"])).await;
    tp.cycle().await;
    tp.cycle().await;
    let before = tp.persistence.list_progress(&order.id).await.unwrap().len();

    for _ in 0..3 {
        tp.cycle().await;
    }
    assert_eq!(tp.persistence.list_progress(&order.id).await.unwrap().len(), before);

    let unit = tp.gateway("f1").live_units().await.remove(0);
    tp.gateway("f1").complete(&unit).await;
    tp.run_until(&order.id, OrderState::Completed, 1).await;
    assert_eq!(tp.persistence.list_progress(&order.id).await.unwrap().len(), before + 1);
}

#[tokio::test]
async fn test_cleanup_worker_disabled_returns_immediately() {
    let tp = TestPlanner::new(&["f1"]).await;
    let worker = OrderCleanupWorker::new(
        tp.persistence.clone(),
        OrderCleanupWorkerConfig {
            enabled: false,
            ..Default::default()
        },
    );
    tokio::time::timeout(Duration::from_secs(1), worker.run())
        .await
        .expect("disabled worker should return");
}

#[tokio::test]
async fn test_cleanup_worker_deletes_in_batches() {
    let tp = TestPlanner::with_settings(&["f1"], PlannerSettings {
        order_retention: Duration::ZERO,
        ..Default::default()
    })
    .await;

    let mut ids = Vec::new();
    for i in 0..5 {
        let order = tp
            .released(new_order(&format!("BATCH-{}", i), "f1", &["L2_NO2"]))
            .await;
        ids.push(order.id);
    }
    for _ in 0..4 {
        tp.cycle().await;
    }
    for id in &ids {
        assert_eq!(tp.order(id).await.state, OrderState::Completed);
        tp.control.close(id).await.unwrap();
    }

    let worker = OrderCleanupWorker::new(
        tp.persistence.clone(),
        OrderCleanupWorkerConfig {
            batch_size: 2,
            ..Default::default()
        },
    );
    assert_eq!(worker.run_cycle().await.unwrap(), 5);
    assert_eq!(worker.run_cycle().await.unwrap(), 0);
    for id in &ids {
        assert!(tp.persistence.get_order(id).await.unwrap().is_none());
    }
}

#[tokio::test]
async fn test_workers_stop_on_shutdown_signal() {
    let tp = TestPlanner::new(&["f1"]).await;

    let dispatch = DispatchLoop::new(
        tp.ctx.clone(),
        DispatchLoopConfig {
            cycle_interval: Duration::from_millis(10),
        },
    );
    let monitor = ProgressMonitor::new(
        tp.ctx.clone(),
        ProgressMonitorConfig {
            poll_interval: Duration::from_millis(10),
        },
    );
    let cleanup = OrderCleanupWorker::new(
        tp.persistence.clone(),
        OrderCleanupWorkerConfig {
            poll_interval: Duration::from_millis(10),
            ..Default::default()
        },
    );

    let shutdowns = [
        dispatch.shutdown_handle(),
        monitor.shutdown_handle(),
        cleanup.shutdown_handle(),
    ];
    let handles = [
        tokio::spawn(async move { dispatch.run().await }),
        tokio::spawn(async move { monitor.run().await }),
        tokio::spawn(async move { cleanup.run().await }),
    ];

    tokio::time::sleep(Duration::from_millis(50)).await;
    for shutdown in &shutdowns {
        shutdown.notify_one();
    }
    for handle in handles {
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("worker did not stop")
            .expect("worker panicked");
    }
}

#[tokio::test]
async fn test_runtime_drives_order_to_completion() {
    let tp = TestPlanner::new(&["f1", "f2"]).await;

    let runtime = PlannerRuntime::builder()
        .persistence(tp.persistence.clone())
        .catalog(Arc::new(MissionCatalog::from_json(MISSION).unwrap()))
        .facilities(tp.ctx.facilities.clone())
        .storage(tp.ctx.storage.clone())
        .notifier(tp.notifier.clone())
        .dispatch_config(DispatchLoopConfig {
            cycle_interval: Duration::from_millis(10),
        })
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();
    assert!(runtime.is_running());

    let control = runtime.control();
    let order = control
        .submit(sliced_order("RUNTIME", "f2", &["L1B", "L2_NO2"], 2, 30))
        .await
        .unwrap();
    control.approve(&order.id).await.unwrap();
    control.plan(&order.id).await.unwrap();
    control.release(&order.id).await.unwrap();

    let completed = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let order = tp.order(&order.id).await;
            if order.state == OrderState::Completed {
                return order;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("order did not complete");

    assert_eq!(completed.state, OrderState::Completed);
    assert_eq!(tp.gateway("f2").created_units(), 4);
    assert_eq!(tp.gateway("f1").created_units(), 0);

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_runtime_builder_requires_collaborators() {
    assert!(PlannerRuntime::builder().build().is_err());

    let tp = TestPlanner::new(&["f1"]).await;
    let missing_storage = PlannerRuntime::builder()
        .persistence(tp.persistence.clone())
        .catalog(Arc::new(MissionCatalog::from_json(MISSION).unwrap()))
        .facilities(tp.ctx.facilities.clone())
        .build();
    assert!(missing_storage.is_err());
}
