// Copyright (C) 2025 The groundseg Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for groundseg-planner tests.
//!
//! Provides TestPlanner: an in-memory SQLite database, mock facilities, a
//! temporary storage root and a notifier that records what it was told.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use groundseg_core::{
    Diagnostic, JobStep, MissionCatalog, NewOrder, OrderState, Persistence, ProcessingOrder,
    Product, RetryCoordinator, RetryPolicy, SlicingType, SqlitePersistence, migrations,
};
use groundseg_planner::context::{PlannerContext, PlannerSettings};
use groundseg_planner::dispatch::{CycleReport, DispatchLoop, DispatchLoopConfig};
use groundseg_planner::facility::{FacilityConfig, FacilityRegistry, GatewayConfig};
use groundseg_planner::gateway::{ClusterGateway, MockBehaviour, MockGateway};
use groundseg_planner::ingestor::CatalogIngestor;
use groundseg_planner::notifier::Notifier;
use groundseg_planner::order_control::OrderControl;
use groundseg_planner::storage::PosixStorage;
use sqlx::sqlite::SqlitePoolOptions;

/// Mission with one raw product class and two derived ones.
pub const MISSION: &str = r#"{
    "mission_code": "S5P",
    "product_classes": [
        {"product_type": "L1B", "processor": "l01b-1.0"},
        {"product_type": "L2_O3", "processor": "l2-2.1",
         "selection_rules": "FOR L1B SELECT ValIntersect(0, 0) MANDATORY"},
        {"product_type": "L2_NO2", "processor": "l2-2.1"}
    ],
    "processors": [
        {"identifier": "l01b-1.0", "processor_name": "TROPONRT_L01B", "version": "1.0",
         "image": "registry.local/l01b:1.0"},
        {"identifier": "l2-2.1", "processor_name": "TROPNRT_L2", "version": "2.1",
         "image": "registry.local/l2:2.1", "command": ["/usr/bin/run-l2"]}
    ]
}"#;

pub const CALLBACK_URL: &str = "http://planner.local/api";

/// Noon on 2024-03-01.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

/// Everything an end-to-end planner test needs, wired like the runtime
/// wires it but driven one cycle at a time.
pub struct TestPlanner {
    pub ctx: Arc<PlannerContext>,
    pub control: OrderControl,
    pub dispatch: DispatchLoop,
    pub persistence: Arc<dyn Persistence>,
    pub gateways: BTreeMap<String, Arc<MockGateway>>,
    pub notifier: Arc<RecordingNotifier>,
    pub storage_dir: tempfile::TempDir,
}

impl TestPlanner {
    /// Planner with one mock facility per name, all auto-succeeding.
    pub async fn new(facilities: &[&str]) -> Self {
        Self::with_settings(facilities, PlannerSettings {
            gateway_timeout: Duration::from_secs(5),
            callback_url: Some(CALLBACK_URL.to_string()),
            ..Default::default()
        })
        .await
    }

    pub async fn with_settings(facilities: &[&str], settings: PlannerSettings) -> Self {
        Self::assemble(facilities, settings, |gateway| gateway).await
    }

    /// Planner whose facilities reach their mock through `wrap`. The mock
    /// stays available through [`TestPlanner::gateway`].
    pub async fn with_gateway<F>(facilities: &[&str], wrap: F) -> Self
    where
        F: Fn(Arc<dyn ClusterGateway>) -> Arc<dyn ClusterGateway>,
    {
        Self::assemble(
            facilities,
            PlannerSettings {
                gateway_timeout: Duration::from_secs(5),
                callback_url: Some(CALLBACK_URL.to_string()),
                ..Default::default()
            },
            wrap,
        )
        .await
    }

    async fn assemble<F>(facilities: &[&str], settings: PlannerSettings, wrap: F) -> Self
    where
        F: Fn(Arc<dyn ClusterGateway>) -> Arc<dyn ClusterGateway>,
    {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool");
        migrations::run_sqlite(&pool)
            .await
            .expect("Failed to run migrations");
        let persistence: Arc<dyn Persistence> = Arc::new(SqlitePersistence::new(pool));

        let mut registry = FacilityRegistry::new();
        let mut gateways = BTreeMap::new();
        for name in facilities {
            let gateway = Arc::new(MockGateway::new(*name));
            registry.insert(
                facility_config(name),
                wrap(gateway.clone() as Arc<dyn ClusterGateway>),
            );
            gateways.insert(name.to_string(), gateway);
        }

        let storage_dir = tempfile::TempDir::new().expect("Failed to create temp dir");
        let notifier = Arc::new(RecordingNotifier::default());
        let catalog = MissionCatalog::from_json(MISSION).expect("Invalid test mission");

        let ctx = Arc::new(PlannerContext::new(
            persistence.clone(),
            Arc::new(catalog),
            Arc::new(registry),
            Arc::new(PosixStorage::new(storage_dir.path())),
            Arc::new(CatalogIngestor::new(persistence.clone())),
            notifier.clone(),
            RetryCoordinator::new(RetryPolicy {
                max_attempts: 5,
                delay: Duration::from_millis(1),
            }),
            settings,
        ));

        Self {
            control: OrderControl::new(ctx.clone()),
            dispatch: DispatchLoop::new(ctx.clone(), DispatchLoopConfig::default()),
            ctx,
            persistence,
            gateways,
            notifier,
            storage_dir,
        }
    }

    pub fn gateway(&self, facility: &str) -> &Arc<MockGateway> {
        self.gateways
            .get(facility)
            .unwrap_or_else(|| panic!("no mock facility {}", facility))
    }

    pub async fn set_behaviour(&self, facility: &str, behaviour: MockBehaviour) {
        self.gateway(facility).set_behaviour(behaviour).await;
    }

    /// Submit, approve, plan and release an order.
    pub async fn released(&self, new: NewOrder) -> ProcessingOrder {
        let order = self.control.submit(new).await.expect("submit failed");
        self.control.approve(&order.id).await.expect("approve failed");
        self.control.plan(&order.id).await.expect("plan failed");
        self.control.release(&order.id).await.expect("release failed")
    }

    pub async fn cycle(&self) -> CycleReport {
        self.dispatch.run_cycle().await.expect("dispatch cycle failed")
    }

    /// Run cycles until the order reaches `state`, at most `max_cycles`.
    pub async fn run_until(&self, order_id: &str, state: OrderState, max_cycles: usize) -> ProcessingOrder {
        for _ in 0..max_cycles {
            self.cycle().await;
            let order = self.order(order_id).await;
            if order.state == state {
                return order;
            }
        }
        let order = self.order(order_id).await;
        panic!(
            "order {} is {} after {} cycles, expected {}",
            order_id, order.state, max_cycles, state
        );
    }

    pub async fn order(&self, order_id: &str) -> ProcessingOrder {
        self.persistence
            .get_order(order_id)
            .await
            .expect("get_order failed")
            .expect("order missing")
    }

    pub async fn steps(&self, order_id: &str) -> Vec<JobStep> {
        self.persistence
            .list_job_steps(order_id)
            .await
            .expect("list_job_steps failed")
    }

    /// Catalogue an externally produced product.
    pub async fn ingest(&self, product_class: &str, start: DateTime<Utc>, stop: DateTime<Utc>) -> Product {
        let product = Product {
            id: format!("{}-{}", product_class, start.timestamp()),
            product_class: product_class.to_string(),
            mission_code: "S5P".to_string(),
            sensing_start: start,
            sensing_stop: stop,
            generation_time: Utc::now(),
            file_name: format!("{}_{}.nc", product_class, start.format("%Y%m%dT%H%M%S")),
            facility: "external".to_string(),
            job_step_id: None,
            created_at: Utc::now(),
        };
        self.persistence
            .insert_product(&product)
            .await
            .expect("insert_product failed");
        product
    }
}

pub fn facility_config(name: &str) -> FacilityConfig {
    FacilityConfig {
        name: name.to_string(),
        gateway: GatewayConfig::Mock,
        storage_type: "POSIX".to_string(),
        storage_endpoint: format!("/data/{}", name),
        storage_user: Some("planner".to_string()),
        storage_password: Some("secret".to_string()),
        log_target: None,
        volumes: vec![],
        extra_env: BTreeMap::new(),
    }
}

/// A one-hour order producing `classes` on `facility`.
pub fn new_order(identifier: &str, facility: &str, classes: &[&str]) -> NewOrder {
    NewOrder {
        identifier: identifier.to_string(),
        mission_code: "S5P".to_string(),
        start_time: t0(),
        stop_time: t0() + chrono::Duration::hours(1),
        slicing_type: SlicingType::None,
        slice_duration_secs: None,
        slice_overlap_secs: 0,
        requested_product_classes: classes.iter().map(|c| c.to_string()).collect(),
        facility: facility.to_string(),
        processing_mode: None,
        dynamic_parameters: BTreeMap::new(),
        tolerate_partial_failure: false,
        max_step_attempts: None,
    }
}

/// Like [`new_order`], cut into `slices` slices of `slice_minutes` each.
pub fn sliced_order(
    identifier: &str,
    facility: &str,
    classes: &[&str],
    slices: i64,
    slice_minutes: i64,
) -> NewOrder {
    NewOrder {
        stop_time: t0() + chrono::Duration::minutes(slices * slice_minutes),
        slicing_type: SlicingType::TimeSlice,
        slice_duration_secs: Some(slice_minutes * 60),
        ..new_order(identifier, facility, classes)
    }
}

/// What the planner reported to the order owners.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    StepExhausted {
        job_step_id: String,
        code: String,
    },
    OrderFailed {
        order_id: String,
        code: String,
        job_step_id: Option<String>,
    },
}

#[derive(Default)]
pub struct RecordingNotifier {
    notices: Mutex<Vec<Notice>>,
}

impl RecordingNotifier {
    pub fn notices(&self) -> Vec<Notice> {
        self.notices.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn job_step_exhausted(&self, _order: &ProcessingOrder, step: &JobStep, diagnostic: &Diagnostic) {
        self.notices.lock().unwrap().push(Notice::StepExhausted {
            job_step_id: step.id.clone(),
            code: diagnostic.code.clone(),
        });
    }

    async fn order_failed(&self, order: &ProcessingOrder, diagnostic: &Diagnostic) {
        self.notices.lock().unwrap().push(Notice::OrderFailed {
            order_id: order.id.clone(),
            code: diagnostic.code.clone(),
            job_step_id: diagnostic.job_step_id.clone(),
        });
    }
}
