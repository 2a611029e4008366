// Copyright (C) 2025 The groundseg Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Groundseg Planner - production planning for a satellite ground segment
//!
//! Turns processing orders into job steps and drives them to completion on
//! the container clusters of one or more processing facilities.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                    Operators / processors                         │
//! │        (order commands, job step completion callbacks)            │
//! └──────────────────────────────────────────────────────────────────┘
//!                                 │
//!                                 ▼
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                    groundseg-planner (this crate)                 │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────────────┐ │
//! │  │ OrderControl │  │ DispatchLoop │  │ ProgressMonitor /        │ │
//! │  │              │  │              │  │ OrderCleanupWorker       │ │
//! │  └──────────────┘  └──────────────┘  └──────────────────────────┘ │
//! └──────────────────────────────────────────────────────────────────┘
//!        │                  │                         │
//!        ▼                  ▼                         ▼
//! ┌──────────────┐  ┌──────────────────────┐  ┌──────────────────────┐
//! │ Persistence  │  │ ClusterGateway       │  │ StorageManager       │
//! │ (core)       │  │ per facility         │  │ (job order files)    │
//! └──────────────┘  └──────────────────────┘  └──────────────────────┘
//! ```
//!
//! # Order lifecycle
//!
//! | Command | From | To |
//! |---------|------|----|
//! | `submit` | | `INITIAL` |
//! | `approve` | `INITIAL` | `APPROVED` |
//! | `reset` | `APPROVED`, `PLANNED` | `INITIAL` |
//! | `plan` | `APPROVED` | `PLANNED` (or `FAILED`) |
//! | `release` | `PLANNED` | `RELEASED` |
//! | `suspend` | `RELEASED`, `RUNNING` | `SUSPENDING` |
//! | `resume` | `PLANNED` | `RELEASED` |
//! | `cancel` | `APPROVED` through `SUSPENDING` | `FAILED` |
//! | `retry` | `FAILED` | `PLANNED` |
//! | `close` | `COMPLETED`, `FAILED` | `CLOSED` |
//!
//! `RUNNING`, `COMPLETED` and `FAILED` are otherwise reached by the
//! dispatch loop from the states of the job steps, as is the return from
//! `SUSPENDING` to `PLANNED` once no step is running.

pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod facility;
pub mod gateway;
pub mod ingestor;
pub mod job_step_machine;
pub mod notifier;
pub mod order_cleanup_worker;
pub mod order_control;
pub mod order_machine;
pub mod progress_monitor;
pub mod runtime;
pub mod storage;

pub use config::{Config, ConfigError};
pub use context::{PlannerContext, PlannerSettings};
pub use error::{Error, Result};
pub use facility::{Facility, FacilityConfig, FacilityRegistry};
pub use gateway::{ClusterGateway, ExecutionStatus, GatewayError};
pub use order_control::OrderControl;
pub use runtime::PlannerRuntime;
