// Copyright (C) 2025 The groundseg Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Groundseg Core - orders, jobs and job steps of a production planner
//!
//! This crate holds everything about satellite product processing that does
//! not talk to a processing facility: the domain records, their lifecycle
//! state machines, order decomposition, input selection rules, job order
//! descriptors and durable storage.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                      groundseg-planner                         │
//! │     (order control, dispatch loop, facility gateways)          │
//! └───────────────────────────────────────────────────────────────┘
//!            │ plans, transitions, descriptors    │ versioned writes
//!            ▼                                    ▼
//! ┌────────────────────────────┐      ┌──────────────────────────┐
//! │  groundseg-core (pure)     │      │  Persistence             │
//! │  planning / lifecycle /    │      │  (PostgreSQL or SQLite)  │
//! │  selection / joborder      │      │                          │
//! └────────────────────────────┘      └──────────────────────────┘
//! ```
//!
//! # Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`model`] | Orders, jobs, job steps, products, progress snapshots |
//! | [`lifecycle`] | Step transitions and order state derivation |
//! | [`planning`] | Slicing an order into jobs and job steps |
//! | [`catalog`] | Mission configuration: product classes and processors |
//! | [`selection`] | Selection rule parsing and input resolution |
//! | [`joborder`] | Job order descriptor construction and XML |
//! | [`persistence`] | Storage trait with PostgreSQL and SQLite backends |
//! | [`retry`] | Replay of read-modify-write sequences on write conflicts |
//!
//! # Concurrency
//!
//! Several planner instances may drive the same database. Every write to an
//! order, job or job step carries the version the writer read; a stale write
//! fails with [`CoreError::Conflict`](error::CoreError::Conflict) and the
//! caller replays the whole sequence through [`retry::RetryCoordinator`].
//! Side effects bound to a transition run only after its write has landed.

/// Mission configuration: product classes, processors and their rules.
pub mod catalog;

/// Error types and persisted failure diagnostics.
pub mod error;

/// Job order descriptors.
pub mod joborder;

/// Job step and order state machines.
pub mod lifecycle;

/// Embedded database migrations.
pub mod migrations;

/// Domain records and state enums.
pub mod model;

/// Durable storage.
pub mod persistence;

/// Order decomposition.
pub mod planning;

/// Conflict retry.
pub mod retry;

/// Input product selection.
pub mod selection;

pub use catalog::{ConfiguredProcessor, MissionCatalog, ProductClass};
pub use error::{CoreError, Diagnostic, ErrorKind, Result};
pub use model::{
    Job, JobState, JobStep, JobStepState, MonOrderProgress, NewOrder, OrderState,
    ProcessingOrder, Product, SensingWindow, SlicingType, StepCounts,
};
pub use persistence::{Persistence, PostgresPersistence, ProductQuery, SqlitePersistence};
pub use retry::{RetryCoordinator, RetryPolicy};
