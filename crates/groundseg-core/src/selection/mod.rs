// Copyright (C) 2025 The groundseg Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Input product selection.
//!
//! A product class declares which inputs its processor needs through
//! selection rules. [`SelectionRule::parse`] turns the rule text into
//! policies; [`SelectionRuleEvaluator`] applies them to the catalog for a
//! job's sensing window.

pub mod evaluator;
pub mod policy;
pub mod rule;

pub use evaluator::{InputResolution, ProductCatalog, RuleResolution, SelectionRuleEvaluator};
pub use policy::{coverage_percent, order_candidates};
pub use rule::{PolicyKind, SelectionPolicy, SelectionRule};
