// Copyright (C) 2025 The groundseg Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Resolution of selection rules against the product catalog.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument};

use crate::error::Result;
use crate::model::{Product, SensingWindow};
use crate::persistence::{Persistence, ProductQuery};

use super::policy::coverage_percent;
use super::rule::SelectionRule;

/// Read-only view of catalogued products.
#[async_trait]
pub trait ProductCatalog: Send + Sync {
    /// Products of `product_class` for `mission_code` matching `query`.
    async fn candidates(
        &self,
        mission_code: &str,
        product_class: &str,
        query: &ProductQuery,
    ) -> Result<Vec<Product>>;
}

#[async_trait]
impl<P: Persistence + ?Sized> ProductCatalog for P {
    async fn candidates(
        &self,
        mission_code: &str,
        product_class: &str,
        query: &ProductQuery,
    ) -> Result<Vec<Product>> {
        self.find_products(mission_code, product_class, query).await
    }
}

/// Outcome of resolving one rule.
#[derive(Debug, Clone, PartialEq)]
pub enum RuleResolution {
    /// Selected products, possibly empty for an optional rule.
    Satisfied(Vec<Product>),
    Unsatisfied,
}

/// Outcome of resolving every rule of a job step.
#[derive(Debug, Clone, PartialEq)]
pub enum InputResolution {
    /// Union of all selected products, ordered by class then preference.
    Satisfied(Vec<Product>),
    /// Product types whose mandatory rules found nothing.
    Unsatisfied(Vec<String>),
}

/// Evaluates selection rules against a [`ProductCatalog`].
///
/// The evaluator never writes; its bound only grants catalog reads.
pub struct SelectionRuleEvaluator<C: ?Sized = dyn ProductCatalog> {
    catalog: Arc<C>,
}

impl<C: ?Sized> Clone for SelectionRuleEvaluator<C> {
    fn clone(&self) -> Self {
        Self {
            catalog: self.catalog.clone(),
        }
    }
}

impl<C: ProductCatalog + ?Sized> SelectionRuleEvaluator<C> {
    pub fn new(catalog: Arc<C>) -> Self {
        Self { catalog }
    }

    /// Resolve a single rule for a job window.
    #[instrument(skip(self, rule), fields(product_type = %rule.product_type))]
    pub async fn resolve(
        &self,
        mission_code: &str,
        window: &SensingWindow,
        rule: &SelectionRule,
    ) -> Result<RuleResolution> {
        for policy in &rule.policies {
            let candidates = self
                .catalog
                .candidates(mission_code, &rule.product_type, &policy.query(window))
                .await?;
            let selected = policy.select(window, &candidates);
            if selected.is_empty() {
                continue;
            }

            if let Some(min) = rule.min_coverage {
                let pct = coverage_percent(window, &selected);
                if pct < f64::from(min) {
                    debug!(
                        policy = policy.kind.name(),
                        coverage = pct,
                        required = min,
                        "Selection below minimum coverage"
                    );
                    continue;
                }
            }

            return Ok(RuleResolution::Satisfied(
                selected.into_iter().cloned().collect(),
            ));
        }

        if rule.mandatory {
            Ok(RuleResolution::Unsatisfied)
        } else {
            Ok(RuleResolution::Satisfied(Vec::new()))
        }
    }

    /// Resolve all rules of a job step. The result is identical for
    /// identical catalog contents.
    pub async fn resolve_all(
        &self,
        mission_code: &str,
        window: &SensingWindow,
        rules: &[SelectionRule],
    ) -> Result<InputResolution> {
        let mut selected = Vec::new();
        let mut seen = BTreeSet::new();
        let mut missing = Vec::new();

        for rule in rules {
            match self.resolve(mission_code, window, rule).await? {
                RuleResolution::Satisfied(products) => {
                    for product in products {
                        if seen.insert(product.id.clone()) {
                            selected.push(product);
                        }
                    }
                }
                RuleResolution::Unsatisfied => missing.push(rule.product_type.clone()),
            }
        }

        if missing.is_empty() {
            Ok(InputResolution::Satisfied(selected))
        } else {
            Ok(InputResolution::Unsatisfied(missing))
        }
    }
}
