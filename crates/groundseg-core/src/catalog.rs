// Copyright (C) 2025 The groundseg Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mission reference data: product classes and configured processors.
//!
//! The catalog is loaded once from a JSON document at startup and shared
//! read-only between the planner components.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CoreError, Result};
use crate::selection::SelectionRule;

/// A product type and the processor that produces it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductClass {
    pub product_type: String,
    /// Identifier of the [`ConfiguredProcessor`] producing this class.
    pub processor: String,
    /// Selection rule text for the inputs, see [`SelectionRule::parse`].
    #[serde(default)]
    pub selection_rules: String,
}

/// A processor version plus the static configuration it runs with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfiguredProcessor {
    pub identifier: String,
    pub processor_name: String,
    pub version: String,
    /// Container image run on the facility.
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub config_files: Vec<String>,
    #[serde(default)]
    pub dynamic_parameters: BTreeMap<String, String>,
    #[serde(default = "default_log_level")]
    pub stdout_log_level: String,
    #[serde(default = "default_log_level")]
    pub stderr_log_level: String,
    #[serde(default)]
    pub test: bool,
}

fn default_log_level() -> String {
    "INFO".to_string()
}

/// Reference data for one mission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissionCatalog {
    pub mission_code: String,
    #[serde(default)]
    pub product_classes: Vec<ProductClass>,
    #[serde(default)]
    pub processors: Vec<ConfiguredProcessor>,
}

impl MissionCatalog {
    /// Parse and validate a catalog document.
    pub fn from_json(json: &str) -> Result<Self> {
        let catalog: MissionCatalog =
            serde_json::from_str(json).map_err(|e| CoreError::Configuration {
                context: "mission catalog".to_string(),
                message: e.to_string(),
            })?;
        catalog.validate()?;
        Ok(catalog)
    }

    /// Read a catalog document from disk.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| CoreError::Configuration {
                context: format!("mission catalog {}", path.display()),
                message: e.to_string(),
            })?;
        let catalog = Self::from_json(&json)?;
        debug!(
            mission = %catalog.mission_code,
            product_classes = catalog.product_classes.len(),
            processors = catalog.processors.len(),
            "Loaded mission catalog"
        );
        Ok(catalog)
    }

    /// Cross-reference checks. Rule syntax is checked here too so that a
    /// broken catalog is rejected at startup rather than mid-order.
    pub fn validate(&self) -> Result<()> {
        for class in &self.product_classes {
            if self.processor(&class.processor).is_none() {
                return Err(CoreError::Configuration {
                    context: format!("product class {}", class.product_type),
                    message: format!("unknown processor '{}'", class.processor),
                });
            }
            SelectionRule::parse(&class.selection_rules)?;
        }
        Ok(())
    }

    pub fn product_class(&self, product_type: &str) -> Option<&ProductClass> {
        self.product_classes
            .iter()
            .find(|c| c.product_type == product_type)
    }

    pub fn processor(&self, identifier: &str) -> Option<&ConfiguredProcessor> {
        self.processors.iter().find(|p| p.identifier == identifier)
    }

    /// Product class or a configuration error naming it.
    pub fn require_product_class(&self, product_type: &str) -> Result<&ProductClass> {
        self.product_class(product_type)
            .ok_or_else(|| CoreError::Configuration {
                context: format!("mission {}", self.mission_code),
                message: format!("unknown product class '{}'", product_type),
            })
    }

    /// Processor producing `product_type`.
    pub fn processor_for(&self, product_type: &str) -> Result<&ConfiguredProcessor> {
        let class = self.require_product_class(product_type)?;
        self.processor(&class.processor)
            .ok_or_else(|| CoreError::Configuration {
                context: format!("product class {}", product_type),
                message: format!("unknown processor '{}'", class.processor),
            })
    }

    /// Parsed input selection rules for `product_type`.
    pub fn selection_rules(&self, product_type: &str) -> Result<Vec<SelectionRule>> {
        let class = self.require_product_class(product_type)?;
        SelectionRule::parse(&class.selection_rules)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &str = r#"{
        "mission_code": "S5P",
        "product_classes": [
            {"product_type": "L1B", "processor": "l01b-1.0"},
            {"product_type": "L2_O3", "processor": "l2-2.1",
             "selection_rules": "FOR L1B SELECT ValIntersect(0, 0) MANDATORY"}
        ],
        "processors": [
            {"identifier": "l01b-1.0", "processor_name": "TROPONRT_L01B", "version": "1.0",
             "image": "registry.local/l01b:1.0"},
            {"identifier": "l2-2.1", "processor_name": "TROPNRT_O3", "version": "2.1",
             "image": "registry.local/o3:2.1", "config_files": ["o3.cfg"],
             "dynamic_parameters": {"threads": "4"}}
        ]
    }"#;

    #[test]
    fn test_load_and_lookup() {
        let catalog = MissionCatalog::from_json(CATALOG).unwrap();
        assert_eq!(catalog.mission_code, "S5P");

        let processor = catalog.processor_for("L2_O3").unwrap();
        assert_eq!(processor.processor_name, "TROPNRT_O3");
        assert_eq!(processor.stdout_log_level, "INFO");

        let rules = catalog.selection_rules("L2_O3").unwrap();
        assert_eq!(rules.len(), 1);
        assert!(catalog.selection_rules("L1B").unwrap().is_empty());
    }

    #[test]
    fn test_unknown_processor_is_configuration_error() {
        let json = r#"{
            "mission_code": "S5P",
            "product_classes": [{"product_type": "L1B", "processor": "missing"}],
            "processors": []
        }"#;
        let err = MissionCatalog::from_json(json).unwrap_err();
        assert!(matches!(err, CoreError::Configuration { .. }));
    }

    #[test]
    fn test_malformed_rule_rejected_at_load() {
        let json = r#"{
            "mission_code": "S5P",
            "product_classes": [{"product_type": "L2", "processor": "p",
                                 "selection_rules": "FOR L1B SELECT Nonsense(0, 0)"}],
            "processors": [{"identifier": "p", "processor_name": "P", "version": "1",
                            "image": "p:1"}]
        }"#;
        let err = MissionCatalog::from_json(json).unwrap_err();
        assert_eq!(err.error_code(), "RULE_SYNTAX_ERROR");
    }
}
