// Copyright (C) 2025 The groundseg Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Processing facility registry.
//!
//! Built once at startup from a JSON document and handed to the dispatch
//! loop. Each facility owns one cluster gateway; nothing here is mutated
//! after construction.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::ConfigError;
use crate::error::{Error, Result};
use crate::gateway::{ClusterGateway, GatewayHealth, KubernetesGateway, MockGateway};

fn default_namespace() -> String {
    "default".to_string()
}

fn default_storage_type() -> String {
    "POSIX".to_string()
}

/// Which scheduler a facility runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayConfig {
    Kubernetes {
        /// Kubeconfig file; the in-cluster or default config is used when absent.
        #[serde(default)]
        kubeconfig_path: Option<PathBuf>,
        #[serde(default)]
        context: Option<String>,
        #[serde(default = "default_namespace")]
        namespace: String,
    },
    /// In-process simulation, for local runs.
    Mock,
}

/// Host directory mounted into every execution unit of a facility.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeConfig {
    pub name: String,
    pub host_path: String,
    pub mount_path: String,
}

/// One entry of the facility document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FacilityConfig {
    pub name: String,
    pub gateway: GatewayConfig,
    /// Storage type handed to processors (`POSIX`, `S3`, ...).
    #[serde(default = "default_storage_type")]
    pub storage_type: String,
    pub storage_endpoint: String,
    #[serde(default)]
    pub storage_user: Option<String>,
    #[serde(default)]
    pub storage_password: Option<String>,
    /// Where processors write their log file.
    #[serde(default)]
    pub log_target: Option<String>,
    #[serde(default)]
    pub volumes: Vec<VolumeConfig>,
    /// Facility-specific environment passed to every execution unit.
    #[serde(default)]
    pub extra_env: BTreeMap<String, String>,
}

impl FacilityConfig {
    /// Reject entries that cannot be dispatched to.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let missing = |field: &str| ConfigError::Facility {
            facility: self.name.clone(),
            message: format!("{} is required", field),
        };

        if self.name.trim().is_empty() {
            return Err(missing("name"));
        }
        if self.storage_endpoint.trim().is_empty() {
            return Err(missing("storage_endpoint"));
        }
        if self.storage_user.as_deref().is_none_or(str::is_empty) {
            return Err(missing("storage_user"));
        }
        if self.storage_password.as_deref().is_none_or(str::is_empty) {
            return Err(missing("storage_password"));
        }
        Ok(())
    }

    /// Environment of an execution unit running `job_step_id`.
    pub fn execution_env(
        &self,
        job_step_id: &str,
        joborder_location: &str,
        callback_url: Option<&str>,
    ) -> BTreeMap<String, String> {
        let mut env = self.extra_env.clone();
        env.insert("JOBORDER_FILE".to_string(), joborder_location.to_string());
        env.insert("FS_TYPE".to_string(), self.storage_type.clone());
        env.insert("STORAGE_ENDPOINT".to_string(), self.storage_endpoint.clone());
        env.insert(
            "STORAGE_USER".to_string(),
            self.storage_user.clone().unwrap_or_default(),
        );
        env.insert(
            "STORAGE_PASSWORD".to_string(),
            self.storage_password.clone().unwrap_or_default(),
        );
        if let Some(target) = &self.log_target {
            env.insert("LOGFILE_TARGET".to_string(), target.clone());
        }
        if let Some(url) = callback_url {
            env.insert(
                "STATE_CALLBACK_ENDPOINT".to_string(),
                format!("{}/jobsteps/{}", url.trim_end_matches('/'), job_step_id),
            );
            env.insert("SUCCESS_STATE".to_string(), "COMPLETED".to_string());
        }
        env
    }
}

/// A configured facility and its gateway.
#[derive(Clone)]
pub struct Facility {
    pub config: FacilityConfig,
    pub gateway: Arc<dyn ClusterGateway>,
}

/// Facilities by name.
#[derive(Clone, Default)]
pub struct FacilityRegistry {
    facilities: BTreeMap<String, Facility>,
}

impl FacilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a facility, replacing any entry of the same name.
    pub fn insert(&mut self, config: FacilityConfig, gateway: Arc<dyn ClusterGateway>) {
        self.facilities
            .insert(config.name.clone(), Facility { config, gateway });
    }

    pub fn get(&self, name: &str) -> Option<&Facility> {
        self.facilities.get(name)
    }

    pub fn require(&self, name: &str) -> Result<&Facility> {
        self.get(name)
            .ok_or_else(|| Error::UnknownFacility(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.facilities.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Facility> {
        self.facilities.values()
    }

    pub fn len(&self) -> usize {
        self.facilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.facilities.is_empty()
    }

    /// Read and validate the facility document.
    pub async fn load_configs(
        path: impl AsRef<Path>,
    ) -> std::result::Result<Vec<FacilityConfig>, ConfigError> {
        let path = path.as_ref();
        let document = path.display().to_string();
        let json = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ConfigError::Facility {
                facility: document.clone(),
                message: e.to_string(),
            })?;
        Self::parse_configs(&json).map_err(|e| match e {
            ConfigError::Facility { facility, message } if facility.is_empty() => {
                ConfigError::Facility {
                    facility: document,
                    message,
                }
            }
            other => other,
        })
    }

    /// Parse and validate a facility document.
    pub fn parse_configs(json: &str) -> std::result::Result<Vec<FacilityConfig>, ConfigError> {
        let configs: Vec<FacilityConfig> =
            serde_json::from_str(json).map_err(|e| ConfigError::Facility {
                facility: String::new(),
                message: e.to_string(),
            })?;
        for config in &configs {
            config.validate()?;
        }
        Ok(configs)
    }

    /// Build gateways for every facility and check each one answers.
    ///
    /// An unreachable cluster is logged, not fatal: its steps wait until the
    /// cluster answers.
    pub async fn from_configs(configs: Vec<FacilityConfig>) -> Result<Self> {
        let mut registry = Self::new();
        for config in configs {
            let gateway: Arc<dyn ClusterGateway> = match &config.gateway {
                GatewayConfig::Kubernetes {
                    kubeconfig_path,
                    context,
                    namespace,
                } => Arc::new(
                    KubernetesGateway::connect_to(
                        config.name.clone(),
                        kubeconfig_path.as_deref(),
                        context.as_deref(),
                        namespace.clone(),
                        config.volumes.clone(),
                    )
                    .await?,
                ),
                GatewayConfig::Mock => Arc::new(MockGateway::new(config.name.clone())),
            };

            match gateway.connect().await {
                Ok(GatewayHealth::Healthy) => info!(
                    facility = %config.name,
                    gateway_type = gateway.gateway_type(),
                    "Facility connected"
                ),
                Ok(GatewayHealth::Degraded { reason }) => warn!(
                    facility = %config.name,
                    reason = %reason,
                    "Facility degraded"
                ),
                Err(e) => warn!(
                    facility = %config.name,
                    error = %e,
                    "Facility unreachable at startup"
                ),
            }

            registry.insert(config, gateway);
        }
        Ok(registry)
    }
}
