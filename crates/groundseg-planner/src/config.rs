// Copyright (C) 2025 The groundseg Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for groundseg-planner.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use groundseg_core::retry::RetryPolicy;

/// Planner configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL (`postgres://`) or SQLite (`sqlite:`) database URL
    pub database_url: String,
    /// JSON document listing the processing facilities
    pub facilities_file: PathBuf,
    /// JSON document with the mission's product classes and processors
    pub mission_file: PathBuf,
    /// Root directory for job order descriptors and products
    pub storage_root: PathBuf,
    /// Pause between dispatch cycles
    pub cycle_interval: Duration,
    /// Timeout applied to every cluster gateway call
    pub gateway_timeout: Duration,
    /// Attempt budget given to job steps of new orders
    pub max_step_attempts: i32,
    /// Bounds for replaying conflicting writes
    pub retry: RetryPolicy,
    /// Pause between progress snapshots
    pub progress_interval: Duration,
    /// Endpoint processors report their terminal state to
    pub callback_url: Option<String>,
    /// How long closed orders are kept before eviction
    pub order_retention: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = required("GROUNDSEG_DATABASE_URL")?;
        let facilities_file = PathBuf::from(required("GROUNDSEG_FACILITIES_FILE")?);
        let mission_file = PathBuf::from(required("GROUNDSEG_MISSION_FILE")?);

        let storage_root = PathBuf::from(
            std::env::var("GROUNDSEG_STORAGE_ROOT").unwrap_or_else(|_| ".data/storage".to_string()),
        );

        let cycle_interval = Duration::from_secs(parsed("GROUNDSEG_CYCLE_INTERVAL_SECS", 10)?);
        let gateway_timeout = Duration::from_secs(parsed("GROUNDSEG_GATEWAY_TIMEOUT_SECS", 30)?);
        let max_step_attempts: i32 = parsed("GROUNDSEG_MAX_STEP_ATTEMPTS", 3)?;
        if max_step_attempts < 1 {
            return Err(ConfigError::InvalidValue {
                var: "GROUNDSEG_MAX_STEP_ATTEMPTS",
                value: max_step_attempts.to_string(),
            });
        }

        let retry = RetryPolicy {
            max_attempts: parsed("GROUNDSEG_RETRY_MAX_ATTEMPTS", 5)?,
            delay: Duration::from_millis(parsed("GROUNDSEG_RETRY_DELAY_MS", 200)?),
        };

        let progress_interval =
            Duration::from_secs(parsed("GROUNDSEG_PROGRESS_INTERVAL_SECS", 60)?);

        let callback_url = std::env::var("GROUNDSEG_CALLBACK_URL")
            .ok()
            .filter(|v| !v.is_empty());

        let retention_days: u64 = parsed("GROUNDSEG_ORDER_RETENTION_DAYS", 30)?;

        Ok(Self {
            database_url,
            facilities_file,
            mission_file,
            storage_root,
            cycle_interval,
            gateway_timeout,
            max_step_attempts,
            retry,
            progress_interval,
            callback_url,
            order_retention: Duration::from_secs(retention_days * 24 * 3600),
        })
    }
}

fn required(var: &'static str) -> Result<String, ConfigError> {
    std::env::var(var).map_err(|_| ConfigError::MissingEnvVar(var))
}

fn parsed<T: FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(var) {
        Ok(value) => value
            .parse()
            .map_err(|_| ConfigError::InvalidValue { var, value }),
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),

    /// An environment variable holds an unusable value.
    #[error("Invalid value '{value}' for {var}")]
    InvalidValue { var: &'static str, value: String },

    /// The facility registry could not be read or is incomplete.
    #[error("Facility '{facility}': {message}")]
    Facility { facility: String, message: String },
}
