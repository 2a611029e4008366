// Copyright (C) 2025 The groundseg Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for groundseg-planner.

use groundseg_core::error::{CoreError, Diagnostic, ErrorKind};
use thiserror::Error;

use crate::gateway::GatewayError;
use crate::storage::StorageError;

/// Planner errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Core operation failed (persistence, lifecycle, planning).
    #[error("Core error: {0}")]
    Core(#[from] CoreError),

    /// Cluster gateway call failed.
    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    /// Storage manager call failed.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The job references a facility missing from the registry.
    #[error("Unknown facility: {0}")]
    UnknownFacility(String),
}

impl Error {
    /// Whether the next cycle may succeed where this one failed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Core(e) => e.kind() == ErrorKind::Transient,
            Self::Gateway(e) => e.is_transient(),
            Self::Storage(_) | Self::Database(_) | Self::Io(_) => true,
            _ => false,
        }
    }

    /// Structured diagnostic for order and job step records.
    pub fn diagnostic(&self) -> Diagnostic {
        match self {
            Self::Core(e) => Diagnostic::from_error(e),
            Self::Gateway(e) => e.diagnostic(),
            Self::UnknownFacility(name) => Diagnostic::new(
                ErrorKind::Configuration,
                "UNKNOWN_FACILITY",
                format!("facility '{}' is not configured", name),
            ),
            Self::Config(e) => {
                Diagnostic::new(ErrorKind::Configuration, "CONFIGURATION_ERROR", e.to_string())
            }
            Self::Storage(_) | Self::Database(_) | Self::Io(_) | Self::Json(_) => Diagnostic::new(
                ErrorKind::Transient,
                "INFRASTRUCTURE_ERROR",
                "infrastructure failure, see planner log",
            ),
        }
    }
}

/// Result type using the planner error.
pub type Result<T> = std::result::Result<T, Error>;
