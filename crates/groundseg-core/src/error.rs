// Copyright (C) 2025 The groundseg Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for groundseg-core.
//!
//! Every error carries a stable code and an [`ErrorKind`] that tells the
//! dispatch loop whether the condition is worth another attempt.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Coarse classification used for retry decisions and order diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Malformed reference data or facility setup. Never retried.
    Configuration,
    /// Infrastructure hiccup (write conflict, unreachable cluster). Retried.
    Transient,
    /// The processor ran and failed.
    Execution,
    /// A request was rejected because it does not fit the current state.
    Validation,
    /// The addressed entity does not exist.
    NotFound,
}

impl ErrorKind {
    /// Database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Configuration => "CONFIGURATION",
            Self::Transient => "TRANSIENT",
            Self::Execution => "EXECUTION",
            Self::Validation => "VALIDATION",
            Self::NotFound => "NOT_FOUND",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "CONFIGURATION" => Ok(Self::Configuration),
            "TRANSIENT" => Ok(Self::Transient),
            "EXECUTION" => Ok(Self::Execution),
            "VALIDATION" => Ok(Self::Validation),
            "NOT_FOUND" => Ok(Self::NotFound),
            other => Err(CoreError::ValidationError {
                field: "error_kind".to_string(),
                message: format!("unknown error kind '{}'", other),
            }),
        }
    }
}

/// Structured failure information attached to orders and job steps.
///
/// Presentation (message catalogs, localisation) is left to the callers; the
/// core only records what happened and where.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// Failure class.
    pub kind: ErrorKind,
    /// Stable machine-readable code.
    pub code: String,
    /// Human-readable summary.
    pub message: String,
    /// Job step the failure originated from, if any.
    pub job_step_id: Option<String>,
}

impl Diagnostic {
    /// Create a diagnostic not tied to a job step.
    pub fn new(kind: ErrorKind, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: code.into(),
            message: message.into(),
            job_step_id: None,
        }
    }

    /// Attach the originating job step.
    pub fn for_job_step(mut self, job_step_id: impl Into<String>) -> Self {
        self.job_step_id = Some(job_step_id.into());
        self
    }

    /// Build a diagnostic from a core error.
    pub fn from_error(err: &CoreError) -> Self {
        Self::new(err.kind(), err.error_code(), err.to_string())
    }

    /// Whether a job step failing with this diagnostic may be attempted again.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind, ErrorKind::Execution | ErrorKind::Transient)
    }
}

/// Core errors that can occur while planning and driving orders.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum CoreError {
    /// Order was not found in the database.
    OrderNotFound {
        /// The order ID that was not found.
        order_id: String,
    },

    /// Job was not found in the database.
    JobNotFound {
        /// The job ID that was not found.
        job_id: String,
    },

    /// Job step was not found in the database.
    JobStepNotFound {
        /// The job step ID that was not found.
        job_step_id: String,
    },

    /// The requested state change is not allowed from the current state.
    InvalidStateTransition {
        /// Entity type ("order", "job step").
        entity: &'static str,
        /// Entity ID.
        id: String,
        /// Current state.
        from: String,
        /// Requested state.
        to: String,
    },

    /// Another writer modified the row since it was read.
    Conflict {
        /// Entity type ("order", "job", "job step").
        entity: &'static str,
        /// Entity ID.
        id: String,
        /// Version the caller based its update on.
        expected_version: i64,
    },

    /// Reference data or facility setup cannot be used.
    Configuration {
        /// What was being configured (product class, facility, processor).
        context: String,
        /// What is wrong with it.
        message: String,
    },

    /// A selection rule text could not be parsed.
    RuleSyntax {
        /// The offending rule text.
        rule: String,
        /// Byte offset of the problem.
        position: usize,
        /// What was expected.
        message: String,
    },

    /// A job order descriptor could not be rendered or parsed.
    Descriptor {
        /// Error details.
        message: String,
    },

    /// Input validation failed.
    ValidationError {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// Database operation failed.
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::OrderNotFound { .. } => "ORDER_NOT_FOUND",
            Self::JobNotFound { .. } => "JOB_NOT_FOUND",
            Self::JobStepNotFound { .. } => "JOB_STEP_NOT_FOUND",
            Self::InvalidStateTransition { .. } => "INVALID_STATE_TRANSITION",
            Self::Conflict { .. } => "CONCURRENT_MODIFICATION",
            Self::Configuration { .. } => "CONFIGURATION_ERROR",
            Self::RuleSyntax { .. } => "RULE_SYNTAX_ERROR",
            Self::Descriptor { .. } => "DESCRIPTOR_ERROR",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
        }
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::OrderNotFound { .. } | Self::JobNotFound { .. } | Self::JobStepNotFound { .. } => {
                ErrorKind::NotFound
            }
            Self::InvalidStateTransition { .. } | Self::ValidationError { .. } => {
                ErrorKind::Validation
            }
            Self::Conflict { .. } | Self::DatabaseError { .. } => ErrorKind::Transient,
            Self::Configuration { .. } | Self::RuleSyntax { .. } | Self::Descriptor { .. } => {
                ErrorKind::Configuration
            }
        }
    }

    /// True for optimistic-locking failures.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub fn invalid_transition(
        entity: &'static str,
        id: &str,
        from: impl fmt::Display,
        to: impl fmt::Display,
    ) -> Self {
        Self::InvalidStateTransition {
            entity,
            id: id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OrderNotFound { order_id } => write!(f, "Order '{}' not found", order_id),
            Self::JobNotFound { job_id } => write!(f, "Job '{}' not found", job_id),
            Self::JobStepNotFound { job_step_id } => {
                write!(f, "Job step '{}' not found", job_step_id)
            }
            Self::InvalidStateTransition {
                entity,
                id,
                from,
                to,
            } => write!(
                f,
                "Illegal {} state transition for '{}' from {} to {}",
                entity, id, from, to
            ),
            Self::Conflict {
                entity,
                id,
                expected_version,
            } => write!(
                f,
                "The {} '{}' was modified concurrently (expected version {})",
                entity, id, expected_version
            ),
            Self::Configuration { context, message } => {
                write!(f, "Configuration error in {}: {}", context, message)
            }
            Self::RuleSyntax {
                rule,
                position,
                message,
            } => write!(
                f,
                "Syntax error in selection rule '{}' at offset {}: {}",
                rule, position, message
            ),
            Self::Descriptor { message } => write!(f, "Job order error: {}", message),
            Self::ValidationError { field, message } => {
                write!(f, "Validation error for '{}': {}", field, message)
            }
            Self::DatabaseError { operation, details } => {
                write!(f, "Database error during '{}': {}", operation, details)
            }
        }
    }
}

impl std::error::Error for CoreError {}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::DatabaseError {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_and_kinds() {
        let test_cases = vec![
            (
                CoreError::OrderNotFound {
                    order_id: "o-1".to_string(),
                },
                "ORDER_NOT_FOUND",
                ErrorKind::NotFound,
            ),
            (
                CoreError::Conflict {
                    entity: "job step",
                    id: "js-1".to_string(),
                    expected_version: 3,
                },
                "CONCURRENT_MODIFICATION",
                ErrorKind::Transient,
            ),
            (
                CoreError::RuleSyntax {
                    rule: "FOR".to_string(),
                    position: 3,
                    message: "expected product type".to_string(),
                },
                "RULE_SYNTAX_ERROR",
                ErrorKind::Configuration,
            ),
            (
                CoreError::invalid_transition("order", "o-1", "INITIAL", "RUNNING"),
                "INVALID_STATE_TRANSITION",
                ErrorKind::Validation,
            ),
        ];

        for (err, code, kind) in test_cases {
            assert_eq!(err.error_code(), code);
            assert_eq!(err.kind(), kind);
        }
    }

    #[test]
    fn test_conflict_display_mentions_version() {
        let err = CoreError::Conflict {
            entity: "order",
            id: "o-7".to_string(),
            expected_version: 12,
        };
        assert!(err.is_conflict());
        assert_eq!(
            err.to_string(),
            "The order 'o-7' was modified concurrently (expected version 12)"
        );
    }

    #[test]
    fn test_diagnostic_retryable_by_kind() {
        let exec = Diagnostic::new(ErrorKind::Execution, "PROCESSOR_FAILED", "signal 9");
        let conf = Diagnostic::new(ErrorKind::Configuration, "RULE_SYNTAX_ERROR", "bad rule")
            .for_job_step("js-1");

        assert!(exec.is_retryable());
        assert!(!conf.is_retryable());
        assert_eq!(conf.job_step_id.as_deref(), Some("js-1"));
    }

    #[test]
    fn test_error_kind_round_trips_through_text() {
        for kind in [
            ErrorKind::Configuration,
            ErrorKind::Transient,
            ErrorKind::Execution,
            ErrorKind::Validation,
            ErrorKind::NotFound,
        ] {
            assert_eq!(kind.as_str().parse::<ErrorKind>().unwrap(), kind);
        }
        assert!("BOGUS".parse::<ErrorKind>().is_err());
    }
}
