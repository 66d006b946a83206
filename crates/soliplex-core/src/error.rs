// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for the ingestion core.
//!
//! Provides a unified error type for persistence and engine operations. The
//! handler-boundary errors (retryable vs fatal) live in `soliplex-engine`;
//! this taxonomy covers everything the data layer can signal to a caller.

use std::fmt;

/// Result type using IngestError.
pub type Result<T> = std::result::Result<T, IngestError>;

/// Core errors that can occur during persistence and engine operations.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum IngestError {
    /// Bad input; the current call fails immediately and is never retried.
    Validation {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// A referenced entity does not exist.
    NotFound {
        /// The entity kind ("batch", "document", "run_group", ...).
        entity: &'static str,
        /// The lookup key that missed.
        key: String,
    },

    /// A concurrent modification lost a race. The caller may retry.
    Conflict {
        /// The entity kind.
        entity: &'static str,
        /// The contested key.
        key: String,
        /// What was observed.
        details: String,
    },

    /// An impossible state was observed. The engine refuses to advance the
    /// affected run and marks it failed with diagnostic metadata.
    EngineInvariant {
        /// Diagnostic description of the observation.
        details: String,
    },

    /// Database operation failed.
    Database {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// Artifact storage failed during a cascading delete.
    ArtifactStorage {
        /// Error details from the backend.
        details: String,
    },
}

impl IngestError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Conflict { .. } => "CONFLICT",
            Self::EngineInvariant { .. } => "ENGINE_INVARIANT",
            Self::Database { .. } => "DATABASE_ERROR",
            Self::ArtifactStorage { .. } => "ARTIFACT_STORAGE_ERROR",
        }
    }

    /// Shorthand for a NotFound error.
    pub fn not_found(entity: &'static str, key: impl fmt::Display) -> Self {
        Self::NotFound {
            entity,
            key: key.to_string(),
        }
    }

    /// Shorthand for a Validation error.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for IngestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation { field, message } => {
                write!(f, "Validation error for '{}': {}", field, message)
            }
            Self::NotFound { entity, key } => {
                write!(f, "{} '{}' not found", entity, key)
            }
            Self::Conflict {
                entity,
                key,
                details,
            } => {
                write!(f, "Conflict on {} '{}': {}", entity, key, details)
            }
            Self::EngineInvariant { details } => {
                write!(f, "Engine invariant violated: {}", details)
            }
            Self::Database { operation, details } => {
                write!(f, "Database error during '{}': {}", operation, details)
            }
            Self::ArtifactStorage { details } => {
                write!(f, "Artifact storage error: {}", details)
            }
        }
    }
}

impl std::error::Error for IngestError {}

impl From<sqlx::Error> for IngestError {
    fn from(err: sqlx::Error) -> Self {
        IngestError::Database {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for IngestError {
    fn from(err: serde_json::Error) -> Self {
        IngestError::Database {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let cases: Vec<(IngestError, &str)> = vec![
            (
                IngestError::validation("uri", "must not be empty"),
                "VALIDATION_ERROR",
            ),
            (IngestError::not_found("batch", 42), "NOT_FOUND"),
            (
                IngestError::Conflict {
                    entity: "run_step",
                    key: "7".to_string(),
                    details: "claimed by another worker".to_string(),
                },
                "CONFLICT",
            ),
            (
                IngestError::EngineInvariant {
                    details: "two RUNNING siblings".to_string(),
                },
                "ENGINE_INVARIANT",
            ),
            (
                IngestError::Database {
                    operation: "insert".to_string(),
                    details: "connection refused".to_string(),
                },
                "DATABASE_ERROR",
            ),
        ];

        for (error, expected_code) in cases {
            assert_eq!(
                error.error_code(),
                expected_code,
                "error {:?} should map to {}",
                error,
                expected_code
            );
            assert!(!error.to_string().is_empty());
        }
    }

    #[test]
    fn test_error_display() {
        let err = IngestError::not_found("document", "sha256-abc123");
        assert_eq!(err.to_string(), "document 'sha256-abc123' not found");

        let err = IngestError::validation("param_id", "unknown parameter set");
        assert_eq!(
            err.to_string(),
            "Validation error for 'param_id': unknown parameter set"
        );

        let err = IngestError::EngineInvariant {
            details: "run 9 has two RUNNING steps".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Engine invariant violated: run 9 has two RUNNING steps"
        );
    }

    #[test]
    fn test_from_sqlx_error() {
        let err: IngestError = sqlx::Error::RowNotFound.into();
        assert_eq!(err.error_code(), "DATABASE_ERROR");
    }
}
