// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for jobline-core.
//!
//! Provides a unified error type with stable error codes and an HTTP-style
//! status classification for API layers built on top of the engine.

use thiserror::Error;
use uuid::Uuid;

use crate::model::FieldError;

/// Result type using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

/// HTTP-style classification carried by process errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    /// The caller supplied bad data (400).
    BadRequest,
    /// The target does not exist (404).
    NotFound,
    /// The process or the server failed (500).
    InternalServerError,
}

impl StatusClass {
    /// Numeric HTTP status code.
    pub fn as_u16(&self) -> u16 {
        match self {
            Self::BadRequest => 400,
            Self::NotFound => 404,
            Self::InternalServerError => 500,
        }
    }
}

/// Errors surfaced by the lifecycle engine and its backends.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// Operation targets an instance that does not exist.
    #[error("Process not found: {instance_id}")]
    NotFound {
        /// The instance ID that was not found.
        instance_id: Uuid,
    },

    /// A form submission made while waiting on a process was rejected.
    #[error("Form '{form_name}' submit error: {}", format_field_errors(.errors))]
    Validation {
        /// The suspended process.
        instance_id: Uuid,
        /// Name of the rejected form.
        form_name: String,
        /// Per-field messages.
        errors: Vec<FieldError>,
    },

    /// The process failed, was cancelled, or a pipeline raised a domain failure.
    #[error("{message}")]
    Process {
        /// The affected instance, when known.
        instance_id: Option<Uuid>,
        /// Human-readable message.
        message: String,
        /// HTTP-style classification.
        status: StatusClass,
    },

    /// Unexpected failure while starting a process. The cause is preserved.
    #[error("Error starting the process {instance_id}")]
    Internal {
        /// The instance being started.
        instance_id: Uuid,
        /// Original cause.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The caller stopped waiting for the process. Process state is untouched.
    #[error("Wait for process {instance_id} was interrupted")]
    Interrupted {
        /// The instance being waited on.
        instance_id: Uuid,
    },

    /// Archive or filesystem I/O failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Database operation failed.
    #[error("Database error during '{operation}': {details}")]
    Database {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    /// Build a process error with the given classification.
    pub fn process(
        instance_id: impl Into<Option<Uuid>>,
        message: impl Into<String>,
        status: StatusClass,
    ) -> Self {
        Self::Process {
            instance_id: instance_id.into(),
            message: message.into(),
            status,
        }
    }

    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "PROCESS_NOT_FOUND",
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::Process { .. } => "PROCESS_ERROR",
            Self::Internal { .. } => "INTERNAL_ERROR",
            Self::Interrupted { .. } => "WAIT_INTERRUPTED",
            Self::Io(_) => "IO_ERROR",
            Self::Database { .. } => "DATABASE_ERROR",
            Self::Json(_) => "JSON_ERROR",
        }
    }

    /// HTTP-style classification of this error.
    pub fn status_class(&self) -> StatusClass {
        match self {
            Self::NotFound { .. } => StatusClass::NotFound,
            Self::Validation { .. } => StatusClass::BadRequest,
            Self::Process { status, .. } => *status,
            _ => StatusClass::InternalServerError,
        }
    }

    /// The instance this error is about, when it carries one.
    pub fn instance_id(&self) -> Option<Uuid> {
        match self {
            Self::NotFound { instance_id }
            | Self::Validation { instance_id, .. }
            | Self::Internal { instance_id, .. }
            | Self::Interrupted { instance_id } => Some(*instance_id),
            Self::Process { instance_id, .. } => *instance_id,
            _ => None,
        }
    }
}

fn format_field_errors(errors: &[FieldError]) -> String {
    if errors.is_empty() {
        return "n/a".to_string();
    }

    errors
        .iter()
        .map(|e| format!("{}: {}", e.field_name, e.error))
        .collect::<Vec<_>>()
        .join(",")
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        EngineError::Database {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for EngineError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        EngineError::Database {
            operation: "migrate".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<zip::result::ZipError> for EngineError {
    fn from(err: zip::result::ZipError) -> Self {
        match err {
            zip::result::ZipError::Io(e) => EngineError::Io(e),
            other => EngineError::Io(std::io::Error::other(other)),
        }
    }
}
