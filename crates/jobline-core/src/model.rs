// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Data model shared by the engine and its collaborators.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tempfile::TempPath;
use uuid::Uuid;

use crate::status::ProcessStatus;

/// JSON object of named values (arguments, outputs, form data).
pub type Variables = Map<String, Value>;

/// Capability descriptor sent by a worker asking for work.
pub type Capabilities = Map<String, Value>;

/// Snapshot of a persisted process.
///
/// Owned by the queue; the engine only ever holds short-lived copies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessEntry {
    /// Unique identifier for the instance.
    pub instance_id: Uuid,
    /// Process this one was forked from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_instance_id: Option<Uuid>,
    /// Current status.
    pub status: ProcessStatus,
    /// When the process was created.
    pub created_at: DateTime<Utc>,
    /// When the row was last written.
    pub last_updated_at: DateTime<Utc>,
    /// Owning project.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<Uuid>,
    /// Owning project name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    /// User who started the process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initiator_id: Option<Uuid>,
    /// Name of the user who started the process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initiator: Option<String>,
    /// Worker currently (or last) handling the process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    /// Capabilities a worker must have to claim the process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requirements: Option<Value>,
}

/// Values needed to enqueue a new process row.
#[derive(Debug, Clone, Default)]
pub struct NewProcess {
    /// Unique identifier for the instance.
    pub instance_id: Uuid,
    /// Parent process, for forks.
    pub parent_instance_id: Option<Uuid>,
    /// Owning project.
    pub project_id: Option<Uuid>,
    /// Owning project name.
    pub project_name: Option<String>,
    /// User who started the process.
    pub initiator_id: Option<Uuid>,
    /// Name of the user who started the process.
    pub initiator: Option<String>,
    /// Capabilities a worker must have to claim the process.
    pub requirements: Option<Value>,
}

impl NewProcess {
    /// A root process with no metadata.
    pub fn new(instance_id: Uuid) -> Self {
        Self {
            instance_id,
            ..Default::default()
        }
    }

    /// A child process forked from `parent_instance_id`.
    pub fn fork(instance_id: Uuid, parent_instance_id: Uuid) -> Self {
        Self {
            instance_id,
            parent_instance_id: Some(parent_instance_id),
            ..Default::default()
        }
    }
}

/// In-flight request to start, fork or resume a process.
#[derive(Debug, Clone, PartialEq)]
pub struct Payload {
    /// Target instance.
    pub instance_id: Uuid,
    /// Request data handed to the pipeline (arguments, form data, ...).
    pub input: Variables,
}

impl Payload {
    /// Create a payload with no input.
    pub fn new(instance_id: Uuid) -> Self {
        Self {
            instance_id,
            input: Variables::new(),
        }
    }

    /// Attach request data.
    pub fn with_input(mut self, input: Variables) -> Self {
        self.input = input;
        self
    }
}

/// Work handed to a worker: the claimed process and its state archive.
///
/// The archive is a temporary zip file owned by the caller. It is removed when
/// the entry is dropped unless the caller persists it with [`TempPath::keep`].
#[derive(Debug)]
pub struct PayloadEntry {
    /// Snapshot of the claimed process.
    pub process: ProcessEntry,
    /// Zip archive of the process state.
    pub archive: TempPath,
}

/// Outcome of a start/fork call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessResult {
    /// The started instance.
    pub instance_id: Uuid,
    /// Output values, present only for synchronous calls that finished with outputs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub out: Option<Variables>,
}

/// A per-field validation message from a form submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldError {
    /// Name of the rejected field.
    pub field_name: String,
    /// Validation message.
    pub error: String,
}

/// Result of submitting data to a process's next pending form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormSubmitResult {
    /// Whether the submission was accepted.
    pub valid: bool,
    /// Name of the form the data was submitted to.
    pub form_name: String,
    /// Field errors for rejected submissions.
    #[serde(default)]
    pub errors: Vec<FieldError>,
}

impl FormSubmitResult {
    /// An accepted submission.
    pub fn accepted(form_name: impl Into<String>) -> Self {
        Self {
            valid: true,
            form_name: form_name.into(),
            errors: Vec::new(),
        }
    }

    /// A rejected submission.
    pub fn rejected(form_name: impl Into<String>, errors: Vec<FieldError>) -> Self {
        Self {
            valid: false,
            form_name: form_name.into(),
            errors,
        }
    }
}

/// One entry of a process's log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    /// Process the entry belongs to.
    pub instance_id: Uuid,
    /// Log line.
    pub message: String,
    /// When the entry was written.
    pub created_at: DateTime<Utc>,
}
