// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQL backends for the queue, state, log and agent command interfaces.
//!
//! Each backend implements every storage-facing trait of the engine over one
//! connection pool, so a single value can be handed to
//! [`EngineBuilder::persistence`](crate::runtime::EngineBuilder::persistence).

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresPersistence;
pub use self::sqlite::SqlitePersistence;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::dispatch::AgentDispatcher;
use crate::error::EngineError;
use crate::logs::ProcessLogStore;
use crate::model::ProcessEntry;
use crate::queue::ProcessQueue;
use crate::state::ProcessStateStore;

/// Everything the engine needs from storage, implemented by one backend.
pub trait Persistence:
    ProcessQueue + ProcessStateStore + ProcessLogStore + AgentDispatcher + 'static
{
}

impl<T> Persistence for T where
    T: ProcessQueue + ProcessStateStore + ProcessLogStore + AgentDispatcher + 'static
{
}

/// Guard appended to every status-writing statement: terminal rows never change.
pub(crate) const NOT_TERMINAL: &str = "status NOT IN ('CANCELLED', 'FAILED', 'FINISHED')";

/// Process row as selected by both backends.
///
/// Identifiers and requirements come back as text (PostgreSQL selects them
/// with `::text` casts) and are parsed here.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct ProcessRow {
    pub instance_id: String,
    pub parent_instance_id: Option<String>,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub project_id: Option<String>,
    pub project_name: Option<String>,
    pub initiator_id: Option<String>,
    pub initiator: Option<String>,
    pub agent_id: Option<String>,
    pub requirements: Option<String>,
}

fn decode_error(details: String) -> EngineError {
    EngineError::Database {
        operation: "decode".to_string(),
        details,
    }
}

pub(crate) fn parse_uuid(column: &str, value: &str) -> Result<Uuid, EngineError> {
    Uuid::parse_str(value).map_err(|e| decode_error(format!("{column} '{value}': {e}")))
}

fn parse_optional_uuid(column: &str, value: Option<&str>) -> Result<Option<Uuid>, EngineError> {
    value.map(|v| parse_uuid(column, v)).transpose()
}

impl TryFrom<ProcessRow> for ProcessEntry {
    type Error = EngineError;

    fn try_from(row: ProcessRow) -> Result<Self, Self::Error> {
        let requirements = row
            .requirements
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;

        Ok(ProcessEntry {
            instance_id: parse_uuid("instance_id", &row.instance_id)?,
            parent_instance_id: parse_optional_uuid(
                "parent_instance_id",
                row.parent_instance_id.as_deref(),
            )?,
            status: row
                .status
                .parse()
                .map_err(|e: crate::status::UnknownStatus| decode_error(e.to_string()))?,
            created_at: row.created_at,
            last_updated_at: row.last_updated_at,
            project_id: parse_optional_uuid("project_id", row.project_id.as_deref())?,
            project_name: row.project_name,
            initiator_id: parse_optional_uuid("initiator_id", row.initiator_id.as_deref())?,
            initiator: row.initiator,
            agent_id: row.agent_id,
            requirements,
        })
    }
}

/// Convert a batch of rows, failing on the first malformed one.
pub(crate) fn into_entries(rows: Vec<ProcessRow>) -> Result<Vec<ProcessEntry>, EngineError> {
    rows.into_iter().map(ProcessEntry::try_from).collect()
}

/// Requirements as stored: JSON `null` is the same as no requirements.
pub(crate) fn stored_requirements(requirements: Option<&serde_json::Value>) -> Option<&serde_json::Value> {
    requirements.filter(|r| !r.is_null())
}
