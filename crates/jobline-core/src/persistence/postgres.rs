// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed persistence.
//!
//! Every operation is a free function over a [`PgPool`] so that services can
//! call them inside their own transactions; [`PostgresPersistence`] wraps
//! them behind the engine's storage traits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dispatch::{AgentCommand, AgentDispatcher};
use crate::error::EngineError;
use crate::logs::ProcessLogStore;
use crate::migrations;
use crate::model::{Capabilities, LogEntry, NewProcess, ProcessEntry};
use crate::queue::ProcessQueue;
use crate::state::{ProcessStateStore, StateSink};
use crate::status::{ProcessStatus, status_strings};

use super::{NOT_TERMINAL, ProcessRow, into_entries, stored_requirements};

const PROCESS_COLUMNS: &str = "instance_id::text AS instance_id, \
     parent_instance_id::text AS parent_instance_id, status, created_at, last_updated_at, \
     project_id::text AS project_id, project_name, initiator_id::text AS initiator_id, \
     initiator, agent_id, requirements::text AS requirements";

/// PostgreSQL-backed persistence implementation.
#[derive(Clone)]
pub struct PostgresPersistence {
    pool: PgPool,
}

impl PostgresPersistence {
    /// Create a new Postgres-backed persistence implementation over a migrated pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `url`, then run migrations.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, EngineError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| EngineError::Database {
                operation: "connect".to_string(),
                details: format!("Failed to connect to PostgreSQL: {}", e),
            })?;

        migrations::run_postgres(&pool).await?;

        Ok(Self { pool })
    }

    /// The underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Remove and return the commands queued for `agent_id`, oldest first.
    pub async fn take_agent_commands(&self, agent_id: &str) -> Result<Vec<AgentCommand>, EngineError> {
        take_agent_commands(&self.pool, agent_id).await
    }
}

// ============================================================================
// Queue Operations
// ============================================================================

/// Insert a new process in `ENQUEUED` status.
pub async fn insert_process(pool: &PgPool, process: &NewProcess) -> Result<(), EngineError> {
    sqlx::query(
        r#"
        INSERT INTO process_queue (
            instance_id, parent_instance_id, status, created_at, last_updated_at,
            project_id, project_name, initiator_id, initiator, requirements
        )
        VALUES ($1, $2, $3, NOW(), NOW(), $4, $5, $6, $7, $8)
        "#,
    )
    .bind(process.instance_id)
    .bind(process.parent_instance_id)
    .bind(ProcessStatus::Enqueued.as_str())
    .bind(process.project_id)
    .bind(&process.project_name)
    .bind(process.initiator_id)
    .bind(&process.initiator)
    .bind(stored_requirements(process.requirements.as_ref()).cloned())
    .execute(pool)
    .await?;

    Ok(())
}

/// Claim the oldest enqueued process whose requirements are contained in
/// `capabilities`.
///
/// Concurrent claimers skip each other's locked rows instead of waiting.
pub async fn claim_next(
    pool: &PgPool,
    capabilities: &Capabilities,
) -> Result<Option<ProcessEntry>, EngineError> {
    let sql = format!(
        r#"
        UPDATE process_queue
        SET status = 'STARTING', last_updated_at = NOW()
        WHERE instance_id = (
            SELECT instance_id
            FROM process_queue
            WHERE status = 'ENQUEUED'
              AND (requirements IS NULL OR $1::jsonb @> requirements)
            ORDER BY created_at
            LIMIT 1
            FOR UPDATE SKIP LOCKED
        )
        AND status = 'ENQUEUED'
        RETURNING {PROCESS_COLUMNS}
        "#
    );
    let row = sqlx::query_as::<_, ProcessRow>(&sql)
        .bind(Json(capabilities))
        .fetch_optional(pool)
        .await?;

    row.map(ProcessEntry::try_from).transpose()
}

/// Get a process by ID.
pub async fn get_process(pool: &PgPool, instance_id: Uuid) -> Result<Option<ProcessEntry>, EngineError> {
    let sql = format!("SELECT {PROCESS_COLUMNS} FROM process_queue WHERE instance_id = $1");
    let row = sqlx::query_as::<_, ProcessRow>(&sql)
        .bind(instance_id)
        .fetch_optional(pool)
        .await?;

    row.map(ProcessEntry::try_from).transpose()
}

/// Get a process and all of its descendants.
pub async fn get_cascade(pool: &PgPool, instance_id: Uuid) -> Result<Vec<ProcessEntry>, EngineError> {
    let sql = format!(
        r#"
        WITH RECURSIVE cascade(instance_id) AS (
            SELECT instance_id FROM process_queue WHERE instance_id = $1
            UNION
            SELECT child.instance_id
            FROM process_queue child
            JOIN cascade parent ON child.parent_instance_id = parent.instance_id
        )
        SELECT {PROCESS_COLUMNS}
        FROM process_queue
        WHERE instance_id IN (SELECT instance_id FROM cascade)
        ORDER BY created_at
        "#
    );
    let rows = sqlx::query_as::<_, ProcessRow>(&sql)
        .bind(instance_id)
        .fetch_all(pool)
        .await?;

    into_entries(rows)
}

/// Conditionally move one process from `expected` to `new_status`.
pub async fn update_status_if(
    pool: &PgPool,
    instance_id: Uuid,
    expected: ProcessStatus,
    new_status: ProcessStatus,
) -> Result<bool, EngineError> {
    let sql = format!(
        r#"
        UPDATE process_queue
        SET status = $1, last_updated_at = NOW()
        WHERE instance_id = $2 AND status = $3 AND {NOT_TERMINAL}
        "#
    );
    let result = sqlx::query(&sql)
        .bind(new_status.as_str())
        .bind(instance_id)
        .bind(expected.as_str())
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}

/// Conditionally move every listed process whose status is in `expected`.
///
/// Returns `true` only when every listed process was moved.
pub async fn update_statuses_if(
    pool: &PgPool,
    instance_ids: &[Uuid],
    new_status: ProcessStatus,
    expected: &[ProcessStatus],
) -> Result<bool, EngineError> {
    let mut ids = instance_ids.to_vec();
    ids.sort();
    ids.dedup();
    if ids.is_empty() {
        return Ok(true);
    }

    let sql = format!(
        r#"
        UPDATE process_queue
        SET status = $1, last_updated_at = NOW()
        WHERE instance_id = ANY($2) AND status = ANY($3) AND {NOT_TERMINAL}
        "#
    );
    let result = sqlx::query(&sql)
        .bind(new_status.as_str())
        .bind(&ids)
        .bind(status_strings(expected))
        .execute(pool)
        .await?;

    Ok(result.rows_affected() == ids.len() as u64)
}

/// Record a worker's status report. Terminal rows are left untouched.
///
/// Commands held for the process while it had no agent are handed to
/// `agent_id` in the same transaction.
pub async fn update_agent_id(
    pool: &PgPool,
    instance_id: Uuid,
    agent_id: &str,
    status: ProcessStatus,
) -> Result<bool, EngineError> {
    let sql = format!(
        r#"
        UPDATE process_queue
        SET status = $1, agent_id = $2, last_updated_at = NOW()
        WHERE instance_id = $3 AND {NOT_TERMINAL}
        "#
    );

    let mut tx = pool.begin().await?;
    let result = sqlx::query(&sql)
        .bind(status.as_str())
        .bind(agent_id)
        .bind(instance_id)
        .execute(&mut *tx)
        .await?;
    if result.rows_affected() == 0 {
        return Ok(false);
    }

    let handed = sqlx::query(
        "UPDATE agent_commands SET agent_id = $1 WHERE instance_id = $2 AND agent_id IS NULL",
    )
    .bind(agent_id)
    .bind(instance_id)
    .execute(&mut *tx)
    .await?
    .rows_affected();
    tx.commit().await?;

    if handed > 0 {
        info!(
            instance_id = %instance_id,
            agent_id = %agent_id,
            commands = handed,
            "Held commands handed to agent"
        );
    }
    Ok(true)
}

// ============================================================================
// State Operations
// ============================================================================

/// Whether a state item exists.
pub async fn state_item_exists(pool: &PgPool, instance_id: Uuid, path: &str) -> Result<bool, EngineError> {
    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS (SELECT 1 FROM process_state WHERE instance_id = $1 AND item_path = $2)",
    )
    .bind(instance_id)
    .bind(path)
    .fetch_one(pool)
    .await?;

    Ok(exists)
}

/// Read a state item.
pub async fn get_state_item(
    pool: &PgPool,
    instance_id: Uuid,
    path: &str,
) -> Result<Option<Vec<u8>>, EngineError> {
    let data = sqlx::query_scalar(
        "SELECT item_data FROM process_state WHERE instance_id = $1 AND item_path = $2",
    )
    .bind(instance_id)
    .bind(path)
    .fetch_optional(pool)
    .await?;

    Ok(data)
}

/// Store or replace a state item.
pub async fn put_state_item(
    pool: &PgPool,
    instance_id: Uuid,
    path: &str,
    data: &[u8],
) -> Result<(), EngineError> {
    sqlx::query(
        r#"
        INSERT INTO process_state (instance_id, item_path, item_data)
        VALUES ($1, $2, $3)
        ON CONFLICT (instance_id, item_path) DO UPDATE SET item_data = EXCLUDED.item_data
        "#,
    )
    .bind(instance_id)
    .bind(path)
    .bind(data)
    .execute(pool)
    .await?;

    Ok(())
}

/// Remove a state item.
pub async fn delete_state_item(pool: &PgPool, instance_id: Uuid, path: &str) -> Result<(), EngineError> {
    sqlx::query("DELETE FROM process_state WHERE instance_id = $1 AND item_path = $2")
        .bind(instance_id)
        .bind(path)
        .execute(pool)
        .await?;

    Ok(())
}

/// All state items of a process, ordered by path.
pub async fn list_state_items(
    pool: &PgPool,
    instance_id: Uuid,
) -> Result<Vec<(String, Vec<u8>)>, EngineError> {
    let items = sqlx::query_as(
        "SELECT item_path, item_data FROM process_state WHERE instance_id = $1 ORDER BY item_path",
    )
    .bind(instance_id)
    .fetch_all(pool)
    .await?;

    Ok(items)
}

// ============================================================================
// Log Operations
// ============================================================================

/// Append a line to a process log.
pub async fn append_log(pool: &PgPool, instance_id: Uuid, message: &str) -> Result<(), EngineError> {
    sqlx::query("INSERT INTO process_logs (instance_id, message, created_at) VALUES ($1, $2, NOW())")
        .bind(instance_id)
        .bind(message)
        .execute(pool)
        .await?;

    Ok(())
}

/// All lines of a process log, oldest first.
pub async fn list_logs(pool: &PgPool, instance_id: Uuid) -> Result<Vec<LogEntry>, EngineError> {
    let rows: Vec<(String, DateTime<Utc>)> = sqlx::query_as(
        "SELECT message, created_at FROM process_logs WHERE instance_id = $1 ORDER BY id",
    )
    .bind(instance_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(message, created_at)| LogEntry {
            instance_id,
            message,
            created_at,
        })
        .collect())
}

// ============================================================================
// Agent Commands
// ============================================================================

/// Queue a `CANCEL_JOB` command for the agent of each listed process.
///
/// A process with no agent yet gets its command held until the first status
/// report. The process rows are locked while reading the agent, so a report
/// running concurrently either lands first or picks the held command up.
/// Returns the number of commands queued; unknown processes are skipped.
pub async fn enqueue_cancel_commands(pool: &PgPool, instance_ids: &[Uuid]) -> Result<usize, EngineError> {
    let commands = instance_ids
        .iter()
        .map(|&instance_id| serde_json::to_value(AgentCommand::CancelJob { instance_id }))
        .collect::<Result<Vec<Value>, _>>()?;

    let queued: Vec<(Uuid, Option<String>)> = sqlx::query_as(
        r#"
        WITH requested AS (
            SELECT * FROM UNNEST($1::uuid[], $2::jsonb[]) AS r(instance_id, command)
        ),
        target AS (
            SELECT q.instance_id, q.agent_id
            FROM process_queue q
            JOIN requested r ON r.instance_id = q.instance_id
            FOR UPDATE OF q
        )
        INSERT INTO agent_commands (instance_id, agent_id, command, created_at)
        SELECT t.instance_id, t.agent_id, r.command, NOW()
        FROM target t
        JOIN requested r ON r.instance_id = t.instance_id
        RETURNING instance_id, agent_id
        "#,
    )
    .bind(instance_ids)
    .bind(&commands)
    .fetch_all(pool)
    .await?;

    for (instance_id, agent_id) in &queued {
        match agent_id {
            Some(agent_id) => {
                debug!(instance_id = %instance_id, agent_id = %agent_id, "Cancel command queued")
            }
            None => info!(instance_id = %instance_id, "No agent assigned yet, cancel held"),
        }
    }
    if queued.len() < instance_ids.len() {
        warn!(
            requested = instance_ids.len(),
            queued = queued.len(),
            "Some processes were not found, kill requests skipped"
        );
    }

    Ok(queued.len())
}

/// Remove and return the commands queued for an agent, oldest first.
pub async fn take_agent_commands(pool: &PgPool, agent_id: &str) -> Result<Vec<AgentCommand>, EngineError> {
    let mut rows: Vec<(i64, Value)> = sqlx::query_as(
        r#"
        DELETE FROM agent_commands
        WHERE id IN (
            SELECT id FROM agent_commands
            WHERE agent_id = $1
            ORDER BY id
            FOR UPDATE SKIP LOCKED
        )
        RETURNING id, command
        "#,
    )
    .bind(agent_id)
    .fetch_all(pool)
    .await?;
    rows.sort_by_key(|(id, _)| *id);

    rows.into_iter()
        .map(|(_, command)| serde_json::from_value(command).map_err(EngineError::from))
        .collect()
}

// ============================================================================
// Trait Implementations
// ============================================================================

#[async_trait]
impl ProcessQueue for PostgresPersistence {
    async fn insert(&self, process: &NewProcess) -> Result<(), EngineError> {
        insert_process(&self.pool, process).await
    }

    async fn poll(&self, capabilities: &Capabilities) -> Result<Option<ProcessEntry>, EngineError> {
        claim_next(&self.pool, capabilities).await
    }

    async fn get(&self, instance_id: Uuid) -> Result<Option<ProcessEntry>, EngineError> {
        get_process(&self.pool, instance_id).await
    }

    async fn get_cascade(&self, instance_id: Uuid) -> Result<Vec<ProcessEntry>, EngineError> {
        get_cascade(&self.pool, instance_id).await
    }

    async fn update_status_if(
        &self,
        instance_id: Uuid,
        expected: ProcessStatus,
        new_status: ProcessStatus,
    ) -> Result<bool, EngineError> {
        update_status_if(&self.pool, instance_id, expected, new_status).await
    }

    async fn update_statuses_if(
        &self,
        instance_ids: &[Uuid],
        new_status: ProcessStatus,
        expected: &[ProcessStatus],
    ) -> Result<bool, EngineError> {
        update_statuses_if(&self.pool, instance_ids, new_status, expected).await
    }

    async fn update_agent_id(
        &self,
        instance_id: Uuid,
        agent_id: &str,
        status: ProcessStatus,
    ) -> Result<bool, EngineError> {
        update_agent_id(&self.pool, instance_id, agent_id, status).await
    }
}

#[async_trait]
impl ProcessStateStore for PostgresPersistence {
    async fn exists(&self, instance_id: Uuid, path: &str) -> Result<bool, EngineError> {
        state_item_exists(&self.pool, instance_id, path).await
    }

    async fn get_bytes(
        &self,
        instance_id: Uuid,
        path: &str,
    ) -> Result<Option<Vec<u8>>, EngineError> {
        get_state_item(&self.pool, instance_id, path).await
    }

    async fn put(&self, instance_id: Uuid, path: &str, data: &[u8]) -> Result<(), EngineError> {
        put_state_item(&self.pool, instance_id, path, data).await
    }

    async fn delete(&self, instance_id: Uuid, path: &str) -> Result<(), EngineError> {
        delete_state_item(&self.pool, instance_id, path).await
    }

    async fn export(&self, instance_id: Uuid, sink: &mut dyn StateSink) -> Result<(), EngineError> {
        for (path, data) in list_state_items(&self.pool, instance_id).await? {
            sink.write_item(&path, &data)?;
        }
        Ok(())
    }
}

#[async_trait]
impl ProcessLogStore for PostgresPersistence {
    async fn append(&self, instance_id: Uuid, message: &str) -> Result<(), EngineError> {
        append_log(&self.pool, instance_id, message).await
    }

    async fn list(&self, instance_id: Uuid) -> Result<Vec<LogEntry>, EngineError> {
        list_logs(&self.pool, instance_id).await
    }
}

#[async_trait]
impl AgentDispatcher for PostgresPersistence {
    async fn kill_process(&self, instance_id: Uuid) -> Result<(), EngineError> {
        enqueue_cancel_commands(&self.pool, &[instance_id]).await?;
        Ok(())
    }

    async fn kill_processes(&self, instance_ids: &[Uuid]) -> Result<(), EngineError> {
        enqueue_cancel_commands(&self.pool, instance_ids).await?;
        Ok(())
    }
}
