// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed persistence implementation.
//!
//! SQLite has no JSON containment operator, so [`ProcessQueue::poll`] filters
//! enqueued rows in Rust and claims the first match with a conditional update,
//! moving on to the next candidate when another claimer wins.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::capabilities::satisfies;
use crate::dispatch::{AgentCommand, AgentDispatcher};
use crate::error::EngineError;
use crate::logs::ProcessLogStore;
use crate::migrations;
use crate::model::{Capabilities, LogEntry, NewProcess, ProcessEntry};
use crate::queue::ProcessQueue;
use crate::state::{ProcessStateStore, StateSink};
use crate::status::{ProcessStatus, status_strings};

use super::{NOT_TERMINAL, ProcessRow, into_entries, parse_uuid, stored_requirements};

const PROCESS_COLUMNS: &str = "instance_id, parent_instance_id, status, created_at, \
     last_updated_at, project_id, project_name, initiator_id, initiator, agent_id, requirements";

/// How long a connection waits on a locked database before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Enqueued rows read per page while looking for a claimable process.
const CLAIM_PAGE_SIZE: i64 = 100;

/// IDs bound per statement in bulk updates, well under SQLite's variable limit.
const BULK_UPDATE_CHUNK: usize = 500;

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing, migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to `url`, then run migrations.
    ///
    /// An in-memory database lives only as long as its connection, so for
    /// memory URLs `max_connections` is ignored and the pool keeps exactly one
    /// connection open for its whole life.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, EngineError> {
        let connect_error = |e: sqlx::Error| EngineError::Database {
            operation: "connect".to_string(),
            details: format!("Failed to connect to SQLite at {}: {}", url, e),
        };

        let options = SqliteConnectOptions::from_str(url)
            .map_err(connect_error)?
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);
        let pool = pool_options(url, max_connections)
            .connect_with(options)
            .await
            .map_err(connect_error)?;

        migrations::run_sqlite(&pool).await?;

        Ok(Self { pool })
    }

    /// Create and initialize a SQLite database file at `path`.
    ///
    /// Parent directories and the file itself are created when missing.
    ///
    /// ```ignore
    /// let persistence = SqlitePersistence::from_path(".data/jobline.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| EngineError::Database {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        Self::connect(&url, 5).await
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Remove and return the commands queued for `agent_id`, oldest first.
    pub async fn take_agent_commands(&self, agent_id: &str) -> Result<Vec<AgentCommand>, EngineError> {
        let mut rows: Vec<(i64, String)> =
            sqlx::query_as("DELETE FROM agent_commands WHERE agent_id = ?1 RETURNING id, command")
                .bind(agent_id)
                .fetch_all(&self.pool)
                .await?;
        rows.sort_by_key(|(id, _)| *id);

        rows.into_iter()
            .map(|(_, command)| serde_json::from_str(&command).map_err(EngineError::from))
            .collect()
    }

    /// Queue a `CANCEL_JOB` command for the agent currently assigned to
    /// `instance_id`.
    ///
    /// Without an agent the command is held and handed to the first agent that
    /// reports on the process. Returns `false` when the process doesn't exist.
    async fn enqueue_cancel(&self, instance_id: Uuid) -> Result<bool, EngineError> {
        let command = serde_json::to_string(&AgentCommand::CancelJob { instance_id })?;
        let queued: Option<Option<String>> = sqlx::query_scalar(
            r#"
            INSERT INTO agent_commands (instance_id, agent_id, command, created_at)
            SELECT instance_id, agent_id, ?2, ?3 FROM process_queue
            WHERE instance_id = ?1
            RETURNING agent_id
            "#,
        )
        .bind(instance_id.to_string())
        .bind(command)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;

        match queued {
            None => {
                warn!(instance_id = %instance_id, "Process not found, kill request skipped");
                Ok(false)
            }
            Some(None) => {
                info!(instance_id = %instance_id, "No agent assigned yet, cancel held");
                Ok(true)
            }
            Some(Some(agent_id)) => {
                debug!(instance_id = %instance_id, agent_id = %agent_id, "Cancel command queued");
                Ok(true)
            }
        }
    }
}

/// Pool settings for `url`.
fn pool_options(url: &str, max_connections: u32) -> SqlitePoolOptions {
    if is_memory_url(url) {
        SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(max_connections)
    }
}

/// Whether `url` names an in-memory database.
pub(crate) fn is_memory_url(url: &str) -> bool {
    url.contains(":memory:") || url.contains("mode=memory")
}

#[async_trait]
impl ProcessQueue for SqlitePersistence {
    async fn insert(&self, process: &NewProcess) -> Result<(), EngineError> {
        sqlx::query(
            r#"
            INSERT INTO process_queue (
                instance_id, parent_instance_id, status, created_at, last_updated_at,
                project_id, project_name, initiator_id, initiator, requirements
            )
            VALUES (?1, ?2, ?3, ?4, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(process.instance_id.to_string())
        .bind(process.parent_instance_id.map(|id| id.to_string()))
        .bind(ProcessStatus::Enqueued.as_str())
        .bind(Utc::now())
        .bind(process.project_id.map(|id| id.to_string()))
        .bind(&process.project_name)
        .bind(process.initiator_id.map(|id| id.to_string()))
        .bind(&process.initiator)
        .bind(stored_requirements(process.requirements.as_ref()).map(|r| r.to_string()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn poll(&self, capabilities: &Capabilities) -> Result<Option<ProcessEntry>, EngineError> {
        // Keyset over (created_at, rowid), oldest first.
        let mut after = (String::new(), 0i64);
        loop {
            let page: Vec<(i64, String, String, Option<String>)> = sqlx::query_as(
                r#"
                SELECT rowid, instance_id, created_at, requirements
                FROM process_queue
                WHERE status = ?1
                  AND (created_at > ?2 OR (created_at = ?2 AND rowid > ?3))
                ORDER BY created_at, rowid
                LIMIT ?4
                "#,
            )
            .bind(ProcessStatus::Enqueued.as_str())
            .bind(&after.0)
            .bind(after.1)
            .bind(CLAIM_PAGE_SIZE)
            .fetch_all(&self.pool)
            .await?;

            let page_len = page.len();
            for (rowid, instance_id, created_at, requirements) in page {
                after = (created_at, rowid);

                let requirements = requirements
                    .map(|r| serde_json::from_str::<serde_json::Value>(&r))
                    .transpose()?;
                if !satisfies(requirements.as_ref(), capabilities) {
                    continue;
                }

                let instance_id = parse_uuid("instance_id", &instance_id)?;
                if self
                    .update_status_if(instance_id, ProcessStatus::Enqueued, ProcessStatus::Starting)
                    .await?
                {
                    return self.get(instance_id).await;
                }
                debug!(instance_id = %instance_id, "Claimed by someone else, trying next");
            }

            if page_len < CLAIM_PAGE_SIZE as usize {
                return Ok(None);
            }
        }
    }

    async fn get(&self, instance_id: Uuid) -> Result<Option<ProcessEntry>, EngineError> {
        let sql = format!("SELECT {PROCESS_COLUMNS} FROM process_queue WHERE instance_id = ?1");
        let row = sqlx::query_as::<_, ProcessRow>(&sql)
            .bind(instance_id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(ProcessEntry::try_from).transpose()
    }

    async fn get_cascade(&self, instance_id: Uuid) -> Result<Vec<ProcessEntry>, EngineError> {
        let sql = format!(
            r#"
            WITH RECURSIVE cascade(instance_id) AS (
                SELECT instance_id FROM process_queue WHERE instance_id = ?1
                UNION
                SELECT child.instance_id
                FROM process_queue child
                JOIN cascade parent ON child.parent_instance_id = parent.instance_id
            )
            SELECT {PROCESS_COLUMNS}
            FROM process_queue
            WHERE instance_id IN (SELECT instance_id FROM cascade)
            ORDER BY created_at, rowid
            "#
        );
        let rows = sqlx::query_as::<_, ProcessRow>(&sql)
            .bind(instance_id.to_string())
            .fetch_all(&self.pool)
            .await?;

        into_entries(rows)
    }

    async fn update_status_if(
        &self,
        instance_id: Uuid,
        expected: ProcessStatus,
        new_status: ProcessStatus,
    ) -> Result<bool, EngineError> {
        let sql = format!(
            r#"
            UPDATE process_queue
            SET status = ?1, last_updated_at = ?2
            WHERE instance_id = ?3 AND status = ?4 AND {NOT_TERMINAL}
            "#
        );
        let result = sqlx::query(&sql)
            .bind(new_status.as_str())
            .bind(Utc::now())
            .bind(instance_id.to_string())
            .bind(expected.as_str())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn update_statuses_if(
        &self,
        instance_ids: &[Uuid],
        new_status: ProcessStatus,
        expected: &[ProcessStatus],
    ) -> Result<bool, EngineError> {
        let mut ids: Vec<String> = instance_ids.iter().map(Uuid::to_string).collect();
        ids.sort();
        ids.dedup();
        if ids.is_empty() {
            return Ok(true);
        }

        let now = Utc::now();
        let expected = status_strings(expected);
        let mut moved = 0;
        for chunk in ids.chunks(BULK_UPDATE_CHUNK) {
            let mut query = QueryBuilder::<Sqlite>::new("UPDATE process_queue SET status = ");
            query.push_bind(new_status.as_str());
            query.push(", last_updated_at = ");
            query.push_bind(now);
            query.push(" WHERE instance_id IN (");
            {
                let mut separated = query.separated(", ");
                for id in chunk {
                    separated.push_bind(id.clone());
                }
            }
            query.push(") AND status IN (");
            {
                let mut separated = query.separated(", ");
                for status in &expected {
                    separated.push_bind(status.clone());
                }
            }
            query.push(") AND ");
            query.push(NOT_TERMINAL);

            moved += query.build().execute(&self.pool).await?.rows_affected();
        }

        Ok(moved == ids.len() as u64)
    }

    async fn update_agent_id(
        &self,
        instance_id: Uuid,
        agent_id: &str,
        status: ProcessStatus,
    ) -> Result<bool, EngineError> {
        let sql = format!(
            r#"
            UPDATE process_queue
            SET status = ?1, agent_id = ?2, last_updated_at = ?3
            WHERE instance_id = ?4 AND {NOT_TERMINAL}
            "#
        );

        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(&sql)
            .bind(status.as_str())
            .bind(agent_id)
            .bind(Utc::now())
            .bind(instance_id.to_string())
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Ok(false);
        }

        let handed = sqlx::query(
            "UPDATE agent_commands SET agent_id = ?1 WHERE instance_id = ?2 AND agent_id IS NULL",
        )
        .bind(agent_id)
        .bind(instance_id.to_string())
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
}

#[async_trait]
impl ProcessStateStore for SqlitePersistence {
    async fn exists(&self, instance_id: Uuid, path: &str) -> Result<bool, EngineError> {
        let found: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM process_state WHERE instance_id = ?1 AND item_path = ?2",
        )
        .bind(instance_id.to_string())
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;

        Ok(found.is_some())
    }

    async fn get_bytes(
        &self,
        instance_id: Uuid,
        path: &str,
    ) -> Result<Option<Vec<u8>>, EngineError> {
        let data = sqlx::query_scalar(
            "SELECT item_data FROM process_state WHERE instance_id = ?1 AND item_path = ?2",
        )
        .bind(instance_id.to_string())
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;

        Ok(data)
    }

    async fn put(&self, instance_id: Uuid, path: &str, data: &[u8]) -> Result<(), EngineError> {
        sqlx::query(
            r#"
            INSERT INTO process_state (instance_id, item_path, item_data)
            VALUES (?1, ?2, ?3)
            ON CONFLICT (instance_id, item_path) DO UPDATE SET item_data = excluded.item_data
            "#,
        )
        .bind(instance_id.to_string())
        .bind(path)
        .bind(data)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, instance_id: Uuid, path: &str) -> Result<(), EngineError> {
        sqlx::query("DELETE FROM process_state WHERE instance_id = ?1 AND item_path = ?2")
            .bind(instance_id.to_string())
            .bind(path)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn export(&self, instance_id: Uuid, sink: &mut dyn StateSink) -> Result<(), EngineError> {
        let items: Vec<(String, Vec<u8>)> = sqlx::query_as(
            "SELECT item_path, item_data FROM process_state WHERE instance_id = ?1 ORDER BY item_path",
        )
        .bind(instance_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        for (path, data) in &items {
            sink.write_item(path, data)?;
        }
        Ok(())
    }
}

#[async_trait]
impl ProcessLogStore for SqlitePersistence {
    async fn append(&self, instance_id: Uuid, message: &str) -> Result<(), EngineError> {
        sqlx::query("INSERT INTO process_logs (instance_id, message, created_at) VALUES (?1, ?2, ?3)")
            .bind(instance_id.to_string())
            .bind(message)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn list(&self, instance_id: Uuid) -> Result<Vec<LogEntry>, EngineError> {
        let rows: Vec<(String, DateTime<Utc>)> = sqlx::query_as(
            "SELECT message, created_at FROM process_logs WHERE instance_id = ?1 ORDER BY id",
        )
        .bind(instance_id.to_string())
        .fetch_all(&self.pool)
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
}

#[async_trait]
impl AgentDispatcher for SqlitePersistence {
    async fn kill_process(&self, instance_id: Uuid) -> Result<(), EngineError> {
        self.enqueue_cancel(instance_id).await?;
        Ok(())
    }

    async fn kill_processes(&self, instance_ids: &[Uuid]) -> Result<(), EngineError> {
        let mut queued = 0;
        for instance_id in instance_ids {
            if self.enqueue_cancel(*instance_id).await? {
                queued += 1;
            }
        }
        debug!(requested = instance_ids.len(), queued = queued, "Cancel commands queued");
        Ok(())
    }
}
