// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process queue interface.
//!
//! The queue is the durable store of process rows and the only long-lived
//! shared mutable resource. Every status write made on behalf of the engine is
//! a conditional update executed as one atomic statement by the backend.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::EngineError;
use crate::model::{Capabilities, NewProcess, ProcessEntry};
use crate::status::ProcessStatus;

/// Durable store of process rows.
#[async_trait]
pub trait ProcessQueue: Send + Sync {
    /// Insert a new process in `ENQUEUED` status.
    async fn insert(&self, process: &NewProcess) -> Result<(), EngineError>;

    /// Atomically claim the oldest `ENQUEUED` process whose requirements are
    /// satisfied by `capabilities`, moving it to `STARTING`.
    ///
    /// Returns the claimed row, or `None` when nothing matches.
    async fn poll(&self, capabilities: &Capabilities)
    -> Result<Option<ProcessEntry>, EngineError>;

    /// Fetch a process by ID.
    async fn get(&self, instance_id: Uuid) -> Result<Option<ProcessEntry>, EngineError>;

    /// Fetch a process and all processes transitively forked from it.
    async fn get_cascade(&self, instance_id: Uuid) -> Result<Vec<ProcessEntry>, EngineError>;

    /// Set the status to `new_status` only if it is currently `expected`.
    ///
    /// Returns `false` when the precondition did not hold.
    async fn update_status_if(
        &self,
        instance_id: Uuid,
        expected: ProcessStatus,
        new_status: ProcessStatus,
    ) -> Result<bool, EngineError>;

    /// Set the status of every row in `instance_ids` whose current status is in
    /// `expected` to `new_status`.
    ///
    /// Returns `true` only if every listed row was updated.
    async fn update_statuses_if(
        &self,
        instance_ids: &[Uuid],
        new_status: ProcessStatus,
        expected: &[ProcessStatus],
    ) -> Result<bool, EngineError>;

    /// Record a worker's status report and agent association.
    ///
    /// No expected-status precondition applies, but terminal rows are never
    /// modified. Returns `false` when the row is missing or terminal.
    async fn update_agent_id(
        &self,
        instance_id: Uuid,
        agent_id: &str,
        status: ProcessStatus,
    ) -> Result<bool, EngineError>;
}

/// IDs of the entries whose status is in `statuses`.
pub fn filter_process_ids(entries: &[ProcessEntry], statuses: &[ProcessStatus]) -> Vec<Uuid> {
    entries
        .iter()
        .filter(|e| statuses.contains(&e.status))
        .map(|e| e.instance_id)
        .collect()
}
