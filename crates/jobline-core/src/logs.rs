// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-process log interface.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::EngineError;
use crate::model::LogEntry;

/// Append-only log visible to users of a process.
#[async_trait]
pub trait ProcessLogStore: Send + Sync {
    /// Append a line to the instance's log.
    async fn append(&self, instance_id: Uuid, message: &str) -> Result<(), EngineError>;

    /// All lines of the instance's log, oldest first.
    async fn list(&self, instance_id: Uuid) -> Result<Vec<LogEntry>, EngineError>;
}
