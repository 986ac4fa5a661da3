// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Delivery of cancellation signals to remote workers.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineError;

/// Sends kill requests to whichever worker is executing a process.
///
/// Delivery is advisory: callers do not wait for the worker to stop. The
/// worker reports the resulting terminal status on its own.
#[async_trait]
pub trait AgentDispatcher: Send + Sync {
    /// Ask the worker running `instance_id` to cancel it.
    async fn kill_process(&self, instance_id: Uuid) -> Result<(), EngineError>;

    /// Batched form of [`kill_process`](Self::kill_process).
    async fn kill_processes(&self, instance_ids: &[Uuid]) -> Result<(), EngineError> {
        for id in instance_ids {
            self.kill_process(*id).await?;
        }
        Ok(())
    }
}

/// Command queued for a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentCommand {
    /// Stop executing the process.
    #[serde(rename_all = "camelCase")]
    CancelJob {
        /// Process to cancel.
        instance_id: Uuid,
    },
}
