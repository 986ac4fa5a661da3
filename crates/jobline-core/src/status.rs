// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process status state machine.
//!
//! Statuses are partitioned into three disjoint sets that drive every
//! algorithm in the engine:
//!
//! | Set | Statuses | Meaning |
//! |-----|----------|---------|
//! | queued | `ENQUEUED`, `PREPARING`, `SUSPENDED` | owned by the server, not on a worker |
//! | active | `STARTING`, `RUNNING`, `RESUMING` | owned by a remote worker |
//! | terminal | `CANCELLED`, `FAILED`, `FINISHED` | immutable once reached |

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessStatus {
    /// Waiting in the queue for a worker.
    Enqueued,
    /// Being prepared by a pipeline.
    Preparing,
    /// Paused, waiting for external input.
    Suspended,
    /// Claimed by a worker, not yet running.
    Starting,
    /// Executing on a worker.
    Running,
    /// Being resumed on a worker after a suspension.
    Resuming,
    /// Cancelled before or during execution.
    Cancelled,
    /// Failed on the worker.
    Failed,
    /// Completed successfully.
    Finished,
}

/// Statuses in which the server owns the process.
pub const QUEUED_STATUSES: [ProcessStatus; 3] = [
    ProcessStatus::Enqueued,
    ProcessStatus::Preparing,
    ProcessStatus::Suspended,
];

/// Statuses in which a remote worker owns the process.
pub const ACTIVE_STATUSES: [ProcessStatus; 3] = [
    ProcessStatus::Starting,
    ProcessStatus::Running,
    ProcessStatus::Resuming,
];

/// Statuses that can never be left.
pub const TERMINAL_STATUSES: [ProcessStatus; 3] = [
    ProcessStatus::Cancelled,
    ProcessStatus::Failed,
    ProcessStatus::Finished,
];

impl ProcessStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [ProcessStatus; 9] = [
        Self::Enqueued,
        Self::Preparing,
        Self::Suspended,
        Self::Starting,
        Self::Running,
        Self::Resuming,
        Self::Cancelled,
        Self::Failed,
        Self::Finished,
    ];

    /// Database/wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enqueued => "ENQUEUED",
            Self::Preparing => "PREPARING",
            Self::Suspended => "SUSPENDED",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Resuming => "RESUMING",
            Self::Cancelled => "CANCELLED",
            Self::Failed => "FAILED",
            Self::Finished => "FINISHED",
        }
    }

    /// Not yet dispatched, or paused awaiting input.
    pub fn is_queued(&self) -> bool {
        QUEUED_STATUSES.contains(self)
    }

    /// Currently owned by a remote worker.
    pub fn is_active(&self) -> bool {
        ACTIVE_STATUSES.contains(self)
    }

    /// No further transition is permitted.
    pub fn is_terminal(&self) -> bool {
        TERMINAL_STATUSES.contains(self)
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a stored status string is not a known status.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown process status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for ProcessStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

/// String forms of a status set, for binding into SQL `IN` lists.
pub(crate) fn status_strings(statuses: &[ProcessStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_string()).collect()
}
