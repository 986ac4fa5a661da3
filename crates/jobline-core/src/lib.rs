// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Jobline Core - Process Lifecycle Engine
//!
//! This crate tracks long-running, suspendable, forkable processes executed by
//! a pool of remote workers. It hands work to workers, ingests their status
//! reports, waits on processes for synchronous callers and cancels whole
//! process trees, keeping every status change safe under concurrent writers.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────┐        ┌──────────────────────────────┐
//! │   API layer (callers)         │        │   Workers (agents)           │
//! │ start / fork / resume / kill  │        │ next_payload / update_status │
//! └───────────────┬───────────────┘        └───────────────┬──────────────┘
//!                 │                                        │
//!                 ▼                                        ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          LifecycleEngine                                │
//! │     status protocol · sync wait · cascade kill · payload handoff        │
//! └─────────────────────────────────────────────────────────────────────────┘
//!      │            │            │             │            │          │
//!      ▼            ▼            ▼             ▼            ▼          ▼
//!  ProcessQueue  StateStore  LogStore  AgentDispatcher  FormGateway  Pipelines
//!      └────────────┴────────────┴─────────────┘
//!                         │
//!                         ▼
//!            ┌──────────────────────────┐
//!            │  PostgreSQL or SQLite    │
//!            │  (persistence module)    │
//!            └──────────────────────────┘
//! ```
//!
//! # Process Status State Machine
//!
//! ```text
//!   queued                     active                     terminal
//!  ┌───────────┐  claim    ┌───────────┐             ┌───────────┐
//!  │ ENQUEUED  │──────────►│ STARTING  │────────────►│ FINISHED  │
//!  │ PREPARING │           │ RUNNING   │────────────►│ FAILED    │
//!  │ SUSPENDED │◄──────────│ RESUMING  │             │ CANCELLED │
//!  └─────┬─────┘  suspend  └─────┬─────┘             └───────────┘
//!        │                       │                         ▲
//!        │ kill (in place)       │ kill (via worker)       │
//!        └───────────────────────┴─────────────────────────┘
//! ```
//!
//! Terminal rows are never modified again. A worker's `FINISHED` report is
//! recorded as `SUSPENDED` when the process left the suspend marker
//! `_attachments/_state/_suspend` in its state.
//!
//! ## Status Descriptions
//!
//! | Status | Set | Description |
//! |--------|-----|-------------|
//! | `ENQUEUED` | queued | Waiting for a worker to claim it |
//! | `PREPARING` | queued | Being prepared by a pipeline |
//! | `SUSPENDED` | queued | Paused, awaiting external input |
//! | `STARTING` | active | Claimed by a worker, not yet running |
//! | `RUNNING` | active | Executing on a worker |
//! | `RESUMING` | active | Restarting after a suspension |
//! | `FINISHED` | terminal | Completed successfully |
//! | `FAILED` | terminal | Completed with an error |
//! | `CANCELLED` | terminal | Cancelled by a user or a cascade |
//!
//! # Configuration
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `JOBLINE_DATABASE_URL` | Yes | - | PostgreSQL or SQLite connection string |
//! | `JOBLINE_MAX_CONNECTIONS` | No | `10` | Database pool size |
//! | `JOBLINE_WAIT_POLL_INTERVAL_MS` | No | `1000` | Sync wait poll interval |
//! | `JOBLINE_ARCHIVE_DIR` | No | temp dir | Payload archive directory |
//! | `JOBLINE_RELEASE_ON_ARCHIVE_FAILURE` | No | `true` | Re-enqueue claims whose archive failed |

#![deny(missing_docs)]

/// Zip archives of process state handed to workers.
pub mod archive;

/// Requirement matching against worker capabilities.
pub mod capabilities;

/// Configuration loaded from environment variables.
pub mod config;

/// Worker cancellation interface and command format.
pub mod dispatch;

/// The lifecycle engine.
pub mod engine;

/// Error types with stable codes and HTTP-style classification.
pub mod error;

/// Form submission interface.
pub mod forms;

/// Per-process log interface.
pub mod logs;

/// Embedded database migrations.
pub mod migrations;

/// Shared data model.
pub mod model;

/// SQLite and PostgreSQL storage backends.
pub mod persistence;

/// Start, fork and resume pipelines.
pub mod pipeline;

/// Process queue interface.
pub mod queue;

/// Engine assembly and process-wide setup.
pub mod runtime;

/// Per-process state storage interface.
pub mod state;

/// Process statuses and status sets.
pub mod status;

pub use engine::{EngineOptions, LifecycleEngine};
pub use error::{EngineError, Result};
pub use status::ProcessStatus;
