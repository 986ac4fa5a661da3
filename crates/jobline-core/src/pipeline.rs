// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Processing chains that prepare and dispatch a process.
//!
//! The engine knows exactly three chains, selected by call site through
//! [`PipelineKind`]. What a chain does (persisting request data, resolving a
//! project, enqueueing) is up to the [`PipelineRunner`] implementation.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::error::StatusClass;
use crate::model::Payload;

/// The chain a payload is routed through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineKind {
    /// Fresh start of a root process.
    Start,
    /// Start of a child process forked from a running one.
    Fork,
    /// Resumption of a suspended process.
    Resume,
}

impl PipelineKind {
    /// Name used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Fork => "fork",
            Self::Resume => "resume",
        }
    }
}

impl fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by a pipeline.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PipelineError {
    /// Domain failure already classified by the pipeline. Passed through as is.
    #[error("{message}")]
    Process {
        /// Human-readable message.
        message: String,
        /// HTTP-style classification.
        status: StatusClass,
    },

    /// Any other failure. Wrapped by the engine as an internal error.
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl PipelineError {
    /// Wrap an arbitrary error.
    pub fn other(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Other(err.into())
    }
}

/// One processing chain.
#[async_trait]
pub trait PipelineRunner: Send + Sync {
    /// Process the payload.
    async fn process(&self, payload: &Payload) -> Result<(), PipelineError>;
}

/// The three chains held by the engine.
#[derive(Clone)]
pub struct Pipelines {
    start: Arc<dyn PipelineRunner>,
    fork: Arc<dyn PipelineRunner>,
    resume: Arc<dyn PipelineRunner>,
}

impl fmt::Debug for Pipelines {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipelines")
            .field("start", &"...")
            .field("fork", &"...")
            .field("resume", &"...")
            .finish()
    }
}

impl Pipelines {
    /// Group the three chains.
    pub fn new(
        start: Arc<dyn PipelineRunner>,
        fork: Arc<dyn PipelineRunner>,
        resume: Arc<dyn PipelineRunner>,
    ) -> Self {
        Self {
            start,
            fork,
            resume,
        }
    }

    /// The chain for `kind`.
    pub fn get(&self, kind: PipelineKind) -> &dyn PipelineRunner {
        match kind {
            PipelineKind::Start => self.start.as_ref(),
            PipelineKind::Fork => self.fork.as_ref(),
            PipelineKind::Resume => self.resume.as_ref(),
        }
    }
}
