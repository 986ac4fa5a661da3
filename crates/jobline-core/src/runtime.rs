// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Assembling an engine inside an existing tokio application.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use jobline_core::config::Config;
//! use jobline_core::runtime::{self, LifecycleEngine};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     runtime::init_tracing();
//!     let config = Config::from_env()?;
//!     let backend = runtime::connect(&config).await?;
//!
//!     let engine = LifecycleEngine::builder()
//!         .backend(backend)
//!         .forms(Arc::new(MyForms::new()))
//!         .start_pipeline(Arc::new(StartPipeline::new()))
//!         .fork_pipeline(Arc::new(ForkPipeline::new()))
//!         .resume_pipeline(Arc::new(ResumePipeline::new()))
//!         .options(config.engine_options())
//!         .build()?;
//!
//!     // ... serve requests with `engine` ...
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::config::Config;
use crate::dispatch::AgentDispatcher;
use crate::error::EngineError;
use crate::forms::FormGateway;
use crate::logs::ProcessLogStore;
use crate::persistence::{Persistence, PostgresPersistence, SqlitePersistence};
use crate::pipeline::{PipelineRunner, Pipelines};
use crate::queue::ProcessQueue;
use crate::state::ProcessStateStore;

pub use crate::engine::{EngineOptions, LifecycleEngine};

/// Initialise the global `tracing` subscriber.
///
/// Honors `RUST_LOG`, with `jobline_core=info` added by default. Calling it
/// again after a subscriber is installed has no effect.
pub fn init_tracing() {
    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    if let Ok(directive) = "jobline_core=info".parse() {
        filter = filter.add_directive(directive);
    }

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// A connected, migrated storage backend.
#[derive(Clone)]
pub enum Backend {
    /// SQLite database file or in-memory database.
    Sqlite(SqlitePersistence),
    /// PostgreSQL server.
    Postgres(PostgresPersistence),
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite(_) => f.write_str("Backend::Sqlite"),
            Self::Postgres(_) => f.write_str("Backend::Postgres"),
        }
    }
}

/// Open the backend named by `config.database_url` and run its migrations.
pub async fn connect(config: &Config) -> Result<Backend, EngineError> {
    if config.is_sqlite() {
        let backend =
            SqlitePersistence::connect(&config.database_url, config.max_connections).await?;
        let pool = backend.pool().options();
        info!(
            max_connections = pool.get_max_connections(),
            min_connections = pool.get_min_connections(),
            "Connected to SQLite"
        );
        Ok(Backend::Sqlite(backend))
    } else {
        let backend =
            PostgresPersistence::connect(&config.database_url, config.max_connections).await?;
        info!(max_connections = config.max_connections, "Connected to PostgreSQL");
        Ok(Backend::Postgres(backend))
    }
}

/// Builder for a [`LifecycleEngine`].
#[derive(Default)]
pub struct EngineBuilder {
    queue: Option<Arc<dyn ProcessQueue>>,
    state: Option<Arc<dyn ProcessStateStore>>,
    dispatcher: Option<Arc<dyn AgentDispatcher>>,
    logs: Option<Arc<dyn ProcessLogStore>>,
    forms: Option<Arc<dyn FormGateway>>,
    start: Option<Arc<dyn PipelineRunner>>,
    fork: Option<Arc<dyn PipelineRunner>>,
    resume: Option<Arc<dyn PipelineRunner>>,
    options: EngineOptions,
}

impl std::fmt::Debug for EngineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineBuilder")
            .field("queue", &self.queue.as_ref().map(|_| "..."))
            .field("state", &self.state.as_ref().map(|_| "..."))
            .field("dispatcher", &self.dispatcher.as_ref().map(|_| "..."))
            .field("logs", &self.logs.as_ref().map(|_| "..."))
            .field("forms", &self.forms.as_ref().map(|_| "..."))
            .field("start", &self.start.as_ref().map(|_| "..."))
            .field("fork", &self.fork.as_ref().map(|_| "..."))
            .field("resume", &self.resume.as_ref().map(|_| "..."))
            .field("options", &self.options)
            .finish()
    }
}

impl LifecycleEngine {
    /// Create a new builder for configuring the engine.
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }
}

impl EngineBuilder {
    /// Create a new builder with default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use one backend for the queue, state, logs and agent commands.
    pub fn persistence<P: Persistence>(self, persistence: Arc<P>) -> Self {
        self.queue(persistence.clone())
            .state(persistence.clone())
            .logs(persistence.clone())
            .dispatcher(persistence)
    }

    /// Use a backend opened by [`connect`].
    pub fn backend(self, backend: Backend) -> Self {
        match backend {
            Backend::Sqlite(p) => self.persistence(Arc::new(p)),
            Backend::Postgres(p) => self.persistence(Arc::new(p)),
        }
    }

    /// Set the process queue (required).
    pub fn queue(mut self, queue: Arc<dyn ProcessQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Set the state store (required).
    pub fn state(mut self, state: Arc<dyn ProcessStateStore>) -> Self {
        self.state = Some(state);
        self
    }

    /// Set the agent dispatcher (required).
    pub fn dispatcher(mut self, dispatcher: Arc<dyn AgentDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Set the process log store (required).
    pub fn logs(mut self, logs: Arc<dyn ProcessLogStore>) -> Self {
        self.logs = Some(logs);
        self
    }

    /// Set the form gateway (required).
    pub fn forms(mut self, forms: Arc<dyn FormGateway>) -> Self {
        self.forms = Some(forms);
        self
    }

    /// Set the start pipeline (required).
    pub fn start_pipeline(mut self, runner: Arc<dyn PipelineRunner>) -> Self {
        self.start = Some(runner);
        self
    }

    /// Set the fork pipeline (required).
    pub fn fork_pipeline(mut self, runner: Arc<dyn PipelineRunner>) -> Self {
        self.fork = Some(runner);
        self
    }

    /// Set the resume pipeline (required).
    pub fn resume_pipeline(mut self, runner: Arc<dyn PipelineRunner>) -> Self {
        self.resume = Some(runner);
        self
    }

    /// Set engine options.
    ///
    /// Default: [`EngineOptions::default`]
    pub fn options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    /// Build the engine.
    ///
    /// Returns an error naming the first missing collaborator.
    pub fn build(self) -> Result<LifecycleEngine> {
        let queue = self
            .queue
            .ok_or_else(|| anyhow::anyhow!("queue is required"))?;
        let state = self
            .state
            .ok_or_else(|| anyhow::anyhow!("state store is required"))?;
        let dispatcher = self
            .dispatcher
            .ok_or_else(|| anyhow::anyhow!("agent dispatcher is required"))?;
        let logs = self
            .logs
            .ok_or_else(|| anyhow::anyhow!("log store is required"))?;
        let forms = self
            .forms
            .ok_or_else(|| anyhow::anyhow!("form gateway is required"))?;
        let start = self
            .start
            .ok_or_else(|| anyhow::anyhow!("start pipeline is required"))?;
        let fork = self
            .fork
            .ok_or_else(|| anyhow::anyhow!("fork pipeline is required"))?;
        let resume = self
            .resume
            .ok_or_else(|| anyhow::anyhow!("resume pipeline is required"))?;

        Ok(LifecycleEngine::new(
            queue,
            state,
            dispatcher,
            forms,
            logs,
            Pipelines::new(start, fork, resume),
            self.options,
        ))
    }
}
