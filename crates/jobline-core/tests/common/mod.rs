// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for jobline-core integration tests.
//!
//! Provides a [`TestContext`] wiring a real backend into an engine with
//! simple pipelines and a form gateway, along with helpers that act as a
//! worker would.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tempfile::TempDir;
use uuid::Uuid;

use jobline_core::engine::{EngineOptions, LifecycleEngine};
use jobline_core::error::EngineError;
use jobline_core::forms::FormGateway;
use jobline_core::error::StatusClass;
use jobline_core::model::{
    FieldError, FormSubmitResult, NewProcess, Payload, PayloadEntry, Variables,
};
use jobline_core::persistence::{Persistence, PostgresPersistence, SqlitePersistence};
use jobline_core::pipeline::{PipelineError, PipelineKind, PipelineRunner};
use jobline_core::runtime;
use jobline_core::state::paths;
use jobline_core::status::ProcessStatus;

/// Input key the fork pipeline reads the parent ID from.
pub const PARENT_KEY: &str = "parentInstanceId";

/// Input key holding worker requirements of a start request.
pub const REQUIREMENTS_KEY: &str = "requirements";

/// Skip the current test when no PostgreSQL database is configured.
#[macro_export]
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        }
    };
}

/// Engine over a real backend, with the pieces tests need to drive it.
pub struct TestContext<P: Persistence> {
    pub store: Arc<P>,
    pub engine: Arc<LifecycleEngine>,
    pub forms: Arc<RequiredFieldForms<P>>,
    pub archive_dir: TempDir,
    _db_dir: Option<TempDir>,
}

impl TestContext<SqlitePersistence> {
    /// Engine over a fresh SQLite database file.
    pub async fn sqlite() -> Self {
        runtime::init_tracing();

        let db_dir = tempfile::tempdir().expect("Failed to create database dir");
        let store = SqlitePersistence::from_path(db_dir.path().join("jobline.db"))
            .await
            .expect("Failed to open SQLite database");

        Self::with_store(Arc::new(store), Some(db_dir))
    }
}

impl TestContext<PostgresPersistence> {
    /// Engine over the database in `TEST_DATABASE_URL`, if set.
    pub async fn postgres() -> Option<Self> {
        runtime::init_tracing();

        let database_url = std::env::var("TEST_DATABASE_URL").ok()?;
        let store = PostgresPersistence::connect(&database_url, 10).await.ok()?;

        Some(Self::with_store(Arc::new(store), None))
    }
}

impl<P: Persistence> TestContext<P> {
    fn with_store(store: Arc<P>, db_dir: Option<TempDir>) -> Self {
        let archive_dir = tempfile::tempdir().expect("Failed to create archive dir");
        let forms = Arc::new(RequiredFieldForms::new(store.clone()));

        let engine = LifecycleEngine::builder()
            .persistence(store.clone())
            .forms(forms.clone())
            .start_pipeline(Arc::new(EnqueuePipeline::new(store.clone(), PipelineKind::Start)))
            .fork_pipeline(Arc::new(EnqueuePipeline::new(store.clone(), PipelineKind::Fork)))
            .resume_pipeline(Arc::new(ResumePipeline::new(store.clone())))
            .options(EngineOptions {
                poll_interval: Duration::from_millis(10),
                archive_dir: Some(archive_dir.path().to_path_buf()),
                release_on_archive_failure: true,
            })
            .build()
            .expect("Failed to build engine");

        Self {
            store,
            engine: Arc::new(engine),
            forms,
            archive_dir,
            _db_dir: db_dir,
        }
    }

    /// Enqueue a root process directly, bypassing the engine.
    pub async fn enqueue(&self) -> Uuid {
        self.enqueue_process(NewProcess::new(Uuid::new_v4())).await
    }

    /// Enqueue a child of `parent` directly, bypassing the engine.
    pub async fn enqueue_child(&self, parent: Uuid) -> Uuid {
        self.enqueue_process(NewProcess::fork(Uuid::new_v4(), parent))
            .await
    }

    /// Enqueue `process` directly, bypassing the engine.
    pub async fn enqueue_process(&self, process: NewProcess) -> Uuid {
        let id = process.instance_id;
        self.store
            .insert(&process)
            .await
            .expect("Failed to insert process");
        id
    }

    /// Current status of a process.
    pub async fn status(&self, id: Uuid) -> ProcessStatus {
        self.store
            .get(id)
            .await
            .expect("Failed to read process")
            .expect("Process should exist")
            .status
    }

    /// Report `status` for `id` as worker `agent_id`.
    pub async fn report(&self, id: Uuid, agent_id: &str, status: ProcessStatus) {
        self.engine
            .update_status(id, agent_id, status)
            .await
            .expect("Failed to report status");
    }

    /// Wait until `id` reaches `status`, failing after a few seconds.
    pub async fn wait_for_status(&self, id: Uuid, status: ProcessStatus) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let current = self
                .store
                .get(id)
                .await
                .expect("Failed to read process")
                .map(|p| p.status);
            if current == Some(status) {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "process {id} never reached {status}"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Claim the next process as a worker, retrying until one shows up.
    pub async fn claim(&self, capabilities: Value) -> PayloadEntry {
        let capabilities = capabilities.as_object().cloned().unwrap_or_default();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            if let Some(entry) = self
                .engine
                .next_payload(&capabilities)
                .await
                .expect("Failed to poll")
            {
                return entry;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "no process was claimable"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

/// Build a start payload with `arguments`.
pub fn start_payload(id: Uuid, arguments: Value) -> Payload {
    Payload::new(id).with_input(object(json!({ (paths::ARGUMENTS_KEY): arguments })))
}

/// Build a fork payload for a child of `parent`.
pub fn fork_payload(id: Uuid, parent: Uuid) -> Payload {
    Payload::new(id).with_input(object(json!({ PARENT_KEY: parent.to_string() })))
}

/// Unwrap a JSON object.
pub fn object(value: Value) -> Variables {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {other}"),
    }
}

// ============================================================================
// Pipelines
// ============================================================================

/// Persists the request document and enqueues the process.
pub struct EnqueuePipeline<P> {
    store: Arc<P>,
    kind: PipelineKind,
}

impl<P> EnqueuePipeline<P> {
    pub fn new(store: Arc<P>, kind: PipelineKind) -> Self {
        Self { store, kind }
    }
}

#[async_trait]
impl<P: Persistence> PipelineRunner for EnqueuePipeline<P> {
    async fn process(&self, payload: &Payload) -> Result<(), PipelineError> {
        let mut process = NewProcess::new(payload.instance_id);

        if self.kind == PipelineKind::Fork {
            let parent = payload
                .input
                .get(PARENT_KEY)
                .and_then(Value::as_str)
                .and_then(|s| Uuid::parse_str(s).ok())
                .ok_or_else(|| PipelineError::Process {
                    message: "Parent process is required".to_string(),
                    status: StatusClass::BadRequest,
                })?;
            process.parent_instance_id = Some(parent);
        }
        process.requirements = payload.input.get(REQUIREMENTS_KEY).cloned();

        let request = serde_json::to_vec(&payload.input).map_err(PipelineError::other)?;
        self.store
            .put(payload.instance_id, paths::REQUEST_DATA, &request)
            .await
            .map_err(PipelineError::other)?;
        self.store
            .insert(&process)
            .await
            .map_err(PipelineError::other)?;
        Ok(())
    }
}

/// Moves a suspended process back to a worker.
pub struct ResumePipeline<P> {
    store: Arc<P>,
}

impl<P> ResumePipeline<P> {
    pub fn new(store: Arc<P>) -> Self {
        Self { store }
    }
}

/// Resume `id`: clear its suspend marker and hand it back to its worker.
async fn resume_process<P: Persistence>(store: &P, id: Uuid) -> Result<bool, EngineError> {
    store.delete(id, paths::SUSPEND_MARKER).await?;
    store
        .update_status_if(id, ProcessStatus::Suspended, ProcessStatus::Resuming)
        .await
}

#[async_trait]
impl<P: Persistence> PipelineRunner for ResumePipeline<P> {
    async fn process(&self, payload: &Payload) -> Result<(), PipelineError> {
        let resumed = resume_process(self.store.as_ref(), payload.instance_id)
            .await
            .map_err(PipelineError::other)?;
        if !resumed {
            return Err(PipelineError::Process {
                message: "Process is not suspended".to_string(),
                status: StatusClass::BadRequest,
            });
        }
        Ok(())
    }
}

// ============================================================================
// Forms
// ============================================================================

/// Form gateway with one pending form per suspended process, requiring the
/// listed fields to be present. Valid submissions resume the process.
pub struct RequiredFieldForms<P> {
    store: Arc<P>,
    form_name: String,
    required: std::sync::Mutex<Vec<String>>,
    submissions: std::sync::Mutex<Vec<(Uuid, Variables)>>,
}

impl<P> RequiredFieldForms<P> {
    pub fn new(store: Arc<P>) -> Self {
        Self {
            store,
            form_name: "approval".to_string(),
            required: std::sync::Mutex::new(Vec::new()),
            submissions: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Require `fields` in every submission.
    pub fn require(&self, fields: &[&str]) {
        *self.required.lock().unwrap() = fields.iter().map(|f| f.to_string()).collect();
    }

    /// Submissions received so far.
    pub fn submissions(&self) -> Vec<(Uuid, Variables)> {
        self.submissions.lock().unwrap().clone()
    }
}

#[async_trait]
impl<P: Persistence> FormGateway for RequiredFieldForms<P> {
    async fn submit_next(
        &self,
        instance_id: Uuid,
        data: &Variables,
    ) -> Result<Option<FormSubmitResult>, EngineError> {
        self.submissions
            .lock()
            .unwrap()
            .push((instance_id, data.clone()));

        let required = self.required.lock().unwrap().clone();
        let errors: Vec<FieldError> = required
            .iter()
            .filter(|field| !data.contains_key(field.as_str()))
            .map(|field| FieldError {
                field_name: field.clone(),
                error: "required".to_string(),
            })
            .collect();

        if !errors.is_empty() {
            return Ok(Some(FormSubmitResult::rejected(&self.form_name, errors)));
        }

        resume_process(self.store.as_ref(), instance_id).await?;
        Ok(Some(FormSubmitResult::accepted(&self.form_name)))
    }
}
