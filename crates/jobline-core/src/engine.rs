// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process lifecycle engine.
//!
//! Coordinates the queue, the state store, workers, forms and pipelines to
//! start, wait on, hand off, report on and cancel processes. The engine keeps
//! no state of its own between calls: every decision re-reads the queue, and
//! every status change it makes is a conditional update, so any number of
//! engine instances may share one store.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::archive;
use crate::dispatch::AgentDispatcher;
use crate::error::{EngineError, Result, StatusClass};
use crate::forms::FormGateway;
use crate::logs::ProcessLogStore;
use crate::model::{Capabilities, Payload, PayloadEntry, ProcessResult, Variables};
use crate::pipeline::{PipelineError, PipelineKind, Pipelines};
use crate::queue::{ProcessQueue, filter_process_ids};
use crate::state::{self, ProcessStateStore, paths};
use crate::status::{ACTIVE_STATUSES, ProcessStatus, QUEUED_STATUSES};

/// Default delay between status checks while waiting on a process.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Tunables of the engine.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Delay between status checks in the synchronous wait.
    pub poll_interval: Duration,
    /// Directory for payload archives. The system temp dir when unset.
    pub archive_dir: Option<PathBuf>,
    /// Put a claimed process back to `ENQUEUED` when its archive can't be built.
    pub release_on_archive_failure: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            archive_dir: None,
            release_on_archive_failure: true,
        }
    }
}

impl EngineOptions {
    /// Directory payload archives are created in.
    pub fn archive_dir(&self) -> PathBuf {
        self.archive_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

/// The process lifecycle and cascade-control engine.
///
/// Cheap to share behind an `Arc`; all methods take `&self`.
pub struct LifecycleEngine {
    queue: Arc<dyn ProcessQueue>,
    state: Arc<dyn ProcessStateStore>,
    dispatcher: Arc<dyn AgentDispatcher>,
    forms: Arc<dyn FormGateway>,
    logs: Arc<dyn ProcessLogStore>,
    pipelines: Pipelines,
    options: EngineOptions,
}

impl fmt::Debug for LifecycleEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleEngine")
            .field("queue", &"...")
            .field("state", &"...")
            .field("dispatcher", &"...")
            .field("forms", &"...")
            .field("logs", &"...")
            .field("pipelines", &self.pipelines)
            .field("options", &self.options)
            .finish()
    }
}

impl LifecycleEngine {
    /// Assemble an engine from its collaborators.
    ///
    /// Most callers go through [`EngineBuilder`](crate::runtime::EngineBuilder).
    pub fn new(
        queue: Arc<dyn ProcessQueue>,
        state: Arc<dyn ProcessStateStore>,
        dispatcher: Arc<dyn AgentDispatcher>,
        forms: Arc<dyn FormGateway>,
        logs: Arc<dyn ProcessLogStore>,
        pipelines: Pipelines,
        options: EngineOptions,
    ) -> Self {
        Self {
            queue,
            state,
            dispatcher,
            forms,
            logs,
            pipelines,
            options,
        }
    }

    /// The engine's options.
    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    // ========================================================================
    // Work Handoff
    // ========================================================================

    /// Claim the next process a worker with `capabilities` can run and package
    /// its state.
    ///
    /// The claimed process moves `ENQUEUED` → `STARTING`. The returned archive
    /// belongs to the caller.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Io`] when the archive can't be written. With
    /// `release_on_archive_failure` set, the claim is released first so
    /// another worker can pick the process up.
    #[instrument(skip_all)]
    pub async fn next_payload(&self, capabilities: &Capabilities) -> Result<Option<PayloadEntry>> {
        let Some(process) = self.queue.poll(capabilities).await? else {
            debug!("No matching process");
            return Ok(None);
        };
        let instance_id = process.instance_id;

        let dir = self.options.archive_dir();
        match archive::export_to_temp_zip(self.state.as_ref(), instance_id, &dir).await {
            Ok(archive) => {
                info!(instance_id = %instance_id, "Process claimed");
                Ok(Some(PayloadEntry { process, archive }))
            }
            Err(e) => {
                warn!(instance_id = %instance_id, error = %e, "Failed to export process state");
                if self.options.release_on_archive_failure {
                    self.release_claim(instance_id).await;
                }
                Err(e)
            }
        }
    }

    async fn release_claim(&self, instance_id: Uuid) {
        match self
            .queue
            .update_status_if(instance_id, ProcessStatus::Starting, ProcessStatus::Enqueued)
            .await
        {
            Ok(true) => info!(instance_id = %instance_id, "Claim released"),
            Ok(false) => debug!(instance_id = %instance_id, "Claim already moved on, not released"),
            Err(e) => warn!(instance_id = %instance_id, error = %e, "Failed to release claim"),
        }
    }

    // ========================================================================
    // Start / Fork / Resume
    // ========================================================================

    /// Start a root process, optionally waiting for it to finish.
    pub async fn start(&self, payload: Payload, sync: bool) -> Result<ProcessResult> {
        self.start_with_cancel(PipelineKind::Start, payload, sync, &CancellationToken::new())
            .await
    }

    /// Start a child process, optionally waiting for it to finish.
    pub async fn start_fork(&self, payload: Payload, sync: bool) -> Result<ProcessResult> {
        self.start_with_cancel(PipelineKind::Fork, payload, sync, &CancellationToken::new())
            .await
    }

    /// Run `payload` through the `kind` pipeline and, when `sync` is set, wait
    /// until the process reaches a terminal status.
    ///
    /// While waiting, a suspended process gets its arguments submitted to its
    /// next pending form. Cancelling `cancel` stops the wait with
    /// [`EngineError::Interrupted`]. Neither that nor dropping the future
    /// touches the process.
    ///
    /// # Errors
    ///
    /// - [`EngineError::Process`] when the pipeline rejects the payload or the
    ///   process ends `FAILED`/`CANCELLED`
    /// - [`EngineError::Internal`] for any other pipeline failure
    /// - [`EngineError::Validation`] when a form submission is rejected
    /// - [`EngineError::NotFound`] when the process disappears while waiting
    #[instrument(skip(self, payload, cancel), fields(instance_id = %payload.instance_id, kind = %kind))]
    pub async fn start_with_cancel(
        &self,
        kind: PipelineKind,
        payload: Payload,
        sync: bool,
        cancel: &CancellationToken,
    ) -> Result<ProcessResult> {
        let instance_id = payload.instance_id;
        self.run_pipeline(kind, &payload).await?;
        info!(sync = sync, "Process started");

        if !sync {
            return Ok(ProcessResult {
                instance_id,
                out: None,
            });
        }

        let args = self.read_args(instance_id).await?;
        let out = self.wait_for_completion(instance_id, &args, cancel).await?;
        Ok(ProcessResult { instance_id, out })
    }

    /// Resume a suspended process through the resume pipeline.
    #[instrument(skip(self, payload), fields(instance_id = %payload.instance_id))]
    pub async fn resume(&self, payload: Payload) -> Result<()> {
        self.run_pipeline(PipelineKind::Resume, &payload).await?;
        info!("Process resumed");
        Ok(())
    }

    async fn run_pipeline(&self, kind: PipelineKind, payload: &Payload) -> Result<()> {
        let instance_id = payload.instance_id;
        match self.pipelines.get(kind).process(payload).await {
            Ok(()) => Ok(()),
            Err(PipelineError::Process { message, status }) => {
                warn!(kind = %kind, message = %message, "Pipeline rejected the process");
                Err(EngineError::process(instance_id, message, status))
            }
            Err(PipelineError::Other(source)) => {
                error!(kind = %kind, error = %source, "Pipeline failed");
                Err(EngineError::Internal {
                    instance_id,
                    source,
                })
            }
        }
    }

    // ========================================================================
    // Synchronous Wait
    // ========================================================================

    async fn wait_for_completion(
        &self,
        instance_id: Uuid,
        args: &Variables,
        cancel: &CancellationToken,
    ) -> Result<Option<Variables>> {
        loop {
            let process = self
                .queue
                .get(instance_id)
                .await?
                .ok_or(EngineError::NotFound { instance_id })?;

            match process.status {
                ProcessStatus::Suspended => self.wake_up(instance_id, args).await?,
                ProcessStatus::Failed | ProcessStatus::Cancelled => {
                    warn!(status = %process.status, "Process ended unsuccessfully");
                    return Err(EngineError::process(
                        instance_id,
                        "Process error",
                        StatusClass::InternalServerError,
                    ));
                }
                ProcessStatus::Finished => return self.read_out_values(instance_id).await,
                status => debug!(status = %status, "Waiting for process"),
            }

            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    info!("Wait interrupted");
                    return Err(EngineError::Interrupted { instance_id });
                }
                _ = tokio::time::sleep(self.options.poll_interval) => {}
            }
        }
    }

    async fn wake_up(&self, instance_id: Uuid, args: &Variables) -> Result<()> {
        let Some(result) = self.forms.submit_next(instance_id, args).await? else {
            debug!("Suspended process has no pending form");
            return Ok(());
        };

        if !result.valid {
            return Err(EngineError::Validation {
                instance_id,
                form_name: result.form_name,
                errors: result.errors,
            });
        }

        debug!(form = %result.form_name, "Form submitted");
        Ok(())
    }

    async fn read_args(&self, instance_id: Uuid) -> Result<Variables> {
        let request: Option<Value> =
            state::get_json(self.state.as_ref(), instance_id, paths::REQUEST_DATA).await?;

        let args = request
            .and_then(|mut request| request.get_mut(paths::ARGUMENTS_KEY).map(Value::take))
            .and_then(|args| match args {
                Value::Object(map) => Some(map),
                _ => None,
            });
        Ok(args.unwrap_or_default())
    }

    async fn read_out_values(&self, instance_id: Uuid) -> Result<Option<Variables>> {
        state::get_json(self.state.as_ref(), instance_id, paths::OUT_VALUES).await
    }

    // ========================================================================
    // Cancellation
    // ========================================================================

    /// Cancel a single process.
    ///
    /// A queued process is cancelled in place. An active one (or a queued one
    /// that changed status concurrently) is asked to stop by its worker. A
    /// terminal process is left alone.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] if the process doesn't exist.
    #[instrument(skip(self), fields(instance_id = %instance_id))]
    pub async fn kill(&self, instance_id: Uuid) -> Result<()> {
        let process = self
            .queue
            .get(instance_id)
            .await?
            .ok_or(EngineError::NotFound { instance_id })?;
        let current = process.status;

        if current.is_terminal() {
            debug!(status = %current, "Process already terminated");
            return Ok(());
        }

        if current.is_queued() {
            if self
                .queue
                .update_status_if(instance_id, current, ProcessStatus::Cancelled)
                .await?
            {
                info!(previous = %current, "Process cancelled");
                return Ok(());
            }
            debug!(previous = %current, "Status changed concurrently, asking the worker");
        }

        self.dispatcher.kill_process(instance_id).await?;
        info!("Kill requested");
        Ok(())
    }

    /// Cancel a process and every process forked from it, transitively.
    ///
    /// Queued members of the tree are cancelled in place, retrying until a
    /// snapshot of the tree is cancelled without interference. Active members
    /// of that final snapshot are then signalled in one batch.
    #[instrument(skip(self), fields(instance_id = %instance_id))]
    pub async fn kill_cascade(&self, instance_id: Uuid) -> Result<()> {
        let mut attempts = 0u32;
        let processes = loop {
            attempts += 1;
            let processes = self.queue.get_cascade(instance_id).await?;
            let queued = filter_process_ids(&processes, &QUEUED_STATUSES);

            if queued.is_empty()
                || self
                    .queue
                    .update_statuses_if(&queued, ProcessStatus::Cancelled, &QUEUED_STATUSES)
                    .await?
            {
                debug!(attempts = attempts, cancelled = queued.len(), "Queued processes settled");
                break processes;
            }

            debug!(attempts = attempts, "Process tree changed concurrently, retrying");
            tokio::task::yield_now().await;
        };

        let active = filter_process_ids(&processes, &ACTIVE_STATUSES);
        if !active.is_empty() {
            self.dispatcher.kill_processes(&active).await?;
        }

        info!(
            processes = processes.len(),
            signalled = active.len(),
            "Cascade kill completed"
        );
        Ok(())
    }

    // ========================================================================
    // Status Reports
    // ========================================================================

    /// Record a status report from the worker `agent_id`.
    ///
    /// A `FINISHED` report is stored as `SUSPENDED` when the process left a
    /// suspend marker. Reports about terminal or unknown processes are ignored.
    #[instrument(skip(self, agent_id), fields(instance_id = %instance_id, agent_id = %agent_id))]
    pub async fn update_status(
        &self,
        instance_id: Uuid,
        agent_id: &str,
        status: ProcessStatus,
    ) -> Result<()> {
        let status = if status == ProcessStatus::Finished && self.is_suspended(instance_id).await? {
            debug!("Suspend marker found, recording as suspended");
            ProcessStatus::Suspended
        } else {
            status
        };

        if !self
            .queue
            .update_agent_id(instance_id, agent_id, status)
            .await?
        {
            debug!(status = %status, "Status report ignored, process missing or terminated");
            return Ok(());
        }

        self.logs
            .append(instance_id, &format!("Process status: {}", status))
            .await?;
        info!(status = %status, "Process status updated");
        Ok(())
    }

    async fn is_suspended(&self, instance_id: Uuid) -> Result<bool> {
        self.state.exists(instance_id, paths::SUSPEND_MARKER).await
    }
}
