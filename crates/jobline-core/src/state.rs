// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-process state storage interface.
//!
//! State is a set of named blobs per instance (request data, outputs, markers,
//! attachments), written by workers and pipelines. The engine only reads it.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::error::EngineError;

/// Well-known resource paths inside a process's state.
pub mod paths {
    /// Directory holding files produced by the worker.
    pub const ATTACHMENTS_DIR: &str = "_attachments";

    /// Directory holding the worker's persisted execution state.
    pub const STATE_DIR: &str = "_state";

    /// Request document written by the start pipeline.
    pub const REQUEST_DATA: &str = "_main.json";

    /// Key of the arguments object inside the request document.
    pub const ARGUMENTS_KEY: &str = "arguments";

    /// Output variables written by the worker on completion.
    pub const OUT_VALUES: &str = "_attachments/out.json";

    /// Present while the process is paused awaiting external input.
    pub const SUSPEND_MARKER: &str = "_attachments/_state/_suspend";
}

/// Receives state items during an export.
pub trait StateSink: Send {
    /// Write one item.
    fn write_item(&mut self, path: &str, data: &[u8]) -> Result<(), EngineError>;
}

/// Durable per-process blob storage.
#[async_trait]
pub trait ProcessStateStore: Send + Sync {
    /// Whether `path` exists for the instance.
    async fn exists(&self, instance_id: Uuid, path: &str) -> Result<bool, EngineError>;

    /// Raw bytes stored at `path`.
    async fn get_bytes(&self, instance_id: Uuid, path: &str)
    -> Result<Option<Vec<u8>>, EngineError>;

    /// Store (or replace) the item at `path`.
    async fn put(&self, instance_id: Uuid, path: &str, data: &[u8]) -> Result<(), EngineError>;

    /// Remove the item at `path`, if present.
    async fn delete(&self, instance_id: Uuid, path: &str) -> Result<(), EngineError>;

    /// Write every item of the instance's state into `sink`.
    async fn export(&self, instance_id: Uuid, sink: &mut dyn StateSink)
    -> Result<(), EngineError>;
}

/// Read the item at `path` and decode it as JSON.
pub async fn get_json<T, S>(
    store: &S,
    instance_id: Uuid,
    path: &str,
) -> Result<Option<T>, EngineError>
where
    T: DeserializeOwned,
    S: ProcessStateStore + ?Sized,
{
    match store.get_bytes(instance_id, path).await? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}
