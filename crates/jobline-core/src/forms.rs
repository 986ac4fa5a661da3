// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Human-input gateway used to wake suspended processes.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::EngineError;
use crate::model::{FormSubmitResult, Variables};

/// Submits data to a suspended process's pending input requests.
#[async_trait]
pub trait FormGateway: Send + Sync {
    /// Submit `data` as the answer to the next pending form of the instance,
    /// resuming the process when the submission is valid.
    ///
    /// Returns `None` when the process has no pending form.
    async fn submit_next(
        &self,
        instance_id: Uuid,
        data: &Variables,
    ) -> Result<Option<FormSubmitResult>, EngineError>;
}
