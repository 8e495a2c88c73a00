// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Message processor
//!
//! Turns one leased message body into dispatched updates: parse the
//! envelope, fetch every referenced update payload, decode, dispatch.
//! Messages that can never succeed come back as [`ProcessOutcome::Poison`]
//! so the caller deletes them instead of waiting for redelivery.

use crate::dispatcher::{DispatchError, DispatchInput, DispatchSummary, Dispatcher};
use crate::envelope::{Envelope, ObjectLocation};
use bytes::Bytes;
use lensgraph_core::{retry_until, RetryPolicy, TenantId, Update};
use lensgraph_plugins::{ObjectStore, PluginError};
use lensgraph_rpc::decode_update;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Dispatched(DispatchSummary),
    /// Unusable message; delete it without dispatching
    Poison(String),
}

/// Failures that leave the message on the queue for redelivery
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Failed to fetch s3://{bucket}/{key}: {reason}")]
    Fetch {
        bucket: String,
        key: String,
        reason: String,
    },

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

pub struct MessageProcessor {
    store: Arc<dyn ObjectStore>,
    dispatcher: Dispatcher,
    tenant_id: TenantId,
    fetch_retry: RetryPolicy,
}

impl MessageProcessor {
    pub fn new(store: Arc<dyn ObjectStore>, dispatcher: Dispatcher, tenant_id: TenantId) -> Self {
        Self {
            store,
            dispatcher,
            tenant_id,
            fetch_retry: RetryPolicy::until_deadline(),
        }
    }

    pub fn with_fetch_retry(mut self, policy: RetryPolicy) -> Self {
        self.fetch_retry = policy;
        self
    }

    pub async fn process(
        &self,
        message_id: &str,
        body: &str,
        deadline: Instant,
    ) -> Result<ProcessOutcome, ProcessError> {
        let envelope = match Envelope::parse(body) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(message_id = %message_id, error = %e, "Dropping unparseable message");
                return Ok(ProcessOutcome::Poison(e.to_string()));
            }
        };

        let mut payloads: Vec<(Bytes, Update)> = Vec::with_capacity(envelope.records.len());
        for location in envelope.locations() {
            let bytes = self.fetch(&location, deadline).await?;
            match decode_update(&bytes) {
                Ok(update) => payloads.push((bytes, update)),
                Err(e) => {
                    error!(
                        message_id = %message_id,
                        bucket = %location.bucket,
                        key = %location.key,
                        error = %e,
                        "Dropping message with undecodable update"
                    );
                    return Ok(ProcessOutcome::Poison(e.to_string()));
                }
            }
        }

        let mut summary = DispatchSummary::default();
        let mut first_error = None;
        for (bytes, update) in &payloads {
            debug!(
                message_id = %message_id,
                root_uid = %update.root_uid(),
                kind = update.kind(),
                "Dispatching update"
            );
            let input = DispatchInput {
                tenant_id: self.tenant_id,
                message_id,
                body: bytes,
                update,
                deadline,
            };
            match self.dispatcher.dispatch(input).await {
                Ok(part) => summary.merge(&part),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(ProcessOutcome::Dispatched(summary)),
        }
    }

    async fn fetch(&self, location: &ObjectLocation, deadline: Instant) -> Result<Bytes, ProcessError> {
        retry_until(
            &self.fetch_retry,
            deadline,
            |e: &PluginError| matches!(e, PluginError::ObjectStore(_) | PluginError::IoError(_)),
            || self.store.get(&location.bucket, &location.key),
        )
        .await
        .map_err(|e| ProcessError::Fetch {
            bucket: location.bucket.clone(),
            key: location.key.clone(),
            reason: e.to_string(),
        })
    }
}
