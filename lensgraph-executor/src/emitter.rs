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

//! Hit emitter: publishes execution hits downstream as JSON.

use crate::queue::{classify_sdk_error, sqs_client, QueueError};
use async_trait::async_trait;
use lensgraph_core::{retry_until, ExecutionHit, RetryError, RetryPolicy};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Error)]
pub enum EmitError {
    #[error("Failed to serialize hit: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Transient publish failure: {0}")]
    Transient(String),

    #[error("Publish failed: {0}")]
    Permanent(String),
}

impl EmitError {
    pub fn is_transient(&self) -> bool {
        matches!(self, EmitError::Transient(_))
    }
}

impl From<QueueError> for EmitError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::Transient(msg) => EmitError::Transient(msg),
            other => EmitError::Permanent(other.to_string()),
        }
    }
}

impl From<RetryError<EmitError>> for EmitError {
    fn from(e: RetryError<EmitError>) -> Self {
        match e {
            RetryError::DeadlineExceeded { attempts, last_error } => EmitError::Permanent(format!(
                "gave up after {} attempts: {}",
                attempts,
                last_error.map_or_else(|| "deadline exceeded".to_string(), |e| e.to_string())
            )),
            RetryError::Exhausted { last_error, .. } => match last_error {
                EmitError::Transient(msg) => EmitError::Permanent(msg),
                other => other,
            },
            RetryError::Permanent(e) => e,
        }
    }
}

/// Returns once the downstream channel has acknowledged the hit.
#[async_trait]
pub trait HitEmitter: Send + Sync {
    async fn emit(&self, hit: &ExecutionHit) -> Result<(), EmitError>;
}

pub struct SqsHitEmitter {
    client: aws_sdk_sqs::Client,
    queue_url: String,
    retry: RetryPolicy,
    budget: Duration,
}

impl SqsHitEmitter {
    pub fn new(
        sdk_config: &aws_config::SdkConfig,
        queue_url: impl Into<String>,
        endpoint: Option<&str>,
        budget: Duration,
    ) -> Self {
        Self {
            client: sqs_client(sdk_config, endpoint),
            queue_url: queue_url.into(),
            retry: RetryPolicy::until_deadline(),
            budget,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn publish(&self, body: &str) -> Result<(), EmitError> {
        self.client
            .send_message()
            .queue_url(&self.queue_url)
            .message_body(body)
            .send()
            .await
            .map_err(|e| EmitError::from(classify_sdk_error("SendMessage", e)))?;
        Ok(())
    }
}

#[async_trait]
impl HitEmitter for SqsHitEmitter {
    async fn emit(&self, hit: &ExecutionHit) -> Result<(), EmitError> {
        let body = serde_json::to_string(hit)?;
        retry_until(
            &self.retry,
            Instant::now() + self.budget,
            EmitError::is_transient,
            || self.publish(&body),
        )
        .await?;
        debug!(analyzer = %hit.analyzer_name, root_uid = %hit.root_uid(), "Hit published");
        Ok(())
    }
}
