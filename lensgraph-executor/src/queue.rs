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

//! Work-queue broker seam and its SQS implementation

use async_trait::async_trait;
use aws_sdk_sqs::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use std::time::Duration;
use thiserror::Error;

/// A message as handed out by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub message_id: String,
    pub receipt_handle: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    /// Connectivity blips, throttling, 5xx. Retry with backoff.
    #[error("Transient broker error: {0}")]
    Transient(String),

    /// Credentials, permissions, missing queue. Not retryable.
    #[error("Fatal broker error: {0}")]
    Fatal(String),

    /// The receipt handle no longer refers to an in-flight message.
    #[error("Lease lost: {0}")]
    LeaseLost(String),
}

impl QueueError {
    pub fn is_transient(&self) -> bool {
        matches!(self, QueueError::Transient(_))
    }
}

const LEASE_LOST_CODES: &[&str] = &[
    "ReceiptHandleIsInvalid",
    "InvalidReceiptHandle",
    "MessageNotInflight",
];

const FATAL_CODES: &[&str] = &[
    "AccessDenied",
    "AccessDeniedException",
    "InvalidClientTokenId",
    "SignatureDoesNotMatch",
    "UnrecognizedClientException",
    "InvalidSecurity",
    "NonExistentQueue",
    "QueueDoesNotExist",
];

/// Classify a broker error code. SQS codes may carry an
/// `AWS.SimpleQueueService.` prefix, so matching is on the suffix.
pub fn classify_error_code(code: Option<&str>, message: String) -> QueueError {
    let Some(code) = code else {
        return QueueError::Transient(message);
    };
    let matches_any = |codes: &[&str]| codes.iter().any(|c| code.ends_with(c));
    if matches_any(LEASE_LOST_CODES) {
        QueueError::LeaseLost(message)
    } else if code.ends_with("InvalidParameterValue") && message.contains("receipt handle") {
        // expired receipt handles surface as a parameter error
        QueueError::LeaseLost(message)
    } else if matches_any(FATAL_CODES) {
        QueueError::Fatal(message)
    } else {
        QueueError::Transient(message)
    }
}

pub(crate) fn classify_sdk_error<E, R>(operation: &str, err: SdkError<E, R>) -> QueueError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let message = format!("{} failed: {}", operation, DisplayErrorContext(&err));
    match &err {
        SdkError::ServiceError(service) => classify_error_code(service.err().code(), message),
        _ => QueueError::Transient(message),
    }
}

/// The operations the lease manager needs from a work queue
#[async_trait]
pub trait QueueBroker: Send + Sync {
    fn queue_url(&self) -> &str;

    /// Receive at most one message, hiding it for `visibility_secs`.
    async fn receive(&self, visibility_secs: u32) -> Result<Option<ReceivedMessage>, QueueError>;

    /// Hide the message for `timeout_secs` counted from now.
    async fn change_visibility(&self, receipt_handle: &str, timeout_secs: u32)
        -> Result<(), QueueError>;

    async fn delete(&self, receipt_handle: &str) -> Result<(), QueueError>;
}

#[derive(Debug, Clone)]
pub struct SqsBroker {
    client: aws_sdk_sqs::Client,
    queue_url: String,
    wait_time: Duration,
}

impl SqsBroker {
    pub fn new(
        sdk_config: &aws_config::SdkConfig,
        queue_url: impl Into<String>,
        endpoint: Option<&str>,
        wait_time: Duration,
    ) -> Self {
        Self::from_client(sqs_client(sdk_config, endpoint), queue_url, wait_time)
    }

    pub fn from_client(
        client: aws_sdk_sqs::Client,
        queue_url: impl Into<String>,
        wait_time: Duration,
    ) -> Self {
        Self {
            client,
            queue_url: queue_url.into(),
            wait_time,
        }
    }
}

/// SQS client inheriting the shared SDK config, optionally pointed at a
/// custom endpoint (LocalStack, ElasticMQ).
pub fn sqs_client(sdk_config: &aws_config::SdkConfig, endpoint: Option<&str>) -> aws_sdk_sqs::Client {
    let mut builder = aws_sdk_sqs::config::Builder::from(sdk_config);
    if let Some(endpoint) = endpoint {
        builder = builder.endpoint_url(endpoint);
    }
    aws_sdk_sqs::Client::from_conf(builder.build())
}

#[async_trait]
impl QueueBroker for SqsBroker {
    fn queue_url(&self) -> &str {
        &self.queue_url
    }

    async fn receive(&self, visibility_secs: u32) -> Result<Option<ReceivedMessage>, QueueError> {
        let response = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(1)
            .visibility_timeout(visibility_secs.min(i32::MAX as u32) as i32)
            .wait_time_seconds(self.wait_time.as_secs().min(20) as i32)
            .send()
            .await
            .map_err(|e| classify_sdk_error("ReceiveMessage", e))?;

        let Some(message) = response.messages().first() else {
            return Ok(None);
        };
        match (message.message_id(), message.receipt_handle()) {
            (Some(id), Some(handle)) => Ok(Some(ReceivedMessage {
                message_id: id.to_string(),
                receipt_handle: handle.to_string(),
                body: message.body().unwrap_or_default().to_string(),
            })),
            _ => Err(QueueError::Transient(
                "ReceiveMessage returned a message without id or receipt handle".into(),
            )),
        }
    }

    async fn change_visibility(
        &self,
        receipt_handle: &str,
        timeout_secs: u32,
    ) -> Result<(), QueueError> {
        self.client
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .visibility_timeout(timeout_secs.min(i32::MAX as u32) as i32)
            .send()
            .await
            .map_err(|e| classify_sdk_error("ChangeMessageVisibility", e))?;
        Ok(())
    }

    async fn delete(&self, receipt_handle: &str) -> Result<(), QueueError> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| classify_sdk_error("DeleteMessage", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_lease_lost() {
        for code in [
            "ReceiptHandleIsInvalid",
            "AWS.SimpleQueueService.MessageNotInflight",
            "InvalidReceiptHandle",
        ] {
            assert!(matches!(
                classify_error_code(Some(code), "x".into()),
                QueueError::LeaseLost(_)
            ));
        }
        assert!(matches!(
            classify_error_code(
                Some("InvalidParameterValue"),
                "Value for parameter ReceiptHandle is invalid. Reason: The receipt handle has expired.".into()
            ),
            QueueError::LeaseLost(_)
        ));
    }

    #[test]
    fn test_classify_fatal_and_transient() {
        assert!(matches!(
            classify_error_code(Some("AccessDenied"), "x".into()),
            QueueError::Fatal(_)
        ));
        assert!(matches!(
            classify_error_code(Some("AWS.SimpleQueueService.NonExistentQueue"), "x".into()),
            QueueError::Fatal(_)
        ));
        let throttled = classify_error_code(Some("ThrottlingException"), "x".into());
        assert!(throttled.is_transient());
        assert!(classify_error_code(None, "io".into()).is_transient());
        assert!(!QueueError::LeaseLost("x".into()).is_transient());
    }
}
