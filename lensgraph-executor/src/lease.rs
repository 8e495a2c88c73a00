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

//! Queue lease manager
//!
//! Owns a leased message while its work runs and keeps the message hidden
//! from other consumers. With visibility timeout `V` and `N` keep-alive
//! loops, checkpoints fall at `V·i − 10` seconds after the work starts for
//! `i = 1..=N+1`:
//!
//! - at checkpoints `1..=N` the visibility is extended to `V·(i+1)` seconds,
//!   which always covers the next checkpoint with ten seconds to spare
//! - at checkpoint `N+1` the work is cancelled and the message abandoned
//!
//! With `V = 15, N = 2` that is: extend to 30 at 5s, extend to 45 at 20s,
//! cancel at 35s.

use crate::queue::{QueueBroker, QueueError};
use lensgraph_core::{retry_until, RetryPolicy};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// Seconds of slack between a checkpoint and the visibility it relies on
pub const KEEP_ALIVE_MARGIN_SECS: u32 = 10;

/// One leased message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub queue_url: String,
    pub receipt_handle: String,
    pub message_id: String,
    pub initial_visibility_secs: u32,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("visibility timeout must exceed {KEEP_ALIVE_MARGIN_SECS}s, got {0}s")]
    VisibilityTooShort(u32),

    #[error("at least one keep-alive loop is required")]
    NoKeepAliveLoops,

    #[error("keep-alive schedule overflows: {0}s x {1} loops")]
    Overflow(u32, u32),
}

#[derive(Debug, Error)]
pub enum LeaseError<E> {
    #[error("Message {message_id} timed out after {elapsed:?}")]
    Timeout { message_id: String, elapsed: Duration },

    #[error("Work failed: {0}")]
    Work(E),

    #[error("Lease lost: {0}")]
    LeaseLost(String),

    #[error("Broker error: {0}")]
    Broker(QueueError),

    #[error("Work panicked: {0}")]
    Panicked(String),
}

pub struct LeaseManager {
    broker: Arc<dyn QueueBroker>,
    visibility_secs: u32,
    max_loops: u32,
    delete_retry: RetryPolicy,
}

impl LeaseManager {
    pub fn new(
        broker: Arc<dyn QueueBroker>,
        visibility_secs: u32,
        max_loops: u32,
    ) -> Result<Self, ScheduleError> {
        if visibility_secs <= KEEP_ALIVE_MARGIN_SECS {
            return Err(ScheduleError::VisibilityTooShort(visibility_secs));
        }
        if max_loops == 0 {
            return Err(ScheduleError::NoKeepAliveLoops);
        }
        visibility_secs
            .checked_mul(max_loops.saturating_add(2))
            .ok_or(ScheduleError::Overflow(visibility_secs, max_loops))?;

        Ok(Self {
            broker,
            visibility_secs,
            max_loops,
            delete_retry: RetryPolicy::exponential(),
        })
    }

    pub fn visibility_secs(&self) -> u32 {
        self.visibility_secs
    }

    pub fn max_loops(&self) -> u32 {
        self.max_loops
    }

    /// Offset of checkpoint `i` from the start of work.
    fn checkpoint(&self, i: u32) -> Duration {
        Duration::from_secs(u64::from(self.visibility_secs * i - KEEP_ALIVE_MARGIN_SECS))
    }

    /// How long work may run before it is cancelled.
    pub fn work_budget(&self) -> Duration {
        self.checkpoint(self.max_loops + 1)
    }

    /// `V·(N+1)`: the latest visibility ever granted for a message.
    pub fn hard_deadline(&self) -> Duration {
        Duration::from_secs(u64::from(self.visibility_secs * (self.max_loops + 1)))
    }

    /// Next available lease, or `None` when the queue is empty.
    pub async fn poll(&self) -> Result<Option<Lease>, QueueError> {
        let received = self.broker.receive(self.visibility_secs).await?;
        Ok(received.map(|message| Lease {
            queue_url: self.broker.queue_url().to_string(),
            receipt_handle: message.receipt_handle,
            message_id: message.message_id,
            initial_visibility_secs: self.visibility_secs,
            body: message.body,
        }))
    }

    /// Run `work` under `lease`. The message is deleted only when the work
    /// returns `Ok`.
    pub async fn run<F, T, E>(&self, lease: &Lease, work: F) -> Result<T, LeaseError<E>>
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let start = Instant::now();
        let mut handle = tokio::spawn(work);

        for i in 1..=self.max_loops + 1 {
            let checkpoint = start + self.checkpoint(i);
            if let Ok(joined) = tokio::time::timeout_at(checkpoint, &mut handle).await {
                return match joined {
                    Ok(Ok(value)) => {
                        self.delete(lease).await?;
                        Ok(value)
                    }
                    Ok(Err(e)) => Err(LeaseError::Work(e)),
                    Err(join) if join.is_panic() => {
                        let payload = join.into_panic();
                        let reason = payload
                            .downcast_ref::<&str>()
                            .map(|s| s.to_string())
                            .or_else(|| payload.downcast_ref::<String>().cloned())
                            .unwrap_or_else(|| "unknown panic payload".to_string());
                        error!(message_id = %lease.message_id, reason = %reason, "Message work panicked");
                        Err(LeaseError::Panicked(reason))
                    }
                    Err(join) => Err(LeaseError::Panicked(join.to_string())),
                };
            }

            if i > self.max_loops {
                break;
            }
            if handle.is_finished() {
                // collected on the next iteration without extending
                continue;
            }

            let new_timeout = self.visibility_secs * (i + 1);
            match self
                .broker
                .change_visibility(&lease.receipt_handle, new_timeout)
                .await
            {
                Ok(()) => debug!(
                    message_id = %lease.message_id,
                    loop_index = i,
                    new_timeout_secs = new_timeout,
                    "Extended message visibility"
                ),
                Err(QueueError::LeaseLost(reason)) => {
                    handle.abort();
                    warn!(message_id = %lease.message_id, reason = %reason, "Lease lost while extending; abandoning message");
                    return Err(LeaseError::LeaseLost(reason));
                }
                Err(e) => warn!(
                    message_id = %lease.message_id,
                    error = %e,
                    "Visibility extension failed; message may become visible early"
                ),
            }
        }

        handle.abort();
        let elapsed = start.elapsed();
        warn!(
            message_id = %lease.message_id,
            elapsed_ms = elapsed.as_millis() as u64,
            loops = self.max_loops,
            "Keep-alive exhausted; abandoning message"
        );
        Err(LeaseError::Timeout {
            message_id: lease.message_id.clone(),
            elapsed,
        })
    }

    async fn delete<E>(&self, lease: &Lease) -> Result<(), LeaseError<E>> {
        let deadline = Instant::now() + Duration::from_secs(u64::from(KEEP_ALIVE_MARGIN_SECS));
        retry_until(
            &self.delete_retry,
            deadline,
            |e: &QueueError| e.is_transient(),
            || self.broker.delete(&lease.receipt_handle),
        )
        .await
        .map_err(|e| match e.into_last_error() {
            Some(QueueError::LeaseLost(reason)) => LeaseError::LeaseLost(reason),
            Some(other) => LeaseError::Broker(other),
            None => LeaseError::Broker(QueueError::Transient("delete timed out".into())),
        })?;
        debug!(message_id = %lease.message_id, "Deleted message");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::ReceivedMessage;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Extend { at_secs: u64, timeout: u32 },
        Delete { at_secs: u64 },
    }

    struct ScriptedBroker {
        start: Instant,
        calls: Mutex<Vec<Call>>,
        lose_lease: bool,
    }

    impl ScriptedBroker {
        fn new(lose_lease: bool) -> Arc<Self> {
            Arc::new(Self {
                start: Instant::now(),
                calls: Mutex::new(Vec::new()),
                lose_lease,
            })
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl QueueBroker for ScriptedBroker {
        fn queue_url(&self) -> &str {
            "test://queue"
        }

        async fn receive(&self, _visibility_secs: u32) -> Result<Option<ReceivedMessage>, QueueError> {
            Ok(Some(ReceivedMessage {
                message_id: "m-1".into(),
                receipt_handle: "r-1".into(),
                body: "{}".into(),
            }))
        }

        async fn change_visibility(&self, _handle: &str, timeout: u32) -> Result<(), QueueError> {
            if self.lose_lease {
                return Err(QueueError::LeaseLost("MessageNotInflight".into()));
            }
            self.calls.lock().push(Call::Extend {
                at_secs: self.start.elapsed().as_secs(),
                timeout,
            });
            Ok(())
        }

        async fn delete(&self, _handle: &str) -> Result<(), QueueError> {
            self.calls.lock().push(Call::Delete {
                at_secs: self.start.elapsed().as_secs(),
            });
            Ok(())
        }
    }

    async fn lease_for(manager: &LeaseManager) -> Lease {
        manager.poll().await.unwrap().unwrap()
    }

    #[test]
    fn test_schedule_validation() {
        let broker = ScriptedBroker::new(false);
        assert!(matches!(
            LeaseManager::new(broker.clone(), 10, 3),
            Err(ScheduleError::VisibilityTooShort(10))
        ));
        assert!(matches!(
            LeaseManager::new(broker.clone(), 30, 0),
            Err(ScheduleError::NoKeepAliveLoops)
        ));
        let manager = LeaseManager::new(broker, 30, 10).unwrap();
        assert_eq!(manager.work_budget(), Duration::from_secs(320));
        assert_eq!(manager.hard_deadline(), Duration::from_secs(330));
    }

    #[tokio::test(start_paused = true)]
    async fn test_quick_work_deletes_without_extension() {
        let broker = ScriptedBroker::new(false);
        let manager = LeaseManager::new(broker.clone(), 15, 2).unwrap();
        let lease = lease_for(&manager).await;
        assert_eq!(lease.initial_visibility_secs, 15);
        assert_eq!(lease.queue_url, "test://queue");

        let value = manager
            .run(&lease, async { Ok::<_, String>(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(broker.calls(), vec![Call::Delete { at_secs: 0 }]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_fires_once() {
        let broker = ScriptedBroker::new(false);
        let manager = LeaseManager::new(broker.clone(), 15, 10).unwrap();
        let lease = lease_for(&manager).await;

        manager
            .run(&lease, async {
                tokio::time::sleep(Duration::from_secs(12)).await;
                Ok::<_, String>(())
            })
            .await
            .unwrap();

        assert_eq!(
            broker.calls(),
            vec![
                Call::Extend { at_secs: 5, timeout: 30 },
                Call::Delete { at_secs: 12 },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_exhaustion() {
        let broker = ScriptedBroker::new(false);
        let manager = LeaseManager::new(broker.clone(), 15, 2).unwrap();
        let lease = lease_for(&manager).await;
        let start = Instant::now();

        let result = manager
            .run(&lease, futures::future::pending::<Result<(), String>>())
            .await;

        assert!(matches!(result, Err(LeaseError::Timeout { .. })));
        assert_eq!(start.elapsed(), Duration::from_secs(35));
        assert_eq!(
            broker.calls(),
            vec![
                Call::Extend { at_secs: 5, timeout: 30 },
                Call::Extend { at_secs: 20, timeout: 45 },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_work_failure_keeps_message() {
        let broker = ScriptedBroker::new(false);
        let manager = LeaseManager::new(broker.clone(), 15, 2).unwrap();
        let lease = lease_for(&manager).await;

        let result = manager
            .run(&lease, async { Err::<(), _>("emit failed".to_string()) })
            .await;
        assert!(matches!(result, Err(LeaseError::Work(ref e)) if e == "emit failed"));
        assert!(broker.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_lost_abandons_work() {
        let broker = ScriptedBroker::new(true);
        let manager = LeaseManager::new(broker.clone(), 15, 2).unwrap();
        let lease = lease_for(&manager).await;
        let start = Instant::now();

        let result = manager
            .run(&lease, futures::future::pending::<Result<(), String>>())
            .await;
        assert!(matches!(result, Err(LeaseError::LeaseLost(_))));
        assert_eq!(start.elapsed(), Duration::from_secs(5));
        assert!(broker.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_work_is_reported() {
        let broker = ScriptedBroker::new(false);
        let manager = LeaseManager::new(broker.clone(), 15, 2).unwrap();
        let lease = lease_for(&manager).await;

        let result = manager
            .run(&lease, async {
                if true {
                    panic!("processor bug");
                }
                Ok::<(), String>(())
            })
            .await;
        assert!(matches!(result, Err(LeaseError::Panicked(ref msg)) if msg.contains("processor bug")));
        assert!(broker.calls().is_empty());
    }
}
