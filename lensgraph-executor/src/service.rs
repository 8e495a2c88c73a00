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

//! Executor service loop: `poll -> lease -> dispatch` with bounded
//! concurrency and graceful drain on shutdown.

use crate::lease::{Lease, LeaseError, LeaseManager};
use crate::processor::{MessageProcessor, ProcessOutcome};
use crate::queue::QueueError;
use crate::stats::PipelineStats;
use lensgraph_core::RetryPolicy;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Final state of one leased message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageDisposition {
    Deleted,
    /// Unusable message, deleted without dispatch
    Poisoned,
    /// Keep-alive exhausted; left for redelivery
    TimedOut,
    LeaseLost,
    /// Left for redelivery
    Failed(String),
}

#[derive(Clone)]
pub struct ExecutorService {
    lease: Arc<LeaseManager>,
    processor: Arc<MessageProcessor>,
    stats: Arc<PipelineStats>,
    concurrency: usize,
    idle_delay: Duration,
    poll_retry: RetryPolicy,
}

impl ExecutorService {
    pub fn new(
        lease: Arc<LeaseManager>,
        processor: Arc<MessageProcessor>,
        stats: Arc<PipelineStats>,
        concurrency: usize,
    ) -> Self {
        Self {
            lease,
            processor,
            stats,
            concurrency: concurrency.max(1),
            idle_delay: Duration::ZERO,
            poll_retry: RetryPolicy::exponential(),
        }
    }

    /// Pause after an empty poll. Only needed when the broker does not long-poll.
    pub fn with_idle_delay(mut self, idle_delay: Duration) -> Self {
        self.idle_delay = idle_delay;
        self
    }

    pub fn stats(&self) -> &Arc<PipelineStats> {
        &self.stats
    }

    /// Process one leased message to completion.
    pub async fn process_one(&self, lease: Lease) -> MessageDisposition {
        // the lease cancels work before this deadline is reached
        let deadline = Instant::now() + self.lease.hard_deadline();
        let processor = Arc::clone(&self.processor);
        let message_id = lease.message_id.clone();
        let body = lease.body.clone();

        let result = self
            .lease
            .run(&lease, async move {
                processor.process(&message_id, &body, deadline).await
            })
            .await;

        match result {
            Ok(ProcessOutcome::Dispatched(summary)) => {
                self.stats.record_deleted();
                debug!(
                    message_id = %lease.message_id,
                    hits = summary.hits,
                    misses = summary.misses,
                    failures = summary.failures,
                    "Message processed"
                );
                MessageDisposition::Deleted
            }
            Ok(ProcessOutcome::Poison(_)) => {
                self.stats.record_poison();
                self.stats.record_deleted();
                MessageDisposition::Poisoned
            }
            Err(LeaseError::Timeout { .. }) => {
                self.stats.record_timeout();
                MessageDisposition::TimedOut
            }
            Err(LeaseError::LeaseLost(_)) => MessageDisposition::LeaseLost,
            Err(LeaseError::Work(e)) => {
                warn!(message_id = %lease.message_id, error = %e, "Message left for redelivery");
                MessageDisposition::Failed(e.to_string())
            }
            Err(LeaseError::Broker(e)) => {
                warn!(message_id = %lease.message_id, error = %e, "Failed to delete processed message");
                MessageDisposition::Failed(e.to_string())
            }
            Err(LeaseError::Panicked(reason)) => MessageDisposition::Failed(reason),
        }
    }

    /// Poll and process until `shutdown` resolves, then drain in-flight
    /// messages. Fails only on a fatal broker error.
    pub async fn run_until<S>(&self, shutdown: S) -> Result<(), QueueError>
    where
        S: Future<Output = ()>,
    {
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut in_flight = JoinSet::new();
        let mut poll_failures: u32 = 0;
        let mut fatal = None;
        tokio::pin!(shutdown);

        info!(concurrency = self.concurrency, "Executor service started");

        loop {
            while let Some(joined) = in_flight.try_join_next() {
                log_join(joined);
            }

            let permit = tokio::select! {
                _ = &mut shutdown => break,
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let polled = tokio::select! {
                _ = &mut shutdown => break,
                polled = self.lease.poll() => polled,
            };

            match polled {
                Ok(Some(lease)) => {
                    poll_failures = 0;
                    self.stats.record_received();
                    let service = self.clone();
                    in_flight.spawn(async move {
                        let _permit = permit;
                        service.process_one(lease).await
                    });
                }
                Ok(None) => {
                    poll_failures = 0;
                    if !self.idle_delay.is_zero() {
                        tokio::select! {
                            _ = &mut shutdown => break,
                            _ = tokio::time::sleep(self.idle_delay) => {}
                        }
                    }
                }
                Err(e) if e.is_transient() => {
                    let delay = self.poll_retry.delay_for_attempt(poll_failures);
                    poll_failures = poll_failures.saturating_add(1);
                    warn!(error = %e, attempt = poll_failures, delay_ms = delay.as_millis() as u64, "Queue poll failed; backing off");
                    tokio::select! {
                        _ = &mut shutdown => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    error!(error = %e, "Fatal queue error; stopping");
                    fatal = Some(e);
                    break;
                }
            }
        }

        info!(in_flight = in_flight.len(), "Draining in-flight messages");
        while let Some(joined) = in_flight.join_next().await {
            log_join(joined);
        }
        info!("Executor service stopped");

        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn log_join(joined: Result<MessageDisposition, tokio::task::JoinError>) {
    match joined {
        Ok(disposition) => debug!(?disposition, "Message finished"),
        Err(e) => error!(error = %e, "Message task failed"),
    }
}
