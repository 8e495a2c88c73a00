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

//! Retry with jittered exponential backoff, bounded by a deadline.

use rand::random;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: f64,
}

impl RetryPolicy {
    pub fn exponential() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }

    /// Keep retrying until the caller's deadline, not an attempt count.
    pub fn until_deadline() -> Self {
        Self {
            max_attempts: u32::MAX,
            ..Self::exponential()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let jitter_factor = 1.0 + (random::<f64>() - 0.5) * 2.0 * self.jitter;
        let jittered = base * jitter_factor;
        let clamped = jittered.min(self.max_delay.as_secs_f64()).max(0.0);
        Duration::from_secs_f64(clamped)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

#[derive(Debug, Error)]
pub enum RetryError<E: std::fmt::Display> {
    #[error("Deadline exceeded after {attempts} attempts")]
    DeadlineExceeded { attempts: u32, last_error: Option<E> },

    #[error("All {attempts} retry attempts exhausted. Last error: {last_error}")]
    Exhausted { attempts: u32, last_error: E },

    #[error("Permanent failure: {0}")]
    Permanent(E),
}

impl<E: std::fmt::Display> RetryError<E> {
    /// The most recent underlying error, if any attempt completed.
    pub fn into_last_error(self) -> Option<E> {
        match self {
            RetryError::DeadlineExceeded { last_error, .. } => last_error,
            RetryError::Exhausted { last_error, .. } => Some(last_error),
            RetryError::Permanent(e) => Some(e),
        }
    }
}

/// Run `operation` until it succeeds, fails permanently, runs out of
/// attempts, or `deadline` passes. An in-flight attempt is dropped at the
/// deadline, which cancels it.
pub async fn retry_until<T, E, F, Fut>(
    policy: &RetryPolicy,
    deadline: Instant,
    is_transient: impl Fn(&E) -> bool,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempts: u32 = 0;
    let mut last_error: Option<E> = None;

    loop {
        attempts = attempts.saturating_add(1);
        match tokio::time::timeout_at(deadline, operation()).await {
            Err(_) => {
                return Err(RetryError::DeadlineExceeded {
                    attempts,
                    last_error,
                })
            }
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) if !is_transient(&e) => return Err(RetryError::Permanent(e)),
            Ok(Err(e)) => {
                if attempts >= policy.max_attempts {
                    return Err(RetryError::Exhausted {
                        attempts,
                        last_error: e,
                    });
                }
                last_error = Some(e);
            }
        }

        let delay = policy.delay_for_attempt(attempts - 1);
        if Instant::now() + delay >= deadline {
            return Err(RetryError::DeadlineExceeded {
                attempts,
                last_error,
            });
        }
        tokio::time::sleep(delay).await;
    }
}
