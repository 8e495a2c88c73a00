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

//! Analyzer dispatcher
//!
//! Fans one update out to every registered analyzer. Per analyzer:
//!
//! 1. inbound dedup on `(analyzer, message_id, body)`
//! 2. relevance check against the registered query
//! 3. run (graph query, `analyze`, `add_context`)
//! 4. analyzer name override
//! 5. outbound dedup on `(analyzer, idempotency_key, root_uid)`
//! 6. emit
//!
//! Analyzers run concurrently on the calling task. A failing analyzer only
//! costs its own result. Dedup entries recorded for an analyzer that never
//! resolves, because emission failed or the message deadline cancelled it,
//! are forgotten again so the redelivered message replays that analyzer.

use crate::dedup::DedupCache;
use crate::emitter::HitEmitter;
use crate::stats::PipelineStats;
use futures::future::join_all;
use futures::FutureExt;
use lensgraph_core::{
    DedupKey, DedupNamespace, ExecutionResult, RunRequest, TenantId, Update,
};
use lensgraph_plugins::{AnalyzerRegistration, AnalyzerRegistry};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum DispatchError {
    /// Hits that could not be published; their dedup keys were rolled back.
    #[error("Failed to emit hits for {analyzers:?}")]
    EmitFailed { analyzers: Vec<String> },
}

/// What happened to one analyzer for one update
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnalyzerOutcome {
    AlreadySeen,
    Irrelevant,
    Miss,
    Hit,
    DuplicateHit,
    Failed(String),
    EmitFailed(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub hits: usize,
    pub misses: usize,
    pub failures: usize,
    pub already_seen: usize,
    pub duplicate_hits: usize,
}

impl DispatchSummary {
    fn absorb(&mut self, outcome: &AnalyzerOutcome) {
        match outcome {
            AnalyzerOutcome::AlreadySeen => self.already_seen += 1,
            AnalyzerOutcome::Irrelevant | AnalyzerOutcome::Miss => self.misses += 1,
            AnalyzerOutcome::Hit => self.hits += 1,
            AnalyzerOutcome::DuplicateHit => self.duplicate_hits += 1,
            AnalyzerOutcome::Failed(_) | AnalyzerOutcome::EmitFailed(_) => self.failures += 1,
        }
    }

    pub fn merge(&mut self, other: &DispatchSummary) {
        self.hits += other.hits;
        self.misses += other.misses;
        self.failures += other.failures;
        self.already_seen += other.already_seen;
        self.duplicate_hits += other.duplicate_hits;
    }
}

/// One update to dispatch
#[derive(Debug, Clone, Copy)]
pub struct DispatchInput<'a> {
    pub tenant_id: TenantId,
    pub message_id: &'a str,
    /// Raw payload; part of the inbound dedup key
    pub body: &'a [u8],
    pub update: &'a Update,
    pub deadline: Instant,
}

pub struct Dispatcher {
    registry: Arc<AnalyzerRegistry>,
    cache: Arc<dyn DedupCache>,
    emitter: Arc<dyn HitEmitter>,
    stats: Arc<PipelineStats>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<AnalyzerRegistry>,
        cache: Arc<dyn DedupCache>,
        emitter: Arc<dyn HitEmitter>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            registry,
            cache,
            emitter,
            stats,
        }
    }

    pub fn registry(&self) -> &AnalyzerRegistry {
        &self.registry
    }

    pub async fn dispatch(&self, input: DispatchInput<'_>) -> Result<DispatchSummary, DispatchError> {
        let outcomes = join_all(
            self.registry
                .iter()
                .map(|registration| self.dispatch_one(registration, input)),
        )
        .await;

        let mut summary = DispatchSummary::default();
        let mut emit_failures = Vec::new();
        for (registration, outcome) in self.registry.iter().zip(&outcomes) {
            summary.absorb(outcome);
            if let AnalyzerOutcome::EmitFailed(_) = outcome {
                emit_failures.push(registration.name.to_string());
            }
        }

        debug!(
            message_id = %input.message_id,
            hits = summary.hits,
            misses = summary.misses,
            failures = summary.failures,
            "Dispatch complete"
        );

        if emit_failures.is_empty() {
            Ok(summary)
        } else {
            Err(DispatchError::EmitFailed {
                analyzers: emit_failures,
            })
        }
    }

    async fn dispatch_one(
        &self,
        registration: &AnalyzerRegistration,
        input: DispatchInput<'_>,
    ) -> AnalyzerOutcome {
        let name = &registration.name;

        let msg_key = DedupKey::message(name, input.message_id, input.body);
        if self
            .cache
            .check_and_record(DedupNamespace::MessageSeen, &msg_key)
            .await
        {
            debug!(analyzer = %name, message_id = %input.message_id, "Message already processed");
            self.stats.record_duplicate_message();
            return AnalyzerOutcome::AlreadySeen;
        }

        let mut pending = PendingKeys::new(Arc::clone(&self.cache));
        pending.push(DedupNamespace::MessageSeen, msg_key);
        let outcome = self.run_analyzer(registration, input, &mut pending).await;
        pending.disarm();
        outcome
    }

    async fn run_analyzer(
        &self,
        registration: &AnalyzerRegistration,
        input: DispatchInput<'_>,
        pending: &mut PendingKeys,
    ) -> AnalyzerOutcome {
        let name = &registration.name;

        if !registration.query.may_be_affected_by(input.update) {
            self.stats.record_miss();
            return AnalyzerOutcome::Irrelevant;
        }

        let request = RunRequest {
            tenant_id: input.tenant_id,
            update: input.update.clone(),
            deadline: input.deadline,
        };
        let ran = tokio::time::timeout_at(
            input.deadline,
            AssertUnwindSafe(registration.runner.run(request)).catch_unwind(),
        )
        .await;

        let mut hit = match ran {
            Ok(Ok(Ok(ExecutionResult::Hit(hit)))) => hit,
            Ok(Ok(Ok(ExecutionResult::Miss))) => {
                self.stats.record_miss();
                return AnalyzerOutcome::Miss;
            }
            Ok(Ok(Err(e))) => {
                error!(analyzer = %name, message_id = %input.message_id, error = %e, "Analyzer failed");
                self.stats.record_analyzer_failure();
                return AnalyzerOutcome::Failed(e.to_string());
            }
            Ok(Err(_panic)) => {
                error!(analyzer = %name, message_id = %input.message_id, "Analyzer panicked");
                self.stats.record_analyzer_failure();
                return AnalyzerOutcome::Failed("panicked".into());
            }
            Err(_) => {
                warn!(analyzer = %name, message_id = %input.message_id, "Analyzer ran past the message deadline");
                self.stats.record_analyzer_failure();
                return AnalyzerOutcome::Failed("deadline exceeded".into());
            }
        };

        hit.analyzer_name = name.clone();

        let hit_key = DedupKey::hit(name, hit.idempotency_key, hit.root_uid());
        if self
            .cache
            .check_and_record(DedupNamespace::HitSeen, &hit_key)
            .await
        {
            debug!(analyzer = %name, root_uid = %hit.root_uid(), "Duplicate hit suppressed");
            self.stats.record_duplicate_hit();
            return AnalyzerOutcome::DuplicateHit;
        }
        pending.push(DedupNamespace::HitSeen, hit_key);

        match self.emitter.emit(&hit).await {
            Ok(()) => {
                info!(
                    analyzer = %name,
                    message_id = %input.message_id,
                    root_uid = %hit.root_uid(),
                    score = hit.score,
                    "Emitted hit"
                );
                self.stats.record_hit();
                AnalyzerOutcome::Hit
            }
            Err(e) => {
                // let redelivery replay this analyzer
                pending.forget_all().await;
                error!(analyzer = %name, message_id = %input.message_id, error = %e, "Failed to emit hit");
                self.stats.record_emit_failure();
                AnalyzerOutcome::EmitFailed(e.to_string())
            }
        }
    }
}

/// Dedup entries recorded for an analyzer that has not resolved yet.
///
/// Dropped while still armed (the message deadline cancelled the dispatch),
/// the entries are forgotten in the background so a redelivery runs the
/// analyzer again.
struct PendingKeys {
    cache: Arc<dyn DedupCache>,
    keys: Vec<(DedupNamespace, DedupKey)>,
}

impl PendingKeys {
    fn new(cache: Arc<dyn DedupCache>) -> Self {
        Self {
            cache,
            keys: Vec::with_capacity(2),
        }
    }

    fn push(&mut self, namespace: DedupNamespace, key: DedupKey) {
        self.keys.push((namespace, key));
    }

    fn disarm(&mut self) {
        self.keys.clear();
    }

    async fn forget_all(&mut self) {
        for (namespace, key) in self.keys.drain(..) {
            self.cache.forget(namespace, &key).await;
        }
    }
}

impl Drop for PendingKeys {
    fn drop(&mut self) {
        if self.keys.is_empty() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let cache = Arc::clone(&self.cache);
        let keys = std::mem::take(&mut self.keys);
        runtime.spawn(async move {
            for (namespace, key) in keys {
                cache.forget(namespace, &key).await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::LocalDedupCache;
    use std::time::Duration;

    fn key(s: &str) -> DedupKey {
        let name = lensgraph_core::AnalyzerName::new("a").unwrap();
        DedupKey::message(&name, s, b"")
    }

    #[test]
    fn test_summary_counts_outcomes() {
        let mut summary = DispatchSummary::default();
        for outcome in [
            AnalyzerOutcome::Hit,
            AnalyzerOutcome::Irrelevant,
            AnalyzerOutcome::Miss,
            AnalyzerOutcome::AlreadySeen,
            AnalyzerOutcome::Failed("boom".into()),
            AnalyzerOutcome::EmitFailed("down".into()),
        ] {
            summary.absorb(&outcome);
        }
        assert_eq!(summary.hits, 1);
        assert_eq!(summary.misses, 2);
        assert_eq!(summary.already_seen, 1);
        assert_eq!(summary.failures, 2);

        let mut total = summary.clone();
        total.merge(&summary);
        assert_eq!(total.hits, 2);
    }

    #[tokio::test]
    async fn test_dropped_pending_keys_are_forgotten() {
        let cache = Arc::new(LocalDedupCache::new(100, Duration::from_secs(60)));
        let armed = key("armed");
        let disarmed = key("disarmed");
        cache.record(DedupNamespace::MessageSeen, &armed).await;
        cache.record(DedupNamespace::MessageSeen, &disarmed).await;

        let mut pending = PendingKeys::new(cache.clone());
        pending.push(DedupNamespace::MessageSeen, armed.clone());
        drop(pending);

        let mut settled = PendingKeys::new(cache.clone());
        settled.push(DedupNamespace::MessageSeen, disarmed.clone());
        settled.disarm();
        drop(settled);

        tokio::task::yield_now().await;
        for _ in 0..10 {
            if !cache.check(DedupNamespace::MessageSeen, &armed).await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!cache.check(DedupNamespace::MessageSeen, &armed).await);
        assert!(cache.check(DedupNamespace::MessageSeen, &disarmed).await);
    }
}
