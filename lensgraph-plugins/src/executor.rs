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

//! In-process analyzer execution
//!
//! [`AnalyzerExecutor`] drives one analyzer through relevance check, graph
//! query, `analyze` and `add_context` for a single update. It backs both
//! declarative analyzers in the executor process and the sandbox worker,
//! which serves it over `AnalyzerService`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use lensgraph_core::{
    retry_until, Analyzer, AnalyzerContext, AnalyzerError, AnalyzerName, AnalyzerRunner,
    ExecutionResult, GraphQuery, GraphQueryApi, GraphQueryError, RetryPolicy, RunRequest,
};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct AnalyzerExecutor {
    name: AnalyzerName,
    analyzer: Arc<dyn Analyzer>,
    query: GraphQuery,
    graph: Arc<dyn GraphQueryApi>,
    process_start: DateTime<Utc>,
    retry: RetryPolicy,
}

impl AnalyzerExecutor {
    /// `query` must be the result of the analyzer's single `query()` call.
    pub fn new(
        name: AnalyzerName,
        analyzer: Arc<dyn Analyzer>,
        query: GraphQuery,
        graph: Arc<dyn GraphQueryApi>,
    ) -> Self {
        Self {
            name,
            analyzer,
            query,
            graph,
            process_start: Utc::now(),
            retry: RetryPolicy::until_deadline(),
        }
    }

    pub fn with_process_start(mut self, process_start: DateTime<Utc>) -> Self {
        self.process_start = process_start;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn name(&self) -> &AnalyzerName {
        &self.name
    }

    pub fn query(&self) -> &GraphQuery {
        &self.query
    }
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[async_trait]
impl AnalyzerRunner for AnalyzerExecutor {
    async fn run(&self, request: RunRequest) -> Result<ExecutionResult, AnalyzerError> {
        if !self.query.may_be_affected_by(&request.update) {
            debug!(analyzer = %self.name, update = request.update.kind(), "Update cannot affect query");
            return Ok(ExecutionResult::Miss);
        }

        let root_uid = request.update.root_uid();
        let lookup = retry_until(
            &self.retry,
            request.deadline,
            |e: &GraphQueryError| e.is_transient(),
            || {
                self.graph
                    .query_with_uid(request.tenant_id, root_uid, &self.query)
            },
        )
        .await;

        let matched = match lookup {
            Ok(Some(matched)) => matched,
            Ok(None) => return Ok(ExecutionResult::Miss),
            Err(e) => {
                warn!(analyzer = %self.name, root_uid = %root_uid, error = %e, "Graph query gave up");
                return Ok(ExecutionResult::Miss);
            }
        };

        let Some(root) = matched.root_view() else {
            return Err(GraphQueryError::InvalidResponse(format!(
                "match is missing its root {}",
                matched.root_uid
            ))
            .into());
        };

        let ctx = AnalyzerContext::new(
            request.tenant_id,
            self.name.clone(),
            self.graph.clone(),
            self.process_start,
        );

        let analyzed = tokio::time::timeout_at(
            request.deadline,
            AssertUnwindSafe(self.analyzer.analyze(root, &ctx)).catch_unwind(),
        )
        .await
        .map_err(|_| AnalyzerError::DeadlineExceeded)?
        .map_err(|p| AnalyzerError::Panicked(panic_message(p)))??;

        let Some(mut hit) = analyzed else {
            return Ok(ExecutionResult::Miss);
        };

        if hit.analyzer_name != self.name {
            debug!(analyzer = %self.name, claimed = %hit.analyzer_name, "Overriding hit analyzer name");
        }
        hit.analyzer_name = self.name.clone();

        let analyzed_graph = hit.graph.clone();
        tokio::time::timeout_at(
            request.deadline,
            AssertUnwindSafe(self.analyzer.add_context(&mut hit.graph, &ctx)).catch_unwind(),
        )
        .await
        .map_err(|_| AnalyzerError::DeadlineExceeded)?
        .map_err(|p| AnalyzerError::Panicked(panic_message(p)))??;

        if !hit.graph.extends(&analyzed_graph) {
            warn!(analyzer = %self.name, root_uid = %analyzed_graph.root_uid, "add_context removed part of the hit graph");
            return Err(AnalyzerError::Failed(
                "add_context may only add to the hit graph".to_string(),
            ));
        }

        Ok(ExecutionResult::Hit(hit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lensgraph_core::{
        ExecutionHit, GraphQueryBuilder, InMemoryGraph, MatchedGraph, NodeProperties, NodeType,
        NodeView, PropertyName, PropertyUpdate, StringFilter, TenantId, Uid, Update,
    };
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tokio::time::Instant;

    fn prop(name: &str) -> PropertyName {
        PropertyName::new(name).unwrap()
    }

    fn svchost_query() -> GraphQuery {
        let mut b = GraphQueryBuilder::new();
        let p = b.node(NodeType::new("Process").unwrap());
        b.with_string_filters(p, prop("process_name"), vec![StringFilter::equal("svchost.exe")])
            .unwrap();
        b.build(p).unwrap()
    }

    fn store() -> Arc<InMemoryGraph> {
        let graph = InMemoryGraph::new();
        graph.insert_node(
            NodeProperties::new(Uid::new(42).unwrap(), NodeType::new("Process").unwrap())
                .with_string(prop("process_name"), "svchost.exe"),
        );
        Arc::new(graph)
    }

    fn request(property: &str, secs: u64) -> RunRequest {
        RunRequest {
            tenant_id: TenantId::new(uuid::Uuid::new_v4()),
            update: Update::StringProperty(PropertyUpdate {
                uid: Uid::new(42).unwrap(),
                property_name: prop(property),
            }),
            deadline: Instant::now() + Duration::from_secs(secs),
        }
    }

    enum Behavior {
        Forge,
        Panic,
        Hang,
        Decline,
        Reroot,
    }

    struct Scripted {
        behavior: Behavior,
        contexts: AtomicU32,
    }

    impl Scripted {
        fn new(behavior: Behavior) -> Self {
            Self {
                behavior,
                contexts: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl Analyzer for Scripted {
        fn query(&self) -> GraphQuery {
            svchost_query()
        }

        async fn analyze(
            &self,
            root: NodeView<'_>,
            _ctx: &AnalyzerContext,
        ) -> Result<Option<ExecutionHit>, AnalyzerError> {
            match self.behavior {
                Behavior::Forge | Behavior::Reroot => Ok(Some(ExecutionHit::new(
                    root.graph().clone(),
                    AnalyzerName::new("someone-else").unwrap(),
                    7,
                    50,
                ))),
                Behavior::Panic => panic!("analyzer blew up"),
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(None)
                }
                Behavior::Decline => Ok(None),
            }
        }

        async fn add_context(
            &self,
            graph: &mut MatchedGraph,
            _ctx: &AnalyzerContext,
        ) -> Result<(), AnalyzerError> {
            self.contexts.fetch_add(1, Ordering::SeqCst);
            match self.behavior {
                Behavior::Reroot => {
                    graph.nodes.clear();
                    graph.root_uid = Uid::new(7).unwrap();
                }
                _ => graph.insert_node(
                    NodeProperties::new(Uid::new(7).unwrap(), NodeType::new("Process").unwrap())
                        .with_string(prop("process_name"), "services.exe"),
                ),
            }
            Ok(())
        }
    }

    fn executor(analyzer: Arc<Scripted>, graph: Arc<InMemoryGraph>) -> AnalyzerExecutor {
        AnalyzerExecutor::new(
            AnalyzerName::new("svchost").unwrap(),
            analyzer,
            svchost_query(),
            graph,
        )
    }

    #[tokio::test]
    async fn test_hit_name_is_overridden() {
        let analyzer = Arc::new(Scripted::new(Behavior::Forge));
        let result = executor(analyzer.clone(), store())
            .run(request("process_name", 30))
            .await
            .unwrap();
        let hit = result.into_hit().unwrap();
        assert_eq!(hit.analyzer_name.as_str(), "svchost");
        assert_eq!(hit.root_uid().get(), 42);
        assert_eq!(analyzer.contexts.load(Ordering::SeqCst), 1);
        assert!(hit.graph.contains(Uid::new(7).unwrap()));
    }

    #[tokio::test]
    async fn test_add_context_cannot_rewrite_match() {
        let analyzer = Arc::new(Scripted::new(Behavior::Reroot));
        let err = executor(analyzer.clone(), store())
            .run(request("process_name", 30))
            .await
            .unwrap_err();
        assert!(matches!(err, AnalyzerError::Failed(_)), "unexpected {err:?}");
        assert_eq!(analyzer.contexts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_irrelevant_update_skips_graph() {
        let graph = store();
        let result = executor(Arc::new(Scripted::new(Behavior::Forge)), graph.clone())
            .run(request("pid", 30))
            .await
            .unwrap();
        assert_eq!(result, ExecutionResult::Miss);
        assert_eq!(graph.query_count(), 0);
    }

    #[tokio::test]
    async fn test_decline_is_a_miss_without_context() {
        let analyzer = Arc::new(Scripted::new(Behavior::Decline));
        let result = executor(analyzer.clone(), store())
            .run(request("process_name", 30))
            .await
            .unwrap();
        assert_eq!(result, ExecutionResult::Miss);
        assert_eq!(analyzer.contexts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let err = executor(Arc::new(Scripted::new(Behavior::Panic)), store())
            .run(request("process_name", 30))
            .await
            .unwrap_err();
        match err {
            AnalyzerError::Panicked(msg) => assert!(msg.contains("blew up")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_cancels_analyze() {
        let err = executor(Arc::new(Scripted::new(Behavior::Hang)), store())
            .run(request("process_name", 5))
            .await
            .unwrap_err();
        assert_eq!(err, AnalyzerError::DeadlineExceeded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_graph_failure_is_retried() {
        let graph = store();
        graph.fail_next(2);
        let result = executor(Arc::new(Scripted::new(Behavior::Forge)), graph.clone())
            .run(request("process_name", 30))
            .await
            .unwrap();
        assert!(result.is_hit());
        assert_eq!(graph.query_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_graph_outage_becomes_miss() {
        let graph = store();
        graph.fail_next(u32::MAX);
        let result = executor(Arc::new(Scripted::new(Behavior::Forge)), graph)
            .run(request("process_name", 2))
            .await
            .unwrap();
        assert_eq!(result, ExecutionResult::Miss);
    }
}
