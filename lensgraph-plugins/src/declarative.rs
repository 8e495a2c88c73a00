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

//! Declarative analyzers: every match of the query is a hit.

use crate::error::PluginResult;
use crate::manifest::AnalyzerManifest;
use async_trait::async_trait;
use lensgraph_core::{
    Analyzer, AnalyzerContext, AnalyzerError, ExecutionHit, GraphQuery, LensRef, MatchedGraph,
    NodeView,
};

#[derive(Debug, Clone)]
pub struct DeclarativeAnalyzer {
    query: GraphQuery,
    score: i32,
    lenses: Vec<LensRef>,
}

impl DeclarativeAnalyzer {
    pub fn new(query: GraphQuery, score: i32, lenses: Vec<LensRef>) -> Self {
        Self {
            query,
            score,
            lenses,
        }
    }

    pub fn from_manifest(manifest: &AnalyzerManifest) -> PluginResult<Self> {
        Ok(Self::new(
            manifest.to_query()?,
            manifest.hit.score,
            manifest.hit.lenses.clone(),
        ))
    }
}

/// Stable key for a match: the first 8 bytes of BLAKE3 over the sorted
/// matched uids. The same subgraph always yields the same key.
pub fn idempotency_key(graph: &MatchedGraph) -> u64 {
    let mut hasher = blake3::Hasher::new();
    for uid in graph.nodes.keys() {
        hasher.update(&uid.get().to_be_bytes());
    }
    let digest = hasher.finalize();
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_be_bytes(prefix)
}

#[async_trait]
impl Analyzer for DeclarativeAnalyzer {
    fn query(&self) -> GraphQuery {
        self.query.clone()
    }

    async fn analyze(
        &self,
        root: NodeView<'_>,
        ctx: &AnalyzerContext,
    ) -> Result<Option<ExecutionHit>, AnalyzerError> {
        let graph = root.graph().clone();
        let key = idempotency_key(&graph);
        let mut hit = ExecutionHit::new(graph, ctx.analyzer_name.clone(), key, self.score);
        hit.lenses = self.lenses.clone();
        Ok(Some(hit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use lensgraph_core::{
        AnalyzerName, GraphQueryBuilder, InMemoryGraph, NodeProperties, NodeType, TenantId, Uid,
    };
    use std::sync::Arc;

    fn process(uid: u64) -> NodeProperties {
        NodeProperties::new(Uid::new(uid).unwrap(), NodeType::new("Process").unwrap())
    }

    #[test]
    fn test_idempotency_key_depends_on_uids_only() {
        let a = MatchedGraph::new(process(1));
        let mut b = MatchedGraph::new(process(1));
        b.insert_node(process(1));
        assert_eq!(idempotency_key(&a), idempotency_key(&b));

        b.insert_node(process(2));
        assert_ne!(idempotency_key(&a), idempotency_key(&b));
    }

    #[tokio::test]
    async fn test_every_match_is_a_hit() {
        let mut builder = GraphQueryBuilder::new();
        let root = builder.node(NodeType::new("Process").unwrap());
        let query = builder.build(root).unwrap();
        let lens = LensRef::new("hostname", "DESKTOP-1").unwrap();
        let analyzer = DeclarativeAnalyzer::new(query, 10, vec![lens.clone()]);

        let ctx = AnalyzerContext::new(
            TenantId::new(uuid::Uuid::new_v4()),
            AnalyzerName::new("any-process").unwrap(),
            Arc::new(InMemoryGraph::new()),
            Utc::now(),
        );
        let graph = MatchedGraph::new(process(42));
        let root = graph.root_view().unwrap();

        let hit = analyzer.analyze(root, &ctx).await.unwrap().unwrap();
        assert_eq!(hit.root_uid().get(), 42);
        assert_eq!(hit.score, 10);
        assert_eq!(hit.lenses, vec![lens]);
        assert_eq!(hit.analyzer_name.as_str(), "any-process");
        assert_eq!(hit.idempotency_key, idempotency_key(&graph));
    }
}
