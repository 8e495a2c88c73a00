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

//! Analyzer execution contract
//!
//! An analyzer is three capabilities:
//!
//! - [`Analyzer::query`]: pure, called once at registration
//! - [`Analyzer::analyze`]: decides whether a match is a hit
//! - [`Analyzer::add_context`]: enriches the hit's graph before emission
//!
//! The dispatcher never calls these directly. It talks to an
//! [`AnalyzerRunner`], which is either an in-process executor wrapping an
//! [`Analyzer`] or a client for a sandboxed analyzer worker.

use crate::graph::{MatchedGraph, NodeView};
use crate::graph_client::{GraphQueryApi, GraphQueryError};
use crate::hit::{ExecutionHit, ExecutionResult};
use crate::ids::{TenantId, Uid};
use crate::names::AnalyzerName;
use crate::query::GraphQuery;
use crate::update::Update;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AnalyzerError {
    #[error("Graph query failed: {0}")]
    GraphQuery(#[from] GraphQueryError),

    #[error("Analyzer failed: {0}")]
    Failed(String),

    #[error("Analyzer panicked: {0}")]
    Panicked(String),

    #[error("Analyzer deadline exceeded")]
    DeadlineExceeded,

    #[error("Analyzer transport error: {0}")]
    Transport(String),
}

/// Per-invocation context handed to `analyze` and `add_context`.
///
/// A fresh context is built for every dispatch; analyzers cannot share
/// state through it.
#[derive(Clone)]
pub struct AnalyzerContext {
    pub tenant_id: TenantId,
    pub analyzer_name: AnalyzerName,
    pub process_start: DateTime<Utc>,
    /// Hosts the analyzer may reach. Empty for dispatched invocations.
    pub allow_list: BTreeSet<String>,
    graph: Arc<dyn GraphQueryApi>,
}

impl AnalyzerContext {
    pub fn new(
        tenant_id: TenantId,
        analyzer_name: AnalyzerName,
        graph: Arc<dyn GraphQueryApi>,
        process_start: DateTime<Utc>,
    ) -> Self {
        Self {
            tenant_id,
            analyzer_name,
            process_start,
            allow_list: BTreeSet::new(),
            graph,
        }
    }

    pub fn graph(&self) -> &Arc<dyn GraphQueryApi> {
        &self.graph
    }

    pub async fn query_with_uid(
        &self,
        node_uid: Uid,
        query: &GraphQuery,
    ) -> Result<Option<MatchedGraph>, GraphQueryError> {
        self.graph
            .query_with_uid(self.tenant_id, node_uid, query)
            .await
    }

    pub async fn query_from_uid(
        &self,
        node_uid: Uid,
        query: &GraphQuery,
    ) -> Result<Vec<MatchedGraph>, GraphQueryError> {
        self.graph
            .query_from_uid(self.tenant_id, node_uid, query)
            .await
    }
}

impl std::fmt::Debug for AnalyzerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalyzerContext")
            .field("tenant_id", &self.tenant_id)
            .field("analyzer_name", &self.analyzer_name)
            .field("process_start", &self.process_start)
            .field("allow_list", &self.allow_list)
            .finish_non_exhaustive()
    }
}

/// A user-supplied analyzer
#[async_trait]
pub trait Analyzer: Send + Sync {
    /// The subgraph this analyzer is interested in. Must be pure.
    fn query(&self) -> GraphQuery;

    /// Inspect a match rooted at `root`. `Ok(None)` is a miss.
    async fn analyze(
        &self,
        root: NodeView<'_>,
        ctx: &AnalyzerContext,
    ) -> Result<Option<ExecutionHit>, AnalyzerError>;

    /// Augment a hit's graph with supplementary nodes and edges. Removing
    /// matched nodes or edges, or moving the root, fails the run.
    async fn add_context(
        &self,
        _graph: &mut MatchedGraph,
        _ctx: &AnalyzerContext,
    ) -> Result<(), AnalyzerError> {
        Ok(())
    }
}

/// One dispatch of one update to one analyzer
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub tenant_id: TenantId,
    pub update: Update,
    /// Work past this instant is cancelled.
    pub deadline: tokio::time::Instant,
}

/// Something that can run an analyzer against an update
#[async_trait]
pub trait AnalyzerRunner: Send + Sync {
    /// Must return `Miss` rather than an error when the update cannot
    /// affect the analyzer's query.
    async fn run(&self, request: RunRequest) -> Result<ExecutionResult, AnalyzerError>;
}
