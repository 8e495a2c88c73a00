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

//! Lensgraph Core
//!
//! Value types shared by every part of the analyzer execution pipeline:
//!
//! - graph identifiers and names ([`Uid`], [`TenantId`], [`PropertyName`], ...)
//! - the event-update taxonomy the pipeline reacts to ([`Update`])
//! - graph queries and the subgraphs that match them ([`GraphQuery`], [`MatchedGraph`])
//! - execution results produced by analyzers ([`ExecutionHit`], [`ExecutionResult`])
//! - the analyzer execution contract ([`Analyzer`], [`AnalyzerContext`], [`AnalyzerRunner`])
//! - dedup key derivation and retry primitives
//!
//! Nothing in this crate talks to the network; the graph store is reached
//! through the [`GraphQueryApi`] seam.

pub mod analyzer;
pub mod dedup;
pub mod error;
pub mod graph;
pub mod graph_client;
pub mod hit;
pub mod ids;
pub mod mem_graph;
pub mod names;
pub mod query;
pub mod resilience;
pub mod update;

pub use analyzer::{Analyzer, AnalyzerContext, AnalyzerError, AnalyzerRunner, RunRequest};
pub use dedup::{DedupKey, DedupNamespace};
pub use error::{CoreError, CoreResult};
pub use graph::{MatchedEdge, MatchedGraph, NodeProperties, NodeView};
pub use graph_client::{GraphQueryApi, GraphQueryError};
pub use hit::{ExecutionHit, ExecutionResult, LensRef};
pub use ids::{TenantId, Uid};
pub use mem_graph::InMemoryGraph;
pub use names::{AnalyzerName, EdgeName, NodeType, PropertyName};
pub use query::{
    EdgeQuery, GraphQuery, GraphQueryBuilder, Int64Filter, IntFilter, IntOperation, NodePropertyQuery,
    QueryNodeId, StringFilter, StringOperation, UInt64Filter,
};
pub use resilience::{retry_until, RetryError, RetryPolicy};
pub use update::{EdgeUpdate, PropertyUpdate, ScalarKind, Update};

/// Maximum length of property, edge and node-type names.
pub const MAX_NAME_LEN: usize = 32;

/// Maximum length of an analyzer name (it doubles as an object-store path segment).
pub const MAX_ANALYZER_NAME_LEN: usize = 64;
