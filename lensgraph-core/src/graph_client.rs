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

//! Graph store access seam

use crate::graph::MatchedGraph;
use crate::ids::{TenantId, Uid};
use crate::query::GraphQuery;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphQueryError {
    #[error("Graph store unavailable: {0}")]
    Unavailable(String),

    #[error("Graph store rejected the query: {0}")]
    Rejected(String),

    #[error("Graph query cancelled")]
    Cancelled,

    #[error("Invalid graph store response: {0}")]
    InvalidResponse(String),
}

impl GraphQueryError {
    /// Whether a retry may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, GraphQueryError::Unavailable(_))
    }
}

/// Typed access to the graph store.
///
/// Both operations are idempotent. Dropping the returned future cancels the
/// request; implementations must not keep work running past that point.
#[async_trait]
pub trait GraphQueryApi: Send + Sync {
    /// Resolve `query` anchored at `node_uid` as its root. At most one match;
    /// a returned match always has `root_uid == node_uid`.
    async fn query_with_uid(
        &self,
        tenant_id: TenantId,
        node_uid: Uid,
        query: &GraphQuery,
    ) -> Result<Option<MatchedGraph>, GraphQueryError>;

    /// Resolve `query` using `node_uid` as a seed that may bind to any node
    /// of the query. Zero or more matches, each rooted at the query root.
    async fn query_from_uid(
        &self,
        tenant_id: TenantId,
        node_uid: Uid,
        query: &GraphQuery,
    ) -> Result<Vec<MatchedGraph>, GraphQueryError>;
}
