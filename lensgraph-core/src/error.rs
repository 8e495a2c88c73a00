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

//! Core error types

use crate::query::QueryNodeId;
use thiserror::Error;

/// Result type for core value construction
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised while constructing or validating core values
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error("Uid 0 is reserved and invalid")]
    ZeroUid,

    #[error("Invalid {kind}: {value:?}")]
    InvalidName { kind: &'static str, value: String },

    #[error("Invalid tenant id: {0}")]
    InvalidTenantId(String),

    #[error("Invalid lens reference: {0}")]
    InvalidLens(String),

    #[error("Query references unknown node {0}")]
    UnknownQueryNode(QueryNodeId),

    #[error("Query root {0} is not one of its nodes")]
    MissingRoot(QueryNodeId),

    #[error("Query is not connected; unreachable from root: {0:?}")]
    DisconnectedQuery(Vec<QueryNodeId>),

    #[error("Matched graph does not contain its root {0}")]
    MissingMatchedRoot(u64),

    #[error("Matched edge {src} -> {dst} references a node outside the graph")]
    DanglingEdge { src: u64, dst: u64 },
}
