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

//! Execution hits and results

use crate::error::{CoreError, CoreResult};
use crate::graph::MatchedGraph;
use crate::ids::Uid;
use crate::names::AnalyzerName;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Reference to an analyst lens a hit should be attached to
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LensRef {
    pub namespace: String,
    pub name: String,
}

impl LensRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> CoreResult<Self> {
        let lens = Self {
            namespace: namespace.into(),
            name: name.into(),
        };
        if lens.namespace.is_empty() || lens.name.is_empty() {
            return Err(CoreError::InvalidLens(lens.to_string()));
        }
        Ok(lens)
    }
}

impl fmt::Display for LensRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.name)
    }
}

/// A match an analyzer decided is interesting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionHit {
    pub graph: MatchedGraph,
    #[serde(default)]
    pub lenses: Vec<LensRef>,
    pub analyzer_name: AnalyzerName,
    /// Opaque key chosen by the analyzer; together with the analyzer name
    /// and root uid it identifies the hit for dedup.
    pub idempotency_key: u64,
    pub time_of_match: DateTime<Utc>,
    pub score: i32,
}

impl ExecutionHit {
    pub fn new(
        graph: MatchedGraph,
        analyzer_name: AnalyzerName,
        idempotency_key: u64,
        score: i32,
    ) -> Self {
        Self {
            graph,
            lenses: Vec::new(),
            analyzer_name,
            idempotency_key,
            time_of_match: Utc::now(),
            score,
        }
    }

    pub fn with_lens(mut self, lens: LensRef) -> Self {
        self.lenses.push(lens);
        self
    }

    pub fn root_uid(&self) -> Uid {
        self.graph.root_uid
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", content = "hit", rename_all = "snake_case")]
pub enum ExecutionResult {
    Hit(ExecutionHit),
    Miss,
}

impl ExecutionResult {
    pub fn is_hit(&self) -> bool {
        matches!(self, ExecutionResult::Hit(_))
    }

    pub fn hit(&self) -> Option<&ExecutionHit> {
        match self {
            ExecutionResult::Hit(hit) => Some(hit),
            ExecutionResult::Miss => None,
        }
    }

    pub fn into_hit(self) -> Option<ExecutionHit> {
        match self {
            ExecutionResult::Hit(hit) => Some(hit),
            ExecutionResult::Miss => None,
        }
    }
}

impl From<Option<ExecutionHit>> for ExecutionResult {
    fn from(hit: Option<ExecutionHit>) -> Self {
        hit.map_or(ExecutionResult::Miss, ExecutionResult::Hit)
    }
}
