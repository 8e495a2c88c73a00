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

//! In-memory property graph implementing [`GraphQueryApi`]
//!
//! Used by tests and by local runs of the analyzer worker. Queries are
//! evaluated with a backtracking matcher: query nodes are visited in
//! breadth-first order from the anchor, each bound to a distinct store node
//! reached over the required edge, and every query edge between bound nodes
//! is checked before descending.

use crate::graph::{MatchedGraph, NodeProperties};
use crate::graph_client::{GraphQueryApi, GraphQueryError};
use crate::ids::{TenantId, Uid};
use crate::names::EdgeName;
use crate::query::{GraphQuery, QueryNodeId};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

#[derive(Debug, Default)]
struct GraphState {
    nodes: HashMap<Uid, NodeProperties>,
    adjacency: HashMap<Uid, BTreeSet<(EdgeName, Uid)>>,
}

impl GraphState {
    fn has_edge(&self, src: Uid, name: &EdgeName, dst: Uid) -> bool {
        self.adjacency
            .get(&src)
            .map(|out| out.contains(&(name.clone(), dst)))
            .unwrap_or(false)
    }

    fn neighbors<'a>(&'a self, src: Uid, name: &'a EdgeName) -> impl Iterator<Item = Uid> + 'a {
        self.adjacency
            .get(&src)
            .into_iter()
            .flatten()
            .filter(move |(edge, _)| edge == name)
            .map(|(_, dst)| *dst)
    }
}

/// Step of the visiting order: bind `node`, reached from the already-bound
/// `parent` over `edge` (absent for the anchor).
struct Step<'q> {
    node: QueryNodeId,
    via: Option<(QueryNodeId, &'q EdgeName)>,
}

fn visit_order(query: &GraphQuery, anchor: QueryNodeId) -> Vec<Step<'_>> {
    let mut order = vec![Step {
        node: anchor,
        via: None,
    }];
    let mut seen = BTreeSet::from([anchor]);
    let mut queue = VecDeque::from([anchor]);
    while let Some(current) = queue.pop_front() {
        for (edge, next) in query.neighbors(current) {
            if seen.insert(next) {
                order.push(Step {
                    node: next,
                    via: Some((current, edge)),
                });
                queue.push_back(next);
            }
        }
    }
    order
}

#[derive(Debug, Default)]
pub struct InMemoryGraph {
    state: RwLock<GraphState>,
    calls: AtomicU64,
    failures_remaining: AtomicU32,
}

impl InMemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a node, merging properties into an existing node with the same uid.
    pub fn insert_node(&self, node: NodeProperties) {
        let mut state = self.state.write();
        match state.nodes.get_mut(&node.uid) {
            Some(existing) => {
                existing.string_properties.extend(node.string_properties);
                existing.int64_properties.extend(node.int64_properties);
                existing.uint64_properties.extend(node.uint64_properties);
            }
            None => {
                state.nodes.insert(node.uid, node);
            }
        }
    }

    /// Insert `src -[forward]-> dst` together with `dst -[reverse]-> src`.
    pub fn insert_edge(&self, src: Uid, forward: EdgeName, reverse: EdgeName, dst: Uid) {
        let mut state = self.state.write();
        state.adjacency.entry(src).or_default().insert((forward, dst));
        state.adjacency.entry(dst).or_default().insert((reverse, src));
    }

    pub fn node(&self, uid: Uid) -> Option<NodeProperties> {
        self.state.read().nodes.get(&uid).cloned()
    }

    /// Number of queries served so far, failed ones included.
    pub fn query_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Make the next `n` queries fail with [`GraphQueryError::Unavailable`].
    pub fn fail_next(&self, n: u32) {
        self.failures_remaining.store(n, Ordering::SeqCst);
    }

    fn begin_call(&self) -> Result<(), GraphQueryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let injected = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(GraphQueryError::Unavailable(
                "injected failure".to_string(),
            ));
        }
        Ok(())
    }

    fn match_anchored(
        state: &GraphState,
        query: &GraphQuery,
        anchor: QueryNodeId,
        anchor_uid: Uid,
    ) -> Option<MatchedGraph> {
        let order = visit_order(query, anchor);
        let mut bound = BTreeMap::new();
        if !Self::bind(state, query, &order, 0, anchor_uid, &mut bound) {
            return None;
        }

        let root_uid = *bound.get(&query.root())?;
        let nodes = bound
            .values()
            .filter_map(|uid| state.nodes.get(uid).cloned())
            .collect::<Vec<_>>();
        let mut graph = MatchedGraph::from_parts(root_uid, nodes, Vec::new()).ok()?;
        for edge in query.edges() {
            let (src, dst) = (bound[&edge.src], bound[&edge.dst]);
            graph.insert_edge(src, edge.forward_name.clone(), dst);
            graph.insert_edge(dst, edge.reverse_name.clone(), src);
        }
        Some(graph)
    }

    fn bind(
        state: &GraphState,
        query: &GraphQuery,
        order: &[Step<'_>],
        depth: usize,
        anchor_uid: Uid,
        bound: &mut BTreeMap<QueryNodeId, Uid>,
    ) -> bool {
        let Some(step) = order.get(depth) else {
            return true;
        };
        let Some(pattern) = query.node(step.node) else {
            return false;
        };

        let candidates: Vec<Uid> = match step.via {
            None => vec![anchor_uid],
            Some((parent, edge)) => match bound.get(&parent) {
                Some(parent_uid) => state.neighbors(*parent_uid, edge).collect(),
                None => return false,
            },
        };

        for candidate in candidates {
            if bound.values().any(|uid| *uid == candidate) {
                continue;
            }
            let Some(node) = state.nodes.get(&candidate) else {
                continue;
            };
            if !pattern.matches(node) {
                continue;
            }
            let edges_hold = query.neighbors(step.node).all(|(edge, other)| {
                bound
                    .get(&other)
                    .map_or(true, |other_uid| state.has_edge(candidate, edge, *other_uid))
            });
            if !edges_hold {
                continue;
            }

            bound.insert(step.node, candidate);
            if Self::bind(state, query, order, depth + 1, anchor_uid, bound) {
                return true;
            }
            bound.remove(&step.node);
        }
        false
    }
}

#[async_trait]
impl GraphQueryApi for InMemoryGraph {
    async fn query_with_uid(
        &self,
        _tenant_id: TenantId,
        node_uid: Uid,
        query: &GraphQuery,
    ) -> Result<Option<MatchedGraph>, GraphQueryError> {
        self.begin_call()?;
        let state = self.state.read();
        Ok(Self::match_anchored(&state, query, query.root(), node_uid))
    }

    async fn query_from_uid(
        &self,
        _tenant_id: TenantId,
        node_uid: Uid,
        query: &GraphQuery,
    ) -> Result<Vec<MatchedGraph>, GraphQueryError> {
        self.begin_call()?;
        let state = self.state.read();
        let mut matches: Vec<MatchedGraph> = Vec::new();
        for pattern in query.nodes() {
            if let Some(found) = Self::match_anchored(&state, query, pattern.node_id, node_uid) {
                if !matches.contains(&found) {
                    matches.push(found);
                }
            }
        }
        Ok(matches)
    }
}
