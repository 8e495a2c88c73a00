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

//! Matched subgraphs returned by the graph store

use crate::error::{CoreError, CoreResult};
use crate::ids::Uid;
use crate::names::{EdgeName, NodeType, PropertyName};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Properties of one concrete node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeProperties {
    pub uid: Uid,
    pub node_type: NodeType,
    #[serde(default)]
    pub string_properties: BTreeMap<PropertyName, String>,
    #[serde(default)]
    pub int64_properties: BTreeMap<PropertyName, i64>,
    #[serde(default)]
    pub uint64_properties: BTreeMap<PropertyName, u64>,
}

impl NodeProperties {
    pub fn new(uid: Uid, node_type: NodeType) -> Self {
        Self {
            uid,
            node_type,
            string_properties: BTreeMap::new(),
            int64_properties: BTreeMap::new(),
            uint64_properties: BTreeMap::new(),
        }
    }

    pub fn with_string(mut self, name: PropertyName, value: impl Into<String>) -> Self {
        self.string_properties.insert(name, value.into());
        self
    }

    pub fn with_int64(mut self, name: PropertyName, value: i64) -> Self {
        self.int64_properties.insert(name, value);
        self
    }

    pub fn with_uint64(mut self, name: PropertyName, value: u64) -> Self {
        self.uint64_properties.insert(name, value);
        self
    }

    /// Fold another snapshot of the same node into this one; newer values win.
    fn absorb(&mut self, other: NodeProperties) {
        self.string_properties.extend(other.string_properties);
        self.int64_properties.extend(other.int64_properties);
        self.uint64_properties.extend(other.uint64_properties);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MatchedEdge {
    pub src: Uid,
    pub edge_name: EdgeName,
    pub dst: Uid,
}

/// A concrete subgraph rooted at `root_uid`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchedGraph {
    pub root_uid: Uid,
    pub nodes: BTreeMap<Uid, NodeProperties>,
    #[serde(default)]
    pub edges: BTreeSet<MatchedEdge>,
}

impl MatchedGraph {
    pub fn new(root: NodeProperties) -> Self {
        let root_uid = root.uid;
        Self {
            root_uid,
            nodes: BTreeMap::from([(root_uid, root)]),
            edges: BTreeSet::new(),
        }
    }

    /// Build from parts, checking that the root is among the nodes and
    /// that every edge connects known nodes.
    pub fn from_parts(
        root_uid: Uid,
        nodes: impl IntoIterator<Item = NodeProperties>,
        edges: impl IntoIterator<Item = MatchedEdge>,
    ) -> CoreResult<Self> {
        let mut graph = Self {
            root_uid,
            nodes: BTreeMap::new(),
            edges: BTreeSet::new(),
        };
        for node in nodes {
            graph.insert_node(node);
        }
        if !graph.nodes.contains_key(&root_uid) {
            return Err(CoreError::MissingMatchedRoot(root_uid.get()));
        }
        for edge in edges {
            if !graph.nodes.contains_key(&edge.src) || !graph.nodes.contains_key(&edge.dst) {
                return Err(CoreError::DanglingEdge {
                    src: edge.src.get(),
                    dst: edge.dst.get(),
                });
            }
            graph.edges.insert(edge);
        }
        Ok(graph)
    }

    pub fn insert_node(&mut self, node: NodeProperties) {
        match self.nodes.get_mut(&node.uid) {
            Some(existing) => existing.absorb(node),
            None => {
                self.nodes.insert(node.uid, node);
            }
        }
    }

    /// Record `src -[name]-> dst`. Both ends should already be present.
    pub fn insert_edge(&mut self, src: Uid, edge_name: EdgeName, dst: Uid) {
        self.edges.insert(MatchedEdge {
            src,
            edge_name,
            dst,
        });
    }

    /// Union with another match; the root of `self` is kept.
    pub fn merge(&mut self, other: MatchedGraph) {
        for node in other.nodes.into_values() {
            self.insert_node(node);
        }
        self.edges.extend(other.edges);
    }

    /// True when `self` keeps the root, every node and every edge of
    /// `original`. Added nodes, edges and properties are allowed.
    pub fn extends(&self, original: &MatchedGraph) -> bool {
        self.root_uid == original.root_uid
            && original.nodes.iter().all(|(uid, node)| {
                self.nodes
                    .get(uid)
                    .is_some_and(|kept| kept.node_type == node.node_type)
            })
            && self.edges.is_superset(&original.edges)
    }

    pub fn contains(&self, uid: Uid) -> bool {
        self.nodes.contains_key(&uid)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn view(&self, uid: Uid) -> Option<NodeView<'_>> {
        self.nodes.get(&uid).map(|node| NodeView { graph: self, node })
    }

    pub fn root_view(&self) -> Option<NodeView<'_>> {
        self.view(self.root_uid)
    }
}

/// Borrowed view of one node inside a [`MatchedGraph`]
#[derive(Debug, Clone, Copy)]
pub struct NodeView<'a> {
    graph: &'a MatchedGraph,
    node: &'a NodeProperties,
}

impl<'a> NodeView<'a> {
    pub fn uid(&self) -> Uid {
        self.node.uid
    }

    pub fn node_type(&self) -> &'a NodeType {
        &self.node.node_type
    }

    pub fn properties(&self) -> &'a NodeProperties {
        self.node
    }

    pub fn graph(&self) -> &'a MatchedGraph {
        self.graph
    }

    pub fn get_string(&self, name: &str) -> Option<&'a str> {
        self.node.string_properties.get(name).map(String::as_str)
    }

    pub fn get_int64(&self, name: &str) -> Option<i64> {
        self.node.int64_properties.get(name).copied()
    }

    pub fn get_uint64(&self, name: &str) -> Option<u64> {
        self.node.uint64_properties.get(name).copied()
    }

    /// Nodes reached from this one over edges named `edge_name`.
    pub fn neighbors(&self, edge_name: &'a str) -> impl Iterator<Item = NodeView<'a>> + 'a {
        let graph = self.graph;
        let uid = self.node.uid;
        graph
            .edges
            .iter()
            .filter(move |e| e.src == uid && e.edge_name.as_str() == edge_name)
            .filter_map(move |e| graph.view(e.dst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uid(raw: u64) -> Uid {
        Uid::new(raw).unwrap()
    }

    fn process(raw: u64, name: &str) -> NodeProperties {
        NodeProperties::new(uid(raw), NodeType::new("Process").unwrap())
            .with_string(PropertyName::new("process_name").unwrap(), name)
    }

    #[test]
    fn test_views_and_neighbors() {
        let graph = MatchedGraph::from_parts(
            uid(2),
            [process(1, "explorer.exe"), process(2, "cmd.exe")],
            [MatchedEdge {
                src: uid(2),
                edge_name: EdgeName::new("parent").unwrap(),
                dst: uid(1),
            }],
        )
        .unwrap();

        let root = graph.root_view().unwrap();
        assert_eq!(root.get_string("process_name"), Some("cmd.exe"));
        let parents: Vec<_> = root.neighbors("parent").map(|n| n.uid()).collect();
        assert_eq!(parents, vec![uid(1)]);
        assert_eq!(root.neighbors("children").count(), 0);
    }

    #[test]
    fn test_from_parts_requires_root() {
        let err = MatchedGraph::from_parts(uid(9), [process(1, "a")], Vec::new()).unwrap_err();
        assert_eq!(err, CoreError::MissingMatchedRoot(9));
    }

    #[test]
    fn test_merge_keeps_root_and_absorbs_properties() {
        let mut graph = MatchedGraph::new(process(1, "a"));
        let mut other = MatchedGraph::new(
            NodeProperties::new(uid(1), NodeType::new("Process").unwrap())
                .with_uint64(PropertyName::new("pid").unwrap(), 4),
        );
        other.insert_node(process(5, "b"));
        other.insert_edge(uid(1), EdgeName::new("children").unwrap(), uid(5));

        graph.merge(other);
        assert_eq!(graph.root_uid, uid(1));
        assert_eq!(graph.len(), 2);
        let root = graph.root_view().unwrap();
        assert_eq!(root.get_uint64("pid"), Some(4));
        assert_eq!(root.get_string("process_name"), Some("a"));
    }

    #[test]
    fn test_extends_allows_only_additions() {
        let original = MatchedGraph::new(process(42, "svchost.exe"));

        let mut augmented = original.clone();
        augmented.insert_node(process(7, "services.exe"));
        augmented.insert_edge(uid(42), EdgeName::new("parent").unwrap(), uid(7));
        assert!(augmented.extends(&original));

        let mut rerooted = augmented.clone();
        rerooted.root_uid = uid(7);
        assert!(!rerooted.extends(&original));

        let mut emptied = original.clone();
        emptied.nodes.clear();
        assert!(!emptied.extends(&original));

        let mut unlinked = augmented.clone();
        unlinked.edges.clear();
        assert!(!unlinked.extends(&augmented));
    }

    #[test]
    fn test_json_round_trip() {
        let mut graph = MatchedGraph::new(process(42, "svchost.exe"));
        graph.insert_node(process(7, "services.exe"));
        graph.insert_edge(uid(42), EdgeName::new("parent").unwrap(), uid(7));
        let json = serde_json::to_string(&graph).unwrap();
        let back: MatchedGraph = serde_json::from_str(&json).unwrap();
        assert_eq!(back, graph);
    }
}
