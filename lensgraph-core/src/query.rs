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

//! Graph queries
//!
//! A [`GraphQuery`] describes a connected subgraph: a set of typed node
//! patterns keyed by synthetic [`QueryNodeId`]s, directed edge constraints
//! between them, and exactly one root. Property filters are kept per
//! property as an OR of AND-groups:
//!
//! ```text
//! process_name: [[Equal "svchost.exe"], [EndsWith "svchost.exe", Contains "\\temp\\"]]
//! ```
//!
//! matches when the first group holds or the second group holds in full.
//!
//! Queries are built with [`GraphQueryBuilder`], which only ever adds
//! constraints; a built query is immutable.

use crate::error::{CoreError, CoreResult};
use crate::graph::NodeProperties;
use crate::names::{EdgeName, NodeType, PropertyName};
use crate::update::{ScalarKind, Update};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

/// Synthetic id of a node pattern inside one query
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryNodeId(pub u64);

impl fmt::Display for QueryNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "q{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StringOperation {
    Equal,
    Contains,
    StartsWith,
    EndsWith,
    /// Property is present, value ignored
    Has,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntOperation {
    Equal,
    LessThan,
    GreaterThan,
    /// Property is present, value ignored
    Has,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StringFilter {
    pub operation: StringOperation,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub negated: bool,
}

impl StringFilter {
    pub fn new(operation: StringOperation, value: impl Into<String>) -> Self {
        Self {
            operation,
            value: value.into(),
            negated: false,
        }
    }

    pub fn equal(value: impl Into<String>) -> Self {
        Self::new(StringOperation::Equal, value)
    }

    pub fn contains(value: impl Into<String>) -> Self {
        Self::new(StringOperation::Contains, value)
    }

    pub fn has() -> Self {
        Self::new(StringOperation::Has, String::new())
    }

    pub fn negate(mut self) -> Self {
        self.negated = !self.negated;
        self
    }

    /// Evaluate against a property value. A comparison against a missing
    /// property fails whether or not it is negated; only `Has` observes
    /// absence.
    pub fn matches(&self, value: Option<&str>) -> bool {
        let outcome = match (self.operation, value) {
            (StringOperation::Has, v) => v.is_some(),
            (_, None) => return false,
            (StringOperation::Equal, Some(v)) => v == self.value,
            (StringOperation::Contains, Some(v)) => v.contains(self.value.as_str()),
            (StringOperation::StartsWith, Some(v)) => v.starts_with(self.value.as_str()),
            (StringOperation::EndsWith, Some(v)) => v.ends_with(self.value.as_str()),
        };
        outcome != self.negated
    }
}

/// Filter over an integer property. Same absence rules as [`StringFilter`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IntFilter<T> {
    pub operation: IntOperation,
    pub value: T,
    #[serde(default)]
    pub negated: bool,
}

pub type Int64Filter = IntFilter<i64>;
pub type UInt64Filter = IntFilter<u64>;

impl<T: Ord + Copy + Default> IntFilter<T> {
    pub fn new(operation: IntOperation, value: T) -> Self {
        Self {
            operation,
            value,
            negated: false,
        }
    }

    pub fn equal(value: T) -> Self {
        Self::new(IntOperation::Equal, value)
    }

    pub fn has() -> Self {
        Self::new(IntOperation::Has, T::default())
    }

    pub fn negate(mut self) -> Self {
        self.negated = !self.negated;
        self
    }

    pub fn matches(&self, value: Option<T>) -> bool {
        let outcome = match (self.operation, value) {
            (IntOperation::Has, v) => v.is_some(),
            (_, None) => return false,
            (IntOperation::Equal, Some(v)) => v == self.value,
            (IntOperation::LessThan, Some(v)) => v < self.value,
            (IntOperation::GreaterThan, Some(v)) => v > self.value,
        };
        outcome != self.negated
    }
}

/// OR over groups, AND within a group. An empty list imposes no constraint.
fn any_group_matches<F>(groups: &[Vec<F>], mut check: impl FnMut(&F) -> bool) -> bool {
    groups.is_empty() || groups.iter().any(|group| group.iter().all(&mut check))
}

/// Pattern for a single node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodePropertyQuery {
    pub node_id: QueryNodeId,
    pub node_type: NodeType,
    #[serde(default)]
    pub string_filters: BTreeMap<PropertyName, Vec<Vec<StringFilter>>>,
    #[serde(default)]
    pub int64_filters: BTreeMap<PropertyName, Vec<Vec<Int64Filter>>>,
    #[serde(default)]
    pub uint64_filters: BTreeMap<PropertyName, Vec<Vec<UInt64Filter>>>,
}

impl NodePropertyQuery {
    pub fn new(node_id: QueryNodeId, node_type: NodeType) -> Self {
        Self {
            node_id,
            node_type,
            string_filters: BTreeMap::new(),
            int64_filters: BTreeMap::new(),
            uint64_filters: BTreeMap::new(),
        }
    }

    pub fn has_filter(&self, kind: ScalarKind, property: &str) -> bool {
        match kind {
            ScalarKind::String => self.string_filters.contains_key(property),
            ScalarKind::Int64 => self.int64_filters.contains_key(property),
            ScalarKind::UInt64 => self.uint64_filters.contains_key(property),
        }
    }

    /// Whether a concrete node satisfies this pattern's type and filters.
    pub fn matches(&self, node: &NodeProperties) -> bool {
        if node.node_type != self.node_type {
            return false;
        }
        self.string_filters.iter().all(|(name, groups)| {
            let value = node.string_properties.get(name).map(String::as_str);
            any_group_matches(groups, |f| f.matches(value))
        }) && self.int64_filters.iter().all(|(name, groups)| {
            let value = node.int64_properties.get(name).copied();
            any_group_matches(groups, |f| f.matches(value))
        }) && self.uint64_filters.iter().all(|(name, groups)| {
            let value = node.uint64_properties.get(name).copied();
            any_group_matches(groups, |f| f.matches(value))
        })
    }
}

/// Directed edge constraint `src -[forward_name]-> dst`, with the reverse
/// edge `dst -[reverse_name]-> src`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EdgeQuery {
    pub src: QueryNodeId,
    pub forward_name: EdgeName,
    pub reverse_name: EdgeName,
    pub dst: QueryNodeId,
}

/// A connected query with exactly one root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawGraphQuery", into = "RawGraphQuery")]
pub struct GraphQuery {
    root: QueryNodeId,
    nodes: BTreeMap<QueryNodeId, NodePropertyQuery>,
    edges: Vec<EdgeQuery>,
}

/// Unvalidated serde form of [`GraphQuery`]
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawGraphQuery {
    root: QueryNodeId,
    nodes: Vec<NodePropertyQuery>,
    #[serde(default)]
    edges: Vec<EdgeQuery>,
}

impl TryFrom<RawGraphQuery> for GraphQuery {
    type Error = CoreError;

    fn try_from(raw: RawGraphQuery) -> Result<Self, Self::Error> {
        GraphQuery::from_parts(raw.root, raw.nodes, raw.edges)
    }
}

impl From<GraphQuery> for RawGraphQuery {
    fn from(query: GraphQuery) -> Self {
        RawGraphQuery {
            root: query.root,
            nodes: query.nodes.into_values().collect(),
            edges: query.edges,
        }
    }
}

impl GraphQuery {
    /// Assemble and validate a query: the root and every edge endpoint must
    /// name a known node, and every node must be reachable from the root.
    pub fn from_parts(
        root: QueryNodeId,
        nodes: Vec<NodePropertyQuery>,
        edges: Vec<EdgeQuery>,
    ) -> CoreResult<Self> {
        let nodes: BTreeMap<_, _> = nodes.into_iter().map(|n| (n.node_id, n)).collect();
        if !nodes.contains_key(&root) {
            return Err(CoreError::MissingRoot(root));
        }
        for edge in &edges {
            for id in [edge.src, edge.dst] {
                if !nodes.contains_key(&id) {
                    return Err(CoreError::UnknownQueryNode(id));
                }
            }
        }

        let query = Self { root, nodes, edges };
        let reachable = query.reachable_from_root();
        let unreachable: Vec<_> = query
            .nodes
            .keys()
            .filter(|id| !reachable.contains(id))
            .copied()
            .collect();
        if !unreachable.is_empty() {
            return Err(CoreError::DisconnectedQuery(unreachable));
        }
        Ok(query)
    }

    fn reachable_from_root(&self) -> BTreeSet<QueryNodeId> {
        let mut seen = BTreeSet::from([self.root]);
        let mut queue = VecDeque::from([self.root]);
        while let Some(current) = queue.pop_front() {
            for (_, next) in self.neighbors(current) {
                if seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        seen
    }

    pub fn root(&self) -> QueryNodeId {
        self.root
    }

    pub fn root_node(&self) -> &NodePropertyQuery {
        // from_parts guarantees the root is present
        &self.nodes[&self.root]
    }

    pub fn node(&self, id: QueryNodeId) -> Option<&NodePropertyQuery> {
        self.nodes.get(&id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodePropertyQuery> {
        self.nodes.values()
    }

    pub fn edges(&self) -> &[EdgeQuery] {
        &self.edges
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Edges touching `id`, each as (edge name seen from `id`, other end).
    pub fn neighbors(&self, id: QueryNodeId) -> impl Iterator<Item = (&EdgeName, QueryNodeId)> {
        self.edges.iter().filter_map(move |e| {
            if e.src == id {
                Some((&e.forward_name, e.dst))
            } else if e.dst == id {
                Some((&e.reverse_name, e.src))
            } else {
                None
            }
        })
    }

    /// Same query re-rooted at another of its nodes.
    pub fn rerooted(&self, root: QueryNodeId) -> CoreResult<Self> {
        if !self.nodes.contains_key(&root) {
            return Err(CoreError::MissingRoot(root));
        }
        Ok(Self {
            root,
            nodes: self.nodes.clone(),
            edges: self.edges.clone(),
        })
    }

    /// Whether any node filters `property` as the given scalar type.
    pub fn has_property_filter(&self, kind: ScalarKind, property: &str) -> bool {
        self.nodes.values().any(|n| n.has_filter(kind, property))
    }

    /// Relevance test for dispatch. Property updates are relevant only when
    /// some node filters that property with the same scalar type. Edge
    /// updates are always considered relevant.
    pub fn may_be_affected_by(&self, update: &Update) -> bool {
        match update.as_property() {
            Some((kind, property)) => {
                self.has_property_filter(kind, property.property_name.as_str())
            }
            None => true,
        }
    }
}

/// Monotonic builder for [`GraphQuery`]
#[derive(Debug, Default, Clone)]
pub struct GraphQueryBuilder {
    next_id: u64,
    nodes: BTreeMap<QueryNodeId, NodePropertyQuery>,
    edges: Vec<EdgeQuery>,
}

impl GraphQueryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node pattern and return its id.
    pub fn node(&mut self, node_type: NodeType) -> QueryNodeId {
        let id = QueryNodeId(self.next_id);
        self.next_id += 1;
        self.nodes.insert(id, NodePropertyQuery::new(id, node_type));
        id
    }

    fn node_mut(&mut self, id: QueryNodeId) -> CoreResult<&mut NodePropertyQuery> {
        self.nodes
            .get_mut(&id)
            .ok_or(CoreError::UnknownQueryNode(id))
    }

    /// Add one AND-group of string filters on `property`, OR-ed with any
    /// groups already present.
    pub fn with_string_filters(
        &mut self,
        id: QueryNodeId,
        property: PropertyName,
        group: Vec<StringFilter>,
    ) -> CoreResult<&mut Self> {
        self.node_mut(id)?
            .string_filters
            .entry(property)
            .or_default()
            .push(group);
        Ok(self)
    }

    pub fn with_int64_filters(
        &mut self,
        id: QueryNodeId,
        property: PropertyName,
        group: Vec<Int64Filter>,
    ) -> CoreResult<&mut Self> {
        self.node_mut(id)?
            .int64_filters
            .entry(property)
            .or_default()
            .push(group);
        Ok(self)
    }

    pub fn with_uint64_filters(
        &mut self,
        id: QueryNodeId,
        property: PropertyName,
        group: Vec<UInt64Filter>,
    ) -> CoreResult<&mut Self> {
        self.node_mut(id)?
            .uint64_filters
            .entry(property)
            .or_default()
            .push(group);
        Ok(self)
    }

    pub fn with_edge(
        &mut self,
        src: QueryNodeId,
        forward_name: EdgeName,
        reverse_name: EdgeName,
        dst: QueryNodeId,
    ) -> CoreResult<&mut Self> {
        for id in [src, dst] {
            if !self.nodes.contains_key(&id) {
                return Err(CoreError::UnknownQueryNode(id));
            }
        }
        self.edges.push(EdgeQuery {
            src,
            forward_name,
            reverse_name,
            dst,
        });
        Ok(self)
    }

    pub fn build(&self, root: QueryNodeId) -> CoreResult<GraphQuery> {
        GraphQuery::from_parts(root, self.nodes.values().cloned().collect(), self.edges.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::Uid;
    use crate::update::PropertyUpdate;

    fn prop(name: &str) -> PropertyName {
        PropertyName::new(name).unwrap()
    }

    fn process_query() -> GraphQuery {
        let mut b = GraphQueryBuilder::new();
        let child = b.node(NodeType::new("Process").unwrap());
        let parent = b.node(NodeType::new("Process").unwrap());
        b.with_string_filters(
            child,
            prop("process_name"),
            vec![StringFilter::equal("svchost.exe")],
        )
        .unwrap()
        .with_edge(
            parent,
            EdgeName::new("children").unwrap(),
            EdgeName::new("parent").unwrap(),
            child,
        )
        .unwrap();
        b.build(child).unwrap()
    }

    #[test]
    fn test_builder_produces_connected_query() {
        let query = process_query();
        assert_eq!(query.node_count(), 2);
        assert_eq!(query.root(), QueryNodeId(0));
        let neighbors: Vec<_> = query.neighbors(query.root()).collect();
        assert_eq!(neighbors.len(), 1);
        assert_eq!(neighbors[0].0.as_str(), "parent");
    }

    #[test]
    fn test_disconnected_query_rejected() {
        let mut b = GraphQueryBuilder::new();
        let a = b.node(NodeType::new("Process").unwrap());
        let _orphan = b.node(NodeType::new("File").unwrap());
        assert!(matches!(b.build(a), Err(CoreError::DisconnectedQuery(ids)) if ids == vec![QueryNodeId(1)]));
    }

    #[test]
    fn test_unknown_node_rejected() {
        let mut b = GraphQueryBuilder::new();
        let a = b.node(NodeType::new("Process").unwrap());
        let err = b
            .with_string_filters(QueryNodeId(9), prop("pid"), vec![])
            .unwrap_err();
        assert_eq!(err, CoreError::UnknownQueryNode(QueryNodeId(9)));
        assert_eq!(b.build(QueryNodeId(5)).unwrap_err(), CoreError::MissingRoot(QueryNodeId(5)));
        assert!(b.build(a).is_ok());
    }

    #[test]
    fn test_relevance() {
        let query = process_query();
        let update = |kind: fn(PropertyUpdate) -> Update, name: &str| {
            kind(PropertyUpdate {
                uid: Uid::new(42).unwrap(),
                property_name: prop(name),
            })
        };
        assert!(query.may_be_affected_by(&update(Update::StringProperty, "process_name")));
        assert!(!query.may_be_affected_by(&update(Update::StringProperty, "pid")));
        // scalar type must agree
        assert!(!query.may_be_affected_by(&update(Update::Int64Property, "process_name")));
    }

    #[test]
    fn test_string_filter_semantics() {
        assert!(StringFilter::equal("a").matches(Some("a")));
        assert!(!StringFilter::equal("a").negate().matches(Some("a")));
        assert!(!StringFilter::equal("a").negate().matches(None));
        assert!(StringFilter::has().negate().matches(None));
        assert!(StringFilter::new(StringOperation::EndsWith, ".exe").matches(Some("cmd.exe")));
        assert!(StringFilter::contains("temp").matches(Some("c:\\temp\\x")));
    }

    #[test]
    fn test_int_filter_semantics() {
        assert!(Int64Filter::new(IntOperation::LessThan, 0).matches(Some(-3)));
        assert!(!UInt64Filter::new(IntOperation::GreaterThan, 10).matches(Some(10)));
        assert!(UInt64Filter::has().matches(Some(0)));
        assert!(!UInt64Filter::equal(4).matches(None));
    }

    #[test]
    fn test_or_of_and_groups() {
        let mut node = NodeProperties::new(Uid::new(1).unwrap(), NodeType::new("Process").unwrap());
        node.string_properties
            .insert(prop("process_name"), "evil.exe".to_string());

        let mut pattern = NodePropertyQuery::new(QueryNodeId(0), NodeType::new("Process").unwrap());
        pattern.string_filters.insert(
            prop("process_name"),
            vec![
                vec![StringFilter::equal("svchost.exe")],
                vec![
                    StringFilter::new(StringOperation::StartsWith, "evil"),
                    StringFilter::new(StringOperation::EndsWith, ".exe"),
                ],
            ],
        );
        assert!(pattern.matches(&node));

        pattern.node_type = NodeType::new("File").unwrap();
        assert!(!pattern.matches(&node));
    }

    #[test]
    fn test_serde_validates_connectivity() {
        let query = process_query();
        let json = serde_json::to_value(&query).unwrap();
        let back: GraphQuery = serde_json::from_value(json.clone()).unwrap();
        assert_eq!(back, query);

        let mut broken = json;
        broken["edges"] = serde_json::json!([]);
        assert!(serde_json::from_value::<GraphQuery>(broken).is_err());
    }
}
