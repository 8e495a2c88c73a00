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

//! Conversions between `lensgraph-core` values and wire messages
//!
//! Encoding is infallible. Decoding validates uids, names and query shape
//! and fails with [`RpcError`] on anything the core types would reject.

use crate::error::{RpcError, RpcResult};
use crate::pb;
use chrono::{DateTime, Utc};
use lensgraph_core::{
    AnalyzerName, EdgeName, EdgeQuery, EdgeUpdate, ExecutionHit, ExecutionResult, GraphQuery,
    Int64Filter, IntOperation, LensRef, MatchedEdge, MatchedGraph, NodeProperties,
    NodePropertyQuery, NodeType, PropertyName, PropertyUpdate, QueryNodeId, StringFilter,
    StringOperation, TenantId, UInt64Filter, Uid, Update,
};
use prost::Message;
use std::collections::{BTreeMap, HashMap};

fn uid(raw: u64) -> RpcResult<Uid> {
    Ok(Uid::new(raw)?)
}

// ---- identifiers ----

impl From<TenantId> for pb::Uuid {
    fn from(tenant: TenantId) -> Self {
        let (msb, lsb) = tenant.as_u64_pair();
        pb::Uuid { msb, lsb }
    }
}

impl From<pb::Uuid> for TenantId {
    fn from(id: pb::Uuid) -> Self {
        TenantId::from_u64_pair(id.msb, id.lsb)
    }
}

pub(crate) fn tenant_from_wire(id: Option<pb::Uuid>) -> RpcResult<TenantId> {
    id.map(TenantId::from)
        .ok_or_else(|| RpcError::missing("tenant_id"))
}

// ---- updates ----

impl From<&PropertyUpdate> for pb::PropertyUpdate {
    fn from(update: &PropertyUpdate) -> Self {
        pb::PropertyUpdate {
            uid: update.uid.get(),
            property_name: update.property_name.to_string(),
        }
    }
}

impl TryFrom<pb::PropertyUpdate> for PropertyUpdate {
    type Error = RpcError;

    fn try_from(update: pb::PropertyUpdate) -> RpcResult<Self> {
        Ok(PropertyUpdate {
            uid: uid(update.uid)?,
            property_name: PropertyName::new(update.property_name)?,
        })
    }
}

impl From<&Update> for pb::Update {
    fn from(update: &Update) -> Self {
        use pb::update::Inner;
        let inner = match update {
            Update::StringProperty(p) => Inner::StringPropertyUpdate(p.into()),
            Update::Int64Property(p) => Inner::Int64PropertyUpdate(p.into()),
            Update::UInt64Property(p) => Inner::Uint64PropertyUpdate(p.into()),
            Update::Edge(e) => Inner::EdgeUpdate(pb::EdgeUpdate {
                src_uid: e.src_uid.get(),
                dst_uid: e.dst_uid.get(),
                forward_edge_name: e.forward_edge_name.to_string(),
                reverse_edge_name: e.reverse_edge_name.to_string(),
            }),
        };
        pb::Update { inner: Some(inner) }
    }
}

impl TryFrom<pb::Update> for Update {
    type Error = RpcError;

    fn try_from(update: pb::Update) -> RpcResult<Self> {
        use pb::update::Inner;
        match update.inner.ok_or_else(|| RpcError::missing("update.inner"))? {
            Inner::StringPropertyUpdate(p) => Ok(Update::StringProperty(p.try_into()?)),
            Inner::Int64PropertyUpdate(p) => Ok(Update::Int64Property(p.try_into()?)),
            Inner::Uint64PropertyUpdate(p) => Ok(Update::UInt64Property(p.try_into()?)),
            Inner::EdgeUpdate(e) => Ok(Update::Edge(EdgeUpdate {
                src_uid: uid(e.src_uid)?,
                dst_uid: uid(e.dst_uid)?,
                forward_edge_name: EdgeName::new(e.forward_edge_name)?,
                reverse_edge_name: EdgeName::new(e.reverse_edge_name)?,
            })),
        }
    }
}

/// Encode an update as a standalone protobuf payload, the format stored in
/// the object store and referenced by work queue messages.
pub fn encode_update(update: &Update) -> Vec<u8> {
    pb::Update::from(update).encode_to_vec()
}

pub fn decode_update(bytes: &[u8]) -> RpcResult<Update> {
    pb::Update::decode(bytes)?.try_into()
}

// ---- queries ----

fn string_operation_to_wire(op: StringOperation) -> pb::StringOperation {
    match op {
        StringOperation::Equal => pb::StringOperation::Equal,
        StringOperation::Contains => pb::StringOperation::Contains,
        StringOperation::StartsWith => pb::StringOperation::StartsWith,
        StringOperation::EndsWith => pb::StringOperation::EndsWith,
        StringOperation::Has => pb::StringOperation::Has,
    }
}

fn string_operation_from_wire(raw: i32) -> RpcResult<StringOperation> {
    match pb::StringOperation::try_from(raw) {
        Ok(pb::StringOperation::Equal) => Ok(StringOperation::Equal),
        Ok(pb::StringOperation::Contains) => Ok(StringOperation::Contains),
        Ok(pb::StringOperation::StartsWith) => Ok(StringOperation::StartsWith),
        Ok(pb::StringOperation::EndsWith) => Ok(StringOperation::EndsWith),
        Ok(pb::StringOperation::Has) => Ok(StringOperation::Has),
        Ok(pb::StringOperation::Unspecified) | Err(_) => Err(RpcError::InvalidWire(format!(
            "unknown string operation {raw}"
        ))),
    }
}

fn int_operation_to_wire(op: IntOperation) -> pb::IntOperation {
    match op {
        IntOperation::Equal => pb::IntOperation::Equal,
        IntOperation::LessThan => pb::IntOperation::LessThan,
        IntOperation::GreaterThan => pb::IntOperation::GreaterThan,
        IntOperation::Has => pb::IntOperation::Has,
    }
}

fn int_operation_from_wire(raw: i32) -> RpcResult<IntOperation> {
    match pb::IntOperation::try_from(raw) {
        Ok(pb::IntOperation::Equal) => Ok(IntOperation::Equal),
        Ok(pb::IntOperation::LessThan) => Ok(IntOperation::LessThan),
        Ok(pb::IntOperation::GreaterThan) => Ok(IntOperation::GreaterThan),
        Ok(pb::IntOperation::Has) => Ok(IntOperation::Has),
        Ok(pb::IntOperation::Unspecified) | Err(_) => Err(RpcError::InvalidWire(format!(
            "unknown int operation {raw}"
        ))),
    }
}

fn string_groups_to_wire(groups: &[Vec<StringFilter>]) -> pb::OrStringFilters {
    pb::OrStringFilters {
        groups: groups
            .iter()
            .map(|group| pb::AndStringFilters {
                filters: group
                    .iter()
                    .map(|f| pb::StringFilter {
                        operation: string_operation_to_wire(f.operation) as i32,
                        value: f.value.clone(),
                        negated: f.negated,
                    })
                    .collect(),
            })
            .collect(),
    }
}

fn string_groups_from_wire(groups: pb::OrStringFilters) -> RpcResult<Vec<Vec<StringFilter>>> {
    groups
        .groups
        .into_iter()
        .map(|group| {
            group
                .filters
                .into_iter()
                .map(|f| {
                    Ok(StringFilter {
                        operation: string_operation_from_wire(f.operation)?,
                        value: f.value,
                        negated: f.negated,
                    })
                })
                .collect()
        })
        .collect()
}

fn int64_groups_to_wire(groups: &[Vec<Int64Filter>]) -> pb::OrInt64Filters {
    pb::OrInt64Filters {
        groups: groups
            .iter()
            .map(|group| pb::AndInt64Filters {
                filters: group
                    .iter()
                    .map(|f| pb::Int64Filter {
                        operation: int_operation_to_wire(f.operation) as i32,
                        value: f.value,
                        negated: f.negated,
                    })
                    .collect(),
            })
            .collect(),
    }
}

fn int64_groups_from_wire(groups: pb::OrInt64Filters) -> RpcResult<Vec<Vec<Int64Filter>>> {
    groups
        .groups
        .into_iter()
        .map(|group| {
            group
                .filters
                .into_iter()
                .map(|f| {
                    Ok(Int64Filter {
                        operation: int_operation_from_wire(f.operation)?,
                        value: f.value,
                        negated: f.negated,
                    })
                })
                .collect()
        })
        .collect()
}

fn uint64_groups_to_wire(groups: &[Vec<UInt64Filter>]) -> pb::OrUint64Filters {
    pb::OrUint64Filters {
        groups: groups
            .iter()
            .map(|group| pb::AndUint64Filters {
                filters: group
                    .iter()
                    .map(|f| pb::Uint64Filter {
                        operation: int_operation_to_wire(f.operation) as i32,
                        value: f.value,
                        negated: f.negated,
                    })
                    .collect(),
            })
            .collect(),
    }
}

fn uint64_groups_from_wire(groups: pb::OrUint64Filters) -> RpcResult<Vec<Vec<UInt64Filter>>> {
    groups
        .groups
        .into_iter()
        .map(|group| {
            group
                .filters
                .into_iter()
                .map(|f| {
                    Ok(UInt64Filter {
                        operation: int_operation_from_wire(f.operation)?,
                        value: f.value,
                        negated: f.negated,
                    })
                })
                .collect()
        })
        .collect()
}

fn decode_filter_map<W, C>(
    wire: HashMap<String, W>,
    decode: impl Fn(W) -> RpcResult<C>,
) -> RpcResult<BTreeMap<PropertyName, C>> {
    wire.into_iter()
        .map(|(name, groups)| Ok((PropertyName::new(name)?, decode(groups)?)))
        .collect()
}

impl From<&NodePropertyQuery> for pb::NodePropertyQuery {
    fn from(node: &NodePropertyQuery) -> Self {
        pb::NodePropertyQuery {
            node_id: node.node_id.0,
            node_type: node.node_type.to_string(),
            string_filters: node
                .string_filters
                .iter()
                .map(|(k, v)| (k.to_string(), string_groups_to_wire(v)))
                .collect(),
            int64_filters: node
                .int64_filters
                .iter()
                .map(|(k, v)| (k.to_string(), int64_groups_to_wire(v)))
                .collect(),
            uint64_filters: node
                .uint64_filters
                .iter()
                .map(|(k, v)| (k.to_string(), uint64_groups_to_wire(v)))
                .collect(),
        }
    }
}

impl TryFrom<pb::NodePropertyQuery> for NodePropertyQuery {
    type Error = RpcError;

    fn try_from(node: pb::NodePropertyQuery) -> RpcResult<Self> {
        Ok(NodePropertyQuery {
            node_id: QueryNodeId(node.node_id),
            node_type: NodeType::new(node.node_type)?,
            string_filters: decode_filter_map(node.string_filters, string_groups_from_wire)?,
            int64_filters: decode_filter_map(node.int64_filters, int64_groups_from_wire)?,
            uint64_filters: decode_filter_map(node.uint64_filters, uint64_groups_from_wire)?,
        })
    }
}

impl From<&GraphQuery> for pb::GraphQuery {
    fn from(query: &GraphQuery) -> Self {
        pb::GraphQuery {
            root: query.root().0,
            nodes: query.nodes().map(pb::NodePropertyQuery::from).collect(),
            edges: query
                .edges()
                .iter()
                .map(|e| pb::EdgeQuery {
                    src: e.src.0,
                    forward_name: e.forward_name.to_string(),
                    reverse_name: e.reverse_name.to_string(),
                    dst: e.dst.0,
                })
                .collect(),
        }
    }
}

impl TryFrom<pb::GraphQuery> for GraphQuery {
    type Error = RpcError;

    fn try_from(query: pb::GraphQuery) -> RpcResult<Self> {
        let nodes = query
            .nodes
            .into_iter()
            .map(NodePropertyQuery::try_from)
            .collect::<RpcResult<Vec<_>>>()?;
        let edges = query
            .edges
            .into_iter()
            .map(|e| {
                Ok(EdgeQuery {
                    src: QueryNodeId(e.src),
                    forward_name: EdgeName::new(e.forward_name)?,
                    reverse_name: EdgeName::new(e.reverse_name)?,
                    dst: QueryNodeId(e.dst),
                })
            })
            .collect::<RpcResult<Vec<_>>>()?;
        Ok(GraphQuery::from_parts(QueryNodeId(query.root), nodes, edges)?)
    }
}

// ---- matched graphs ----

impl From<&NodeProperties> for pb::NodeProperties {
    fn from(node: &NodeProperties) -> Self {
        pb::NodeProperties {
            uid: node.uid.get(),
            node_type: node.node_type.to_string(),
            string_properties: node
                .string_properties
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
            int64_properties: node
                .int64_properties
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
            uint64_properties: node
                .uint64_properties
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
        }
    }
}

impl TryFrom<pb::NodeProperties> for NodeProperties {
    type Error = RpcError;

    fn try_from(node: pb::NodeProperties) -> RpcResult<Self> {
        Ok(NodeProperties {
            uid: uid(node.uid)?,
            node_type: NodeType::new(node.node_type)?,
            string_properties: decode_filter_map(node.string_properties, Ok)?,
            int64_properties: decode_filter_map(node.int64_properties, Ok)?,
            uint64_properties: decode_filter_map(node.uint64_properties, Ok)?,
        })
    }
}

impl From<&MatchedGraph> for pb::MatchedGraphWithUid {
    fn from(graph: &MatchedGraph) -> Self {
        pb::MatchedGraphWithUid {
            root_uid: graph.root_uid.get(),
            nodes: graph.nodes.values().map(pb::NodeProperties::from).collect(),
            edges: graph
                .edges
                .iter()
                .map(|e| pb::MatchedEdge {
                    src: e.src.get(),
                    edge_name: e.edge_name.to_string(),
                    dst: e.dst.get(),
                })
                .collect(),
        }
    }
}

impl TryFrom<pb::MatchedGraphWithUid> for MatchedGraph {
    type Error = RpcError;

    fn try_from(graph: pb::MatchedGraphWithUid) -> RpcResult<Self> {
        let nodes = graph
            .nodes
            .into_iter()
            .map(NodeProperties::try_from)
            .collect::<RpcResult<Vec<_>>>()?;
        let edges = graph
            .edges
            .into_iter()
            .map(|e| {
                Ok(MatchedEdge {
                    src: uid(e.src)?,
                    edge_name: EdgeName::new(e.edge_name)?,
                    dst: uid(e.dst)?,
                })
            })
            .collect::<RpcResult<Vec<_>>>()?;
        Ok(MatchedGraph::from_parts(uid(graph.root_uid)?, nodes, edges)?)
    }
}

// ---- results ----

impl From<&ExecutionHit> for pb::ExecutionHit {
    fn from(hit: &ExecutionHit) -> Self {
        pb::ExecutionHit {
            graph: Some((&hit.graph).into()),
            lenses: hit
                .lenses
                .iter()
                .map(|l| pb::LensRef {
                    namespace: l.namespace.clone(),
                    name: l.name.clone(),
                })
                .collect(),
            analyzer_name: hit.analyzer_name.to_string(),
            idempotency_key: hit.idempotency_key,
            time_of_match_seconds: hit.time_of_match.timestamp(),
            time_of_match_nanos: hit.time_of_match.timestamp_subsec_nanos(),
            score: hit.score,
        }
    }
}

impl TryFrom<pb::ExecutionHit> for ExecutionHit {
    type Error = RpcError;

    fn try_from(hit: pb::ExecutionHit) -> RpcResult<Self> {
        let graph = hit.graph.ok_or_else(|| RpcError::missing("hit.graph"))?;
        let time_of_match: DateTime<Utc> =
            DateTime::from_timestamp(hit.time_of_match_seconds, hit.time_of_match_nanos)
                .ok_or_else(|| RpcError::InvalidWire("time_of_match out of range".to_string()))?;
        Ok(ExecutionHit {
            graph: graph.try_into()?,
            lenses: hit
                .lenses
                .into_iter()
                .map(|l| LensRef::new(l.namespace, l.name))
                .collect::<Result<Vec<_>, _>>()?,
            analyzer_name: AnalyzerName::new(hit.analyzer_name)?,
            idempotency_key: hit.idempotency_key,
            time_of_match,
            score: hit.score,
        })
    }
}

impl From<&ExecutionResult> for pb::ExecutionResult {
    fn from(result: &ExecutionResult) -> Self {
        use pb::execution_result::Inner;
        let inner = match result {
            ExecutionResult::Hit(hit) => Inner::Hit(hit.into()),
            ExecutionResult::Miss => Inner::Miss(pb::ExecutionMiss {}),
        };
        pb::ExecutionResult { inner: Some(inner) }
    }
}

impl TryFrom<pb::ExecutionResult> for ExecutionResult {
    type Error = RpcError;

    fn try_from(result: pb::ExecutionResult) -> RpcResult<Self> {
        use pb::execution_result::Inner;
        match result
            .inner
            .ok_or_else(|| RpcError::missing("execution_result.inner"))?
        {
            Inner::Hit(hit) => Ok(ExecutionResult::Hit(hit.try_into()?)),
            Inner::Miss(_) => Ok(ExecutionResult::Miss),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lensgraph_core::GraphQueryBuilder;

    fn sample_query() -> GraphQuery {
        let mut b = GraphQueryBuilder::new();
        let child = b.node(NodeType::new("Process").unwrap());
        let parent = b.node(NodeType::new("Process").unwrap());
        b.with_string_filters(
            child,
            PropertyName::new("process_name").unwrap(),
            vec![StringFilter::equal("svchost.exe")],
        )
        .unwrap()
        .with_int64_filters(
            child,
            PropertyName::new("exit_code").unwrap(),
            vec![Int64Filter::new(IntOperation::LessThan, 0).negate()],
        )
        .unwrap()
        .with_uint64_filters(parent, PropertyName::new("pid").unwrap(), vec![UInt64Filter::has()])
        .unwrap()
        .with_edge(
            child,
            EdgeName::new("parent").unwrap(),
            EdgeName::new("children").unwrap(),
            parent,
        )
        .unwrap();
        b.build(child).unwrap()
    }

    #[test]
    fn test_query_survives_wire() {
        let query = sample_query();
        let wire = pb::GraphQuery::from(&query);
        let back = GraphQuery::try_from(wire).unwrap();
        assert_eq!(back, query);
    }

    #[test]
    fn test_invalid_names_rejected_on_decode() {
        let mut wire = pb::GraphQuery::from(&sample_query());
        wire.nodes[0].node_type = "not_pascal".to_string();
        assert!(matches!(GraphQuery::try_from(wire), Err(RpcError::Core(_))));

        let bad = pb::Update {
            inner: Some(pb::update::Inner::StringPropertyUpdate(pb::PropertyUpdate {
                uid: 0,
                property_name: "pid".to_string(),
            })),
        };
        assert!(matches!(Update::try_from(bad), Err(RpcError::Core(_))));
        assert!(matches!(
            Update::try_from(pb::Update { inner: None }),
            Err(RpcError::InvalidWire(_))
        ));
    }

    #[test]
    fn test_unknown_operation_rejected() {
        let mut wire = pb::GraphQuery::from(&sample_query());
        for node in &mut wire.nodes {
            for groups in node.string_filters.values_mut() {
                groups.groups[0].filters[0].operation = 99;
            }
        }
        assert!(matches!(GraphQuery::try_from(wire), Err(RpcError::InvalidWire(_))));
    }

    #[test]
    fn test_hit_keeps_nanosecond_timestamp() {
        let root = NodeProperties::new(Uid::new(42).unwrap(), NodeType::new("Process").unwrap());
        let hit = ExecutionHit::new(
            MatchedGraph::new(root),
            AnalyzerName::new("svchost").unwrap(),
            7,
            -3,
        )
        .with_lens(LensRef::new("hostname", "ws-01").unwrap());
        let result = ExecutionResult::Hit(hit);

        let wire = pb::ExecutionResult::from(&result);
        assert_eq!(ExecutionResult::try_from(wire).unwrap(), result);
        let miss = pb::ExecutionResult::from(&ExecutionResult::Miss);
        assert_eq!(ExecutionResult::try_from(miss).unwrap(), ExecutionResult::Miss);
    }
}
