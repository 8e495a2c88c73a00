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

//! Graph Query RPC
//!
//! [`GrpcGraphQueryClient`] is the executor's handle on the graph store.
//! [`GraphQueryRpcServer`] exposes any [`GraphQueryApi`] over the same
//! service, which is how the in-memory store is served to sandboxed
//! workers and tests.

use crate::convert::tenant_from_wire;
use crate::error::{RpcError, RpcResult};
use crate::pb;
use crate::pb::graph_query_service_client::GraphQueryServiceClient;
use crate::pb::graph_query_service_server::{GraphQueryService, GraphQueryServiceServer};
use async_trait::async_trait;
use lensgraph_core::{GraphQuery, GraphQueryApi, GraphQueryError, MatchedGraph, TenantId, Uid};
use std::sync::Arc;
use std::time::Duration;
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Request, Response, Status};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

fn status_to_query_error(status: Status) -> GraphQueryError {
    match status.code() {
        Code::Unavailable
        | Code::DeadlineExceeded
        | Code::ResourceExhausted
        | Code::Aborted
        | Code::Internal
        | Code::Unknown => GraphQueryError::Unavailable(status.message().to_string()),
        Code::Cancelled => GraphQueryError::Cancelled,
        _ => GraphQueryError::Rejected(format!("{:?}: {}", status.code(), status.message())),
    }
}

fn query_error_to_status(err: GraphQueryError) -> Status {
    match err {
        GraphQueryError::Unavailable(msg) => Status::unavailable(msg),
        GraphQueryError::Rejected(msg) => Status::invalid_argument(msg),
        GraphQueryError::Cancelled => Status::cancelled("graph query cancelled"),
        GraphQueryError::InvalidResponse(msg) => Status::internal(msg),
    }
}

fn invalid_response(err: RpcError) -> GraphQueryError {
    GraphQueryError::InvalidResponse(err.to_string())
}

/// gRPC client for `GraphQueryService`
#[derive(Debug, Clone)]
pub struct GrpcGraphQueryClient {
    client: GraphQueryServiceClient<Channel>,
}

impl GrpcGraphQueryClient {
    /// Connect eagerly; an unreachable graph store fails here.
    pub async fn connect(endpoint: impl Into<String>) -> RpcResult<Self> {
        let endpoint = endpoint.into();
        let channel = Endpoint::from_shared(endpoint.clone())
            .map_err(|e| RpcError::InvalidWire(format!("bad endpoint {endpoint}: {e}")))?
            .connect_timeout(CONNECT_TIMEOUT)
            .connect()
            .await?;
        tracing::info!(endpoint = %endpoint, "Connected to graph query service");
        Ok(Self::from_channel(channel))
    }

    pub fn from_channel(channel: Channel) -> Self {
        Self {
            client: GraphQueryServiceClient::new(channel),
        }
    }
}

#[async_trait]
impl GraphQueryApi for GrpcGraphQueryClient {
    async fn query_with_uid(
        &self,
        tenant_id: TenantId,
        node_uid: Uid,
        query: &GraphQuery,
    ) -> Result<Option<MatchedGraph>, GraphQueryError> {
        let request = pb::QueryGraphWithUidRequest {
            tenant_id: Some(tenant_id.into()),
            node_uid: node_uid.get(),
            graph_query: Some(query.into()),
        };
        let response = self
            .client
            .clone()
            .query_graph_with_uid(request)
            .await
            .map_err(status_to_query_error)?
            .into_inner();

        let Some(wire) = response.maybe_match else {
            return Ok(None);
        };
        let matched = MatchedGraph::try_from(wire).map_err(invalid_response)?;
        if matched.root_uid != node_uid {
            return Err(GraphQueryError::InvalidResponse(format!(
                "match rooted at {} for request anchored at {}",
                matched.root_uid, node_uid
            )));
        }
        Ok(Some(matched))
    }

    async fn query_from_uid(
        &self,
        tenant_id: TenantId,
        node_uid: Uid,
        query: &GraphQuery,
    ) -> Result<Vec<MatchedGraph>, GraphQueryError> {
        let request = pb::QueryGraphFromUidRequest {
            tenant_id: Some(tenant_id.into()),
            node_uid: node_uid.get(),
            graph_query: Some(query.into()),
        };
        let response = self
            .client
            .clone()
            .query_graph_from_uid(request)
            .await
            .map_err(status_to_query_error)?
            .into_inner();

        response
            .matches
            .into_iter()
            .map(|m| MatchedGraph::try_from(m).map_err(invalid_response))
            .collect()
    }
}

/// Serves a [`GraphQueryApi`] as `GraphQueryService`
pub struct GraphQueryRpcServer {
    graph: Arc<dyn GraphQueryApi>,
}

impl GraphQueryRpcServer {
    pub fn new(graph: Arc<dyn GraphQueryApi>) -> Self {
        Self { graph }
    }

    pub fn into_service(self) -> GraphQueryServiceServer<Self> {
        GraphQueryServiceServer::new(self)
    }

    fn decode_request(
        tenant_id: Option<pb::Uuid>,
        node_uid: u64,
        graph_query: Option<pb::GraphQuery>,
    ) -> RpcResult<(TenantId, Uid, GraphQuery)> {
        let tenant = tenant_from_wire(tenant_id)?;
        let uid = Uid::new(node_uid)?;
        let query = graph_query
            .ok_or_else(|| RpcError::missing("graph_query"))?
            .try_into()?;
        Ok((tenant, uid, query))
    }
}

#[tonic::async_trait]
impl GraphQueryService for GraphQueryRpcServer {
    async fn query_graph_with_uid(
        &self,
        request: Request<pb::QueryGraphWithUidRequest>,
    ) -> Result<Response<pb::QueryGraphWithUidResponse>, Status> {
        let r = request.into_inner();
        let (tenant, uid, query) = Self::decode_request(r.tenant_id, r.node_uid, r.graph_query)?;
        let maybe_match = self
            .graph
            .query_with_uid(tenant, uid, &query)
            .await
            .map_err(query_error_to_status)?;
        Ok(Response::new(pb::QueryGraphWithUidResponse {
            maybe_match: maybe_match.as_ref().map(Into::into),
        }))
    }

    async fn query_graph_from_uid(
        &self,
        request: Request<pb::QueryGraphFromUidRequest>,
    ) -> Result<Response<pb::QueryGraphFromUidResponse>, Status> {
        let r = request.into_inner();
        let (tenant, uid, query) = Self::decode_request(r.tenant_id, r.node_uid, r.graph_query)?;
        let matches = self
            .graph
            .query_from_uid(tenant, uid, &query)
            .await
            .map_err(query_error_to_status)?;
        Ok(Response::new(pb::QueryGraphFromUidResponse {
            matches: matches.iter().map(Into::into).collect(),
        }))
    }
}
