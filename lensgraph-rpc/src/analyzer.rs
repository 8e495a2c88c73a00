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

//! Analyzer RPC
//!
//! A sandboxed worker hosts one analyzer behind [`AnalyzerRpcServer`]; the
//! executor reaches it through [`RemoteAnalyzer`], which implements the same
//! [`AnalyzerRunner`] seam as an in-process analyzer.

use crate::convert::tenant_from_wire;
use crate::error::{RpcError, RpcResult};
use crate::pb;
use crate::pb::analyzer_service_client::AnalyzerServiceClient;
use crate::pb::analyzer_service_server::{AnalyzerService, AnalyzerServiceServer};
use async_trait::async_trait;
use lensgraph_core::{
    AnalyzerError, AnalyzerName, AnalyzerRunner, ExecutionResult, RunRequest, Update,
};
use std::sync::Arc;
use std::time::Duration;
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Request, Response, Status};

fn analyzer_error_to_status(err: AnalyzerError) -> Status {
    match err {
        AnalyzerError::DeadlineExceeded => Status::deadline_exceeded(err.to_string()),
        AnalyzerError::GraphQuery(ref e) if e.is_transient() => Status::unavailable(err.to_string()),
        _ => Status::internal(err.to_string()),
    }
}

fn status_to_analyzer_error(status: Status) -> AnalyzerError {
    match status.code() {
        Code::DeadlineExceeded => AnalyzerError::DeadlineExceeded,
        Code::Internal | Code::InvalidArgument => {
            AnalyzerError::Failed(status.message().to_string())
        }
        code => AnalyzerError::Transport(format!("{code:?}: {}", status.message())),
    }
}

/// Serves an [`AnalyzerRunner`] as `AnalyzerService`
pub struct AnalyzerRpcServer {
    runner: Arc<dyn AnalyzerRunner>,
    budget: Duration,
}

impl AnalyzerRpcServer {
    /// `budget` bounds each invocation when the caller sets no tighter timeout.
    pub fn new(runner: Arc<dyn AnalyzerRunner>, budget: Duration) -> Self {
        Self { runner, budget }
    }

    pub fn into_service(self) -> AnalyzerServiceServer<Self> {
        AnalyzerServiceServer::new(self)
    }

    fn decode(request: pb::RunAnalyzerRequest) -> RpcResult<(lensgraph_core::TenantId, Update)> {
        let tenant = tenant_from_wire(request.tenant_id)?;
        let update = request
            .update
            .ok_or_else(|| RpcError::missing("update"))?
            .try_into()?;
        Ok((tenant, update))
    }
}

#[tonic::async_trait]
impl AnalyzerService for AnalyzerRpcServer {
    async fn run_analyzer(
        &self,
        request: Request<pb::RunAnalyzerRequest>,
    ) -> Result<Response<pb::RunAnalyzerResponse>, Status> {
        let (tenant_id, update) = Self::decode(request.into_inner())?;
        let deadline = tokio::time::Instant::now() + self.budget;
        let result = self
            .runner
            .run(RunRequest {
                tenant_id,
                update,
                deadline,
            })
            .await
            .map_err(|e| {
                tracing::warn!(error = %e, "Analyzer invocation failed");
                analyzer_error_to_status(e)
            })?;
        Ok(Response::new(pb::RunAnalyzerResponse {
            execution_result: Some((&result).into()),
        }))
    }
}

/// Client for an analyzer hosted by a sandbox worker
#[derive(Debug, Clone)]
pub struct RemoteAnalyzer {
    name: AnalyzerName,
    client: AnalyzerServiceClient<Channel>,
}

impl RemoteAnalyzer {
    /// Lazily connected; the first invocation establishes the channel.
    pub fn connect_lazy(name: AnalyzerName, endpoint: &str) -> RpcResult<Self> {
        let channel = Endpoint::from_shared(endpoint.to_string())
            .map_err(|e| RpcError::InvalidWire(format!("bad endpoint {endpoint}: {e}")))?
            .connect_lazy();
        Ok(Self::from_channel(name, channel))
    }

    pub fn from_channel(name: AnalyzerName, channel: Channel) -> Self {
        Self {
            name,
            client: AnalyzerServiceClient::new(channel),
        }
    }

    pub fn name(&self) -> &AnalyzerName {
        &self.name
    }
}

#[async_trait]
impl AnalyzerRunner for RemoteAnalyzer {
    async fn run(&self, request: RunRequest) -> Result<ExecutionResult, AnalyzerError> {
        let remaining = request
            .deadline
            .saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return Err(AnalyzerError::DeadlineExceeded);
        }

        let mut rpc = Request::new(pb::RunAnalyzerRequest {
            tenant_id: Some(request.tenant_id.into()),
            update: Some((&request.update).into()),
        });
        rpc.set_timeout(remaining);

        let mut client = self.client.clone();
        let response = tokio::time::timeout_at(request.deadline, client.run_analyzer(rpc))
            .await
            .map_err(|_| AnalyzerError::DeadlineExceeded)?
            .map_err(status_to_analyzer_error)?
            .into_inner();

        let wire = response
            .execution_result
            .ok_or_else(|| AnalyzerError::Transport("missing execution_result".to_string()))?;
        ExecutionResult::try_from(wire).map_err(|e| AnalyzerError::Transport(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lensgraph_core::GraphQueryError;

    #[test]
    fn test_error_mapping() {
        let status = analyzer_error_to_status(AnalyzerError::Failed("boom".to_string()));
        assert_eq!(status.code(), Code::Internal);
        assert!(matches!(status_to_analyzer_error(status), AnalyzerError::Failed(m) if m.contains("boom")));

        let status = analyzer_error_to_status(AnalyzerError::DeadlineExceeded);
        assert_eq!(status_to_analyzer_error(status), AnalyzerError::DeadlineExceeded);

        let transient = AnalyzerError::GraphQuery(GraphQueryError::Unavailable("x".to_string()));
        assert_eq!(analyzer_error_to_status(transient).code(), Code::Unavailable);
    }
}
