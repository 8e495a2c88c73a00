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

//! RPC error types

use lensgraph_core::CoreError;
use thiserror::Error;

pub type RpcResult<T> = Result<T, RpcError>;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("Invalid wire message: {0}")]
    InvalidWire(String),

    #[error("Invalid value on the wire: {0}")]
    Core(#[from] CoreError),

    #[error("Protobuf decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("RPC failed: {0}")]
    Status(#[from] tonic::Status),
}

impl RpcError {
    pub(crate) fn missing(field: &str) -> Self {
        RpcError::InvalidWire(format!("missing field `{field}`"))
    }
}

impl From<RpcError> for tonic::Status {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::Status(status) => status,
            RpcError::InvalidWire(_) | RpcError::Core(_) | RpcError::Decode(_) => {
                tonic::Status::invalid_argument(err.to_string())
            }
            RpcError::Transport(_) => tonic::Status::unavailable(err.to_string()),
        }
    }
}
