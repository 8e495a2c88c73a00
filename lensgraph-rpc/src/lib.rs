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

//! Lensgraph RPC
//!
//! Protobuf schema and tonic services for the two RPC surfaces of the
//! pipeline:
//!
//! - `GraphQueryService`: `QueryGraphWithUid` / `QueryGraphFromUid` against
//!   the graph store
//! - `AnalyzerService`: `RunAnalyzer`, implemented by sandboxed analyzer
//!   workers and called by the executor
//!
//! Wire messages are decoded into `lensgraph-core` values at the edge; names
//! and uids are validated on decode.

#[allow(clippy::all)]
#[allow(clippy::pedantic)]
pub mod pb {
    tonic::include_proto!("lensgraph.v1");
}

pub mod analyzer;
pub mod convert;
pub mod error;
pub mod graph;

pub use analyzer::{AnalyzerRpcServer, RemoteAnalyzer};
pub use convert::{decode_update, encode_update};
pub use error::{RpcError, RpcResult};
pub use graph::{GraphQueryRpcServer, GrpcGraphQueryClient};
