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

//! Sandboxed analyzer worker
//!
//! Hosts a single materialized analyzer behind the `AnalyzerService` RPC so
//! the executor process runs no analyzer code of its own.

use anyhow::{bail, Context, Result};
use clap::Parser;
use lensgraph_core::{AnalyzerName, AnalyzerRunner, GraphQueryApi};
use lensgraph_executor::{init_tracing, shutdown_signal, LogFormat};
use lensgraph_plugins::{AnalyzerExecutor, AnalyzerLoader, LoadedAnalyzer, ManifestLoader};
use lensgraph_rpc::{AnalyzerRpcServer, GrpcGraphQueryClient};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Materialized analyzer directory (contains analyzer.toml)
    #[arg(long, env = "LENSGRAPH_WORKER_ANALYZER_DIR")]
    analyzer_dir: PathBuf,

    /// gRPC listen address
    #[arg(long, env = "LENSGRAPH_WORKER_LISTEN_ADDR", default_value = "127.0.0.1:50061")]
    listen_addr: SocketAddr,

    /// Graph query service endpoint
    #[arg(long, env = "LENSGRAPH_GRAPH_QUERY_ENDPOINT")]
    graph_endpoint: String,

    /// Per-invocation budget in seconds
    #[arg(long, env = "LENSGRAPH_WORKER_BUDGET_SECS", default_value_t = 300)]
    budget_secs: u64,

    /// Log output format
    #[arg(long, value_enum, default_value = "pretty")]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    let dir_name = args
        .analyzer_dir
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("invalid analyzer directory {:?}", args.analyzer_dir))?;
    let name = AnalyzerName::new(dir_name)?;

    let graph: Arc<dyn GraphQueryApi> = Arc::new(
        GrpcGraphQueryClient::connect(args.graph_endpoint.clone())
            .await
            .context("graph store unreachable")?,
    );

    let runner: Arc<dyn AnalyzerRunner> = match ManifestLoader::new().load(&name, &args.analyzer_dir)? {
        LoadedAnalyzer::InProcess(analyzer) => {
            let query = analyzer.query();
            Arc::new(AnalyzerExecutor::new(name.clone(), analyzer, query, graph))
        }
        LoadedAnalyzer::Remote { .. } => {
            bail!("analyzer '{}' is itself remote; a worker can only host local analyzers", name)
        }
    };

    tracing::info!(analyzer = %name, addr = %args.listen_addr, "Analyzer worker listening");
    tonic::transport::Server::builder()
        .add_service(
            AnalyzerRpcServer::new(runner, Duration::from_secs(args.budget_secs)).into_service(),
        )
        .serve_with_shutdown(args.listen_addr, shutdown_signal())
        .await?;
    tracing::info!(analyzer = %name, "Analyzer worker stopped");
    Ok(())
}
