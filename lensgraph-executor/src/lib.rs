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

//! Lensgraph Executor
//!
//! The analyzer execution pipeline:
//!
//! - [`lease`]: leases work-queue messages and keeps them invisible while
//!   they are processed
//! - [`dispatcher`]: fans each update out to the registered analyzers
//! - [`dedup`]: best-effort replay suppression for messages and hits
//! - [`emitter`]: publishes hits downstream
//! - [`service`]: the bounded-concurrency `poll -> lease -> dispatch` loop
//!
//! [`run`] wires these together from an [`ExecutorConfig`].

pub mod config;
pub mod dedup;
pub mod dispatcher;
pub mod emitter;
pub mod envelope;
pub mod error;
pub mod lease;
pub mod processor;
pub mod queue;
pub mod service;
pub mod stats;
pub mod telemetry;

pub use config::{CacheBackend, ExecutorConfig};
pub use dedup::{build_dedup_cache, DedupCache, DynamoDbDedupCache, LocalDedupCache, NoopDedupCache};
pub use dispatcher::{AnalyzerOutcome, DispatchError, DispatchInput, DispatchSummary, Dispatcher};
pub use emitter::{EmitError, HitEmitter, SqsHitEmitter};
pub use envelope::{Envelope, ObjectLocation};
pub use error::{ConfigError, ExecutorError};
pub use lease::{Lease, LeaseError, LeaseManager, ScheduleError};
pub use processor::{MessageProcessor, ProcessError, ProcessOutcome};
pub use queue::{QueueBroker, QueueError, ReceivedMessage, SqsBroker};
pub use service::{ExecutorService, MessageDisposition};
pub use stats::{PipelineStats, StatsSnapshot};
pub use telemetry::{init_tracing, LogFormat};

use aws_config::BehaviorVersion;
use lensgraph_core::GraphQueryApi;
use lensgraph_plugins::{AnalyzerRegistry, ManifestLoader, RegistryConfig, S3ObjectStore};
use lensgraph_rpc::GrpcGraphQueryClient;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Start the pipeline and run until `shutdown` resolves.
///
/// Startup is fail-fast: configuration, the graph-store handshake and the
/// registry load all happen before the first poll.
pub async fn run<S>(config: ExecutorConfig, shutdown: S) -> Result<StatsSnapshot, ExecutorError>
where
    S: Future<Output = ()>,
{
    config.validate()?;
    let tenant_id = config.tenant_id()?;

    let sdk_config = aws_config::defaults(BehaviorVersion::latest()).load().await;

    let graph: Arc<dyn GraphQueryApi> = Arc::new(
        GrpcGraphQueryClient::connect(config.graph.endpoint.clone())
            .await
            .map_err(|e| ExecutorError::Startup(format!("graph store unreachable: {}", e)))?,
    );

    let store = Arc::new(S3ObjectStore::new(
        &sdk_config,
        config.object_store.endpoint.as_deref(),
    ));
    let registry_config = RegistryConfig::new(
        config.object_store.bucket.clone(),
        config.object_store.sandbox_root.clone(),
    )
    .with_prefix(config.object_store.prefix.clone())
    .with_force_fetch(config.object_store.force_fetch);
    let registry = AnalyzerRegistry::load(
        store.as_ref(),
        &registry_config,
        &ManifestLoader::new(),
        Arc::clone(&graph),
    )
    .await?;
    info!(
        analyzers = registry.len(),
        names = ?registry.names(),
        "Analyzer registry loaded"
    );

    let cache = build_dedup_cache(&config.cache, &sdk_config).await;
    let emitter = Arc::new(SqsHitEmitter::new(
        &sdk_config,
        config.emitter.queue_url.clone(),
        config.emitter.endpoint.as_deref(),
        Duration::from_secs(config.emitter.retry_budget_secs),
    ));

    let broker = Arc::new(SqsBroker::new(
        &sdk_config,
        config.queue.url.clone(),
        config.queue.endpoint.as_deref(),
        Duration::from_secs(config.queue.wait_time_secs),
    ));
    let lease = Arc::new(LeaseManager::new(
        broker,
        config.queue.visibility_timeout_secs,
        config.queue.max_keep_alive_loops,
    )?);

    let stats = Arc::new(PipelineStats::new());
    let dispatcher = Dispatcher::new(Arc::new(registry), cache, emitter, Arc::clone(&stats));
    let processor = Arc::new(MessageProcessor::new(store, dispatcher, tenant_id));

    let idle_delay = if config.queue.wait_time_secs == 0 {
        Duration::from_secs(1)
    } else {
        Duration::ZERO
    };
    let service = ExecutorService::new(lease, processor, Arc::clone(&stats), config.runtime.concurrency)
        .with_idle_delay(idle_delay);

    info!(
        queue = %config.queue.url,
        visibility_secs = config.queue.visibility_timeout_secs,
        keep_alive_loops = config.queue.max_keep_alive_loops,
        "Lensgraph executor running"
    );
    service.run_until(shutdown).await?;

    let snapshot = stats.snapshot();
    info!(
        received = snapshot.messages_received,
        deleted = snapshot.messages_deleted,
        timed_out = snapshot.messages_timed_out,
        hits = snapshot.hits_emitted,
        "Lensgraph executor stopped"
    );
    Ok(snapshot)
}

/// Resolves on Ctrl-C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
