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

use async_trait::async_trait;
use bytes::Bytes;
use lensgraph_core::{
    Analyzer, AnalyzerContext, AnalyzerError, AnalyzerName, ExecutionHit, GraphQuery,
    InMemoryGraph, NodeProperties, NodeType, NodeView, PropertyName, PropertyUpdate, RunRequest,
    TenantId, Uid, Update,
};
use lensgraph_plugins::{
    AnalyzerLoader, AnalyzerManifest, AnalyzerRegistry, DeclarativeAnalyzer, LoadedAnalyzer,
    LocalObjectStore, ManifestLoader, ObjectStore, ObjectSummary, PluginError, PluginResult,
    RegistryConfig,
};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

const BUCKET: &str = "artifacts";

const MANIFEST: &str = r#"
[analyzer]
name = "svchost"
version = "1.0.0"

[entry]
kind = "declarative"

[query]
root = "p"

[query.nodes.p]
type = "Process"

[[query.nodes.p.string]]
property = "process_name"
all = [{ operation = "equal", value = "svchost.exe" }]

[hit]
score = 40
"#;

async fn seeded_store(root: &Path) -> LocalObjectStore {
    let store = LocalObjectStore::new(root);
    store
        .put(BUCKET, "analyzers/svchost/analyzer.toml", MANIFEST.as_bytes())
        .await
        .unwrap();
    store
        .put(BUCKET, "analyzers/svchost/notes/readme.txt", b"hello")
        .await
        .unwrap();
    store
}

fn graph() -> Arc<InMemoryGraph> {
    let graph = InMemoryGraph::new();
    graph.insert_node(
        NodeProperties::new(Uid::new(42).unwrap(), NodeType::new("Process").unwrap())
            .with_string(PropertyName::new("process_name").unwrap(), "svchost.exe"),
    );
    Arc::new(graph)
}

/// Wraps the manifest's declarative analyzer and counts `query()` calls.
struct CountingAnalyzer {
    inner: DeclarativeAnalyzer,
    query_calls: Arc<AtomicU32>,
}

#[async_trait]
impl Analyzer for CountingAnalyzer {
    fn query(&self) -> GraphQuery {
        self.query_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.query()
    }

    async fn analyze(
        &self,
        root: NodeView<'_>,
        ctx: &AnalyzerContext,
    ) -> Result<Option<ExecutionHit>, AnalyzerError> {
        self.inner.analyze(root, ctx).await
    }
}

struct CountingLoader {
    query_calls: Arc<AtomicU32>,
}

impl AnalyzerLoader for CountingLoader {
    fn load(&self, _name: &AnalyzerName, dir: &Path) -> PluginResult<LoadedAnalyzer> {
        let manifest = AnalyzerManifest::from_directory(dir)?;
        Ok(LoadedAnalyzer::InProcess(Arc::new(CountingAnalyzer {
            inner: DeclarativeAnalyzer::from_manifest(&manifest)?,
            query_calls: self.query_calls.clone(),
        })))
    }
}

/// Reports a different size in listings than it serves.
struct LyingStore(LocalObjectStore);

#[async_trait]
impl ObjectStore for LyingStore {
    async fn list(&self, bucket: &str, prefix: &str) -> PluginResult<Vec<ObjectSummary>> {
        let mut listed = self.0.list(bucket, prefix).await?;
        for object in &mut listed {
            object.size += 1;
        }
        Ok(listed)
    }

    async fn get(&self, bucket: &str, key: &str) -> PluginResult<Bytes> {
        self.0.get(bucket, key).await
    }
}

fn run_request() -> RunRequest {
    RunRequest {
        tenant_id: TenantId::new(uuid::Uuid::new_v4()),
        update: Update::StringProperty(PropertyUpdate {
            uid: Uid::new(42).unwrap(),
            property_name: PropertyName::new("process_name").unwrap(),
        }),
        deadline: tokio::time::Instant::now() + Duration::from_secs(30),
    }
}

#[tokio::test]
async fn test_load_materializes_and_registers() {
    let store_dir = tempfile::tempdir().unwrap();
    let sandbox = tempfile::tempdir().unwrap();
    let store = seeded_store(store_dir.path()).await;
    let config = RegistryConfig::new(BUCKET, sandbox.path());

    let registry = AnalyzerRegistry::load(&store, &config, &ManifestLoader::new(), graph())
        .await
        .unwrap();

    assert_eq!(registry.len(), 1);
    let registration = registry.get("svchost").unwrap();
    assert_eq!(registration.artifact_key, "analyzers/svchost/");
    assert_eq!(registration.content_hash.len(), 64);
    assert_eq!(
        std::fs::read(sandbox.path().join("svchost/notes/readme.txt")).unwrap(),
        b"hello"
    );

    let result = registration.runner.run(run_request()).await.unwrap();
    let hit = result.into_hit().unwrap();
    assert_eq!(hit.analyzer_name.as_str(), "svchost");
    assert_eq!(hit.score, 40);
}

#[tokio::test]
async fn test_query_is_called_once() {
    let store_dir = tempfile::tempdir().unwrap();
    let sandbox = tempfile::tempdir().unwrap();
    let store = seeded_store(store_dir.path()).await;
    let query_calls = Arc::new(AtomicU32::new(0));
    let loader = CountingLoader {
        query_calls: query_calls.clone(),
    };

    let registry = AnalyzerRegistry::load(
        &store,
        &RegistryConfig::new(BUCKET, sandbox.path()),
        &loader,
        graph(),
    )
    .await
    .unwrap();

    let runner = registry.get("svchost").unwrap().runner.clone();
    for _ in 0..3 {
        runner.run(run_request()).await.unwrap();
    }
    assert_eq!(query_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_existing_files_are_reused_unless_forced() {
    let store_dir = tempfile::tempdir().unwrap();
    let sandbox = tempfile::tempdir().unwrap();
    let store = seeded_store(store_dir.path()).await;

    let readme = sandbox.path().join("svchost/notes/readme.txt");
    std::fs::create_dir_all(readme.parent().unwrap()).unwrap();
    std::fs::write(&readme, b"HELLO").unwrap();

    let config = RegistryConfig::new(BUCKET, sandbox.path());
    let reused = AnalyzerRegistry::load(&store, &config, &ManifestLoader::new(), graph())
        .await
        .unwrap();
    assert_eq!(std::fs::read(&readme).unwrap(), b"HELLO");

    let forced = AnalyzerRegistry::load(
        &store,
        &config.clone().with_force_fetch(true),
        &ManifestLoader::new(),
        graph(),
    )
    .await
    .unwrap();
    assert_eq!(std::fs::read(&readme).unwrap(), b"hello");

    assert_ne!(
        reused.get("svchost").unwrap().content_hash,
        forced.get("svchost").unwrap().content_hash
    );
}

#[tokio::test]
async fn test_size_mismatch_fails_load() {
    let store_dir = tempfile::tempdir().unwrap();
    let sandbox = tempfile::tempdir().unwrap();
    let store = LyingStore(seeded_store(store_dir.path()).await);

    let err = AnalyzerRegistry::load(
        &store,
        &RegistryConfig::new(BUCKET, sandbox.path()),
        &ManifestLoader::new(),
        graph(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, PluginError::IntegrityCheckFailed(_)));
}

#[tokio::test]
async fn test_invalid_manifest_fails_load() {
    let store_dir = tempfile::tempdir().unwrap();
    let sandbox = tempfile::tempdir().unwrap();
    let store = LocalObjectStore::new(store_dir.path());
    store
        .put(BUCKET, "analyzers/broken/analyzer.toml", b"[analyzer]\nname = 1\n")
        .await
        .unwrap();

    let err = AnalyzerRegistry::load(
        &store,
        &RegistryConfig::new(BUCKET, sandbox.path()),
        &ManifestLoader::new(),
        graph(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, PluginError::ManifestParseError(_)));
}
