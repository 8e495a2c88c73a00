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

//! Analyzer registry
//!
//! Built once at startup: every analyzer found under
//! `<bucket>/<prefix>/<analyzer_name>/...` is copied into
//! `<sandbox_root>/<analyzer_name>/`, handed to the loader, and registered
//! with the query it declared. The registry is never modified afterwards.

use crate::error::{PluginError, PluginResult};
use crate::executor::AnalyzerExecutor;
use crate::loader::{AnalyzerLoader, LoadedAnalyzer};
use crate::object_store::{ObjectStore, ObjectSummary};
use crate::DEFAULT_ANALYZER_PREFIX;
use bytes::Bytes;
use chrono::Utc;
use lensgraph_core::{AnalyzerName, AnalyzerRunner, GraphQuery, GraphQueryApi};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub bucket: String,
    pub prefix: String,
    pub sandbox_root: PathBuf,
    /// Re-download files already present in the sandbox
    pub force_fetch: bool,
}

impl RegistryConfig {
    pub fn new(bucket: impl Into<String>, sandbox_root: impl Into<PathBuf>) -> Self {
        Self {
            bucket: bucket.into(),
            prefix: DEFAULT_ANALYZER_PREFIX.to_string(),
            sandbox_root: sandbox_root.into(),
            force_fetch: false,
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_force_fetch(mut self, force_fetch: bool) -> Self {
        self.force_fetch = force_fetch;
        self
    }

    /// Listing prefix with exactly one trailing slash, or empty.
    fn list_prefix(&self) -> String {
        let trimmed = self.prefix.trim_matches('/');
        if trimmed.is_empty() {
            String::new()
        } else {
            format!("{}/", trimmed)
        }
    }
}

/// One registered analyzer
pub struct AnalyzerRegistration {
    pub name: AnalyzerName,
    /// Object-store prefix the analyzer was loaded from
    pub artifact_key: String,
    /// Fixed for the life of the process
    pub query: GraphQuery,
    pub runner: Arc<dyn AnalyzerRunner>,
    /// Hex SHA-256 over the analyzer's files
    pub content_hash: String,
}

impl std::fmt::Debug for AnalyzerRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalyzerRegistration")
            .field("name", &self.name)
            .field("artifact_key", &self.artifact_key)
            .field("content_hash", &self.content_hash)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub struct AnalyzerRegistry {
    analyzers: BTreeMap<AnalyzerName, Arc<AnalyzerRegistration>>,
}

impl AnalyzerRegistry {
    /// Discover, fetch, verify and load every analyzer under the configured
    /// prefix. Any failure aborts the whole load.
    pub async fn load(
        store: &dyn ObjectStore,
        config: &RegistryConfig,
        loader: &dyn AnalyzerLoader,
        graph: Arc<dyn GraphQueryApi>,
    ) -> PluginResult<Self> {
        let list_prefix = config.list_prefix();
        let objects = store.list(&config.bucket, &list_prefix).await?;
        let grouped = group_by_analyzer(&list_prefix, objects)?;
        let process_start = Utc::now();

        info!(
            bucket = %config.bucket,
            prefix = %list_prefix,
            analyzers = grouped.len(),
            "Loading analyzers"
        );

        let mut registrations = Vec::with_capacity(grouped.len());
        for (name, files) in grouped {
            let name = AnalyzerName::new(name)?;
            let dir = config.sandbox_root.join(name.as_str());
            let artifact_key = format!("{}{}/", list_prefix, name);

            let content_hash = materialize(store, config, &artifact_key, &dir, &files).await?;

            let (query, runner): (GraphQuery, Arc<dyn AnalyzerRunner>) =
                match loader.load(&name, &dir)? {
                    LoadedAnalyzer::InProcess(analyzer) => {
                        let query = analyzer.query();
                        let executor = AnalyzerExecutor::new(
                            name.clone(),
                            analyzer,
                            query.clone(),
                            graph.clone(),
                        )
                        .with_process_start(process_start);
                        (query, Arc::new(executor))
                    }
                    LoadedAnalyzer::Remote { query, runner } => (query, runner),
                };

            info!(
                analyzer = %name,
                files = files.len(),
                content_hash = %content_hash,
                "Registered analyzer"
            );

            registrations.push(AnalyzerRegistration {
                name,
                artifact_key,
                query,
                runner,
                content_hash,
            });
        }

        Self::from_registrations(registrations)
    }

    pub fn from_registrations(
        registrations: impl IntoIterator<Item = AnalyzerRegistration>,
    ) -> PluginResult<Self> {
        let mut analyzers = BTreeMap::new();
        for registration in registrations {
            let name = registration.name.clone();
            if analyzers.insert(name.clone(), Arc::new(registration)).is_some() {
                return Err(PluginError::DuplicateAnalyzer(name.to_string()));
            }
        }
        Ok(Self { analyzers })
    }

    pub fn get(&self, name: &str) -> Option<&Arc<AnalyzerRegistration>> {
        self.analyzers.get(name)
    }

    /// Registrations in name order
    pub fn iter(&self) -> impl Iterator<Item = &Arc<AnalyzerRegistration>> {
        self.analyzers.values()
    }

    pub fn names(&self) -> Vec<&AnalyzerName> {
        self.analyzers.keys().collect()
    }

    pub fn len(&self) -> usize {
        self.analyzers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.analyzers.is_empty()
    }
}

/// Relative file within an analyzer directory
struct ArtifactFile {
    key: String,
    relative: String,
    size: u64,
}

fn group_by_analyzer(
    list_prefix: &str,
    objects: Vec<ObjectSummary>,
) -> PluginResult<BTreeMap<String, Vec<ArtifactFile>>> {
    let mut grouped: BTreeMap<String, Vec<ArtifactFile>> = BTreeMap::new();
    for object in objects {
        let Some(rest) = object.key.strip_prefix(list_prefix) else {
            continue;
        };
        if rest.is_empty() || rest.ends_with('/') {
            continue;
        }
        let Some((name, relative)) = rest.split_once('/') else {
            debug!(key = %object.key, "Ignoring object outside any analyzer directory");
            continue;
        };
        safe_relative_path(relative)?;
        grouped.entry(name.to_string()).or_default().push(ArtifactFile {
            key: object.key.clone(),
            relative: relative.to_string(),
            size: object.size,
        });
    }
    for files in grouped.values_mut() {
        files.sort_by(|a, b| a.relative.cmp(&b.relative));
    }
    Ok(grouped)
}

fn safe_relative_path(relative: &str) -> PluginResult<PathBuf> {
    let path = Path::new(relative);
    if relative.is_empty() || !path.components().all(|c| matches!(c, Component::Normal(_))) {
        return Err(PluginError::UnsafePath(relative.to_string()));
    }
    Ok(path.to_path_buf())
}

/// Copy an analyzer's files into `dir` and return the content hash:
/// SHA-256 over, for each file in path order,
/// `u64_be(len(path)) || path || u64_be(len(data)) || data`.
async fn materialize(
    store: &dyn ObjectStore,
    config: &RegistryConfig,
    artifact_key: &str,
    dir: &Path,
    files: &[ArtifactFile],
) -> PluginResult<String> {
    let mut hasher = Sha256::new();

    for file in files {
        let target = dir.join(safe_relative_path(&file.relative)?);

        let existing = matches!(
            tokio::fs::metadata(&target).await,
            Ok(meta) if meta.is_file() && meta.len() == file.size
        );

        let data = if existing && !config.force_fetch {
            debug!(path = %target.display(), "Reusing sandbox file");
            Bytes::from(tokio::fs::read(&target).await?)
        } else {
            let data = store.get(&config.bucket, &file.key).await?;
            if data.len() as u64 != file.size {
                return Err(PluginError::IntegrityCheckFailed(format!(
                    "{}{}: listed {} bytes, fetched {}",
                    artifact_key,
                    file.relative,
                    file.size,
                    data.len()
                )));
            }
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&target, &data).await?;
            data
        };

        hasher.update((file.relative.len() as u64).to_be_bytes());
        hasher.update(file.relative.as_bytes());
        hasher.update((data.len() as u64).to_be_bytes());
        hasher.update(&data);
    }

    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(key: &str, size: u64) -> ObjectSummary {
        ObjectSummary {
            key: key.to_string(),
            size,
        }
    }

    #[test]
    fn test_group_by_first_segment() {
        let grouped = group_by_analyzer(
            "analyzers/",
            vec![
                summary("analyzers/b/analyzer.toml", 1),
                summary("analyzers/a/lib/x.bin", 2),
                summary("analyzers/a/analyzer.toml", 3),
                summary("analyzers/README", 4),
                summary("analyzers/a/", 0),
            ],
        )
        .unwrap();
        let names: Vec<_> = grouped.keys().cloned().collect();
        assert_eq!(names, vec!["a", "b"]);
        let a: Vec<_> = grouped["a"].iter().map(|f| f.relative.as_str()).collect();
        assert_eq!(a, vec!["analyzer.toml", "lib/x.bin"]);
    }

    #[test]
    fn test_rejects_traversal() {
        let err = group_by_analyzer("analyzers/", vec![summary("analyzers/a/../../etc/passwd", 1)]);
        assert!(matches!(err, Err(PluginError::UnsafePath(_))));
    }

    #[test]
    fn test_list_prefix_normalization() {
        let config = RegistryConfig::new("bucket", "/tmp/x");
        assert_eq!(config.list_prefix(), "analyzers/");
        assert_eq!(config.clone().with_prefix("/a/b/").list_prefix(), "a/b/");
        assert_eq!(config.with_prefix("").list_prefix(), "");
    }
}
