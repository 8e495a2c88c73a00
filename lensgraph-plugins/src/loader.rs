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

//! Turning a materialized analyzer directory into something runnable

use crate::declarative::DeclarativeAnalyzer;
use crate::error::{PluginError, PluginResult};
use crate::manifest::{AnalyzerManifest, EntryPoint};
use lensgraph_core::{Analyzer, AnalyzerName, AnalyzerRunner, GraphQuery};
use lensgraph_rpc::RemoteAnalyzer;
use std::path::Path;
use std::sync::Arc;

/// Result of loading one analyzer
pub enum LoadedAnalyzer {
    /// Runs inside this process. The registry calls `query()` on it once.
    InProcess(Arc<dyn Analyzer>),
    /// Runs elsewhere; the query was declared up front.
    Remote {
        query: GraphQuery,
        runner: Arc<dyn AnalyzerRunner>,
    },
}

impl std::fmt::Debug for LoadedAnalyzer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadedAnalyzer::InProcess(_) => f.write_str("LoadedAnalyzer::InProcess"),
            LoadedAnalyzer::Remote { query, .. } => f
                .debug_struct("LoadedAnalyzer::Remote")
                .field("root", &query.root())
                .finish_non_exhaustive(),
        }
    }
}

/// Host-supplied loading mechanism
pub trait AnalyzerLoader: Send + Sync {
    fn load(&self, name: &AnalyzerName, dir: &Path) -> PluginResult<LoadedAnalyzer>;
}

/// Loads analyzers described by an `analyzer.toml` manifest
#[derive(Debug, Clone, Copy, Default)]
pub struct ManifestLoader;

impl ManifestLoader {
    pub fn new() -> Self {
        Self
    }
}

impl AnalyzerLoader for ManifestLoader {
    fn load(&self, name: &AnalyzerName, dir: &Path) -> PluginResult<LoadedAnalyzer> {
        let manifest = AnalyzerManifest::from_directory(dir)?;
        if manifest.name() != name {
            return Err(PluginError::LoadFailed {
                name: name.to_string(),
                reason: format!(
                    "manifest declares '{}' but the artifact directory is '{}'",
                    manifest.name(),
                    name
                ),
            });
        }

        match &manifest.entry {
            EntryPoint::Declarative => Ok(LoadedAnalyzer::InProcess(Arc::new(
                DeclarativeAnalyzer::from_manifest(&manifest)?,
            ))),
            EntryPoint::Remote { endpoint } => {
                let runner = RemoteAnalyzer::connect_lazy(name.clone(), endpoint).map_err(|e| {
                    PluginError::LoadFailed {
                        name: name.to_string(),
                        reason: e.to_string(),
                    }
                })?;
                Ok(LoadedAnalyzer::Remote {
                    query: manifest.to_query()?,
                    runner: Arc::new(runner),
                })
            }
        }
    }
}
