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

//! Registry error types

use lensgraph_core::CoreError;
use thiserror::Error;

/// Result type for registry operations
pub type PluginResult<T> = Result<T, PluginError>;

/// Errors that can occur while discovering and loading analyzers
#[derive(Debug, Error)]
pub enum PluginError {
    // Manifest errors
    #[error("Manifest not found: {0}")]
    ManifestNotFound(String),

    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("Manifest parse error: {0}")]
    ManifestParseError(String),

    #[error("Schema version {0} not supported (max: {1})")]
    UnsupportedSchemaVersion(u32, u32),

    // Artifact errors
    #[error("Object store error: {0}")]
    ObjectStore(String),

    #[error("Unsafe artifact path: {0}")]
    UnsafePath(String),

    #[error("Integrity check failed: {0}")]
    IntegrityCheckFailed(String),

    // Runtime errors
    #[error("Analyzer {name} failed to load: {reason}")]
    LoadFailed { name: String, reason: String },

    #[error("Duplicate analyzer: {0}")]
    DuplicateAnalyzer(String),

    // Value errors
    #[error("Invalid value: {0}")]
    Core(#[from] CoreError),

    // IO errors
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<toml::de::Error> for PluginError {
    fn from(e: toml::de::Error) -> Self {
        PluginError::ManifestParseError(e.to_string())
    }
}

impl From<semver::Error> for PluginError {
    fn from(e: semver::Error) -> Self {
        PluginError::InvalidManifest(format!("Invalid version: {}", e))
    }
}
