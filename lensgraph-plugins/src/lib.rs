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

//! Lensgraph Analyzer Registry
//!
//! Discovers analyzer artifacts under an object-store prefix, materializes
//! them into a local sandbox directory, and turns each one into an
//! [`AnalyzerRegistration`] the dispatcher can invoke.
//!
//! ## Artifact layout
//!
//! ```text
//! <bucket>/<prefix>/<analyzer_name>/analyzer.toml
//! <bucket>/<prefix>/<analyzer_name>/...            (any supporting files)
//! ```
//!
//! The first path segment below the prefix is the analyzer name. How a
//! materialized directory becomes a runnable analyzer is up to the
//! [`AnalyzerLoader`]; [`ManifestLoader`] reads `analyzer.toml` and supports
//! declarative analyzers and analyzers hosted by a sandbox worker.

pub mod declarative;
pub mod error;
pub mod executor;
pub mod loader;
pub mod manifest;
pub mod object_store;
pub mod registry;

pub use declarative::DeclarativeAnalyzer;
pub use error::{PluginError, PluginResult};
pub use executor::AnalyzerExecutor;
pub use loader::{AnalyzerLoader, LoadedAnalyzer, ManifestLoader};
pub use manifest::{AnalyzerManifest, EntryPoint};
pub use object_store::{LocalObjectStore, ObjectStore, ObjectSummary, S3ObjectStore};
pub use registry::{AnalyzerRegistration, AnalyzerRegistry, RegistryConfig};

/// Manifest file name inside each analyzer directory
pub const MANIFEST_FILENAME: &str = "analyzer.toml";

/// Default object-store prefix holding analyzer artifacts
pub const DEFAULT_ANALYZER_PREFIX: &str = "analyzers";

/// Highest manifest schema version this build understands
pub const MAX_SCHEMA_VERSION: u32 = 1;
