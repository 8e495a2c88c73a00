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

//! Analyzer manifest (`analyzer.toml`)
//!
//! Each analyzer directory carries a manifest describing the analyzer's
//! metadata, the subgraph it watches, how a hit is scored, and where its
//! code runs:
//!
//! ```toml
//! [analyzer]
//! name = "suspicious-svchost"
//! version = "1.0.0"
//!
//! [entry]
//! kind = "remote"
//! endpoint = "http://127.0.0.1:50061"
//!
//! [query]
//! root = "child"
//!
//! [query.nodes.child]
//! type = "Process"
//!
//! [[query.nodes.child.string]]
//! property = "process_name"
//! all = [{ operation = "equal", value = "svchost.exe" }]
//!
//! [query.nodes.parent]
//! type = "Process"
//!
//! [[query.edges]]
//! src = "parent"
//! forward = "children"
//! reverse = "parent"
//! dst = "child"
//!
//! [hit]
//! score = 75
//! ```

use crate::error::{PluginError, PluginResult};
use crate::{MANIFEST_FILENAME, MAX_SCHEMA_VERSION};
use lensgraph_core::{
    AnalyzerName, EdgeName, GraphQuery, GraphQueryBuilder, Int64Filter, LensRef, NodeType,
    PropertyName, QueryNodeId, StringFilter, UInt64Filter,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzerManifest {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,

    pub analyzer: AnalyzerMetadata,

    pub entry: EntryPoint,

    pub query: QuerySpec,

    #[serde(default)]
    pub hit: HitSpec,
}

fn default_schema_version() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzerMetadata {
    /// Must equal the analyzer's directory name in the object store
    pub name: AnalyzerName,

    /// Analyzer version (semver)
    pub version: String,

    #[serde(default)]
    pub description: String,
}

/// Where the analyzer's `analyze` / `add_context` run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntryPoint {
    /// Every match is a hit; no user code
    Declarative,
    /// A sandbox worker serving `AnalyzerService`
    Remote { endpoint: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuerySpec {
    /// Label of the root node
    pub root: String,

    /// Node patterns keyed by label
    pub nodes: BTreeMap<String, NodeSpec>,

    #[serde(default)]
    pub edges: Vec<EdgeSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    #[serde(rename = "type")]
    pub node_type: NodeType,

    #[serde(default)]
    pub string: Vec<FilterGroup<StringFilter>>,

    #[serde(default)]
    pub int64: Vec<FilterGroup<Int64Filter>>,

    #[serde(default)]
    pub uint64: Vec<FilterGroup<UInt64Filter>>,
}

/// Filters that must all hold. Repeated groups on one property are OR-ed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterGroup<F> {
    pub property: PropertyName,
    pub all: Vec<F>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeSpec {
    pub src: String,
    pub forward: EdgeName,
    pub reverse: EdgeName,
    pub dst: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HitSpec {
    #[serde(default)]
    pub score: i32,

    #[serde(default)]
    pub lenses: Vec<LensRef>,
}

impl AnalyzerManifest {
    pub fn from_file(path: &Path) -> PluginResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| PluginError::ManifestNotFound(format!("{}: {}", path.display(), e)))?;
        Self::from_str(&content)
    }

    pub fn from_directory(dir: &Path) -> PluginResult<Self> {
        Self::from_file(&dir.join(MANIFEST_FILENAME))
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> PluginResult<Self> {
        let manifest: AnalyzerManifest = toml::from_str(content)?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn validate(&self) -> PluginResult<()> {
        if self.schema_version == 0 || self.schema_version > MAX_SCHEMA_VERSION {
            return Err(PluginError::UnsupportedSchemaVersion(
                self.schema_version,
                MAX_SCHEMA_VERSION,
            ));
        }

        semver::Version::parse(&self.analyzer.version)?;

        if let EntryPoint::Remote { endpoint } = &self.entry {
            if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
                return Err(PluginError::InvalidManifest(format!(
                    "Remote endpoint must be an http(s) URL: {}",
                    endpoint
                )));
            }
        }

        if self.query.nodes.is_empty() {
            return Err(PluginError::InvalidManifest(
                "Query must declare at least one node".into(),
            ));
        }
        if !self.query.nodes.contains_key(&self.query.root) {
            return Err(PluginError::InvalidManifest(format!(
                "Query root '{}' is not a declared node",
                self.query.root
            )));
        }
        for edge in &self.query.edges {
            for label in [&edge.src, &edge.dst] {
                if !self.query.nodes.contains_key(label) {
                    return Err(PluginError::InvalidManifest(format!(
                        "Edge references unknown node '{}'",
                        label
                    )));
                }
            }
        }
        for (label, node) in &self.query.nodes {
            let empty = node.string.iter().any(|g| g.all.is_empty())
                || node.int64.iter().any(|g| g.all.is_empty())
                || node.uint64.iter().any(|g| g.all.is_empty());
            if empty {
                return Err(PluginError::InvalidManifest(format!(
                    "Node '{}' has an empty filter group",
                    label
                )));
            }
        }

        for lens in &self.hit.lenses {
            LensRef::new(lens.namespace.clone(), lens.name.clone())?;
        }

        Ok(())
    }

    pub fn name(&self) -> &AnalyzerName {
        &self.analyzer.name
    }

    pub fn version(&self) -> PluginResult<semver::Version> {
        Ok(semver::Version::parse(&self.analyzer.version)?)
    }

    /// Build the declared query. Node ids follow label order, so the same
    /// manifest always yields the same query.
    pub fn to_query(&self) -> PluginResult<GraphQuery> {
        let mut builder = GraphQueryBuilder::new();
        let mut ids: HashMap<&str, QueryNodeId> = HashMap::new();

        for (label, spec) in &self.query.nodes {
            let id = builder.node(spec.node_type.clone());
            ids.insert(label.as_str(), id);
            for group in &spec.string {
                builder.with_string_filters(id, group.property.clone(), group.all.clone())?;
            }
            for group in &spec.int64 {
                builder.with_int64_filters(id, group.property.clone(), group.all.clone())?;
            }
            for group in &spec.uint64 {
                builder.with_uint64_filters(id, group.property.clone(), group.all.clone())?;
            }
        }

        let lookup = |label: &str| {
            ids.get(label).copied().ok_or_else(|| {
                PluginError::InvalidManifest(format!("Unknown node label '{}'", label))
            })
        };

        for edge in &self.query.edges {
            builder.with_edge(
                lookup(&edge.src)?,
                edge.forward.clone(),
                edge.reverse.clone(),
                lookup(&edge.dst)?,
            )?;
        }

        Ok(builder.build(lookup(&self.query.root)?)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lensgraph_core::{PropertyUpdate, ScalarKind, Uid, Update};

    const SVCHOST_MANIFEST: &str = r#"
[analyzer]
name = "suspicious-svchost"
version = "1.2.0"
description = "svchost.exe with an unexpected parent"

[entry]
kind = "remote"
endpoint = "http://127.0.0.1:50061"

[query]
root = "child"

[query.nodes.child]
type = "Process"

[[query.nodes.child.string]]
property = "process_name"
all = [{ operation = "equal", value = "svchost.exe" }]

[query.nodes.parent]
type = "Process"

[[query.nodes.parent.string]]
property = "process_name"
all = [{ operation = "equal", value = "services.exe", negated = true }]

[[query.edges]]
src = "parent"
forward = "children"
reverse = "parent"
dst = "child"

[hit]
score = 75
lenses = [{ namespace = "hostname", name = "DESKTOP-1" }]
"#;

    #[test]
    fn test_parse_manifest() {
        let manifest = AnalyzerManifest::from_str(SVCHOST_MANIFEST).unwrap();
        assert_eq!(manifest.schema_version, 1);
        assert_eq!(manifest.name().as_str(), "suspicious-svchost");
        assert_eq!(manifest.version().unwrap(), semver::Version::new(1, 2, 0));
        assert_eq!(
            manifest.entry,
            EntryPoint::Remote {
                endpoint: "http://127.0.0.1:50061".into()
            }
        );
        assert_eq!(manifest.hit.score, 75);
        assert_eq!(manifest.hit.lenses.len(), 1);
    }

    #[test]
    fn test_to_query() {
        let manifest = AnalyzerManifest::from_str(SVCHOST_MANIFEST).unwrap();
        let query = manifest.to_query().unwrap();
        assert_eq!(query.node_count(), 2);
        assert_eq!(query.edges().len(), 1);
        assert_eq!(query.root_node().node_type.as_str(), "Process");
        assert!(query.has_property_filter(ScalarKind::String, "process_name"));

        let update = Update::StringProperty(PropertyUpdate {
            uid: Uid::new(42).unwrap(),
            property_name: PropertyName::new("pid").unwrap(),
        });
        assert!(!query.may_be_affected_by(&update));

        // deterministic across builds
        assert_eq!(query, manifest.to_query().unwrap());
    }

    #[test]
    fn test_declarative_entry() {
        let manifest = AnalyzerManifest::from_str(
            r#"
[analyzer]
name = "any-process"
version = "0.1.0"

[entry]
kind = "declarative"

[query]
root = "p"

[query.nodes.p]
type = "Process"
"#,
        )
        .unwrap();
        assert_eq!(manifest.entry, EntryPoint::Declarative);
        assert_eq!(manifest.hit.score, 0);
    }

    #[test]
    fn test_rejects_bad_manifests() {
        let unknown_root = SVCHOST_MANIFEST.replace("root = \"child\"", "root = \"ghost\"");
        assert!(matches!(
            AnalyzerManifest::from_str(&unknown_root),
            Err(PluginError::InvalidManifest(_))
        ));

        let bad_version = SVCHOST_MANIFEST.replace("1.2.0", "one");
        assert!(matches!(
            AnalyzerManifest::from_str(&bad_version),
            Err(PluginError::InvalidManifest(_))
        ));

        let future_schema = format!("schema_version = 9\n{}", SVCHOST_MANIFEST);
        assert!(matches!(
            AnalyzerManifest::from_str(&future_schema),
            Err(PluginError::UnsupportedSchemaVersion(9, 1))
        ));

        let bad_endpoint = SVCHOST_MANIFEST.replace("http://127.0.0.1:50061", "unix:/tmp/sock");
        assert!(matches!(
            AnalyzerManifest::from_str(&bad_endpoint),
            Err(PluginError::InvalidManifest(_))
        ));

        let bad_property = SVCHOST_MANIFEST.replace("property = \"process_name\"", "property = \"ProcessName\"");
        assert!(matches!(
            AnalyzerManifest::from_str(&bad_property),
            Err(PluginError::ManifestParseError(_))
        ));
    }

    #[test]
    fn test_disconnected_query_fails_to_build() {
        let manifest = AnalyzerManifest::from_str(&SVCHOST_MANIFEST.replace(
            "[[query.edges]]\nsrc = \"parent\"\nforward = \"children\"\nreverse = \"parent\"\ndst = \"child\"\n",
            "",
        ))
        .unwrap();
        assert!(matches!(manifest.to_query(), Err(PluginError::Core(_))));
    }
}
