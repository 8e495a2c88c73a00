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

//! Executor configuration
//!
//! Layered: TOML file, then `LENSGRAPH_*` environment variables, then CLI
//! flags (applied by the binary). [`ExecutorConfig::validate`] fails fast on
//! anything missing.

use crate::error::ConfigError;
use crate::telemetry::LogFormat;
use lensgraph_core::TenantId;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ExecutorConfig {
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub object_store: ObjectStoreConfig,
    #[serde(default)]
    pub graph: GraphConfig,
    #[serde(default)]
    pub emitter: EmitterConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub tenant: TenantConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueConfig {
    /// Work queue URL (required)
    #[serde(default)]
    pub url: String,

    /// Broker endpoint override (LocalStack, ElasticMQ)
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Long-poll wait per receive, capped at 20 by SQS
    #[serde(default = "default_wait_time_secs")]
    pub wait_time_secs: u64,

    /// `V`: must exceed 10
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u32,

    /// `N`
    #[serde(default = "default_max_keep_alive_loops")]
    pub max_keep_alive_loops: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObjectStoreConfig {
    /// Bucket holding analyzer artifacts (required)
    #[serde(default)]
    pub bucket: String,

    #[serde(default = "default_prefix")]
    pub prefix: String,

    #[serde(default = "default_sandbox_root")]
    pub sandbox_root: PathBuf,

    #[serde(default)]
    pub force_fetch: bool,

    #[serde(default)]
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct GraphConfig {
    /// Graph query service endpoint (required)
    #[serde(default)]
    pub endpoint: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EmitterConfig {
    /// Downstream queue for hits (required)
    #[serde(default)]
    pub queue_url: String,

    #[serde(default)]
    pub endpoint: Option<String>,

    /// Total time spent retrying one publish
    #[serde(default = "default_emit_budget_secs")]
    pub retry_budget_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheBackend {
    Dynamodb,
    Local,
    None,
}

impl FromStr for CacheBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "dynamodb" => Ok(CacheBackend::Dynamodb),
            "local" => Ok(CacheBackend::Local),
            "none" => Ok(CacheBackend::None),
            other => Err(ConfigError::Invalid {
                variable: "LENSGRAPH_CACHE_BACKEND",
                reason: format!("unknown backend '{}'", other),
            }),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_backend")]
    pub backend: CacheBackend,

    /// DynamoDB table; when unset the cache degrades to a no-op
    #[serde(default)]
    pub table: Option<String>,

    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,

    #[serde(default = "default_local_capacity")]
    pub local_capacity: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RuntimeConfig {
    /// In-flight leases
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default)]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TenantConfig {
    /// Tenant UUID (required)
    #[serde(default)]
    pub id: String,
}

fn default_wait_time_secs() -> u64 {
    20
}

fn default_visibility_timeout_secs() -> u32 {
    30
}

fn default_max_keep_alive_loops() -> u32 {
    10
}

fn default_prefix() -> String {
    lensgraph_plugins::DEFAULT_ANALYZER_PREFIX.to_string()
}

fn default_sandbox_root() -> PathBuf {
    PathBuf::from("/tmp/lensgraph-analyzers")
}

fn default_emit_budget_secs() -> u64 {
    30
}

fn default_cache_backend() -> CacheBackend {
    CacheBackend::Dynamodb
}

fn default_cache_ttl_secs() -> u64 {
    24 * 60 * 60
}

fn default_local_capacity() -> u64 {
    100_000
}

fn default_concurrency() -> usize {
    10
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            endpoint: None,
            wait_time_secs: default_wait_time_secs(),
            visibility_timeout_secs: default_visibility_timeout_secs(),
            max_keep_alive_loops: default_max_keep_alive_loops(),
        }
    }
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            prefix: default_prefix(),
            sandbox_root: default_sandbox_root(),
            force_fetch: false,
            endpoint: None,
        }
    }
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self {
            queue_url: String::new(),
            endpoint: None,
            retry_budget_secs: default_emit_budget_secs(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: default_cache_backend(),
            table: None,
            endpoint: None,
            ttl_secs: default_cache_ttl_secs(),
            local_capacity: default_local_capacity(),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            log_format: LogFormat::default(),
        }
    }
}

fn parse_var<T: FromStr>(variable: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        variable,
        reason: e.to_string(),
    })
}

impl ExecutorConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// File (if given) overlaid with the process environment.
    pub fn load(config_file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match config_file {
            Some(path) => {
                tracing::info!("Loading configuration from file: {:?}", path);
                Self::from_file(path)?
            }
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Overlay `LENSGRAPH_*` variables read through `lookup`.
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        let var = |name: &str| lookup(name).filter(|v| !v.is_empty());

        if let Some(v) = var("LENSGRAPH_QUEUE_URL") {
            self.queue.url = v;
        }
        if let Some(v) = var("LENSGRAPH_QUEUE_ENDPOINT") {
            self.queue.endpoint = Some(v);
        }
        if let Some(v) = var("LENSGRAPH_QUEUE_WAIT_TIME_SECS") {
            self.queue.wait_time_secs = parse_var("LENSGRAPH_QUEUE_WAIT_TIME_SECS", &v)?;
        }
        if let Some(v) = var("LENSGRAPH_VISIBILITY_TIMEOUT_SECS") {
            self.queue.visibility_timeout_secs = parse_var("LENSGRAPH_VISIBILITY_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = var("LENSGRAPH_MAX_KEEP_ALIVE_LOOPS") {
            self.queue.max_keep_alive_loops = parse_var("LENSGRAPH_MAX_KEEP_ALIVE_LOOPS", &v)?;
        }

        if let Some(v) = var("LENSGRAPH_ANALYZER_BUCKET") {
            self.object_store.bucket = v;
        }
        if let Some(v) = var("LENSGRAPH_ANALYZER_PREFIX") {
            self.object_store.prefix = v;
        }
        if let Some(v) = var("LENSGRAPH_SANDBOX_ROOT") {
            self.object_store.sandbox_root = PathBuf::from(v);
        }
        if let Some(v) = var("LENSGRAPH_FORCE_FETCH") {
            self.object_store.force_fetch = parse_var("LENSGRAPH_FORCE_FETCH", &v)?;
        }
        if let Some(v) = var("LENSGRAPH_OBJECT_STORE_ENDPOINT") {
            self.object_store.endpoint = Some(v);
        }

        if let Some(v) = var("LENSGRAPH_GRAPH_QUERY_ENDPOINT") {
            self.graph.endpoint = v;
        }

        if let Some(v) = var("LENSGRAPH_EMITTER_QUEUE_URL") {
            self.emitter.queue_url = v;
        }
        if let Some(v) = var("LENSGRAPH_EMITTER_ENDPOINT") {
            self.emitter.endpoint = Some(v);
        }

        if let Some(v) = var("LENSGRAPH_CACHE_BACKEND") {
            self.cache.backend = v.parse()?;
        }
        if let Some(v) = var("LENSGRAPH_CACHE_TABLE") {
            self.cache.table = Some(v);
        }
        if let Some(v) = var("LENSGRAPH_CACHE_ENDPOINT") {
            self.cache.endpoint = Some(v);
        }
        if let Some(v) = var("LENSGRAPH_CACHE_TTL_SECS") {
            self.cache.ttl_secs = parse_var("LENSGRAPH_CACHE_TTL_SECS", &v)?;
        }

        if let Some(v) = var("LENSGRAPH_CONCURRENCY") {
            self.runtime.concurrency = parse_var("LENSGRAPH_CONCURRENCY", &v)?;
        }
        if let Some(v) = var("LENSGRAPH_LOG_FORMAT") {
            self.runtime.log_format = parse_var("LENSGRAPH_LOG_FORMAT", &v)?;
        }

        if let Some(v) = var("LENSGRAPH_TENANT_ID") {
            self.tenant.id = v;
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("LENSGRAPH_QUEUE_URL", &self.queue.url),
            ("LENSGRAPH_ANALYZER_BUCKET", &self.object_store.bucket),
            ("LENSGRAPH_GRAPH_QUERY_ENDPOINT", &self.graph.endpoint),
            ("LENSGRAPH_EMITTER_QUEUE_URL", &self.emitter.queue_url),
            ("LENSGRAPH_TENANT_ID", &self.tenant.id),
        ];
        for (variable, value) in required {
            if value.trim().is_empty() {
                return Err(ConfigError::MissingVariable(variable));
            }
        }

        if self.queue.visibility_timeout_secs <= crate::lease::KEEP_ALIVE_MARGIN_SECS {
            return Err(ConfigError::Invalid {
                variable: "LENSGRAPH_VISIBILITY_TIMEOUT_SECS",
                reason: format!(
                    "must exceed {} seconds, got {}",
                    crate::lease::KEEP_ALIVE_MARGIN_SECS,
                    self.queue.visibility_timeout_secs
                ),
            });
        }
        if self.queue.max_keep_alive_loops == 0 {
            return Err(ConfigError::Invalid {
                variable: "LENSGRAPH_MAX_KEEP_ALIVE_LOOPS",
                reason: "must be at least 1".into(),
            });
        }
        if self.runtime.concurrency == 0 {
            return Err(ConfigError::Invalid {
                variable: "LENSGRAPH_CONCURRENCY",
                reason: "must be at least 1".into(),
            });
        }

        self.tenant_id()?;
        Ok(())
    }

    pub fn tenant_id(&self) -> Result<TenantId, ConfigError> {
        self.tenant
            .id
            .trim()
            .parse()
            .map_err(|e: lensgraph_core::CoreError| ConfigError::Invalid {
                variable: "LENSGRAPH_TENANT_ID",
                reason: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const TENANT: &str = "6f1c2a57-8d7c-4a4e-9c55-3f1d2b9e0a11";

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    fn complete() -> ExecutorConfig {
        let mut config = ExecutorConfig::default();
        config
            .apply_env(env(&[
                ("LENSGRAPH_QUEUE_URL", "https://sqs/q"),
                ("LENSGRAPH_ANALYZER_BUCKET", "analyzers"),
                ("LENSGRAPH_GRAPH_QUERY_ENDPOINT", "http://graph:50051"),
                ("LENSGRAPH_EMITTER_QUEUE_URL", "https://sqs/hits"),
                ("LENSGRAPH_TENANT_ID", TENANT),
            ]))
            .unwrap();
        config
    }

    #[test]
    fn test_defaults() {
        let config = complete();
        config.validate().unwrap();
        assert_eq!(config.queue.visibility_timeout_secs, 30);
        assert_eq!(config.queue.max_keep_alive_loops, 10);
        assert_eq!(config.runtime.concurrency, 10);
        assert_eq!(config.object_store.prefix, "analyzers");
        assert_eq!(config.cache.backend, CacheBackend::Dynamodb);
        assert_eq!(config.tenant_id().unwrap().to_string(), TENANT);
    }

    #[test]
    fn test_missing_variable_is_named() {
        let mut config = complete();
        config.graph.endpoint.clear();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingVariable("LENSGRAPH_GRAPH_QUERY_ENDPOINT"))
        ));
    }

    #[test]
    fn test_short_visibility_rejected() {
        let mut config = complete();
        config
            .apply_env(env(&[("LENSGRAPH_VISIBILITY_TIMEOUT_SECS", "10")]))
            .unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                variable: "LENSGRAPH_VISIBILITY_TIMEOUT_SECS",
                ..
            })
        ));
    }

    #[test]
    fn test_unparseable_number_fails() {
        let mut config = ExecutorConfig::default();
        let err = config
            .apply_env(env(&[("LENSGRAPH_CONCURRENCY", "many")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                variable: "LENSGRAPH_CONCURRENCY",
                ..
            }
        ));
    }

    #[test]
    fn test_env_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("executor.toml");
        std::fs::write(
            &path,
            r#"
[queue]
url = "https://sqs/from-file"
visibility_timeout_secs = 45

[cache]
backend = "local"
ttl_secs = 60

[runtime]
concurrency = 4
log_format = "json"
"#,
        )
        .unwrap();

        let mut config = ExecutorConfig::from_file(&path).unwrap();
        assert_eq!(config.queue.visibility_timeout_secs, 45);
        assert_eq!(config.cache.backend, CacheBackend::Local);
        assert_eq!(config.runtime.log_format, LogFormat::Json);

        config
            .apply_env(env(&[("LENSGRAPH_QUEUE_URL", "https://sqs/from-env")]))
            .unwrap();
        assert_eq!(config.queue.url, "https://sqs/from-env");
        assert_eq!(config.runtime.concurrency, 4);
    }

    #[test]
    fn test_bad_tenant_rejected() {
        let mut config = complete();
        config.tenant.id = "not-a-uuid".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                variable: "LENSGRAPH_TENANT_ID",
                ..
            })
        ));
    }
}
