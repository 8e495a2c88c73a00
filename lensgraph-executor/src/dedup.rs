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

//! Dedup cache
//!
//! Best-effort "have I seen this?" sets keyed by [`DedupKey`]. Every
//! backend swallows its own errors: an unreachable cache behaves as one
//! that has never seen anything.

use crate::config::{CacheBackend, CacheConfig};
use async_trait::async_trait;
use aws_sdk_dynamodb::error::{DisplayErrorContext, SdkError};
use aws_sdk_dynamodb::operation::put_item::PutItemError;
use aws_sdk_dynamodb::types::AttributeValue;
use lensgraph_core::{DedupKey, DedupNamespace};
use moka::sync::Cache;
use std::sync::{Arc, Once};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

const ATTR_PK: &str = "pk";
const ATTR_EXPIRES_AT: &str = "expires_at";

static DEGRADED_WARNING: Once = Once::new();

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("DynamoDB {operation} failed: {message}")]
    Backend {
        operation: &'static str,
        message: String,
    },
}

#[async_trait]
pub trait DedupCache: Send + Sync {
    async fn check(&self, namespace: DedupNamespace, key: &DedupKey) -> bool;

    async fn record(&self, namespace: DedupNamespace, key: &DedupKey);

    async fn forget(&self, namespace: DedupNamespace, key: &DedupKey);

    /// Record `key` and report whether it was already present. Backends
    /// with an atomic set-if-absent override this.
    async fn check_and_record(&self, namespace: DedupNamespace, key: &DedupKey) -> bool {
        if self.check(namespace, key).await {
            return true;
        }
        self.record(namespace, key).await;
        false
    }

    fn is_degraded(&self) -> bool {
        false
    }
}

/// Cache used when no backend is available: nothing is ever seen.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopDedupCache;

#[async_trait]
impl DedupCache for NoopDedupCache {
    async fn check(&self, _namespace: DedupNamespace, _key: &DedupKey) -> bool {
        false
    }

    async fn record(&self, _namespace: DedupNamespace, _key: &DedupKey) {}

    async fn forget(&self, _namespace: DedupNamespace, _key: &DedupKey) {}

    fn is_degraded(&self) -> bool {
        true
    }
}

/// Single-process cache with TTL eviction
#[derive(Clone)]
pub struct LocalDedupCache {
    entries: Cache<(DedupNamespace, DedupKey), ()>,
}

impl LocalDedupCache {
    pub fn new(max_capacity: u64, ttl: Duration) -> Self {
        Self {
            entries: Cache::builder()
                .max_capacity(max_capacity)
                .time_to_live(ttl)
                .build(),
        }
    }

    pub fn entry_count(&self) -> u64 {
        self.entries.run_pending_tasks();
        self.entries.entry_count()
    }
}

#[async_trait]
impl DedupCache for LocalDedupCache {
    async fn check(&self, namespace: DedupNamespace, key: &DedupKey) -> bool {
        self.entries.contains_key(&(namespace, key.clone()))
    }

    async fn record(&self, namespace: DedupNamespace, key: &DedupKey) {
        self.entries.insert((namespace, key.clone()), ());
    }

    async fn forget(&self, namespace: DedupNamespace, key: &DedupKey) {
        self.entries.invalidate(&(namespace, key.clone()));
    }

    async fn check_and_record(&self, namespace: DedupNamespace, key: &DedupKey) -> bool {
        !self
            .entries
            .entry((namespace, key.clone()))
            .or_insert(())
            .is_fresh()
    }
}

/// Shared cache in a DynamoDB table with a string partition key `pk` and
/// a numeric TTL attribute `expires_at` (epoch seconds).
#[derive(Debug, Clone)]
pub struct DynamoDbDedupCache {
    client: aws_sdk_dynamodb::Client,
    table: String,
    ttl: Duration,
}

impl DynamoDbDedupCache {
    pub fn new(
        sdk_config: &aws_config::SdkConfig,
        table: impl Into<String>,
        endpoint: Option<&str>,
        ttl: Duration,
    ) -> Self {
        let mut builder = aws_sdk_dynamodb::config::Builder::from(sdk_config);
        if let Some(endpoint) = endpoint {
            builder = builder.endpoint_url(endpoint);
        }
        Self::from_client(
            aws_sdk_dynamodb::Client::from_conf(builder.build()),
            table,
            ttl,
        )
    }

    pub fn from_client(client: aws_sdk_dynamodb::Client, table: impl Into<String>, ttl: Duration) -> Self {
        Self {
            client,
            table: table.into(),
            ttl,
        }
    }

    fn pk(namespace: DedupNamespace, key: &DedupKey) -> AttributeValue {
        AttributeValue::S(format!("{}#{}", namespace.as_str(), key.as_str()))
    }

    fn now_secs() -> i64 {
        chrono::Utc::now().timestamp()
    }

    fn expires_at(&self) -> AttributeValue {
        let ttl = i64::try_from(self.ttl.as_secs()).unwrap_or(i64::MAX);
        AttributeValue::N(Self::now_secs().saturating_add(ttl).to_string())
    }

    /// Confirm the table is reachable.
    pub async fn probe(&self) -> Result<(), CacheError> {
        self.client
            .describe_table()
            .table_name(&self.table)
            .send()
            .await
            .map_err(|e| CacheError::Backend {
                operation: "DescribeTable",
                message: DisplayErrorContext(&e).to_string(),
            })?;
        Ok(())
    }

    async fn try_check(&self, namespace: DedupNamespace, key: &DedupKey) -> Result<bool, CacheError> {
        let response = self
            .client
            .get_item()
            .table_name(&self.table)
            .key(ATTR_PK, Self::pk(namespace, key))
            .consistent_read(true)
            .send()
            .await
            .map_err(|e| CacheError::Backend {
                operation: "GetItem",
                message: DisplayErrorContext(&e).to_string(),
            })?;

        let live = response.item().is_some_and(|item| {
            item.get(ATTR_EXPIRES_AT)
                .and_then(|v| v.as_n().ok())
                .and_then(|n| n.parse::<i64>().ok())
                .map_or(true, |expires| expires > Self::now_secs())
        });
        Ok(live)
    }

    async fn try_record(
        &self,
        namespace: DedupNamespace,
        key: &DedupKey,
        only_if_absent: bool,
    ) -> Result<bool, CacheError> {
        let mut request = self
            .client
            .put_item()
            .table_name(&self.table)
            .item(ATTR_PK, Self::pk(namespace, key))
            .item(ATTR_EXPIRES_AT, self.expires_at());
        if only_if_absent {
            // an expired item that TTL has not reaped yet counts as absent
            request = request
                .condition_expression("attribute_not_exists(#pk) OR #exp < :now")
                .expression_attribute_names("#pk", ATTR_PK)
                .expression_attribute_names("#exp", ATTR_EXPIRES_AT)
                .expression_attribute_values(":now", AttributeValue::N(Self::now_secs().to_string()));
        }

        match request.send().await {
            Ok(_) => Ok(true),
            Err(e) if is_conditional_check_failed(&e) => Ok(false),
            Err(e) => Err(CacheError::Backend {
                operation: "PutItem",
                message: DisplayErrorContext(&e).to_string(),
            }),
        }
    }
}

fn is_conditional_check_failed<R>(err: &SdkError<PutItemError, R>) -> bool {
    match err {
        SdkError::ServiceError(service_err) => {
            matches!(
                service_err.err(),
                PutItemError::ConditionalCheckFailedException(_)
            )
        }
        _ => false,
    }
}

#[async_trait]
impl DedupCache for DynamoDbDedupCache {
    async fn check(&self, namespace: DedupNamespace, key: &DedupKey) -> bool {
        match self.try_check(namespace, key).await {
            Ok(seen) => seen,
            Err(e) => {
                warn!(namespace = %namespace, error = %e, "Dedup check failed; treating as unseen");
                false
            }
        }
    }

    async fn record(&self, namespace: DedupNamespace, key: &DedupKey) {
        if let Err(e) = self.try_record(namespace, key, false).await {
            warn!(namespace = %namespace, error = %e, "Dedup record failed");
        }
    }

    async fn forget(&self, namespace: DedupNamespace, key: &DedupKey) {
        let result = self
            .client
            .delete_item()
            .table_name(&self.table)
            .key(ATTR_PK, Self::pk(namespace, key))
            .send()
            .await;
        if let Err(e) = result {
            warn!(namespace = %namespace, error = %DisplayErrorContext(&e), "Dedup forget failed");
        }
    }

    async fn check_and_record(&self, namespace: DedupNamespace, key: &DedupKey) -> bool {
        match self.try_record(namespace, key, true).await {
            Ok(inserted) => !inserted,
            Err(e) => {
                warn!(namespace = %namespace, error = %e, "Dedup check-and-record failed; treating as unseen");
                false
            }
        }
    }
}

fn degraded(reason: &str) -> Arc<dyn DedupCache> {
    DEGRADED_WARNING.call_once(|| {
        warn!(reason = %reason, "Dedup cache unavailable; running without deduplication");
    });
    Arc::new(NoopDedupCache)
}

/// Build the configured cache, falling back to [`NoopDedupCache`] when the
/// backend is missing or unreachable.
pub async fn build_dedup_cache(
    config: &CacheConfig,
    sdk_config: &aws_config::SdkConfig,
) -> Arc<dyn DedupCache> {
    let ttl = Duration::from_secs(config.ttl_secs);
    match config.backend {
        CacheBackend::None => degraded("disabled by configuration"),
        CacheBackend::Local => Arc::new(LocalDedupCache::new(config.local_capacity, ttl)),
        CacheBackend::Dynamodb => {
            let Some(table) = config.table.as_deref().filter(|t| !t.is_empty()) else {
                return degraded("LENSGRAPH_CACHE_TABLE is not set");
            };
            let cache = DynamoDbDedupCache::new(sdk_config, table, config.endpoint.as_deref(), ttl);
            match cache.probe().await {
                Ok(()) => Arc::new(cache),
                Err(e) => degraded(&e.to_string()),
            }
        }
    }
}
