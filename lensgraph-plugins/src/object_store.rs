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

//! Object store access for analyzer artifacts

use crate::error::{PluginError, PluginResult};
use async_trait::async_trait;
use aws_sdk_s3::error::DisplayErrorContext;
use bytes::Bytes;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

/// One listed object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSummary {
    pub key: String,
    pub size: u64,
}

/// Minimal get/list interface over an object store
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// All objects whose key starts with `prefix`, in key order.
    async fn list(&self, bucket: &str, prefix: &str) -> PluginResult<Vec<ObjectSummary>>;

    async fn get(&self, bucket: &str, key: &str) -> PluginResult<Bytes>;
}

/// S3 (or S3-compatible) object store
#[derive(Debug, Clone)]
pub struct S3ObjectStore {
    client: aws_sdk_s3::Client,
}

impl S3ObjectStore {
    /// Build a client from shared SDK config, optionally pointed at a custom
    /// endpoint (LocalStack, MinIO). Custom endpoints use path-style
    /// addressing.
    pub fn new(sdk_config: &aws_config::SdkConfig, endpoint: Option<&str>) -> Self {
        let mut builder = aws_sdk_s3::config::Builder::from(sdk_config);
        if let Some(endpoint) = endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        Self {
            client: aws_sdk_s3::Client::from_conf(builder.build()),
        }
    }

    pub fn from_client(client: aws_sdk_s3::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn list(&self, bucket: &str, prefix: &str) -> PluginResult<Vec<ObjectSummary>> {
        let mut objects = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(bucket)
                .prefix(prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| {
                    PluginError::ObjectStore(format!(
                        "ListObjectsV2 s3://{}/{} failed: {}",
                        bucket,
                        prefix,
                        DisplayErrorContext(&e)
                    ))
                })?;

            for object in response.contents() {
                if let Some(key) = object.key() {
                    objects.push(ObjectSummary {
                        key: key.to_string(),
                        size: object.size().unwrap_or(0).max(0) as u64,
                    });
                }
            }

            match response.next_continuation_token() {
                Some(token) if response.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    async fn get(&self, bucket: &str, key: &str) -> PluginResult<Bytes> {
        let response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                PluginError::ObjectStore(format!(
                    "GetObject s3://{}/{} failed: {}",
                    bucket,
                    key,
                    DisplayErrorContext(&e)
                ))
            })?;
        let body = response.body.collect().await.map_err(|e| {
            PluginError::ObjectStore(format!("Reading s3://{}/{} failed: {}", bucket, key, e))
        })?;
        Ok(body.into_bytes())
    }
}

/// Directory-backed object store: `<root>/<bucket>/<key>`
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, bucket: &str, key: &str) -> PluginResult<PathBuf> {
        let relative = Path::new(key);
        if !relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
        {
            return Err(PluginError::UnsafePath(key.to_string()));
        }
        Ok(self.root.join(bucket).join(relative))
    }

    /// Write an object, creating parent directories.
    pub async fn put(&self, bucket: &str, key: &str, data: &[u8]) -> PluginResult<()> {
        let path = self.object_path(bucket, key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, data).await?;
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn list(&self, bucket: &str, prefix: &str) -> PluginResult<Vec<ObjectSummary>> {
        let base = self.root.join(bucket);
        if !base.exists() {
            return Err(PluginError::ObjectStore(format!(
                "bucket not found: {}",
                base.display()
            )));
        }

        let mut objects = Vec::new();
        for entry in WalkDir::new(&base).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&base) else {
                continue;
            };
            let key = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if key.starts_with(prefix) {
                let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
                objects.push(ObjectSummary { key, size });
            }
        }

        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    async fn get(&self, bucket: &str, key: &str) -> PluginResult<Bytes> {
        let path = self.object_path(bucket, key)?;
        let data = tokio::fs::read(&path).await.map_err(|e| {
            PluginError::ObjectStore(format!("reading {} failed: {}", path.display(), e))
        })?;
        Ok(Bytes::from(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_store_lists_by_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        store.put("bucket", "analyzers/a/analyzer.toml", b"a").await.unwrap();
        store.put("bucket", "analyzers/b/data/x.bin", b"bb").await.unwrap();
        store.put("bucket", "other/c.txt", b"c").await.unwrap();

        let listed = store.list("bucket", "analyzers/").await.unwrap();
        let keys: Vec<_> = listed.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["analyzers/a/analyzer.toml", "analyzers/b/data/x.bin"]);
        assert_eq!(listed[1].size, 2);

        let data = store.get("bucket", "analyzers/b/data/x.bin").await.unwrap();
        assert_eq!(&data[..], b"bb");
    }

    #[tokio::test]
    async fn test_local_store_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        assert!(matches!(
            store.get("bucket", "../secret").await,
            Err(PluginError::UnsafePath(_))
        ));
        assert!(store.list("missing", "").await.is_err());
    }
}
