// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Object-store artifact backend.
//!
//! Uses the `object_store` crate, so the same code talks to AWS S3, any
//! S3-compatible endpoint (MinIO and friends), or a local filesystem mount
//! in tests. Keys follow the filesystem layout:
//! `<storage_root>/<shard>/<hash>/<kind>`.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use tracing::debug;

use soliplex_core::artifact::{ArtifactError, ArtifactStore};
use soliplex_core::config::S3Settings;
use soliplex_core::model::ArtifactKind;

use crate::hash_shard;

/// Artifact store backed by an `object_store` implementation.
pub struct ObjectArtifactStore {
    store: Arc<dyn ObjectStore>,
    storage_root: String,
}

impl ObjectArtifactStore {
    /// Create a store over an existing `ObjectStore` (used by tests).
    pub fn with_store(store: Arc<dyn ObjectStore>, storage_root: &str) -> Self {
        Self {
            store,
            storage_root: storage_root.to_string(),
        }
    }

    /// Create a store over an S3 bucket from the configured settings.
    pub fn s3(settings: &S3Settings, storage_root: &str) -> Result<Self, ArtifactError> {
        if settings.bucket.is_empty() {
            return Err(ArtifactError::Backend(
                "s3 artifact backend requires a bucket".to_string(),
            ));
        }

        let mut builder = AmazonS3Builder::new().with_bucket_name(&settings.bucket);
        if !settings.endpoint.is_empty() {
            builder = builder
                .with_endpoint(&settings.endpoint)
                .with_allow_http(true);
        }
        if !settings.region.is_empty() {
            builder = builder.with_region(&settings.region);
        }
        if !settings.access_key_id.is_empty() {
            builder = builder.with_access_key_id(&settings.access_key_id);
        }
        if !settings.secret_access_key.is_empty() {
            builder = builder.with_secret_access_key(&settings.secret_access_key);
        }

        let store = builder
            .build()
            .map_err(|e| ArtifactError::Backend(format!("failed to build S3 store: {}", e)))?;

        Ok(Self {
            store: Arc::new(store),
            storage_root: storage_root.to_string(),
        })
    }

    /// Create a store over a local directory, mainly for tests.
    pub fn local(dir: impl AsRef<std::path::Path>, storage_root: &str) -> Result<Self, ArtifactError> {
        let store = LocalFileSystem::new_with_prefix(dir.as_ref())
            .map_err(|e| ArtifactError::Backend(format!("failed to open local store: {}", e)))?;
        Ok(Self {
            store: Arc::new(store),
            storage_root: storage_root.to_string(),
        })
    }

    fn hash_prefix(&self, hash: &str) -> ObjectPath {
        ObjectPath::from(format!(
            "{}/{}/{}",
            self.storage_root,
            hash_shard(hash),
            hash
        ))
    }

    fn artifact_path(&self, hash: &str, kind: ArtifactKind) -> ObjectPath {
        ObjectPath::from(format!(
            "{}/{}/{}/{}",
            self.storage_root,
            hash_shard(hash),
            hash,
            kind.as_str()
        ))
    }
}

#[async_trait]
impl ArtifactStore for ObjectArtifactStore {
    async fn put(&self, hash: &str, kind: ArtifactKind, bytes: &[u8]) -> Result<(), ArtifactError> {
        let path = self.artifact_path(hash, kind);
        let payload = PutPayload::from(Bytes::copy_from_slice(bytes));
        self.store
            .put(&path, payload)
            .await
            .map_err(|e| ArtifactError::Backend(format!("put {}: {}", path, e)))?;

        debug!(hash, kind = kind.as_str(), size = bytes.len(), "artifact uploaded");
        Ok(())
    }

    async fn get(&self, hash: &str, kind: ArtifactKind) -> Result<Vec<u8>, ArtifactError> {
        let path = self.artifact_path(hash, kind);
        let result = match self.store.get(&path).await {
            Ok(result) => result,
            Err(object_store::Error::NotFound { .. }) => {
                return Err(ArtifactError::not_found(hash, kind));
            }
            Err(e) => return Err(ArtifactError::Backend(format!("get {}: {}", path, e))),
        };

        let bytes = result
            .bytes()
            .await
            .map_err(|e| ArtifactError::Backend(format!("read {}: {}", path, e)))?;
        Ok(bytes.to_vec())
    }

    async fn exists(&self, hash: &str, kind: ArtifactKind) -> Result<bool, ArtifactError> {
        let path = self.artifact_path(hash, kind);
        match self.store.head(&path).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(ArtifactError::Backend(format!("head {}: {}", path, e))),
        }
    }

    async fn delete_all_for(&self, hash: &str) -> Result<u64, ArtifactError> {
        let prefix = self.hash_prefix(hash);
        let objects: Vec<_> = self
            .store
            .list(Some(&prefix))
            .try_collect()
            .await
            .map_err(|e| ArtifactError::Backend(format!("list {}: {}", prefix, e)))?;

        let mut removed = 0u64;
        for meta in objects {
            self.store
                .delete(&meta.location)
                .await
                .map_err(|e| ArtifactError::Backend(format!("delete {}: {}", meta.location, e)))?;
            removed += 1;
        }

        debug!(hash, removed, "artifacts removed from object store");
        Ok(removed)
    }
}
