// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Database artifact backend.
//!
//! Stores artifact bytes in the `document_bytes` table through the
//! persistence layer, keyed by (hash, kind, storage root). Useful when the
//! deployment wants a single durable store for engine state and artifacts.

use std::sync::Arc;

use async_trait::async_trait;

use soliplex_core::artifact::{ArtifactError, ArtifactStore};
use soliplex_core::model::ArtifactKind;
use soliplex_core::persistence::Persistence;

/// Artifact store backed by the relational `document_bytes` table.
pub struct DbArtifactStore {
    persistence: Arc<dyn Persistence>,
    storage_root: String,
}

impl DbArtifactStore {
    /// Create a store writing under `storage_root`.
    pub fn new(persistence: Arc<dyn Persistence>, storage_root: &str) -> Self {
        Self {
            persistence,
            storage_root: storage_root.to_string(),
        }
    }
}

#[async_trait]
impl ArtifactStore for DbArtifactStore {
    async fn put(&self, hash: &str, kind: ArtifactKind, bytes: &[u8]) -> Result<(), ArtifactError> {
        self.persistence
            .put_artifact_bytes(hash, kind.as_str(), &self.storage_root, bytes)
            .await
            .map_err(|e| ArtifactError::Backend(e.to_string()))
    }

    async fn get(&self, hash: &str, kind: ArtifactKind) -> Result<Vec<u8>, ArtifactError> {
        self.persistence
            .get_artifact_bytes(hash, kind.as_str(), &self.storage_root)
            .await
            .map_err(|e| ArtifactError::Backend(e.to_string()))?
            .ok_or_else(|| ArtifactError::not_found(hash, kind))
    }

    async fn exists(&self, hash: &str, kind: ArtifactKind) -> Result<bool, ArtifactError> {
        self.persistence
            .artifact_bytes_exist(hash, kind.as_str(), &self.storage_root)
            .await
            .map_err(|e| ArtifactError::Backend(e.to_string()))
    }

    async fn delete_all_for(&self, hash: &str) -> Result<u64, ArtifactError> {
        self.persistence
            .delete_artifact_bytes_for(hash, &self.storage_root)
            .await
            .map_err(|e| ArtifactError::Backend(e.to_string()))
    }

    fn is_database_backed(&self) -> bool {
        true
    }
}
