// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Filesystem artifact backend.
//!
//! Artifacts live at `<root>/<storage_root>/<shard>/<hash>/<kind>` where
//! `shard` is the first two hex characters of the digest. Writes go through
//! a temp file + rename so a crashed writer never leaves a torn artifact.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use soliplex_core::artifact::{ArtifactError, ArtifactStore};
use soliplex_core::model::ArtifactKind;

use crate::hash_shard;

/// Artifact store backed by a local directory tree.
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    /// Create a store rooted at `<base_dir>/<storage_root>`. Directories are
    /// created lazily on first write.
    pub fn new(base_dir: impl AsRef<Path>, storage_root: &str) -> Self {
        Self {
            root: base_dir.as_ref().join(storage_root),
        }
    }

    fn hash_dir(&self, hash: &str) -> PathBuf {
        self.root.join(hash_shard(hash)).join(hash)
    }

    fn artifact_path(&self, hash: &str, kind: ArtifactKind) -> PathBuf {
        self.hash_dir(hash).join(kind.as_str())
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn put(&self, hash: &str, kind: ArtifactKind, bytes: &[u8]) -> Result<(), ArtifactError> {
        let dir = self.hash_dir(hash);
        tokio::fs::create_dir_all(&dir).await?;

        let path = self.artifact_path(hash, kind);
        let tmp = dir.join(format!(".{}.tmp", kind.as_str()));
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;

        debug!(hash, kind = kind.as_str(), size = bytes.len(), "artifact written");
        Ok(())
    }

    async fn get(&self, hash: &str, kind: ArtifactKind) -> Result<Vec<u8>, ArtifactError> {
        let path = self.artifact_path(hash, kind);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ArtifactError::not_found(hash, kind))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, hash: &str, kind: ArtifactKind) -> Result<bool, ArtifactError> {
        Ok(tokio::fs::try_exists(self.artifact_path(hash, kind)).await?)
    }

    async fn delete_all_for(&self, hash: &str) -> Result<u64, ArtifactError> {
        let dir = self.hash_dir(hash);
        let mut removed = 0u64;

        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                removed += 1;
            }
        }

        tokio::fs::remove_dir_all(&dir).await?;
        debug!(hash, removed, "artifact directory removed");
        Ok(removed)
    }
}
