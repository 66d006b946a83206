// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The artifact-store capability interface.
//!
//! An artifact store persists typed byte blobs keyed by (content hash,
//! artifact kind) under a configured storage root. The store never interprets
//! the bytes. Backends live in `soliplex-artifacts`; the trait lives here so
//! cascading deletion can call `delete_all_for` without a crate cycle.

use async_trait::async_trait;

use crate::model::ArtifactKind;

/// Errors from artifact storage backends.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ArtifactError {
    /// The requested artifact does not exist.
    #[error("artifact {kind} for '{hash}' not found")]
    NotFound {
        /// Content hash of the missing artifact.
        hash: String,
        /// Kind label of the missing artifact.
        kind: &'static str,
    },

    /// The backend rejected or failed the operation.
    #[error("artifact backend error: {0}")]
    Backend(String),

    /// Filesystem I/O failed.
    #[error("artifact io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Capability interface satisfied by every artifact backend.
///
/// All operations are safe to call concurrently for distinct keys. `put` is
/// overwrite-idempotent: writing the same bytes twice is observationally a
/// no-op, which is what makes re-invoked handlers safe after a crash.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Persist `bytes` under (hash, kind).
    async fn put(&self, hash: &str, kind: ArtifactKind, bytes: &[u8]) -> Result<(), ArtifactError>;

    /// Fetch the bytes stored under (hash, kind).
    async fn get(&self, hash: &str, kind: ArtifactKind) -> Result<Vec<u8>, ArtifactError>;

    /// Whether anything is stored under (hash, kind).
    async fn exists(&self, hash: &str, kind: ArtifactKind) -> Result<bool, ArtifactError>;

    /// Remove every artifact kind stored for `hash`, returning how many were
    /// removed. Used only by cascading deletion; any backend error fails the
    /// enclosing delete.
    async fn delete_all_for(&self, hash: &str) -> Result<u64, ArtifactError>;

    /// Whether this store keeps its bytes in the engine's own database.
    ///
    /// Cascading deletion removes database-backed artifact rows inside its
    /// own transaction and must not call back into the store there (the
    /// embedded single-writer backend would deadlock on itself); external
    /// stores return false and are called mid-transaction instead.
    fn is_database_backed(&self) -> bool {
        false
    }
}

impl ArtifactError {
    /// Shorthand for the NotFound variant.
    pub fn not_found(hash: impl Into<String>, kind: ArtifactKind) -> Self {
        Self::NotFound {
            hash: hash.into(),
            kind: kind.as_str(),
        }
    }
}
