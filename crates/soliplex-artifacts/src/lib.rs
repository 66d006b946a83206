// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Artifact storage backends for the Soliplex ingester.
//!
//! Artifacts are typed byte blobs keyed by (content hash, artifact kind)
//! under a configured storage root. Three backends implement the
//! [`ArtifactStore`] capability interface from `soliplex-core`:
//!
//! - [`FsArtifactStore`]: local directory tree, the development default
//! - [`DbArtifactStore`]: rows in the relational store, co-located with the
//!   rest of the engine state
//! - [`ObjectArtifactStore`]: S3-compatible object store (or a local
//!   filesystem mount through the same interface, for tests)
//!
//! The backend is selected by configuration, not by type: see
//! [`store_for_config`].

#![deny(missing_docs)]

mod db;
mod fs;
mod object;

pub use db::DbArtifactStore;
pub use fs::FsArtifactStore;
pub use object::ObjectArtifactStore;

use std::sync::Arc;

use soliplex_core::artifact::{ArtifactError, ArtifactStore};
use soliplex_core::config::{ArtifactBackend, Config};
use soliplex_core::persistence::Persistence;

/// Default storage root label used when none is configured.
pub const DEFAULT_STORAGE_ROOT: &str = "default";

/// Build the artifact store selected by `config.artifact_backend`.
///
/// The `db` backend stores bytes through `persistence`; the other backends
/// ignore it.
pub fn store_for_config(
    config: &Config,
    persistence: Arc<dyn Persistence>,
) -> Result<Arc<dyn ArtifactStore>, ArtifactError> {
    match config.artifact_backend {
        ArtifactBackend::Fs => Ok(Arc::new(FsArtifactStore::new(
            &config.file_store_dir,
            DEFAULT_STORAGE_ROOT,
        ))),
        ArtifactBackend::Db => Ok(Arc::new(DbArtifactStore::new(
            persistence,
            DEFAULT_STORAGE_ROOT,
        ))),
        ArtifactBackend::S3 => {
            let store = ObjectArtifactStore::s3(&config.s3, DEFAULT_STORAGE_ROOT)?;
            Ok(Arc::new(store))
        }
    }
}

/// Shard directory for a content hash: the first two characters of the hex
/// digest, with any `algo-` prefix stripped.
pub(crate) fn hash_shard(hash: &str) -> &str {
    let digest = hash.split_once('-').map(|(_, d)| d).unwrap_or(hash);
    if digest.len() >= 2 { &digest[..2] } else { digest }
}
