// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integration tests across the three artifact backends.
//!
//! Every backend must satisfy the same contract: overwrite-idempotent
//! `put`, NotFound on missing `get`, and a `delete_all_for` that removes
//! every kind stored for a hash.

use std::sync::Arc;

use sqlx::sqlite::SqlitePoolOptions;
use tempfile::TempDir;

use soliplex_artifacts::{DbArtifactStore, FsArtifactStore, ObjectArtifactStore};
use soliplex_core::artifact::{ArtifactError, ArtifactStore};
use soliplex_core::model::ArtifactKind;
use soliplex_core::persistence::SqlitePersistence;

const HASH: &str = "sha256-0f1e2d3c4b5a69788796a5b4c3d2e1f00f1e2d3c4b5a69788796a5b4c3d2e1f0";

async fn sqlite_persistence() -> SqlitePersistence {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("failed to create in-memory SQLite pool");
    soliplex_core::migrations::run_sqlite(&pool)
        .await
        .expect("failed to run migrations");
    SqlitePersistence::new(pool)
}

/// Run the shared contract checks against one backend.
async fn exercise_store(store: &dyn ArtifactStore) {
    // Missing artifact.
    assert!(!store.exists(HASH, ArtifactKind::Raw).await.unwrap());
    let err = store.get(HASH, ArtifactKind::Raw).await.unwrap_err();
    assert!(matches!(err, ArtifactError::NotFound { .. }));

    // Write and read back.
    store.put(HASH, ArtifactKind::Raw, b"raw bytes").await.unwrap();
    assert!(store.exists(HASH, ArtifactKind::Raw).await.unwrap());
    assert_eq!(store.get(HASH, ArtifactKind::Raw).await.unwrap(), b"raw bytes");

    // Overwrite-idempotent put.
    store.put(HASH, ArtifactKind::Raw, b"raw bytes").await.unwrap();
    assert_eq!(store.get(HASH, ArtifactKind::Raw).await.unwrap(), b"raw bytes");

    // Distinct kinds are distinct keys.
    store
        .put(HASH, ArtifactKind::Chunks, b"[\"chunk\"]")
        .await
        .unwrap();
    store
        .put(HASH, ArtifactKind::Embeddings, b"[[0.1]]")
        .await
        .unwrap();
    assert!(store.exists(HASH, ArtifactKind::Chunks).await.unwrap());
    assert!(!store.exists(HASH, ArtifactKind::ParsedText).await.unwrap());

    // delete_all_for removes every kind for the hash.
    let removed = store.delete_all_for(HASH).await.unwrap();
    assert_eq!(removed, 3);
    assert!(!store.exists(HASH, ArtifactKind::Raw).await.unwrap());
    assert!(!store.exists(HASH, ArtifactKind::Chunks).await.unwrap());

    // Deleting an absent hash is a zero-count no-op.
    assert_eq!(store.delete_all_for(HASH).await.unwrap(), 0);
}

#[tokio::test]
async fn test_fs_store_contract() {
    let dir = TempDir::new().unwrap();
    let store = FsArtifactStore::new(dir.path(), "default");
    exercise_store(&store).await;
}

#[tokio::test]
async fn test_fs_store_layout() {
    let dir = TempDir::new().unwrap();
    let store = FsArtifactStore::new(dir.path(), "prod");
    store.put(HASH, ArtifactKind::Raw, b"x").await.unwrap();

    // <root>/<storage_root>/<shard>/<hash>/<kind>
    let expected = dir.path().join("prod").join("0f").join(HASH).join("raw");
    assert!(expected.is_file(), "expected artifact at {:?}", expected);
}

#[tokio::test]
async fn test_db_store_contract() {
    let persistence = Arc::new(sqlite_persistence().await);
    let store = DbArtifactStore::new(persistence, "default");
    exercise_store(&store).await;
}

#[tokio::test]
async fn test_db_store_roots_are_isolated() {
    let persistence = Arc::new(sqlite_persistence().await);
    let store_a = DbArtifactStore::new(persistence.clone(), "root-a");
    let store_b = DbArtifactStore::new(persistence, "root-b");

    store_a.put(HASH, ArtifactKind::Raw, b"a").await.unwrap();
    assert!(!store_b.exists(HASH, ArtifactKind::Raw).await.unwrap());

    store_b.put(HASH, ArtifactKind::Raw, b"b").await.unwrap();
    assert_eq!(store_a.delete_all_for(HASH).await.unwrap(), 1);
    assert!(store_b.exists(HASH, ArtifactKind::Raw).await.unwrap());
}

#[tokio::test]
async fn test_object_store_contract() {
    let dir = TempDir::new().unwrap();
    let store = ObjectArtifactStore::local(dir.path(), "default").unwrap();
    exercise_store(&store).await;
}

#[tokio::test]
async fn test_object_store_uses_same_key_layout() {
    let dir = TempDir::new().unwrap();
    let store = ObjectArtifactStore::local(dir.path(), "bucket-root").unwrap();
    store.put(HASH, ArtifactKind::Chunks, b"[]").await.unwrap();

    let expected = dir
        .path()
        .join("bucket-root")
        .join("0f")
        .join(HASH)
        .join("chunks");
    assert!(expected.is_file(), "expected object at {:?}", expected);
}

#[tokio::test]
async fn test_concurrent_puts_distinct_keys() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(FsArtifactStore::new(dir.path(), "default"));

    let mut handles = Vec::new();
    for kind in ArtifactKind::all() {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store.put(HASH, kind, kind.as_str().as_bytes()).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    for kind in ArtifactKind::all() {
        assert_eq!(
            store.get(HASH, kind).await.unwrap(),
            kind.as_str().as_bytes()
        );
    }
}
