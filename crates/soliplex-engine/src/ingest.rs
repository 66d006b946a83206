// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Document ingest and the source-status diff.
//!
//! Documents are content-addressed: the hash of the bytes is the identity,
//! and any number of (uri, source) pairs may point at the same content.
//! Ingest writes the `raw` artifact once per hash and records the mapping;
//! re-ingesting identical bytes under the same URI is a no-op that reports
//! the batch which originally carried the content.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};
use tracing::{debug, info};

use soliplex_core::artifact::ArtifactStore;
use soliplex_core::error::IngestError;
use soliplex_core::model::{ArtifactKind, IngestOutcome, IngestRequest};
use soliplex_core::persistence::Persistence;

/// Content hash of document bytes, in the persisted `sha256-<hex>` form.
pub fn content_hash(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    format!("sha256-{}", hex::encode(digest))
}

/// Strip an algorithm prefix (`sha256-..` or `md5:..`) from a hash string.
///
/// Source systems report hashes in assorted prefixed forms; comparisons in
/// the diff work on the bare digest.
pub fn strip_hash_prefix(hash: &str) -> &str {
    if let Some((_, rest)) = hash.split_once('-') {
        return rest;
    }
    if let Some((_, rest)) = hash.split_once(':') {
        return rest;
    }
    hash
}

/// One document to ingest.
#[derive(Debug, Clone)]
pub struct IngestDocument {
    /// URI on the source system.
    pub uri: String,
    /// Source system identifier.
    pub source: String,
    /// The raw bytes.
    pub bytes: Vec<u8>,
    /// MIME type; defaults to `application/octet-stream`.
    pub mime_type: Option<String>,
    /// Free-form metadata to attach to the document.
    pub doc_meta: serde_json::Value,
    /// Batch the ingest belongs to.
    pub batch_id: i64,
}

/// Ingest one document: hash the bytes, write the `raw` artifact if this
/// content has not been seen, and record the document/URI rows.
///
/// Returns the content hash together with what the ingest did. Ingesting
/// the same bytes twice under the same (uri, source) changes nothing and
/// reports [`IngestOutcome::Unchanged`] with the original batch id.
pub async fn ingest_document(
    persistence: &dyn Persistence,
    artifacts: &dyn ArtifactStore,
    doc: IngestDocument,
) -> Result<(String, IngestOutcome), IngestError> {
    if doc.bytes.is_empty() {
        return Err(IngestError::validation("bytes", "must not be empty"));
    }
    if doc.uri.is_empty() {
        return Err(IngestError::validation("uri", "must not be empty"));
    }

    let hash = content_hash(&doc.bytes);

    // The artifact store is the dedupe anchor: write-once per hash.
    let already_stored = artifacts.exists(&hash, ArtifactKind::Raw).await.map_err(|e| {
        IngestError::ArtifactStorage {
            details: e.to_string(),
        }
    })?;
    if !already_stored {
        artifacts
            .put(&hash, ArtifactKind::Raw, &doc.bytes)
            .await
            .map_err(|e| IngestError::ArtifactStorage {
                details: e.to_string(),
            })?;
        debug!(hash, size = doc.bytes.len(), "raw artifact stored");
    }

    let request = IngestRequest {
        uri: doc.uri.clone(),
        source: doc.source.clone(),
        doc_hash: hash.clone(),
        mime_type: doc
            .mime_type
            .unwrap_or_else(|| "application/octet-stream".to_string()),
        file_size: doc.bytes.len() as i64,
        doc_meta: doc.doc_meta,
        batch_id: doc.batch_id,
    };
    let outcome = persistence.record_ingest(&request).await?;

    match &outcome {
        IngestOutcome::Created {
            uri_id,
            existing_document_batch,
        } => {
            info!(
                uri = %doc.uri,
                source = %doc.source,
                hash,
                uri_id,
                ?existing_document_batch,
                "document ingested"
            );
        }
        IngestOutcome::Updated { uri_id, version } => {
            info!(uri = %doc.uri, source = %doc.source, hash, uri_id, version, "document updated");
        }
        IngestOutcome::Unchanged {
            original_batch_id, ..
        } => {
            info!(
                uri = %doc.uri,
                source = %doc.source,
                hash,
                ?original_batch_id,
                "document already exists"
            );
        }
    }

    Ok((hash, outcome))
}

/// A URI present in both the input and persistence, with differing hashes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangedUri {
    /// The URI.
    pub uri: String,
    /// Hash reported by the source system.
    pub source_hash: String,
    /// Hash currently persisted.
    pub stored_hash: String,
}

/// A URI persisted under the source but absent from the input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingUri {
    /// The URI.
    pub uri: String,
    /// Hash currently persisted.
    pub stored_hash: String,
}

/// Result of comparing a source system's view against persistence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceStatus {
    /// URIs present in the input but not in persistence.
    pub new: Vec<String>,
    /// URIs present in both but with a different hash.
    pub changed: Vec<ChangedUri>,
    /// URIs persisted under this source but absent from the input.
    pub missing: Vec<MissingUri>,
}

/// Compare `(source, {uri -> hash})` against the persisted state.
///
/// Read-only; ingest agents use the result to decide what to re-ingest.
pub async fn source_status(
    persistence: &dyn Persistence,
    source: &str,
    input: &BTreeMap<String, String>,
) -> Result<SourceStatus, IngestError> {
    let stored = persistence.uris_for_source(source).await?;
    let mut stored_by_uri: BTreeMap<&str, &str> = stored
        .iter()
        .map(|u| (u.uri.as_str(), u.doc_hash.as_str()))
        .collect();

    let mut status = SourceStatus::default();

    for (uri, source_hash) in input {
        match stored_by_uri.remove(uri.as_str()) {
            None => status.new.push(uri.clone()),
            Some(stored_hash) => {
                if strip_hash_prefix(source_hash) != strip_hash_prefix(stored_hash) {
                    status.changed.push(ChangedUri {
                        uri: uri.clone(),
                        source_hash: source_hash.clone(),
                        stored_hash: stored_hash.to_string(),
                    });
                }
            }
        }
    }

    for (uri, stored_hash) in stored_by_uri {
        status.missing.push(MissingUri {
            uri: uri.to_string(),
            stored_hash: stored_hash.to_string(),
        });
    }

    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_form() {
        let hash = content_hash(b"hello world");
        assert!(hash.starts_with("sha256-"));
        assert_eq!(hash.len(), "sha256-".len() + 64);
        // Stable across calls.
        assert_eq!(hash, content_hash(b"hello world"));
        assert_ne!(hash, content_hash(b"hello worlds"));
    }

    #[test]
    fn test_strip_hash_prefix() {
        assert_eq!(strip_hash_prefix("sha256-abc"), "abc");
        assert_eq!(strip_hash_prefix("md5:abc"), "abc");
        assert_eq!(strip_hash_prefix("abc"), "abc");
    }
}
