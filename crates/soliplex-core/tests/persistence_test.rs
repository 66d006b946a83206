// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integration tests for the SQLite persistence backend.
//!
//! These cover the scheduler state machine (claim, advance, retry,
//! failure), the lifecycle audit trail, deduplicated ingest, stale-worker
//! recovery, and the cascading deletes.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use sqlx::sqlite::SqlitePoolOptions;

use soliplex_core::artifact::{ArtifactError, ArtifactStore};
use soliplex_core::error::IngestError;
use soliplex_core::migrations;
use soliplex_core::model::{
    AdvanceRequest, ArtifactKind, IngestOutcome, IngestRequest, NewRunStep, NewWorkflowRun,
    StepOutcome, StepType,
};
use soliplex_core::persistence::{Persistence, SqlitePersistence};

/// Create an in-memory SQLite persistence with migrations applied.
async fn test_persistence() -> SqlitePersistence {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("failed to create in-memory SQLite pool");

    migrations::run_sqlite(&pool)
        .await
        .expect("failed to run migrations");

    SqlitePersistence::new(pool)
}

/// In-memory artifact store for exercising the cascade path.
#[derive(Default)]
struct MemoryArtifactStore {
    blobs: Mutex<HashMap<(String, &'static str), Vec<u8>>>,
    fail_deletes: bool,
}

#[async_trait::async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn put(&self, hash: &str, kind: ArtifactKind, bytes: &[u8]) -> Result<(), ArtifactError> {
        self.blobs
            .lock()
            .unwrap()
            .insert((hash.to_string(), kind.as_str()), bytes.to_vec());
        Ok(())
    }

    async fn get(&self, hash: &str, kind: ArtifactKind) -> Result<Vec<u8>, ArtifactError> {
        self.blobs
            .lock()
            .unwrap()
            .get(&(hash.to_string(), kind.as_str()))
            .cloned()
            .ok_or_else(|| ArtifactError::not_found(hash, kind))
    }

    async fn exists(&self, hash: &str, kind: ArtifactKind) -> Result<bool, ArtifactError> {
        Ok(self
            .blobs
            .lock()
            .unwrap()
            .contains_key(&(hash.to_string(), kind.as_str())))
    }

    async fn delete_all_for(&self, hash: &str) -> Result<u64, ArtifactError> {
        if self.fail_deletes {
            return Err(ArtifactError::Backend("simulated outage".to_string()));
        }
        let mut blobs = self.blobs.lock().unwrap();
        let before = blobs.len();
        blobs.retain(|(h, _), _| h != hash);
        Ok((before - blobs.len()) as u64)
    }
}

fn ingest_request(batch_id: i64, uri: &str, hash: &str) -> IngestRequest {
    IngestRequest {
        uri: uri.to_string(),
        source: "s".to_string(),
        doc_hash: hash.to_string(),
        mime_type: "application/pdf".to_string(),
        file_size: 42,
        doc_meta: serde_json::json!({}),
        batch_id,
    }
}

fn step_blueprint(number: i64, config_id: i64, is_last: bool, retries: i64) -> NewRunStep {
    NewRunStep {
        step_number: number,
        step_name: format!("step-{}", number),
        step_type: StepType::Parse,
        step_config_id: config_id,
        is_last_step: is_last,
        retries,
        priority: 0,
    }
}

/// Seed a batch, one ingested document, a run group, and one run whose
/// first step is PENDING. Returns (batch, group, run, first step config).
async fn seed_single_run(
    p: &SqlitePersistence,
    hash: &str,
    retries: i64,
    last: bool,
) -> (i64, i64, i64, i64) {
    let batch = p
        .create_batch("s", Some("test batch"), serde_json::json!({}))
        .await
        .unwrap();
    p.record_ingest(&ingest_request(batch.id, &format!("/{}", hash), hash))
        .await
        .unwrap();

    let group = p
        .create_run_group(None, "wf", "default", batch.id)
        .await
        .unwrap();
    let config_id = p
        .get_or_create_step_config(StepType::Parse, &serde_json::json!({}), "{}")
        .await
        .unwrap();
    let (run_id, _step_id) = p
        .create_workflow_run(&NewWorkflowRun {
            run_group_id: group.id,
            workflow_id: "wf".to_string(),
            batch_id: batch.id,
            doc_hash: hash.to_string(),
            priority: 0,
            run_params: serde_json::json!({}),
            first_step: step_blueprint(1, config_id, last, retries),
        })
        .await
        .unwrap();

    (batch.id, group.id, run_id, config_id)
}

// ============================================================================
// Ingest and deduplication
// ============================================================================

#[tokio::test]
async fn test_ingest_creates_document_and_uri() {
    let p = test_persistence().await;
    let batch = p.create_batch("s", None, serde_json::json!({})).await.unwrap();

    let outcome = p
        .record_ingest(&ingest_request(batch.id, "/a", "sha256-aa"))
        .await
        .unwrap();
    assert!(matches!(outcome, IngestOutcome::Created { .. }));

    let doc = p.get_document("sha256-aa").await.unwrap().unwrap();
    assert_eq!(doc.batch_id, Some(batch.id));

    let uri = p.find_document_uri("/a", "s").await.unwrap().unwrap();
    assert_eq!(uri.version, 1);
    assert_eq!(uri.doc_hash, "sha256-aa");

    let history = p.document_uri_history(uri.id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].action, "created");
    assert_eq!(history[0].version, 1);
}

#[tokio::test]
async fn test_ingest_same_bytes_twice_is_noop() {
    let p = test_persistence().await;
    let batch = p.create_batch("s", None, serde_json::json!({})).await.unwrap();

    p.record_ingest(&ingest_request(batch.id, "/a", "sha256-aa"))
        .await
        .unwrap();
    let second = p
        .record_ingest(&ingest_request(batch.id, "/a", "sha256-aa"))
        .await
        .unwrap();

    match second {
        IngestOutcome::Unchanged {
            original_batch_id, ..
        } => assert_eq!(original_batch_id, Some(batch.id)),
        other => panic!("expected Unchanged, got {:?}", other),
    }

    // No version bump, no extra history.
    let uri = p.find_document_uri("/a", "s").await.unwrap().unwrap();
    assert_eq!(uri.version, 1);
    assert_eq!(p.document_uri_history(uri.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_ingest_shared_content_across_batches() {
    let p = test_persistence().await;
    let batch1 = p.create_batch("s", None, serde_json::json!({})).await.unwrap();
    let batch2 = p.create_batch("s", None, serde_json::json!({})).await.unwrap();

    p.record_ingest(&ingest_request(batch1.id, "/a", "sha256-bb"))
        .await
        .unwrap();
    let outcome = p
        .record_ingest(&ingest_request(batch2.id, "/b", "sha256-bb"))
        .await
        .unwrap();

    // New URI, same document; the outcome names the batch that first
    // carried the content.
    match outcome {
        IngestOutcome::Created {
            existing_document_batch,
            ..
        } => assert_eq!(existing_document_batch, Some(batch1.id)),
        other => panic!("expected Created, got {:?}", other),
    }
    assert_eq!(p.document_uris_by_hash("sha256-bb").await.unwrap().len(), 2);
    let doc = p.get_document("sha256-bb").await.unwrap().unwrap();
    assert_eq!(doc.batch_id, Some(batch1.id));
}

#[tokio::test]
async fn test_ingest_changed_content_bumps_version() {
    let p = test_persistence().await;
    let batch = p.create_batch("s", None, serde_json::json!({})).await.unwrap();

    p.record_ingest(&ingest_request(batch.id, "/a", "sha256-v1"))
        .await
        .unwrap();
    p.record_ingest(&ingest_request(batch.id, "/x", "sha256-v2"))
        .await
        .unwrap();

    let outcome = p
        .record_ingest(&ingest_request(batch.id, "/a", "sha256-v2"))
        .await
        .unwrap();
    match outcome {
        IngestOutcome::Updated { version, .. } => assert_eq!(version, 2),
        other => panic!("expected Updated, got {:?}", other),
    }

    let uri = p.find_document_uri("/a", "s").await.unwrap().unwrap();
    assert_eq!(uri.version, 2);
    assert_eq!(uri.doc_hash, "sha256-v2");

    // Most recent history row mirrors the URI state.
    let history = p.document_uri_history(uri.id).await.unwrap();
    let latest = history.last().unwrap();
    assert_eq!(latest.action, "updated");
    assert_eq!(latest.version, uri.version);
    assert_eq!(latest.hash, uri.doc_hash);
}

#[tokio::test]
async fn test_ingest_unknown_batch_fails() {
    let p = test_persistence().await;
    let err = p
        .record_ingest(&ingest_request(999, "/a", "sha256-aa"))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "NOT_FOUND");
}

// ============================================================================
// Claim
// ============================================================================

#[tokio::test]
async fn test_claim_moves_step_to_running() {
    let p = test_persistence().await;
    let (_batch, group, run, _config) = seed_single_run(&p, "sha256-c1", 1, true).await;

    let claimed = p.claim_steps("w1", 5, Utc::now()).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].workflow_run_id, run);
    assert_eq!(claimed[0].step_number, 1);

    let steps = p.steps_for_run(run).await.unwrap();
    assert_eq!(steps[0].status, "RUNNING");
    assert_eq!(steps[0].worker_id.as_deref(), Some("w1"));
    assert!(steps[0].start_date.is_some());

    // Run and group promoted.
    assert_eq!(p.get_workflow_run(run).await.unwrap().unwrap().status, "RUNNING");
    assert_eq!(p.get_run_group(group).await.unwrap().unwrap().status, "RUNNING");
}

#[tokio::test]
async fn test_claim_contention_exactly_one_winner() {
    let p = test_persistence().await;
    seed_single_run(&p, "sha256-c2", 1, true).await;

    let first = p.claim_steps("w1", 5, Utc::now()).await.unwrap();
    let second = p.claim_steps("w2", 5, Utc::now()).await.unwrap();

    assert_eq!(first.len(), 1);
    assert_eq!(second.len(), 0, "second claimer must get zero rows");
}

#[tokio::test]
async fn test_claim_respects_not_before() {
    let p = test_persistence().await;
    let (_batch, _group, run, _config) = seed_single_run(&p, "sha256-c3", 2, true).await;

    let claimed = p.claim_steps("w1", 5, Utc::now()).await.unwrap();
    let step = &claimed[0];

    // Retry with a gate one hour out.
    let gate = Utc::now() + chrono::Duration::hours(1);
    p.advance_step(&AdvanceRequest {
        step_id: step.step_id,
        worker_id: "w1".to_string(),
        outcome: StepOutcome::Retry {
            message: "flaky".to_string(),
            not_before: gate,
        },
        next_step: None,
    })
    .await
    .unwrap();

    assert!(
        p.claim_steps("w1", 5, Utc::now()).await.unwrap().is_empty(),
        "gated step must not be claimable before its backoff passes"
    );

    let later = p
        .claim_steps("w1", 5, gate + chrono::Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(later.len(), 1);
    assert_eq!(later[0].workflow_run_id, run);
    assert_eq!(later[0].retry, 1);
}

#[tokio::test]
async fn test_claim_order_priority_then_age() {
    let p = test_persistence().await;
    let batch = p.create_batch("s", None, serde_json::json!({})).await.unwrap();
    let group = p
        .create_run_group(None, "wf", "default", batch.id)
        .await
        .unwrap();
    let config_id = p
        .get_or_create_step_config(StepType::Parse, &serde_json::json!({}), "{}")
        .await
        .unwrap();

    let mut run_ids = Vec::new();
    for (i, priority) in [(0, 0), (1, 5), (2, 0)] {
        let hash = format!("sha256-p{}", i);
        p.record_ingest(&ingest_request(batch.id, &format!("/{}", hash), &hash))
            .await
            .unwrap();
        let (run_id, _) = p
            .create_workflow_run(&NewWorkflowRun {
                run_group_id: group.id,
                workflow_id: "wf".to_string(),
                batch_id: batch.id,
                doc_hash: hash,
                priority,
                run_params: serde_json::json!({}),
                first_step: NewRunStep {
                    priority,
                    ..step_blueprint(1, config_id, true, 1)
                },
            })
            .await
            .unwrap();
        run_ids.push(run_id);
    }

    let claimed = p.claim_steps("w1", 10, Utc::now()).await.unwrap();
    let order: Vec<i64> = claimed.iter().map(|c| c.workflow_run_id).collect();
    // Highest priority first, then older creation, then smaller run id.
    assert_eq!(order, vec![run_ids[1], run_ids[0], run_ids[2]]);
}

#[tokio::test]
async fn test_claim_limit_and_zero_workers_boundary() {
    let p = test_persistence().await;
    for i in 0..4 {
        seed_single_run(&p, &format!("sha256-l{}", i), 1, true).await;
    }

    // Nothing claims anything: steps stay PENDING indefinitely.
    let (runs, _) = p.list_workflow_runs(None, 100, 0).await.unwrap();
    for run in &runs {
        let steps = p.steps_for_run(run.id).await.unwrap();
        assert_eq!(steps[0].status, "PENDING");
    }

    let claimed = p.claim_steps("w1", 2, Utc::now()).await.unwrap();
    assert_eq!(claimed.len(), 2, "claim honors its limit");
}

// ============================================================================
// Advance
// ============================================================================

#[tokio::test]
async fn test_advance_completed_seeds_next_step() {
    let p = test_persistence().await;
    let (_batch, _group, run, config) = seed_single_run(&p, "sha256-a1", 1, false).await;

    let claimed = p.claim_steps("w1", 5, Utc::now()).await.unwrap();
    let result = p
        .advance_step(&AdvanceRequest {
            step_id: claimed[0].step_id,
            worker_id: "w1".to_string(),
            outcome: StepOutcome::Completed {
                metadata: serde_json::json!({"pages": 3}),
            },
            next_step: Some(step_blueprint(2, config, true, 1)),
        })
        .await
        .unwrap();

    assert!(!result.run_terminal);

    let steps = p.steps_for_run(run).await.unwrap();
    assert_eq!(steps.len(), 2);
    assert_eq!(steps[0].status, "COMPLETED");
    assert_eq!(steps[1].status, "PENDING");
    assert_eq!(steps[1].step_number, 2);
    assert!(steps[1].is_last_step);

    // The run is still live.
    assert_eq!(p.get_workflow_run(run).await.unwrap().unwrap().status, "RUNNING");
}

#[tokio::test]
async fn test_advance_last_step_completes_run_group_batch() {
    let p = test_persistence().await;
    let (batch, group, run, _config) = seed_single_run(&p, "sha256-a2", 1, true).await;

    let claimed = p.claim_steps("w1", 5, Utc::now()).await.unwrap();
    let result = p
        .advance_step(&AdvanceRequest {
            step_id: claimed[0].step_id,
            worker_id: "w1".to_string(),
            outcome: StepOutcome::Completed {
                metadata: serde_json::json!({}),
            },
            next_step: None,
        })
        .await
        .unwrap();

    assert!(result.run_terminal);
    assert!(result.group_terminal);
    assert!(result.batch_completed);

    let run = p.get_workflow_run(run).await.unwrap().unwrap();
    assert_eq!(run.status, "COMPLETED");
    assert!(run.completed_date.is_some());

    let group = p.get_run_group(group).await.unwrap().unwrap();
    assert_eq!(group.status, "COMPLETED");
    assert!(group.completed_date.is_some());

    let batch = p.get_batch(batch).await.unwrap().unwrap();
    assert!(batch.completed_date.is_some());
}

#[tokio::test]
async fn test_advance_wrong_worker_rejected() {
    let p = test_persistence().await;
    seed_single_run(&p, "sha256-a3", 1, true).await;

    let claimed = p.claim_steps("w1", 5, Utc::now()).await.unwrap();
    let err = p
        .advance_step(&AdvanceRequest {
            step_id: claimed[0].step_id,
            worker_id: "w2".to_string(),
            outcome: StepOutcome::Completed {
                metadata: serde_json::json!({}),
            },
            next_step: None,
        })
        .await
        .unwrap_err();

    assert_eq!(err.error_code(), "CONFLICT");

    // The claim is untouched.
    let steps = p
        .steps_for_run(claimed[0].workflow_run_id)
        .await
        .unwrap();
    assert_eq!(steps[0].status, "RUNNING");
    assert_eq!(steps[0].worker_id.as_deref(), Some("w1"));
}

#[tokio::test]
async fn test_retry_cycle_then_success() {
    let p = test_persistence().await;
    let (_batch, group, run, _config) = seed_single_run(&p, "sha256-r1", 2, true).await;

    // First attempt fails transiently.
    let claimed = p.claim_steps("w1", 5, Utc::now()).await.unwrap();
    p.advance_step(&AdvanceRequest {
        step_id: claimed[0].step_id,
        worker_id: "w1".to_string(),
        outcome: StepOutcome::Retry {
            message: "parser overloaded".to_string(),
            not_before: Utc::now(),
        },
        next_step: None,
    })
    .await
    .unwrap();

    let steps = p.steps_for_run(run).await.unwrap();
    assert_eq!(steps[0].status, "PENDING");
    assert_eq!(steps[0].retry, 1);
    assert!(steps[0].worker_id.is_none());

    // Second attempt succeeds.
    let reclaimed = p.claim_steps("w1", 5, Utc::now()).await.unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].retry, 1);
    p.advance_step(&AdvanceRequest {
        step_id: reclaimed[0].step_id,
        worker_id: "w1".to_string(),
        outcome: StepOutcome::Completed {
            metadata: serde_json::json!({}),
        },
        next_step: None,
    })
    .await
    .unwrap();

    let steps = p.steps_for_run(run).await.unwrap();
    assert_eq!(steps[0].status, "COMPLETED");
    assert_eq!(steps[0].retry, 1);

    // Two step_start, one step_failed, one step_end, in that order.
    let events: Vec<String> = p
        .lifecycle_for_group(group)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.event.starts_with("step_"))
        .map(|e| e.event)
        .collect();
    assert_eq!(events, vec!["step_start", "step_failed", "step_start", "step_end"]);
}

#[tokio::test]
async fn test_retry_budget_enforced() {
    let p = test_persistence().await;
    seed_single_run(&p, "sha256-r2", 0, true).await;

    let claimed = p.claim_steps("w1", 5, Utc::now()).await.unwrap();
    // retries = 0: a retry request violates the budget.
    let err = p
        .advance_step(&AdvanceRequest {
            step_id: claimed[0].step_id,
            worker_id: "w1".to_string(),
            outcome: StepOutcome::Retry {
                message: "flaky".to_string(),
                not_before: Utc::now(),
            },
            next_step: None,
        })
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "ENGINE_INVARIANT");
}

#[tokio::test]
async fn test_fatal_failure_fails_run_and_group() {
    let p = test_persistence().await;
    let (_batch, group, run, _config) = seed_single_run(&p, "sha256-f1", 3, true).await;

    let claimed = p.claim_steps("w1", 5, Utc::now()).await.unwrap();
    let result = p
        .advance_step(&AdvanceRequest {
            step_id: claimed[0].step_id,
            worker_id: "w1".to_string(),
            outcome: StepOutcome::Failed {
                message: "corrupt input".to_string(),
            },
            next_step: None,
        })
        .await
        .unwrap();

    assert!(result.run_terminal);
    assert!(result.group_terminal);

    let steps = p.steps_for_run(run).await.unwrap();
    assert_eq!(steps[0].status, "FAILED");

    assert_eq!(p.get_workflow_run(run).await.unwrap().unwrap().status, "FAILED");
    assert_eq!(p.get_run_group(group).await.unwrap().unwrap().status, "FAILED");

    // A FAILED step is never claimable again.
    assert!(p.claim_steps("w1", 5, Utc::now()).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_group_error_while_sibling_runs_live() {
    let p = test_persistence().await;
    let batch = p.create_batch("s", None, serde_json::json!({})).await.unwrap();
    let group = p
        .create_run_group(None, "wf", "default", batch.id)
        .await
        .unwrap();
    let config_id = p
        .get_or_create_step_config(StepType::Parse, &serde_json::json!({}), "{}")
        .await
        .unwrap();

    for hash in ["sha256-g1", "sha256-g2"] {
        p.record_ingest(&ingest_request(batch.id, &format!("/{}", hash), hash))
            .await
            .unwrap();
        p.create_workflow_run(&NewWorkflowRun {
            run_group_id: group.id,
            workflow_id: "wf".to_string(),
            batch_id: batch.id,
            doc_hash: hash.to_string(),
            priority: 0,
            run_params: serde_json::json!({}),
            first_step: step_blueprint(1, config_id, true, 1),
        })
        .await
        .unwrap();
    }

    let claimed = p.claim_steps("w1", 10, Utc::now()).await.unwrap();
    assert_eq!(claimed.len(), 2);

    // Fail the first run; the second is still RUNNING.
    let result = p
        .advance_step(&AdvanceRequest {
            step_id: claimed[0].step_id,
            worker_id: "w1".to_string(),
            outcome: StepOutcome::Failed {
                message: "bad".to_string(),
            },
            next_step: None,
        })
        .await
        .unwrap();
    assert!(result.run_terminal);
    assert!(!result.group_terminal);
    assert_eq!(p.get_run_group(group.id).await.unwrap().unwrap().status, "ERROR");

    // Complete the second run: all terminal, one failed -> group FAILED.
    let result = p
        .advance_step(&AdvanceRequest {
            step_id: claimed[1].step_id,
            worker_id: "w1".to_string(),
            outcome: StepOutcome::Completed {
                metadata: serde_json::json!({}),
            },
            next_step: None,
        })
        .await
        .unwrap();
    assert!(result.group_terminal);
    assert_eq!(p.get_run_group(group.id).await.unwrap().unwrap().status, "FAILED");

    // Batch completion requires terminality, not success.
    assert!(p.get_batch(batch.id).await.unwrap().unwrap().completed_date.is_some());
}

#[tokio::test]
async fn test_lifecycle_event_sequence_happy_path() {
    let p = test_persistence().await;
    let (_batch, group, _run, config) = seed_single_run(&p, "sha256-h1", 1, false).await;

    // Four steps: parse, chunk, embed, store(is_last).
    for number in 1..=4i64 {
        let claimed = p.claim_steps("w1", 5, Utc::now()).await.unwrap();
        assert_eq!(claimed.len(), 1, "step {} should be claimable", number);
        assert_eq!(claimed[0].step_number, number);

        let is_last = number == 4;
        let next_step = if is_last {
            None
        } else {
            Some(step_blueprint(number + 1, config, number + 1 == 4, 1))
        };
        p.advance_step(&AdvanceRequest {
            step_id: claimed[0].step_id,
            worker_id: "w1".to_string(),
            outcome: StepOutcome::Completed {
                metadata: serde_json::json!({}),
            },
            next_step,
        })
        .await
        .unwrap();
    }

    let history = p.lifecycle_for_group(group).await.unwrap();
    let events: Vec<&str> = history.iter().map(|e| e.event.as_str()).collect();
    assert_eq!(
        events,
        vec![
            "group_start",
            "item_start",
            "step_start",
            "step_end",
            "step_start",
            "step_end",
            "step_start",
            "step_end",
            "step_start",
            "step_end",
            "item_end",
            "group_end",
        ]
    );

    // Timestamps are non-decreasing in read order.
    for pair in history.windows(2) {
        assert!(pair[0].start_date <= pair[1].start_date);
    }
}

// ============================================================================
// Worker check-ins and stale recovery
// ============================================================================

#[tokio::test]
async fn test_worker_checkin_upsert() {
    let p = test_persistence().await;
    let first = Utc::now();
    p.worker_checkin("w1", first).await.unwrap();

    let later = first + chrono::Duration::seconds(30);
    p.worker_checkin("w1", later).await.unwrap();

    let checkins = p.list_worker_checkins().await.unwrap();
    assert_eq!(checkins.len(), 1);
    assert!((checkins[0].first_checkin - first).num_seconds().abs() < 1);
    assert!((checkins[0].last_checkin - later).num_seconds().abs() < 1);
    assert!(checkins[0].last_checkin >= checkins[0].first_checkin);

    p.remove_worker("w1").await.unwrap();
    assert!(p.list_worker_checkins().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_stale_worker_recovery() {
    let p = test_persistence().await;
    let (_batch, group, run, _config) = seed_single_run(&p, "sha256-w1", 1, true).await;

    let now = Utc::now();
    p.worker_checkin("w1", now).await.unwrap();
    let claimed = p.claim_steps("w1", 5, now).await.unwrap();
    assert_eq!(claimed.len(), 1);

    // Too early: nothing is reclaimed.
    let early = p
        .recover_stale_steps(now + chrono::Duration::seconds(30), Duration::from_secs(600))
        .await
        .unwrap();
    assert!(early.is_empty());
    let steps = p.steps_for_run(run).await.unwrap();
    assert_eq!(steps[0].status, "RUNNING");

    // Past the threshold: the step returns to PENDING with the worker cleared.
    let reclaimed = p
        .recover_stale_steps(now + chrono::Duration::seconds(601), Duration::from_secs(600))
        .await
        .unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].worker_id, "w1");

    let steps = p.steps_for_run(run).await.unwrap();
    assert_eq!(steps[0].status, "PENDING");
    assert!(steps[0].worker_id.is_none());

    // The reclaim is recorded with its reason.
    let history = p.lifecycle_for_group(group).await.unwrap();
    let reclaim = history
        .iter()
        .find(|e| e.event == "step_failed")
        .expect("reclaim event");
    assert!(
        reclaim
            .status_message
            .as_deref()
            .unwrap()
            .contains("reclaimed from stale worker")
    );

    // The stale check-in row is gone; another worker picks the step up.
    assert!(p.list_worker_checkins().await.unwrap().is_empty());
    let second = p
        .claim_steps("w2", 5, now + chrono::Duration::seconds(602))
        .await
        .unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].step_id, claimed[0].step_id);
}

// ============================================================================
// Cascading deletion
// ============================================================================

#[tokio::test]
async fn test_delete_run_group_cascades() {
    let p = test_persistence().await;
    let (_batch, group, run, _config) = seed_single_run(&p, "sha256-d1", 1, true).await;

    let claimed = p.claim_steps("w1", 5, Utc::now()).await.unwrap();
    p.advance_step(&AdvanceRequest {
        step_id: claimed[0].step_id,
        worker_id: "w1".to_string(),
        outcome: StepOutcome::Completed {
            metadata: serde_json::json!({}),
        },
        next_step: None,
    })
    .await
    .unwrap();

    let counts = p.delete_run_group(group).await.unwrap();
    assert_eq!(counts.run_groups, 1);
    assert_eq!(counts.workflow_runs, 1);
    assert_eq!(counts.run_steps, 1);
    assert!(counts.lifecycle_history > 0);
    assert_eq!(counts.total(), counts.run_groups + counts.workflow_runs
        + counts.run_steps + counts.lifecycle_history);

    assert!(p.get_run_group(group).await.unwrap().is_none());
    assert!(p.get_workflow_run(run).await.unwrap().is_none());
    assert!(p.lifecycle_for_group(group).await.unwrap().is_empty());

    // Second delete: NotFound, nothing changed.
    let err = p.delete_run_group(group).await.unwrap_err();
    assert_eq!(err.error_code(), "NOT_FOUND");

    // The document itself is untouched.
    assert!(p.get_document("sha256-d1").await.unwrap().is_some());
}

#[tokio::test]
async fn test_delete_last_uri_cascades_to_document() {
    let p = test_persistence().await;
    let (_batch, _group, run, _config) = seed_single_run(&p, "sha256-d2", 1, true).await;

    let artifacts = MemoryArtifactStore::default();
    artifacts
        .put("sha256-d2", ArtifactKind::Raw, b"raw bytes")
        .await
        .unwrap();
    artifacts
        .put("sha256-d2", ArtifactKind::Chunks, b"[]")
        .await
        .unwrap();

    let counts = p
        .delete_document_uri("/sha256-d2", "s", &artifacts)
        .await
        .unwrap();

    assert_eq!(counts.document_uris, 1);
    assert_eq!(counts.documents, 1);
    assert_eq!(counts.workflow_runs, 1);
    assert_eq!(counts.run_steps, 1);
    assert_eq!(counts.uri_history, 1);
    assert_eq!(counts.artifacts, 2);

    assert!(p.get_document("sha256-d2").await.unwrap().is_none());
    assert!(p.get_workflow_run(run).await.unwrap().is_none());
    assert!(!artifacts.exists("sha256-d2", ArtifactKind::Raw).await.unwrap());
}

#[tokio::test]
async fn test_delete_uri_with_siblings_keeps_document() {
    let p = test_persistence().await;
    let batch = p.create_batch("s", None, serde_json::json!({})).await.unwrap();
    p.record_ingest(&ingest_request(batch.id, "/a", "sha256-d3"))
        .await
        .unwrap();
    p.record_ingest(&ingest_request(batch.id, "/b", "sha256-d3"))
        .await
        .unwrap();

    let artifacts = MemoryArtifactStore::default();
    artifacts
        .put("sha256-d3", ArtifactKind::Raw, b"raw")
        .await
        .unwrap();

    let counts = p.delete_document_uri("/a", "s", &artifacts).await.unwrap();
    assert_eq!(counts.document_uris, 1);
    assert_eq!(counts.documents, 0);
    assert_eq!(counts.artifacts, 0);

    assert!(p.get_document("sha256-d3").await.unwrap().is_some());
    assert!(p.find_document_uri("/b", "s").await.unwrap().is_some());
    assert!(artifacts.exists("sha256-d3", ArtifactKind::Raw).await.unwrap());
}

#[tokio::test]
async fn test_delete_uri_artifact_failure_rolls_back() {
    let p = test_persistence().await;
    seed_single_run(&p, "sha256-d4", 1, true).await;

    let artifacts = MemoryArtifactStore {
        fail_deletes: true,
        ..Default::default()
    };

    let err = p
        .delete_document_uri("/sha256-d4", "s", &artifacts)
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "ARTIFACT_STORAGE_ERROR");

    // Everything survives the rollback.
    assert!(p.get_document("sha256-d4").await.unwrap().is_some());
    assert!(p.find_document_uri("/sha256-d4", "s").await.unwrap().is_some());
}

#[tokio::test]
async fn test_delete_uri_with_database_backed_artifacts() {
    let p = test_persistence().await;
    seed_single_run(&p, "sha256-d5", 1, true).await;

    p.put_artifact_bytes("sha256-d5", "raw", "default", b"raw")
        .await
        .unwrap();
    p.put_artifact_bytes("sha256-d5", "chunks", "default", b"[]")
        .await
        .unwrap();

    /// Stand-in for DbArtifactStore: rows live in the engine database, so
    /// the cascade must remove them in its own transaction instead of
    /// calling back in.
    struct DbBacked;
    #[async_trait::async_trait]
    impl ArtifactStore for DbBacked {
        async fn put(&self, _: &str, _: ArtifactKind, _: &[u8]) -> Result<(), ArtifactError> {
            Ok(())
        }
        async fn get(&self, hash: &str, kind: ArtifactKind) -> Result<Vec<u8>, ArtifactError> {
            Err(ArtifactError::not_found(hash, kind))
        }
        async fn exists(&self, _: &str, _: ArtifactKind) -> Result<bool, ArtifactError> {
            Ok(false)
        }
        async fn delete_all_for(&self, _: &str) -> Result<u64, ArtifactError> {
            panic!("cascade must not call a database-backed store mid-transaction");
        }
        fn is_database_backed(&self) -> bool {
            true
        }
    }

    let counts = p
        .delete_document_uri("/sha256-d5", "s", &DbBacked)
        .await
        .unwrap();
    assert_eq!(counts.artifacts, 2);
    assert!(
        !p.artifact_bytes_exist("sha256-d5", "raw", "default")
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn test_delete_unknown_uri_not_found() {
    let p = test_persistence().await;
    let artifacts = MemoryArtifactStore::default();
    let err = p
        .delete_document_uri("/nope", "s", &artifacts)
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "NOT_FOUND");
}

// ============================================================================
// Stats, reset, listings
// ============================================================================

#[tokio::test]
async fn test_run_group_stats_and_reset() {
    let p = test_persistence().await;
    let (_batch, group, run, _config) = seed_single_run(&p, "sha256-s1", 1, true).await;

    let stats = p.run_group_stats(group).await.unwrap();
    assert_eq!(stats["PENDING"], 1);
    assert_eq!(stats["RUNNING"], 0);

    let claimed = p.claim_steps("w1", 5, Utc::now()).await.unwrap();
    p.advance_step(&AdvanceRequest {
        step_id: claimed[0].step_id,
        worker_id: "w1".to_string(),
        outcome: StepOutcome::Failed {
            message: "bad".to_string(),
        },
        next_step: None,
    })
    .await
    .unwrap();

    let stats = p.run_group_stats(group).await.unwrap();
    assert_eq!(stats["FAILED"], 1);

    let reset = p.reset_failed_steps(group).await.unwrap();
    assert_eq!(reset, 1);

    let steps = p.steps_for_run(run).await.unwrap();
    assert_eq!(steps[0].status, "PENDING");
    assert_eq!(steps[0].retry, 0);
    assert_eq!(p.get_run_group(group).await.unwrap().unwrap().status, "RUNNING");

    // The reset step is claimable again.
    assert_eq!(p.claim_steps("w1", 5, Utc::now()).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_step_config_dedup() {
    let p = test_persistence().await;
    let config = serde_json::json!({"ocr": true});
    let a = p
        .get_or_create_step_config(StepType::Parse, &config, r#"{"parse":{"ocr":true}}"#)
        .await
        .unwrap();
    let b = p
        .get_or_create_step_config(StepType::Parse, &config, r#"{"parse":{"ocr":true}}"#)
        .await
        .unwrap();
    assert_eq!(a, b);

    let c = p
        .get_or_create_step_config(StepType::Parse, &config, r#"{"parse":{"ocr":false}}"#)
        .await
        .unwrap();
    assert_ne!(a, c);

    let record = p.get_step_config(a).await.unwrap().unwrap();
    assert_eq!(record.step_type, "parse");
    assert_eq!(record.config, config);
}

#[tokio::test]
async fn test_list_workflow_runs_pagination() {
    let p = test_persistence().await;
    for i in 0..5 {
        seed_single_run(&p, &format!("sha256-lp{}", i), 1, true).await;
    }

    let (page, total) = p.list_workflow_runs(None, 2, 0).await.unwrap();
    assert_eq!(page.len(), 2);
    assert_eq!(total, 5);

    let (rest, _) = p.list_workflow_runs(None, 10, 4).await.unwrap();
    assert_eq!(rest.len(), 1);
}

#[tokio::test]
async fn test_update_document_meta() {
    let p = test_persistence().await;
    let batch = p.create_batch("s", None, serde_json::json!({})).await.unwrap();
    p.record_ingest(&ingest_request(batch.id, "/a", "sha256-m1"))
        .await
        .unwrap();

    p.update_document_meta("sha256-m1", serde_json::json!({"title": "Q3 report"}))
        .await
        .unwrap();
    let doc = p.get_document("sha256-m1").await.unwrap().unwrap();
    assert_eq!(doc.doc_meta["title"], "Q3 report");

    let err = p
        .update_document_meta("sha256-missing", serde_json::json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::NotFound { .. }));
}
