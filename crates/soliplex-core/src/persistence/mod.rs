// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for the ingestion engine.
//!
//! The [`Persistence`] trait is the single seam between the engine and
//! durable storage. Two backends implement it with identical observable
//! semantics:
//!
//! - [`SqlitePersistence`]: embedded single-writer store for development and
//!   tests. Claims use a conditional `UPDATE .. WHERE status = 'PENDING'`
//!   that only one claimer can win.
//! - [`PostgresPersistence`]: concurrent client/server store for multi-worker
//!   production. Claims lock candidate rows with `FOR UPDATE SKIP LOCKED`.
//!
//! Every mutating method runs in a single transaction: it either commits the
//! whole state change (including the lifecycle-history rows that record it)
//! or rolls back on any error path. Workers coordinate only through these
//! methods; there is no other shared state.

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresPersistence;
pub use self::sqlite::SqlitePersistence;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::artifact::ArtifactStore;
use crate::error::IngestError;
use crate::model::{
    AdvanceRequest, AdvanceResult, BatchRecord, ClaimedStep, DeleteCounts, DocumentRecord,
    DocumentUriHistoryRecord, DocumentUriRecord, IngestOutcome, IngestRequest,
    LifecycleHistoryRecord, NewWorkflowRun, ReclaimedStep, RunGroupRecord, RunStepRecord,
    StepConfigRecord, StepType, WorkerCheckinRecord, WorkflowRunRecord,
};

/// Per-status run counts for one group, zero-filled for all statuses.
pub type StatusCounts = HashMap<String, i64>;

/// Durable storage operations used by the engine.
///
/// Claim and advance are the heart of the scheduler: see the crate-level
/// documentation for the state machine they enforce.
#[allow(missing_docs)]
#[async_trait]
pub trait Persistence: Send + Sync {
    // ------------------------------------------------------------------
    // Batches
    // ------------------------------------------------------------------

    /// Open a new batch for a source system.
    async fn create_batch(
        &self,
        source: &str,
        name: Option<&str>,
        params: serde_json::Value,
    ) -> Result<BatchRecord, IngestError>;

    async fn get_batch(&self, batch_id: i64) -> Result<Option<BatchRecord>, IngestError>;

    async fn list_batches(&self) -> Result<Vec<BatchRecord>, IngestError>;

    // ------------------------------------------------------------------
    // Documents and URIs
    // ------------------------------------------------------------------

    /// Record one ingest: create the document on first sight of its hash,
    /// create or re-point the (uri, source) mapping, and append the matching
    /// history row. The raw artifact is written by the caller before this.
    ///
    /// Fails with NotFound for an unknown batch and with a validation error
    /// for a batch that has already completed.
    async fn record_ingest(&self, req: &IngestRequest) -> Result<IngestOutcome, IngestError>;

    async fn get_document(&self, doc_hash: &str) -> Result<Option<DocumentRecord>, IngestError>;

    /// Replace a document's metadata map. Used by `enrich` handlers.
    async fn update_document_meta(
        &self,
        doc_hash: &str,
        doc_meta: serde_json::Value,
    ) -> Result<(), IngestError>;

    async fn find_document_uri(
        &self,
        uri: &str,
        source: &str,
    ) -> Result<Option<DocumentUriRecord>, IngestError>;

    async fn document_uris_by_hash(
        &self,
        doc_hash: &str,
    ) -> Result<Vec<DocumentUriRecord>, IngestError>;

    async fn uris_for_source(&self, source: &str) -> Result<Vec<DocumentUriRecord>, IngestError>;

    /// History rows for one URI, oldest first.
    async fn document_uri_history(
        &self,
        doc_uri_id: i64,
    ) -> Result<Vec<DocumentUriHistoryRecord>, IngestError>;

    /// Documents referenced by at least one URI of the batch.
    async fn documents_in_batch(&self, batch_id: i64) -> Result<Vec<DocumentRecord>, IngestError>;

    // ------------------------------------------------------------------
    // Workflow materialization
    // ------------------------------------------------------------------

    /// Create a run group for a batch. Fails with NotFound for an unknown
    /// batch.
    async fn create_run_group(
        &self,
        name: Option<&str>,
        workflow_id: &str,
        param_id: &str,
        batch_id: i64,
    ) -> Result<RunGroupRecord, IngestError>;

    /// Find or create the immutable step configuration identified by
    /// (step type, cumulative snapshot). Returns the row id either way.
    async fn get_or_create_step_config(
        &self,
        step_type: StepType,
        config: &serde_json::Value,
        cumulative_config: &str,
    ) -> Result<i64, IngestError>;

    async fn get_step_config(&self, id: i64) -> Result<Option<StepConfigRecord>, IngestError>;

    /// Create a workflow run and seed its first step as PENDING in the same
    /// transaction. Returns (run id, first step id).
    async fn create_workflow_run(&self, new: &NewWorkflowRun) -> Result<(i64, i64), IngestError>;

    async fn get_run_group(&self, id: i64) -> Result<Option<RunGroupRecord>, IngestError>;

    async fn list_run_groups(
        &self,
        batch_id: Option<i64>,
    ) -> Result<Vec<RunGroupRecord>, IngestError>;

    async fn get_workflow_run(&self, id: i64) -> Result<Option<WorkflowRunRecord>, IngestError>;

    /// Runs ordered newest-first with limit/offset pagination, plus the
    /// total row count for the filter.
    async fn list_workflow_runs(
        &self,
        batch_id: Option<i64>,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<WorkflowRunRecord>, i64), IngestError>;

    /// Steps of one run in step-number order.
    async fn steps_for_run(&self, workflow_run_id: i64)
    -> Result<Vec<RunStepRecord>, IngestError>;

    async fn get_run_step(&self, id: i64) -> Result<Option<RunStepRecord>, IngestError>;

    /// Count of runs per status for a group, zero-filled for all statuses.
    async fn run_group_stats(&self, run_group_id: i64) -> Result<StatusCounts, IngestError>;

    /// Return the FAILED runs of a group to a runnable state: their FAILED
    /// steps go back to PENDING with the retry counter cleared. Returns the
    /// number of steps reset.
    async fn reset_failed_steps(&self, run_group_id: i64) -> Result<u64, IngestError>;

    // ------------------------------------------------------------------
    // Scheduler
    // ------------------------------------------------------------------

    /// Claim up to `limit` eligible steps for `worker_id`.
    ///
    /// A step is eligible when it is PENDING, its `not_before` gate has
    /// passed, its run is non-terminal, no sibling step of the run is
    /// RUNNING, and its predecessor step is COMPLETED (or it is step 1).
    /// Candidates are ordered by priority descending, then creation time,
    /// then run id; at most one step per run is claimed per call.
    ///
    /// Claimed steps move to RUNNING with `worker_id` and `start_date` set.
    /// In the same transaction, the owning run and group are promoted to
    /// RUNNING on their first claim and the `group_start` / `item_start` /
    /// `step_start` lifecycle rows are written.
    async fn claim_steps(
        &self,
        worker_id: &str,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<ClaimedStep>, IngestError>;

    /// Apply a terminal handler outcome to a RUNNING step.
    ///
    /// Only the claiming worker may advance a step. In one transaction this
    /// writes the step's new status, the lifecycle rows recording it, the
    /// next PENDING step (completed, not last), the run/group/batch
    /// completion (completed, last), or the retry/failure bookkeeping.
    async fn advance_step(&self, req: &AdvanceRequest) -> Result<AdvanceResult, IngestError>;

    // ------------------------------------------------------------------
    // Workers
    // ------------------------------------------------------------------

    /// Upsert the heartbeat row for a worker.
    async fn worker_checkin(&self, worker_id: &str, now: DateTime<Utc>)
    -> Result<(), IngestError>;

    /// Remove a worker's heartbeat row on graceful shutdown.
    async fn remove_worker(&self, worker_id: &str) -> Result<(), IngestError>;

    async fn list_worker_checkins(&self) -> Result<Vec<WorkerCheckinRecord>, IngestError>;

    /// Reclaim RUNNING steps held by dead workers.
    ///
    /// A worker is stale when its last check-in is older than `stale_after`,
    /// or when it has no check-in row at all (it shut down or was already
    /// swept). Reclaimed steps return to PENDING with `worker_id` cleared and
    /// a `step_failed` lifecycle row explaining the reclaim; stale check-in
    /// rows are removed. This is the only way RUNNING steps can be unstuck.
    async fn recover_stale_steps(
        &self,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<Vec<ReclaimedStep>, IngestError>;

    // ------------------------------------------------------------------
    // Lifecycle history
    // ------------------------------------------------------------------

    /// History rows for a group, in start-time order.
    async fn lifecycle_for_group(
        &self,
        run_group_id: i64,
    ) -> Result<Vec<LifecycleHistoryRecord>, IngestError>;

    /// History rows for a run, in start-time order.
    async fn lifecycle_for_run(
        &self,
        workflow_run_id: i64,
    ) -> Result<Vec<LifecycleHistoryRecord>, IngestError>;

    // ------------------------------------------------------------------
    // Cascading deletion
    // ------------------------------------------------------------------

    /// Delete a run group with its runs, steps, and lifecycle history.
    /// Fails with NotFound if the group does not exist.
    async fn delete_run_group(&self, run_group_id: i64) -> Result<DeleteCounts, IngestError>;

    /// Delete a (uri, source) mapping. When it is the last reference to its
    /// document, the document, its runs, steps, lifecycle history, and every
    /// artifact (through `artifacts`) are deleted as well. Any artifact
    /// backend error fails the whole transaction.
    async fn delete_document_uri(
        &self,
        uri: &str,
        source: &str,
        artifacts: &dyn ArtifactStore,
    ) -> Result<DeleteCounts, IngestError>;

    // ------------------------------------------------------------------
    // Artifact bytes (backing store for the `db` artifact backend)
    // ------------------------------------------------------------------

    /// Idempotently store artifact bytes under (hash, kind, storage root).
    async fn put_artifact_bytes(
        &self,
        hash: &str,
        kind: &str,
        storage_root: &str,
        bytes: &[u8],
    ) -> Result<(), IngestError>;

    async fn get_artifact_bytes(
        &self,
        hash: &str,
        kind: &str,
        storage_root: &str,
    ) -> Result<Option<Vec<u8>>, IngestError>;

    async fn artifact_bytes_exist(
        &self,
        hash: &str,
        kind: &str,
        storage_root: &str,
    ) -> Result<bool, IngestError>;

    /// Remove every artifact kind stored for `hash` under `storage_root`,
    /// returning the number of rows removed.
    async fn delete_artifact_bytes_for(
        &self,
        hash: &str,
        storage_root: &str,
    ) -> Result<u64, IngestError>;
}
