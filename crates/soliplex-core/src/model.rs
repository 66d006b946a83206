// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Record structs and enums for the ingestion data model.
//!
//! Statuses are stored as TEXT in both backends; the enums here carry the
//! canonical string forms and the terminality rules the scheduler relies on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Enums
// ============================================================================

/// Execution status shared by run groups, workflow runs, and run steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    /// Not yet started.
    Pending,
    /// Currently executing.
    Running,
    /// Finished successfully. Terminal.
    Completed,
    /// Failed but not given up: a step awaiting retry, or a group with a
    /// failed run while sibling runs are still live. Non-terminal.
    Error,
    /// Gave up. Terminal.
    Failed,
}

impl RunStatus {
    /// Canonical string form as stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Error => "ERROR",
            Self::Failed => "FAILED",
        }
    }

    /// Parse the stored string form. Unknown values map to `None`.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "RUNNING" => Some(Self::Running),
            "COMPLETED" => Some(Self::Completed),
            "ERROR" => Some(Self::Error),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    /// COMPLETED and FAILED are terminal; everything else can still move.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// The workflow step types the engine recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    /// Make raw bytes available as the `raw` artifact.
    Ingest,
    /// Reject malformed inputs.
    Validate,
    /// Produce `parsed-text` / `parsed-structured` artifacts.
    Parse,
    /// Produce the `chunks` artifact.
    Chunk,
    /// Produce the `embeddings` artifact.
    Embed,
    /// Produce the `store-receipt` artifact in a vector store.
    Store,
    /// Add fields to document metadata.
    Enrich,
    /// Conditional transition.
    Route,
}

impl StepType {
    /// Canonical string form as stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ingest => "ingest",
            Self::Validate => "validate",
            Self::Parse => "parse",
            Self::Chunk => "chunk",
            Self::Embed => "embed",
            Self::Store => "store",
            Self::Enrich => "enrich",
            Self::Route => "route",
        }
    }

    /// Parse the stored string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ingest" => Some(Self::Ingest),
            "validate" => Some(Self::Validate),
            "parse" => Some(Self::Parse),
            "chunk" => Some(Self::Chunk),
            "embed" => Some(Self::Embed),
            "store" => Some(Self::Store),
            "enrich" => Some(Self::Enrich),
            "route" => Some(Self::Route),
            _ => None,
        }
    }

    /// All step types, in canonical pipeline order.
    pub fn all() -> [StepType; 8] {
        [
            Self::Ingest,
            Self::Validate,
            Self::Parse,
            Self::Chunk,
            Self::Embed,
            Self::Store,
            Self::Enrich,
            Self::Route,
        ]
    }
}

/// A stable label for a class of intermediate output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArtifactKind {
    /// The original document bytes.
    Raw,
    /// Parsed plain-text rendition.
    ParsedText,
    /// Parsed structured rendition.
    ParsedStructured,
    /// Chunked text, JSON-encoded.
    Chunks,
    /// Embedding vectors, JSON-encoded.
    Embeddings,
    /// Receipt returned by the vector store on upsert.
    StoreReceipt,
}

impl ArtifactKind {
    /// Canonical string form used in storage paths and the database backend.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::ParsedText => "parsed-text",
            Self::ParsedStructured => "parsed-structured",
            Self::Chunks => "chunks",
            Self::Embeddings => "embeddings",
            Self::StoreReceipt => "store-receipt",
        }
    }

    /// Parse the stored string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "raw" => Some(Self::Raw),
            "parsed-text" => Some(Self::ParsedText),
            "parsed-structured" => Some(Self::ParsedStructured),
            "chunks" => Some(Self::Chunks),
            "embeddings" => Some(Self::Embeddings),
            "store-receipt" => Some(Self::StoreReceipt),
            _ => None,
        }
    }

    /// Every artifact kind, used by `delete_all_for` sweeps.
    pub fn all() -> [ArtifactKind; 6] {
        [
            Self::Raw,
            Self::ParsedText,
            Self::ParsedStructured,
            Self::Chunks,
            Self::Embeddings,
            Self::StoreReceipt,
        ]
    }
}

/// Engine lifecycle events recorded in `lifecycle_history`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEvent {
    /// First step of the first run of a group claimed.
    GroupStart,
    /// Every run of the group reached a terminal status.
    GroupEnd,
    /// First step of a run claimed.
    ItemStart,
    /// Last step of a run completed.
    ItemEnd,
    /// A run failed.
    ItemFailed,
    /// A step was claimed.
    StepStart,
    /// A step completed.
    StepEnd,
    /// A step failed (transiently or terminally) or was reclaimed.
    StepFailed,
}

impl LifecycleEvent {
    /// Canonical string form as stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GroupStart => "group_start",
            Self::GroupEnd => "group_end",
            Self::ItemStart => "item_start",
            Self::ItemEnd => "item_end",
            Self::ItemFailed => "item_failed",
            Self::StepStart => "step_start",
            Self::StepEnd => "step_end",
            Self::StepFailed => "step_failed",
        }
    }
}

// ============================================================================
// Records
// ============================================================================

/// A batch of documents ingested together for operational accounting.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BatchRecord {
    /// Database primary key.
    pub id: i64,
    /// Optional display name.
    pub name: Option<String>,
    /// Source system tag the batch was ingested from.
    pub source: String,
    /// When the batch was opened.
    pub start_date: DateTime<Utc>,
    /// Set once every run of every group for this batch is terminal.
    pub completed_date: Option<DateTime<Utc>>,
    /// Free-form parameters supplied by the ingesting client.
    pub batch_params: serde_json::Value,
}

/// The content-addressed unit of processing.
///
/// Exactly one row exists per distinct content hash; any number of
/// [`DocumentUriRecord`] rows may reference it.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DocumentRecord {
    /// Content hash in `sha256-<hex>` form. Primary key.
    pub hash: String,
    /// MIME type reported or guessed at ingest.
    pub mime_type: String,
    /// Size of the raw bytes.
    pub file_size: Option<i64>,
    /// Free-form metadata, extended by `enrich` steps.
    pub doc_meta: serde_json::Value,
    /// Batch that first ingested this content.
    pub batch_id: Option<i64>,
}

/// A named reference into a source system, unique on (uri, source).
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DocumentUriRecord {
    /// Database primary key.
    pub id: i64,
    /// Hash of the document this URI currently points at.
    pub doc_hash: String,
    /// The identifier / path on the source system.
    pub uri: String,
    /// Source system identifier.
    pub source: String,
    /// Monotonically increasing per (uri, source); bumped when the content
    /// hash behind the URI changes.
    pub version: i64,
    /// Batch of the most recent ingest that touched this URI.
    pub batch_id: Option<i64>,
}

/// Append-only transition log for a document URI.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DocumentUriHistoryRecord {
    /// Database primary key.
    pub id: i64,
    /// The URI row this transition belongs to.
    pub doc_uri_id: i64,
    /// URI version at the time of the transition.
    pub version: i64,
    /// Content hash at the time of the transition.
    pub hash: String,
    /// One of `created`, `updated`, `deleted`.
    pub action: String,
    /// When the transition was recorded.
    pub process_date: DateTime<Utc>,
    /// Batch responsible for the transition, if any.
    pub batch_id: Option<i64>,
    /// Free-form metadata captured with the transition.
    pub hist_meta: serde_json::Value,
}

/// The batch-wide execution record created when workflows are started.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RunGroupRecord {
    /// Database primary key.
    pub id: i64,
    /// Optional display name.
    pub name: Option<String>,
    /// Workflow definition the group executes.
    pub workflow_id: String,
    /// Parameter set selected for the group.
    pub param_id: String,
    /// Batch the group processes.
    pub batch_id: i64,
    /// When the group was created.
    pub created_date: DateTime<Utc>,
    /// When the group was created (runs may start later).
    pub start_date: DateTime<Utc>,
    /// Set when the group reaches a terminal status.
    pub completed_date: Option<DateTime<Utc>>,
    /// Current status string, see [`RunStatus`].
    pub status: String,
    /// When the status last changed.
    pub status_date: DateTime<Utc>,
    /// Human-readable status detail.
    pub status_message: Option<String>,
    /// Structured status detail.
    pub status_meta: serde_json::Value,
}

/// The per-document execution of one workflow definition.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct WorkflowRunRecord {
    /// Database primary key.
    pub id: i64,
    /// Workflow definition this run executes.
    pub workflow_id: String,
    /// Owning run group.
    pub run_group_id: i64,
    /// Batch the document belongs to.
    pub batch_id: i64,
    /// Content hash of the document being processed.
    pub doc_hash: String,
    /// Claim priority; higher claims first.
    pub priority: i64,
    /// When the run was created.
    pub created_date: DateTime<Utc>,
    /// When the first step was claimed.
    pub start_date: Option<DateTime<Utc>>,
    /// Set when the run reaches a terminal status.
    pub completed_date: Option<DateTime<Utc>>,
    /// Current status string, see [`RunStatus`].
    pub status: String,
    /// When the status last changed.
    pub status_date: DateTime<Utc>,
    /// Human-readable status detail.
    pub status_message: Option<String>,
    /// Structured status detail.
    pub status_meta: serde_json::Value,
    /// Ambient parameters recorded at run creation.
    pub run_params: serde_json::Value,
}

/// One step's execution record within a workflow run.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RunStepRecord {
    /// Database primary key.
    pub id: i64,
    /// Owning workflow run.
    pub workflow_run_id: i64,
    /// 1-based position within the workflow.
    pub step_number: i64,
    /// Step name from the workflow definition.
    pub step_name: String,
    /// Step type string, see [`StepType`].
    pub step_type: String,
    /// Materialized configuration for this step.
    pub step_config_id: i64,
    /// True for the final step of the workflow.
    pub is_last_step: bool,
    /// Claim priority, copied from the run.
    pub priority: i64,
    /// When the step row was created.
    pub created_date: DateTime<Utc>,
    /// When a worker first claimed the step.
    pub start_date: Option<DateTime<Utc>>,
    /// When the status last changed.
    pub status_date: DateTime<Utc>,
    /// Set when the step completes.
    pub completed_date: Option<DateTime<Utc>>,
    /// Retry gate: the claim predicate ignores the step until this passes.
    pub not_before: Option<DateTime<Utc>>,
    /// Retry attempts consumed so far.
    pub retry: i64,
    /// Retry budget from the workflow definition.
    pub retries: i64,
    /// Current status string, see [`RunStatus`].
    pub status: String,
    /// Human-readable status detail.
    pub status_message: Option<String>,
    /// Structured status detail.
    pub status_meta: serde_json::Value,
    /// Worker holding the claim while RUNNING.
    pub worker_id: Option<String>,
}

/// An immutable, deduplicated step configuration.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StepConfigRecord {
    /// Database primary key.
    pub id: i64,
    /// Step type string, see [`StepType`].
    pub step_type: String,
    /// Options for this step from the parameter set.
    pub config: serde_json::Value,
    /// Canonical JSON snapshot of this step's config merged over all
    /// predecessors. The dedup key together with `step_type`.
    pub cumulative_config: String,
    /// When the row was created.
    pub created_date: DateTime<Utc>,
}

/// Worker liveness record, upserted by the heartbeat.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct WorkerCheckinRecord {
    /// Worker identifier (UUID string).
    pub worker_id: String,
    /// First heartbeat seen.
    pub first_checkin: DateTime<Utc>,
    /// Most recent heartbeat. Staleness is measured against this.
    pub last_checkin: DateTime<Utc>,
}

/// Append-only audit record for engine lifecycle transitions.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LifecycleHistoryRecord {
    /// Database primary key.
    pub id: i64,
    /// Event kind string, see [`LifecycleEvent`].
    pub event: String,
    /// Owning run group.
    pub run_group_id: i64,
    /// Workflow run, when the event is run- or step-scoped.
    pub workflow_run_id: Option<i64>,
    /// Run step, when the event is step-scoped.
    pub step_id: Option<i64>,
    /// When the recorded transition happened.
    pub start_date: DateTime<Utc>,
    /// End timestamp for events that close a span.
    pub completed_date: Option<DateTime<Utc>>,
    /// Status at the transition.
    pub status: String,
    /// When the status was recorded.
    pub status_date: DateTime<Utc>,
    /// Human-readable detail.
    pub status_message: Option<String>,
    /// Structured detail.
    pub status_meta: serde_json::Value,
}

// ============================================================================
// Inputs and outcomes
// ============================================================================

/// Input for recording one document ingest.
#[derive(Debug, Clone)]
pub struct IngestRequest {
    /// URI on the source system.
    pub uri: String,
    /// Source system identifier.
    pub source: String,
    /// Content hash of the bytes, `sha256-<hex>` form.
    pub doc_hash: String,
    /// MIME type of the content.
    pub mime_type: String,
    /// Size of the raw bytes.
    pub file_size: i64,
    /// Free-form metadata to attach to the document.
    pub doc_meta: serde_json::Value,
    /// Batch the ingest belongs to.
    pub batch_id: i64,
}

/// What an ingest did to the persisted state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// New (uri, source) mapping was created.
    Created {
        /// The new URI row id.
        uri_id: i64,
        /// Set when the content itself already existed: the batch that
        /// first ingested it.
        existing_document_batch: Option<i64>,
    },
    /// The URI existed but its content hash changed; version was bumped.
    Updated {
        /// The existing URI row id.
        uri_id: i64,
        /// The new version after the bump.
        version: i64,
    },
    /// Both the document and the mapping already existed with this hash.
    Unchanged {
        /// The existing URI row id.
        uri_id: i64,
        /// Batch that originally ingested the content.
        original_batch_id: Option<i64>,
    },
}

/// Blueprint for inserting a run step row.
#[derive(Debug, Clone)]
pub struct NewRunStep {
    /// 1-based position within the workflow.
    pub step_number: i64,
    /// Step name from the workflow definition.
    pub step_name: String,
    /// Step type.
    pub step_type: StepType,
    /// Materialized configuration id.
    pub step_config_id: i64,
    /// True for the final step of the workflow.
    pub is_last_step: bool,
    /// Retry budget.
    pub retries: i64,
    /// Claim priority.
    pub priority: i64,
}

/// Blueprint for creating a workflow run together with its first step.
#[derive(Debug, Clone)]
pub struct NewWorkflowRun {
    /// Owning run group.
    pub run_group_id: i64,
    /// Workflow definition id.
    pub workflow_id: String,
    /// Batch id.
    pub batch_id: i64,
    /// Document content hash.
    pub doc_hash: String,
    /// Claim priority.
    pub priority: i64,
    /// Ambient parameters to record on the run.
    pub run_params: serde_json::Value,
    /// The first step, seeded PENDING in the same transaction.
    pub first_step: NewRunStep,
}

/// A claimed step joined with the run, group, batch, and config context a
/// worker needs to execute it without further lookups.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ClaimedStep {
    /// The step row id.
    pub step_id: i64,
    /// Owning workflow run.
    pub workflow_run_id: i64,
    /// Owning run group.
    pub run_group_id: i64,
    /// Batch id.
    pub batch_id: i64,
    /// Source system tag of the batch.
    pub batch_source: String,
    /// Document content hash.
    pub doc_hash: String,
    /// Workflow definition id.
    pub workflow_id: String,
    /// Parameter set id of the group.
    pub param_id: String,
    /// 1-based position of the step.
    pub step_number: i64,
    /// Step name.
    pub step_name: String,
    /// Step type string.
    pub step_type: String,
    /// Materialized configuration id.
    pub step_config_id: i64,
    /// True for the final step.
    pub is_last_step: bool,
    /// Retry attempts consumed before this claim.
    pub retry: i64,
    /// Retry budget.
    pub retries: i64,
    /// Claim priority.
    pub priority: i64,
    /// Ambient run parameters.
    pub run_params: serde_json::Value,
    /// Per-step options for this step.
    pub config: serde_json::Value,
    /// Cumulative configuration snapshot (canonical JSON text).
    pub cumulative_config: String,
}

/// Terminal outcome of a handler invocation, as decided by the worker.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    /// The handler succeeded.
    Completed {
        /// Metadata map returned by the handler.
        metadata: serde_json::Value,
    },
    /// Transient failure with retry budget remaining: the step returns to
    /// PENDING behind a backoff gate.
    Retry {
        /// Failure description.
        message: String,
        /// Earliest instant the step may be claimed again.
        not_before: DateTime<Utc>,
    },
    /// Fatal failure, or a transient failure with the retry budget exhausted.
    Failed {
        /// Failure description.
        message: String,
    },
}

/// Input for advancing a step after its handler terminated.
#[derive(Debug, Clone)]
pub struct AdvanceRequest {
    /// The step to advance.
    pub step_id: i64,
    /// The worker that holds the claim. Advances from any other worker are
    /// rejected.
    pub worker_id: String,
    /// What happened.
    pub outcome: StepOutcome,
    /// The next step to seed when the outcome is `Completed` and the current
    /// step is not the last. Ignored otherwise.
    pub next_step: Option<NewRunStep>,
}

/// What the advance transaction did beyond the step itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdvanceResult {
    /// The owning run reached a terminal status.
    pub run_terminal: bool,
    /// The owning group reached a terminal status.
    pub group_terminal: bool,
    /// The owning batch was marked completed.
    pub batch_completed: bool,
}

/// A step returned to PENDING by stale-worker recovery.
#[derive(Debug, Clone)]
pub struct ReclaimedStep {
    /// The reclaimed step id.
    pub step_id: i64,
    /// The stale worker that held the claim.
    pub worker_id: String,
    /// Owning workflow run.
    pub workflow_run_id: i64,
}

/// Per-table deletion counts returned by the cascading deletes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeleteCounts {
    /// `run_groups` rows deleted.
    pub run_groups: u64,
    /// `workflow_runs` rows deleted.
    pub workflow_runs: u64,
    /// `run_steps` rows deleted.
    pub run_steps: u64,
    /// `lifecycle_history` rows deleted.
    pub lifecycle_history: u64,
    /// `document_uris` rows deleted.
    pub document_uris: u64,
    /// `document_uri_history` rows deleted.
    pub uri_history: u64,
    /// `documents` rows deleted.
    pub documents: u64,
    /// Artifacts removed through the artifact store.
    pub artifacts: u64,
}

impl DeleteCounts {
    /// Sum over every table.
    pub fn total(&self) -> u64 {
        self.run_groups
            + self.workflow_runs
            + self.run_steps
            + self.lifecycle_history
            + self.document_uris
            + self.uri_history
            + self.documents
            + self.artifacts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_status_roundtrip() {
        for status in [
            RunStatus::Pending,
            RunStatus::Running,
            RunStatus::Completed,
            RunStatus::Error,
            RunStatus::Failed,
        ] {
            assert_eq!(RunStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(RunStatus::parse("bogus"), None);
    }

    #[test]
    fn test_run_status_terminality() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(!RunStatus::Error.is_terminal());
    }

    #[test]
    fn test_step_type_roundtrip() {
        for st in StepType::all() {
            assert_eq!(StepType::parse(st.as_str()), Some(st));
        }
        assert_eq!(StepType::parse("compress"), None);
    }

    #[test]
    fn test_artifact_kind_roundtrip() {
        for kind in ArtifactKind::all() {
            assert_eq!(ArtifactKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ArtifactKind::parse("thumbnail"), None);
    }

    #[test]
    fn test_lifecycle_event_strings() {
        assert_eq!(LifecycleEvent::GroupStart.as_str(), "group_start");
        assert_eq!(LifecycleEvent::StepFailed.as_str(), "step_failed");
        assert_eq!(LifecycleEvent::ItemEnd.as_str(), "item_end");
    }

    #[test]
    fn test_delete_counts_total() {
        let counts = DeleteCounts {
            run_groups: 1,
            workflow_runs: 2,
            run_steps: 8,
            lifecycle_history: 12,
            document_uris: 1,
            uri_history: 3,
            documents: 1,
            artifacts: 4,
        };
        assert_eq!(counts.total(), 32);
    }
}
