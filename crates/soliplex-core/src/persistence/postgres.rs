// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed persistence implementation.
//!
//! The concurrent client/server backend. Claims lock candidate rows with
//! `FOR UPDATE SKIP LOCKED`, so parallel workers polling the same table
//! never block each other and never claim the same step. Deletion paths
//! serialize on the document row with `FOR UPDATE`.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::artifact::ArtifactStore;
use crate::error::IngestError;
use crate::model::{
    AdvanceRequest, AdvanceResult, BatchRecord, ClaimedStep, DeleteCounts, DocumentRecord,
    DocumentUriHistoryRecord, DocumentUriRecord, IngestOutcome, IngestRequest, LifecycleEvent,
    LifecycleHistoryRecord, NewRunStep, NewWorkflowRun, ReclaimedStep, RunGroupRecord,
    RunStatus, RunStepRecord, StepConfigRecord, StepOutcome, StepType, WorkerCheckinRecord,
    WorkflowRunRecord,
};

use super::{Persistence, StatusCounts};

type Tx<'a> = sqlx::Transaction<'a, sqlx::Postgres>;

const CLAIMED_STEP_SQL: &str = r#"
    SELECT s.id AS step_id, s.workflow_run_id, r.run_group_id, r.batch_id,
           b.source AS batch_source, r.doc_hash, r.workflow_id, g.param_id,
           s.step_number, s.step_name, s.step_type, s.step_config_id,
           s.is_last_step, s.retry, s.retries, s.priority, r.run_params,
           c.config, c.cumulative_config
    FROM run_steps s
    JOIN workflow_runs r ON r.id = s.workflow_run_id
    JOIN run_groups g ON g.id = r.run_group_id
    JOIN document_batches b ON b.id = r.batch_id
    JOIN step_configs c ON c.id = s.step_config_id
    WHERE s.id = $1
    "#;

/// PostgreSQL-backed persistence provider.
#[derive(Clone)]
pub struct PostgresPersistence {
    pool: PgPool,
}

impl PostgresPersistence {
    /// Create a new Postgres persistence provider from an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `database_url` and run migrations.
    pub async fn connect(database_url: &str) -> Result<Self, IngestError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| IngestError::Database {
                operation: "connect".to_string(),
                details: e.to_string(),
            })?;

        crate::migrations::run_postgres(&pool)
            .await
            .map_err(|e| IngestError::Database {
                operation: "migrate".to_string(),
                details: e.to_string(),
            })?;

        Ok(Self { pool })
    }

    /// Access the underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[allow(clippy::too_many_arguments)]
async fn insert_lifecycle(
    tx: &mut Tx<'_>,
    event: LifecycleEvent,
    run_group_id: i64,
    workflow_run_id: Option<i64>,
    step_id: Option<i64>,
    status: RunStatus,
    message: Option<&str>,
    meta: serde_json::Value,
    closes: bool,
    now: DateTime<Utc>,
) -> Result<(), IngestError> {
    let completed_date = if closes { Some(now) } else { None };
    sqlx::query(
        r#"
        INSERT INTO lifecycle_history
            (event, run_group_id, workflow_run_id, step_id, start_date,
             completed_date, status, status_date, status_message, status_meta)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $5, $8, $9)
        "#,
    )
    .bind(event.as_str())
    .bind(run_group_id)
    .bind(workflow_run_id)
    .bind(step_id)
    .bind(now)
    .bind(completed_date)
    .bind(status.as_str())
    .bind(message)
    .bind(meta)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

async fn insert_run_step(
    tx: &mut Tx<'_>,
    workflow_run_id: i64,
    step: &NewRunStep,
    now: DateTime<Utc>,
) -> Result<i64, IngestError> {
    let id = sqlx::query_scalar::<_, i64>(
        r#"
        INSERT INTO run_steps
            (workflow_run_id, step_number, step_name, step_type, step_config_id,
             is_last_step, priority, created_date, status_date, retry, retries,
             status, status_meta)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8, 0, $9, 'PENDING', '{}')
        RETURNING id
        "#,
    )
    .bind(workflow_run_id)
    .bind(step.step_number)
    .bind(&step.step_name)
    .bind(step.step_type.as_str())
    .bind(step.step_config_id)
    .bind(step.is_last_step)
    .bind(step.priority)
    .bind(now)
    .bind(step.retries)
    .fetch_one(&mut **tx)
    .await?;

    Ok(id)
}

async fn insert_uri_history(
    tx: &mut Tx<'_>,
    doc_uri_id: i64,
    version: i64,
    hash: &str,
    action: &str,
    batch_id: Option<i64>,
    hist_meta: serde_json::Value,
    now: DateTime<Utc>,
) -> Result<(), IngestError> {
    sqlx::query(
        r#"
        INSERT INTO document_uri_history
            (doc_uri_id, version, hash, action, process_date, batch_id, hist_meta)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(doc_uri_id)
    .bind(version)
    .bind(hash)
    .bind(action)
    .bind(now)
    .bind(batch_id)
    .bind(hist_meta)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

async fn finish_group_if_done(
    tx: &mut Tx<'_>,
    run_group_id: i64,
    batch_id: i64,
    now: DateTime<Utc>,
) -> Result<(bool, bool), IngestError> {
    let non_terminal: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM workflow_runs
        WHERE run_group_id = $1 AND status NOT IN ('COMPLETED', 'FAILED')
        "#,
    )
    .bind(run_group_id)
    .fetch_one(&mut **tx)
    .await?;

    if non_terminal > 0 {
        return Ok((false, false));
    }

    let failed: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM workflow_runs WHERE run_group_id = $1 AND status = 'FAILED'",
    )
    .bind(run_group_id)
    .fetch_one(&mut **tx)
    .await?;

    let group_status = if failed > 0 {
        RunStatus::Failed
    } else {
        RunStatus::Completed
    };

    sqlx::query(
        r#"
        UPDATE run_groups
        SET status = $1, status_date = $2, completed_date = $2
        WHERE id = $3 AND status NOT IN ('COMPLETED', 'FAILED')
        "#,
    )
    .bind(group_status.as_str())
    .bind(now)
    .bind(run_group_id)
    .execute(&mut **tx)
    .await?;

    insert_lifecycle(
        tx,
        LifecycleEvent::GroupEnd,
        run_group_id,
        None,
        None,
        group_status,
        None,
        serde_json::json!({}),
        true,
        now,
    )
    .await?;

    let live_groups: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM run_groups
        WHERE batch_id = $1 AND status NOT IN ('COMPLETED', 'FAILED')
        "#,
    )
    .bind(batch_id)
    .fetch_one(&mut **tx)
    .await?;

    let mut batch_completed = false;
    if live_groups == 0 {
        let res = sqlx::query(
            "UPDATE document_batches SET completed_date = $1 WHERE id = $2 AND completed_date IS NULL",
        )
        .bind(now)
        .bind(batch_id)
        .execute(&mut **tx)
        .await?;
        batch_completed = res.rows_affected() > 0;
    }

    Ok((true, batch_completed))
}

#[async_trait::async_trait]
impl Persistence for PostgresPersistence {
    // ------------------------------------------------------------------
    // Batches
    // ------------------------------------------------------------------

    async fn create_batch(
        &self,
        source: &str,
        name: Option<&str>,
        params: serde_json::Value,
    ) -> Result<BatchRecord, IngestError> {
        let now = Utc::now();
        let record = sqlx::query_as::<_, BatchRecord>(
            r#"
            INSERT INTO document_batches (name, source, start_date, batch_params)
            VALUES ($1, $2, $3, $4)
            RETURNING id, name, source, start_date, completed_date, batch_params
            "#,
        )
        .bind(name)
        .bind(source)
        .bind(now)
        .bind(params)
        .fetch_one(&self.pool)
        .await?;

        Ok(record)
    }

    async fn get_batch(&self, batch_id: i64) -> Result<Option<BatchRecord>, IngestError> {
        let record = sqlx::query_as::<_, BatchRecord>(
            r#"
            SELECT id, name, source, start_date, completed_date, batch_params
            FROM document_batches
            WHERE id = $1
            "#,
        )
        .bind(batch_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn list_batches(&self) -> Result<Vec<BatchRecord>, IngestError> {
        let rows = sqlx::query_as::<_, BatchRecord>(
            r#"
            SELECT id, name, source, start_date, completed_date, batch_params
            FROM document_batches
            ORDER BY start_date DESC, id DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    // ------------------------------------------------------------------
    // Documents and URIs
    // ------------------------------------------------------------------

    async fn record_ingest(&self, req: &IngestRequest) -> Result<IngestOutcome, IngestError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let batch = sqlx::query_as::<_, BatchRecord>(
            r#"
            SELECT id, name, source, start_date, completed_date, batch_params
            FROM document_batches
            WHERE id = $1
            "#,
        )
        .bind(req.batch_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| IngestError::not_found("batch", req.batch_id))?;

        if batch.completed_date.is_some() {
            return Err(IngestError::validation(
                "batch_id",
                format!("batch {} already completed", req.batch_id),
            ));
        }

        // Serialize concurrent ingests of the same content on the document row.
        let existing_doc_batch: Option<Option<i64>> =
            sqlx::query_scalar("SELECT batch_id FROM documents WHERE hash = $1 FOR UPDATE")
                .bind(&req.doc_hash)
                .fetch_optional(&mut *tx)
                .await?;

        let document_existed = existing_doc_batch.is_some();
        let original_batch_id = match existing_doc_batch {
            Some(batch_id) => batch_id,
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO documents (hash, mime_type, file_size, doc_meta, batch_id)
                    VALUES ($1, $2, $3, $4, $5)
                    ON CONFLICT (hash) DO NOTHING
                    "#,
                )
                .bind(&req.doc_hash)
                .bind(&req.mime_type)
                .bind(req.file_size)
                .bind(req.doc_meta.clone())
                .bind(req.batch_id)
                .execute(&mut *tx)
                .await?;
                Some(req.batch_id)
            }
        };

        let existing_uri = sqlx::query_as::<_, DocumentUriRecord>(
            r#"
            SELECT id, doc_hash, uri, source, version, batch_id
            FROM document_uris
            WHERE uri = $1 AND source = $2
            FOR UPDATE
            "#,
        )
        .bind(&req.uri)
        .bind(&req.source)
        .fetch_optional(&mut *tx)
        .await?;

        let outcome = match existing_uri {
            None => {
                let uri_id = sqlx::query_scalar::<_, i64>(
                    r#"
                    INSERT INTO document_uris (doc_hash, uri, source, version, batch_id)
                    VALUES ($1, $2, $3, 1, $4)
                    RETURNING id
                    "#,
                )
                .bind(&req.doc_hash)
                .bind(&req.uri)
                .bind(&req.source)
                .bind(req.batch_id)
                .fetch_one(&mut *tx)
                .await?;

                insert_uri_history(
                    &mut tx,
                    uri_id,
                    1,
                    &req.doc_hash,
                    "created",
                    Some(req.batch_id),
                    req.doc_meta.clone(),
                    now,
                )
                .await?;

                IngestOutcome::Created {
                    uri_id,
                    existing_document_batch: if document_existed {
                        original_batch_id
                    } else {
                        None
                    },
                }
            }
            Some(uri) if uri.doc_hash != req.doc_hash => {
                let version = uri.version + 1;
                sqlx::query(
                    r#"
                    UPDATE document_uris
                    SET doc_hash = $1, version = $2, batch_id = $3
                    WHERE id = $4
                    "#,
                )
                .bind(&req.doc_hash)
                .bind(version)
                .bind(req.batch_id)
                .bind(uri.id)
                .execute(&mut *tx)
                .await?;

                insert_uri_history(
                    &mut tx,
                    uri.id,
                    version,
                    &req.doc_hash,
                    "updated",
                    Some(req.batch_id),
                    req.doc_meta.clone(),
                    now,
                )
                .await?;

                IngestOutcome::Updated {
                    uri_id: uri.id,
                    version,
                }
            }
            Some(uri) => IngestOutcome::Unchanged {
                uri_id: uri.id,
                original_batch_id,
            },
        };

        tx.commit().await?;
        Ok(outcome)
    }

    async fn get_document(&self, doc_hash: &str) -> Result<Option<DocumentRecord>, IngestError> {
        let record = sqlx::query_as::<_, DocumentRecord>(
            "SELECT hash, mime_type, file_size, doc_meta, batch_id FROM documents WHERE hash = $1",
        )
        .bind(doc_hash)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn update_document_meta(
        &self,
        doc_hash: &str,
        doc_meta: serde_json::Value,
    ) -> Result<(), IngestError> {
        let res = sqlx::query("UPDATE documents SET doc_meta = $1 WHERE hash = $2")
            .bind(doc_meta)
            .bind(doc_hash)
            .execute(&self.pool)
            .await?;

        if res.rows_affected() == 0 {
            return Err(IngestError::not_found("document", doc_hash));
        }
        Ok(())
    }

    async fn find_document_uri(
        &self,
        uri: &str,
        source: &str,
    ) -> Result<Option<DocumentUriRecord>, IngestError> {
        let record = sqlx::query_as::<_, DocumentUriRecord>(
            r#"
            SELECT id, doc_hash, uri, source, version, batch_id
            FROM document_uris
            WHERE uri = $1 AND source = $2
            "#,
        )
        .bind(uri)
        .bind(source)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn document_uris_by_hash(
        &self,
        doc_hash: &str,
    ) -> Result<Vec<DocumentUriRecord>, IngestError> {
        let rows = sqlx::query_as::<_, DocumentUriRecord>(
            r#"
            SELECT id, doc_hash, uri, source, version, batch_id
            FROM document_uris
            WHERE doc_hash = $1
            ORDER BY id
            "#,
        )
        .bind(doc_hash)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn uris_for_source(&self, source: &str) -> Result<Vec<DocumentUriRecord>, IngestError> {
        let rows = sqlx::query_as::<_, DocumentUriRecord>(
            r#"
            SELECT id, doc_hash, uri, source, version, batch_id
            FROM document_uris
            WHERE source = $1
            ORDER BY id
            "#,
        )
        .bind(source)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn document_uri_history(
        &self,
        doc_uri_id: i64,
    ) -> Result<Vec<DocumentUriHistoryRecord>, IngestError> {
        let rows = sqlx::query_as::<_, DocumentUriHistoryRecord>(
            r#"
            SELECT id, doc_uri_id, version, hash, action, process_date, batch_id, hist_meta
            FROM document_uri_history
            WHERE doc_uri_id = $1
            ORDER BY process_date ASC, id ASC
            "#,
        )
        .bind(doc_uri_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn documents_in_batch(&self, batch_id: i64) -> Result<Vec<DocumentRecord>, IngestError> {
        let rows = sqlx::query_as::<_, DocumentRecord>(
            r#"
            SELECT hash, mime_type, file_size, doc_meta, batch_id
            FROM documents
            WHERE hash IN (SELECT doc_hash FROM document_uris WHERE batch_id = $1)
            ORDER BY hash
            "#,
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    // ------------------------------------------------------------------
    // Workflow materialization
    // ------------------------------------------------------------------

    async fn create_run_group(
        &self,
        name: Option<&str>,
        workflow_id: &str,
        param_id: &str,
        batch_id: i64,
    ) -> Result<RunGroupRecord, IngestError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let exists: Option<i64> =
            sqlx::query_scalar("SELECT id FROM document_batches WHERE id = $1")
                .bind(batch_id)
                .fetch_optional(&mut *tx)
                .await?;
        if exists.is_none() {
            return Err(IngestError::not_found("batch", batch_id));
        }

        let record = sqlx::query_as::<_, RunGroupRecord>(
            r#"
            INSERT INTO run_groups
                (name, workflow_id, param_id, batch_id, created_date, start_date,
                 status, status_date, status_meta)
            VALUES ($1, $2, $3, $4, $5, $5, 'PENDING', $5, '{}')
            RETURNING id, name, workflow_id, param_id, batch_id, created_date,
                      start_date, completed_date, status, status_date,
                      status_message, status_meta
            "#,
        )
        .bind(name)
        .bind(workflow_id)
        .bind(param_id)
        .bind(batch_id)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(record)
    }

    async fn get_or_create_step_config(
        &self,
        step_type: StepType,
        config: &serde_json::Value,
        cumulative_config: &str,
    ) -> Result<i64, IngestError> {
        let mut tx = self.pool.begin().await?;

        let existing: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM step_configs WHERE step_type = $1 AND cumulative_config = $2",
        )
        .bind(step_type.as_str())
        .bind(cumulative_config)
        .fetch_optional(&mut *tx)
        .await?;

        let id = match existing {
            Some(id) => id,
            None => {
                // Two racers can both miss the lookup; the unique constraint
                // deduplicates and the loser picks up the winner's row.
                let inserted: Option<i64> = sqlx::query_scalar(
                    r#"
                    INSERT INTO step_configs (step_type, config, cumulative_config, created_date)
                    VALUES ($1, $2, $3, $4)
                    ON CONFLICT (step_type, cumulative_config) DO NOTHING
                    RETURNING id
                    "#,
                )
                .bind(step_type.as_str())
                .bind(config.clone())
                .bind(cumulative_config)
                .bind(Utc::now())
                .fetch_optional(&mut *tx)
                .await?;

                match inserted {
                    Some(id) => id,
                    None => sqlx::query_scalar(
                        "SELECT id FROM step_configs WHERE step_type = $1 AND cumulative_config = $2",
                    )
                    .bind(step_type.as_str())
                    .bind(cumulative_config)
                    .fetch_one(&mut *tx)
                    .await?,
                }
            }
        };

        tx.commit().await?;
        Ok(id)
    }

    async fn get_step_config(&self, id: i64) -> Result<Option<StepConfigRecord>, IngestError> {
        let record = sqlx::query_as::<_, StepConfigRecord>(
            r#"
            SELECT id, step_type, config, cumulative_config, created_date
            FROM step_configs
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn create_workflow_run(&self, new: &NewWorkflowRun) -> Result<(i64, i64), IngestError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let run_id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO workflow_runs
                (workflow_id, run_group_id, batch_id, doc_hash, priority,
                 created_date, status, status_date, status_meta, run_params)
            VALUES ($1, $2, $3, $4, $5, $6, 'PENDING', $6, '{}', $7)
            RETURNING id
            "#,
        )
        .bind(&new.workflow_id)
        .bind(new.run_group_id)
        .bind(new.batch_id)
        .bind(&new.doc_hash)
        .bind(new.priority)
        .bind(now)
        .bind(new.run_params.clone())
        .fetch_one(&mut *tx)
        .await?;

        let step_id = insert_run_step(&mut tx, run_id, &new.first_step, now).await?;

        tx.commit().await?;
        Ok((run_id, step_id))
    }

    async fn get_run_group(&self, id: i64) -> Result<Option<RunGroupRecord>, IngestError> {
        let record = sqlx::query_as::<_, RunGroupRecord>(
            r#"
            SELECT id, name, workflow_id, param_id, batch_id, created_date,
                   start_date, completed_date, status, status_date,
                   status_message, status_meta
            FROM run_groups
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn list_run_groups(
        &self,
        batch_id: Option<i64>,
    ) -> Result<Vec<RunGroupRecord>, IngestError> {
        let rows = sqlx::query_as::<_, RunGroupRecord>(
            r#"
            SELECT id, name, workflow_id, param_id, batch_id, created_date,
                   start_date, completed_date, status, status_date,
                   status_message, status_meta
            FROM run_groups
            WHERE ($1::BIGINT IS NULL OR batch_id = $1)
            ORDER BY created_date DESC, id DESC
            "#,
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn get_workflow_run(&self, id: i64) -> Result<Option<WorkflowRunRecord>, IngestError> {
        let record = sqlx::query_as::<_, WorkflowRunRecord>(
            r#"
            SELECT id, workflow_id, run_group_id, batch_id, doc_hash, priority,
                   created_date, start_date, completed_date, status, status_date,
                   status_message, status_meta, run_params
            FROM workflow_runs
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn list_workflow_runs(
        &self,
        batch_id: Option<i64>,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<WorkflowRunRecord>, i64), IngestError> {
        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM workflow_runs WHERE ($1::BIGINT IS NULL OR batch_id = $1)",
        )
        .bind(batch_id)
        .fetch_one(&self.pool)
        .await?;

        let rows = sqlx::query_as::<_, WorkflowRunRecord>(
            r#"
            SELECT id, workflow_id, run_group_id, batch_id, doc_hash, priority,
                   created_date, start_date, completed_date, status, status_date,
                   status_message, status_meta, run_params
            FROM workflow_runs
            WHERE ($1::BIGINT IS NULL OR batch_id = $1)
            ORDER BY created_date DESC, id DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(batch_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok((rows, total))
    }

    async fn steps_for_run(
        &self,
        workflow_run_id: i64,
    ) -> Result<Vec<RunStepRecord>, IngestError> {
        let rows = sqlx::query_as::<_, RunStepRecord>(
            r#"
            SELECT id, workflow_run_id, step_number, step_name, step_type,
                   step_config_id, is_last_step, priority, created_date,
                   start_date, status_date, completed_date, not_before, retry,
                   retries, status, status_message, status_meta, worker_id
            FROM run_steps
            WHERE workflow_run_id = $1
            ORDER BY step_number ASC
            "#,
        )
        .bind(workflow_run_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn get_run_step(&self, id: i64) -> Result<Option<RunStepRecord>, IngestError> {
        let record = sqlx::query_as::<_, RunStepRecord>(
            r#"
            SELECT id, workflow_run_id, step_number, step_name, step_type,
                   step_config_id, is_last_step, priority, created_date,
                   start_date, status_date, completed_date, not_before, retry,
                   retries, status, status_message, status_meta, worker_id
            FROM run_steps
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn run_group_stats(&self, run_group_id: i64) -> Result<StatusCounts, IngestError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT status, COUNT(*) FROM workflow_runs
            WHERE run_group_id = $1
            GROUP BY status
            "#,
        )
        .bind(run_group_id)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = StatusCounts::new();
        for status in ["PENDING", "RUNNING", "COMPLETED", "ERROR", "FAILED"] {
            counts.insert(status.to_string(), 0);
        }
        for (status, count) in rows {
            counts.insert(status, count);
        }

        Ok(counts)
    }

    async fn reset_failed_steps(&self, run_group_id: i64) -> Result<u64, IngestError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let res = sqlx::query(
            r#"
            UPDATE run_steps
            SET status = 'PENDING', retry = 0, worker_id = NULL, not_before = NULL,
                status_date = $1, status_message = 'reset after group failure'
            WHERE status = 'FAILED'
              AND workflow_run_id IN
                  (SELECT id FROM workflow_runs
                   WHERE run_group_id = $2 AND status = 'FAILED')
            "#,
        )
        .bind(now)
        .bind(run_group_id)
        .execute(&mut *tx)
        .await?;
        let reset = res.rows_affected();

        sqlx::query(
            r#"
            UPDATE workflow_runs
            SET status = 'RUNNING', completed_date = NULL, status_date = $1
            WHERE run_group_id = $2 AND status = 'FAILED'
            "#,
        )
        .bind(now)
        .bind(run_group_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE run_groups
            SET status = 'RUNNING', completed_date = NULL, status_date = $1
            WHERE id = $2 AND status IN ('ERROR', 'FAILED')
            "#,
        )
        .bind(now)
        .bind(run_group_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(reset)
    }

    // ------------------------------------------------------------------
    // Scheduler
    // ------------------------------------------------------------------

    async fn claim_steps(
        &self,
        worker_id: &str,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<ClaimedStep>, IngestError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut tx = self.pool.begin().await?;

        // Rows already locked by a concurrent claimer are skipped, not
        // waited on; the winner's commit flips them to RUNNING and they drop
        // out of the predicate.
        let candidates: Vec<(i64, i64)> = sqlx::query_as(
            r#"
            SELECT s.id, s.workflow_run_id
            FROM run_steps s
            JOIN workflow_runs r ON r.id = s.workflow_run_id
            WHERE s.status = 'PENDING'
              AND (s.not_before IS NULL OR s.not_before <= $1)
              AND r.status NOT IN ('COMPLETED', 'FAILED')
              AND NOT EXISTS (
                  SELECT 1 FROM run_steps x
                  WHERE x.workflow_run_id = s.workflow_run_id
                    AND x.status = 'RUNNING')
              AND (s.step_number = 1 OR EXISTS (
                  SELECT 1 FROM run_steps p
                  WHERE p.workflow_run_id = s.workflow_run_id
                    AND p.step_number = s.step_number - 1
                    AND p.status = 'COMPLETED'))
            ORDER BY s.priority DESC, s.created_date ASC, s.workflow_run_id ASC
            LIMIT $2
            FOR UPDATE OF s SKIP LOCKED
            "#,
        )
        .bind(now)
        .bind((limit * 2) as i64)
        .fetch_all(&mut *tx)
        .await?;

        let mut claim_ids: Vec<i64> = Vec::new();
        let mut seen_runs = HashSet::new();
        for (step_id, run_id) in candidates {
            if claim_ids.len() >= limit {
                break;
            }
            if !seen_runs.insert(run_id) {
                continue;
            }
            claim_ids.push(step_id);
        }

        if !claim_ids.is_empty() {
            sqlx::query(
                r#"
                UPDATE run_steps
                SET status = 'RUNNING', worker_id = $1,
                    start_date = COALESCE(start_date, $2), status_date = $2
                WHERE id = ANY($3) AND status = 'PENDING'
                "#,
            )
            .bind(worker_id)
            .bind(now)
            .bind(&claim_ids)
            .execute(&mut *tx)
            .await?;
        }

        let mut claimed = Vec::with_capacity(claim_ids.len());
        for step_id in claim_ids {
            let step = sqlx::query_as::<_, ClaimedStep>(CLAIMED_STEP_SQL)
                .bind(step_id)
                .fetch_one(&mut *tx)
                .await?;

            let group_status: String =
                sqlx::query_scalar("SELECT status FROM run_groups WHERE id = $1 FOR UPDATE")
                    .bind(step.run_group_id)
                    .fetch_one(&mut *tx)
                    .await?;
            if group_status == "PENDING" {
                sqlx::query(
                    "UPDATE run_groups SET status = 'RUNNING', status_date = $1 WHERE id = $2",
                )
                .bind(now)
                .bind(step.run_group_id)
                .execute(&mut *tx)
                .await?;
                insert_lifecycle(
                    &mut tx,
                    LifecycleEvent::GroupStart,
                    step.run_group_id,
                    None,
                    None,
                    RunStatus::Running,
                    None,
                    serde_json::json!({}),
                    false,
                    now,
                )
                .await?;
            }

            let run_status: String =
                sqlx::query_scalar("SELECT status FROM workflow_runs WHERE id = $1 FOR UPDATE")
                    .bind(step.workflow_run_id)
                    .fetch_one(&mut *tx)
                    .await?;
            if run_status == "PENDING" {
                sqlx::query(
                    r#"
                    UPDATE workflow_runs
                    SET status = 'RUNNING', start_date = $1, status_date = $1
                    WHERE id = $2
                    "#,
                )
                .bind(now)
                .bind(step.workflow_run_id)
                .execute(&mut *tx)
                .await?;
                insert_lifecycle(
                    &mut tx,
                    LifecycleEvent::ItemStart,
                    step.run_group_id,
                    Some(step.workflow_run_id),
                    None,
                    RunStatus::Running,
                    None,
                    serde_json::json!({}),
                    false,
                    now,
                )
                .await?;
            }

            insert_lifecycle(
                &mut tx,
                LifecycleEvent::StepStart,
                step.run_group_id,
                Some(step.workflow_run_id),
                Some(step.step_id),
                RunStatus::Running,
                None,
                serde_json::json!({ "worker_id": worker_id }),
                false,
                now,
            )
            .await?;

            claimed.push(step);
        }

        tx.commit().await?;
        Ok(claimed)
    }

    async fn advance_step(&self, req: &AdvanceRequest) -> Result<AdvanceResult, IngestError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let step = sqlx::query_as::<_, RunStepRecord>(
            r#"
            SELECT id, workflow_run_id, step_number, step_name, step_type,
                   step_config_id, is_last_step, priority, created_date,
                   start_date, status_date, completed_date, not_before, retry,
                   retries, status, status_message, status_meta, worker_id
            FROM run_steps
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(req.step_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| IngestError::not_found("run_step", req.step_id))?;

        if step.status != "RUNNING" || step.worker_id.as_deref() != Some(req.worker_id.as_str()) {
            return Err(IngestError::Conflict {
                entity: "run_step",
                key: req.step_id.to_string(),
                details: format!(
                    "step is {} and held by {:?}, not RUNNING for worker {}",
                    step.status, step.worker_id, req.worker_id
                ),
            });
        }

        let run = sqlx::query_as::<_, WorkflowRunRecord>(
            r#"
            SELECT id, workflow_id, run_group_id, batch_id, doc_hash, priority,
                   created_date, start_date, completed_date, status, status_date,
                   status_message, status_meta, run_params
            FROM workflow_runs
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(step.workflow_run_id)
        .fetch_one(&mut *tx)
        .await?;

        let running_siblings: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM run_steps WHERE workflow_run_id = $1 AND status = 'RUNNING'",
        )
        .bind(step.workflow_run_id)
        .fetch_one(&mut *tx)
        .await?;
        if running_siblings > 1 {
            let details = format!(
                "run {} has {} RUNNING steps",
                step.workflow_run_id, running_siblings
            );
            sqlx::query(
                r#"
                UPDATE workflow_runs
                SET status = 'FAILED', completed_date = $1, status_date = $1,
                    status_message = $2, status_meta = $3
                WHERE id = $4
                "#,
            )
            .bind(now)
            .bind(&details)
            .bind(serde_json::json!({ "invariant": "single_running_step" }))
            .bind(step.workflow_run_id)
            .execute(&mut *tx)
            .await?;
            insert_lifecycle(
                &mut tx,
                LifecycleEvent::ItemFailed,
                run.run_group_id,
                Some(run.id),
                Some(step.id),
                RunStatus::Failed,
                Some(&details),
                serde_json::json!({ "invariant": "single_running_step" }),
                true,
                now,
            )
            .await?;
            tx.commit().await?;
            return Err(IngestError::EngineInvariant { details });
        }

        let mut result = AdvanceResult::default();

        match &req.outcome {
            StepOutcome::Completed { metadata } => {
                sqlx::query(
                    r#"
                    UPDATE run_steps
                    SET status = 'COMPLETED', completed_date = $1, status_date = $1,
                        status_message = 'success', status_meta = $2
                    WHERE id = $3 AND status = 'RUNNING' AND worker_id = $4
                    "#,
                )
                .bind(now)
                .bind(metadata.clone())
                .bind(step.id)
                .bind(&req.worker_id)
                .execute(&mut *tx)
                .await?;

                insert_lifecycle(
                    &mut tx,
                    LifecycleEvent::StepEnd,
                    run.run_group_id,
                    Some(run.id),
                    Some(step.id),
                    RunStatus::Completed,
                    Some("success"),
                    metadata.clone(),
                    true,
                    now,
                )
                .await?;

                if step.is_last_step {
                    sqlx::query(
                        r#"
                        UPDATE workflow_runs
                        SET status = 'COMPLETED', completed_date = $1, status_date = $1
                        WHERE id = $2
                        "#,
                    )
                    .bind(now)
                    .bind(run.id)
                    .execute(&mut *tx)
                    .await?;
                    insert_lifecycle(
                        &mut tx,
                        LifecycleEvent::ItemEnd,
                        run.run_group_id,
                        Some(run.id),
                        Some(step.id),
                        RunStatus::Completed,
                        None,
                        serde_json::json!({}),
                        true,
                        now,
                    )
                    .await?;
                    result.run_terminal = true;

                    let (group_terminal, batch_completed) =
                        finish_group_if_done(&mut tx, run.run_group_id, run.batch_id, now).await?;
                    result.group_terminal = group_terminal;
                    result.batch_completed = batch_completed;
                } else {
                    let next = req.next_step.as_ref().ok_or_else(|| {
                        IngestError::EngineInvariant {
                            details: format!(
                                "step {} completed without a successor blueprint",
                                step.id
                            ),
                        }
                    })?;
                    insert_run_step(&mut tx, run.id, next, now).await?;
                }
            }
            StepOutcome::Retry {
                message,
                not_before,
            } => {
                let res = sqlx::query(
                    r#"
                    UPDATE run_steps
                    SET status = 'PENDING', retry = retry + 1, worker_id = NULL,
                        not_before = $1, status_date = $2, status_message = $3
                    WHERE id = $4 AND status = 'RUNNING' AND worker_id = $5
                      AND retry < retries
                    "#,
                )
                .bind(not_before)
                .bind(now)
                .bind(message)
                .bind(step.id)
                .bind(&req.worker_id)
                .execute(&mut *tx)
                .await?;
                if res.rows_affected() == 0 {
                    return Err(IngestError::EngineInvariant {
                        details: format!(
                            "retry requested for step {} with {}/{} attempts used",
                            step.id, step.retry, step.retries
                        ),
                    });
                }

                insert_lifecycle(
                    &mut tx,
                    LifecycleEvent::StepFailed,
                    run.run_group_id,
                    Some(run.id),
                    Some(step.id),
                    RunStatus::Error,
                    Some(message),
                    serde_json::json!({ "retry": step.retry + 1, "retries": step.retries }),
                    false,
                    now,
                )
                .await?;
            }
            StepOutcome::Failed { message } => {
                sqlx::query(
                    r#"
                    UPDATE run_steps
                    SET status = 'FAILED', completed_date = $1, status_date = $1,
                        status_message = $2
                    WHERE id = $3 AND status = 'RUNNING' AND worker_id = $4
                    "#,
                )
                .bind(now)
                .bind(message)
                .bind(step.id)
                .bind(&req.worker_id)
                .execute(&mut *tx)
                .await?;

                insert_lifecycle(
                    &mut tx,
                    LifecycleEvent::StepFailed,
                    run.run_group_id,
                    Some(run.id),
                    Some(step.id),
                    RunStatus::Failed,
                    Some(message),
                    serde_json::json!({ "retry": step.retry, "retries": step.retries }),
                    true,
                    now,
                )
                .await?;

                sqlx::query(
                    r#"
                    UPDATE workflow_runs
                    SET status = 'FAILED', completed_date = $1, status_date = $1,
                        status_message = $2
                    WHERE id = $3
                    "#,
                )
                .bind(now)
                .bind(message)
                .bind(run.id)
                .execute(&mut *tx)
                .await?;

                insert_lifecycle(
                    &mut tx,
                    LifecycleEvent::ItemFailed,
                    run.run_group_id,
                    Some(run.id),
                    Some(step.id),
                    RunStatus::Failed,
                    Some(message),
                    serde_json::json!({}),
                    true,
                    now,
                )
                .await?;
                result.run_terminal = true;

                let (group_terminal, batch_completed) =
                    finish_group_if_done(&mut tx, run.run_group_id, run.batch_id, now).await?;
                result.group_terminal = group_terminal;
                result.batch_completed = batch_completed;
                if !group_terminal {
                    sqlx::query(
                        r#"
                        UPDATE run_groups
                        SET status = 'ERROR', status_date = $1, status_message = $2
                        WHERE id = $3 AND status NOT IN ('COMPLETED', 'FAILED')
                        "#,
                    )
                    .bind(now)
                    .bind(message)
                    .bind(run.run_group_id)
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }

        tx.commit().await?;
        Ok(result)
    }

    // ------------------------------------------------------------------
    // Workers
    // ------------------------------------------------------------------

    async fn worker_checkin(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), IngestError> {
        sqlx::query(
            r#"
            INSERT INTO worker_checkins (worker_id, first_checkin, last_checkin)
            VALUES ($1, $2, $2)
            ON CONFLICT (worker_id) DO UPDATE SET last_checkin = excluded.last_checkin
            "#,
        )
        .bind(worker_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn remove_worker(&self, worker_id: &str) -> Result<(), IngestError> {
        sqlx::query("DELETE FROM worker_checkins WHERE worker_id = $1")
            .bind(worker_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn list_worker_checkins(&self) -> Result<Vec<WorkerCheckinRecord>, IngestError> {
        let rows = sqlx::query_as::<_, WorkerCheckinRecord>(
            "SELECT worker_id, first_checkin, last_checkin FROM worker_checkins ORDER BY worker_id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn recover_stale_steps(
        &self,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<Vec<ReclaimedStep>, IngestError> {
        let cutoff = now
            - chrono::Duration::from_std(stale_after).map_err(|e| IngestError::Validation {
                field: "stale_after".to_string(),
                message: e.to_string(),
            })?;

        let mut tx = self.pool.begin().await?;

        let orphans: Vec<(i64, String, i64, i64)> = sqlx::query_as(
            r#"
            SELECT s.id, s.worker_id, s.workflow_run_id, r.run_group_id
            FROM run_steps s
            JOIN workflow_runs r ON r.id = s.workflow_run_id
            LEFT JOIN worker_checkins w ON w.worker_id = s.worker_id
            WHERE s.status = 'RUNNING'
              AND (w.worker_id IS NULL OR w.last_checkin < $1)
            ORDER BY s.id
            FOR UPDATE OF s SKIP LOCKED
            "#,
        )
        .bind(cutoff)
        .fetch_all(&mut *tx)
        .await?;

        let mut reclaimed = Vec::with_capacity(orphans.len());
        for (step_id, worker_id, workflow_run_id, run_group_id) in orphans {
            let message = format!("reclaimed from stale worker {}", worker_id);
            let res = sqlx::query(
                r#"
                UPDATE run_steps
                SET status = 'PENDING', worker_id = NULL, status_date = $1,
                    status_message = $2
                WHERE id = $3 AND status = 'RUNNING'
                "#,
            )
            .bind(now)
            .bind(&message)
            .bind(step_id)
            .execute(&mut *tx)
            .await?;
            if res.rows_affected() == 0 {
                continue;
            }

            insert_lifecycle(
                &mut tx,
                LifecycleEvent::StepFailed,
                run_group_id,
                Some(workflow_run_id),
                Some(step_id),
                RunStatus::Error,
                Some(&message),
                serde_json::json!({ "stale_worker_id": worker_id }),
                false,
                now,
            )
            .await?;

            reclaimed.push(ReclaimedStep {
                step_id,
                worker_id,
                workflow_run_id,
            });
        }

        sqlx::query("DELETE FROM worker_checkins WHERE last_checkin < $1")
            .bind(cutoff)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(reclaimed)
    }

    // ------------------------------------------------------------------
    // Lifecycle history
    // ------------------------------------------------------------------

    async fn lifecycle_for_group(
        &self,
        run_group_id: i64,
    ) -> Result<Vec<LifecycleHistoryRecord>, IngestError> {
        let rows = sqlx::query_as::<_, LifecycleHistoryRecord>(
            r#"
            SELECT id, event, run_group_id, workflow_run_id, step_id, start_date,
                   completed_date, status, status_date, status_message, status_meta
            FROM lifecycle_history
            WHERE run_group_id = $1
            ORDER BY start_date ASC, id ASC
            "#,
        )
        .bind(run_group_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn lifecycle_for_run(
        &self,
        workflow_run_id: i64,
    ) -> Result<Vec<LifecycleHistoryRecord>, IngestError> {
        let rows = sqlx::query_as::<_, LifecycleHistoryRecord>(
            r#"
            SELECT id, event, run_group_id, workflow_run_id, step_id, start_date,
                   completed_date, status, status_date, status_message, status_meta
            FROM lifecycle_history
            WHERE workflow_run_id = $1
            ORDER BY start_date ASC, id ASC
            "#,
        )
        .bind(workflow_run_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    // ------------------------------------------------------------------
    // Cascading deletion
    // ------------------------------------------------------------------

    async fn delete_run_group(&self, run_group_id: i64) -> Result<DeleteCounts, IngestError> {
        let mut tx = self.pool.begin().await?;

        let exists: Option<i64> =
            sqlx::query_scalar("SELECT id FROM run_groups WHERE id = $1 FOR UPDATE")
                .bind(run_group_id)
                .fetch_optional(&mut *tx)
                .await?;
        if exists.is_none() {
            return Err(IngestError::not_found("run_group", run_group_id));
        }

        let mut counts = DeleteCounts::default();

        counts.run_steps = sqlx::query(
            r#"
            DELETE FROM run_steps
            WHERE workflow_run_id IN
                (SELECT id FROM workflow_runs WHERE run_group_id = $1)
            "#,
        )
        .bind(run_group_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        counts.lifecycle_history =
            sqlx::query("DELETE FROM lifecycle_history WHERE run_group_id = $1")
                .bind(run_group_id)
                .execute(&mut *tx)
                .await?
                .rows_affected();

        counts.workflow_runs = sqlx::query("DELETE FROM workflow_runs WHERE run_group_id = $1")
            .bind(run_group_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        counts.run_groups = sqlx::query("DELETE FROM run_groups WHERE id = $1")
            .bind(run_group_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;
        Ok(counts)
    }

    async fn delete_document_uri(
        &self,
        uri: &str,
        source: &str,
        artifacts: &dyn ArtifactStore,
    ) -> Result<DeleteCounts, IngestError> {
        let mut tx = self.pool.begin().await?;

        let doc_uri = sqlx::query_as::<_, DocumentUriRecord>(
            r#"
            SELECT id, doc_hash, uri, source, version, batch_id
            FROM document_uris
            WHERE uri = $1 AND source = $2
            FOR UPDATE
            "#,
        )
        .bind(uri)
        .bind(source)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| IngestError::not_found("document_uri", format!("{}@{}", uri, source)))?;

        // Serialize against concurrent deletes of sibling URIs.
        sqlx::query("SELECT hash FROM documents WHERE hash = $1 FOR UPDATE")
            .bind(&doc_uri.doc_hash)
            .execute(&mut *tx)
            .await?;

        let references: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM document_uris WHERE doc_hash = $1")
                .bind(&doc_uri.doc_hash)
                .fetch_one(&mut *tx)
                .await?;

        let mut counts = DeleteCounts::default();

        if references == 1 {
            counts.run_steps = sqlx::query(
                r#"
                DELETE FROM run_steps
                WHERE workflow_run_id IN
                    (SELECT id FROM workflow_runs WHERE doc_hash = $1)
                "#,
            )
            .bind(&doc_uri.doc_hash)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            counts.lifecycle_history = sqlx::query(
                r#"
                DELETE FROM lifecycle_history
                WHERE workflow_run_id IN
                    (SELECT id FROM workflow_runs WHERE doc_hash = $1)
                "#,
            )
            .bind(&doc_uri.doc_hash)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            counts.workflow_runs = sqlx::query("DELETE FROM workflow_runs WHERE doc_hash = $1")
                .bind(&doc_uri.doc_hash)
                .execute(&mut *tx)
                .await?
                .rows_affected();

            // Database-backed artifact rows (every storage root) die with
            // this transaction; external stores are called here, and any
            // backend error rolls back the relational deletions.
            counts.artifacts = sqlx::query("DELETE FROM document_bytes WHERE hash = $1")
                .bind(&doc_uri.doc_hash)
                .execute(&mut *tx)
                .await?
                .rows_affected();
            if !artifacts.is_database_backed() {
                counts.artifacts += artifacts
                    .delete_all_for(&doc_uri.doc_hash)
                    .await
                    .map_err(|e| IngestError::ArtifactStorage {
                        details: e.to_string(),
                    })?;
            }

            counts.uri_history =
                sqlx::query("DELETE FROM document_uri_history WHERE doc_uri_id = $1")
                    .bind(doc_uri.id)
                    .execute(&mut *tx)
                    .await?
                    .rows_affected();

            counts.document_uris = sqlx::query("DELETE FROM document_uris WHERE id = $1")
                .bind(doc_uri.id)
                .execute(&mut *tx)
                .await?
                .rows_affected();

            counts.documents = sqlx::query("DELETE FROM documents WHERE hash = $1")
                .bind(&doc_uri.doc_hash)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        } else {
            counts.uri_history =
                sqlx::query("DELETE FROM document_uri_history WHERE doc_uri_id = $1")
                    .bind(doc_uri.id)
                    .execute(&mut *tx)
                    .await?
                    .rows_affected();

            counts.document_uris = sqlx::query("DELETE FROM document_uris WHERE id = $1")
                .bind(doc_uri.id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }

        tx.commit().await?;
        Ok(counts)
    }

    // ------------------------------------------------------------------
    // Artifact bytes
    // ------------------------------------------------------------------

    async fn put_artifact_bytes(
        &self,
        hash: &str,
        kind: &str,
        storage_root: &str,
        bytes: &[u8],
    ) -> Result<(), IngestError> {
        sqlx::query(
            r#"
            INSERT INTO document_bytes (hash, artifact_kind, storage_root, file_size, file_bytes)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (hash, artifact_kind, storage_root)
            DO UPDATE SET file_size = excluded.file_size, file_bytes = excluded.file_bytes
            "#,
        )
        .bind(hash)
        .bind(kind)
        .bind(storage_root)
        .bind(bytes.len() as i64)
        .bind(bytes)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_artifact_bytes(
        &self,
        hash: &str,
        kind: &str,
        storage_root: &str,
    ) -> Result<Option<Vec<u8>>, IngestError> {
        let bytes: Option<Vec<u8>> = sqlx::query_scalar(
            r#"
            SELECT file_bytes FROM document_bytes
            WHERE hash = $1 AND artifact_kind = $2 AND storage_root = $3
            "#,
        )
        .bind(hash)
        .bind(kind)
        .bind(storage_root)
        .fetch_optional(&self.pool)
        .await?;

        Ok(bytes)
    }

    async fn artifact_bytes_exist(
        &self,
        hash: &str,
        kind: &str,
        storage_root: &str,
    ) -> Result<bool, IngestError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM document_bytes
            WHERE hash = $1 AND artifact_kind = $2 AND storage_root = $3
            "#,
        )
        .bind(hash)
        .bind(kind)
        .bind(storage_root)
        .fetch_one(&self.pool)
        .await?;

        Ok(count > 0)
    }

    async fn delete_artifact_bytes_for(
        &self,
        hash: &str,
        storage_root: &str,
    ) -> Result<u64, IngestError> {
        let res = sqlx::query("DELETE FROM document_bytes WHERE hash = $1 AND storage_root = $2")
            .bind(hash)
            .bind(storage_root)
            .execute(&self.pool)
            .await?;

        Ok(res.rows_affected())
    }
}
