// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow start and step-config materialization.
//!
//! Starting workflows for a batch materializes a run group, one workflow
//! run per distinct document, and the PENDING first step of each run. Step
//! configurations are derived from the selected parameter set and
//! deduplicated by their cumulative snapshot: two parameter sets that agree
//! up to step N share the step-config rows for steps 1..N.

use std::collections::BTreeMap;

use tracing::info;

use soliplex_core::error::IngestError;
use soliplex_core::model::{NewRunStep, NewWorkflowRun, RunGroupRecord};
use soliplex_core::persistence::Persistence;
use soliplex_registry::{ParameterSet, Registry, RegistryError, StepSpec, WorkflowDefinition};

/// Options for starting workflows.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Workflow definition id; the configured default when `None`.
    pub workflow_id: Option<String>,
    /// Parameter set id; the configured default when `None`.
    pub param_id: Option<String>,
    /// Claim priority for the created runs.
    pub priority: i64,
    /// Optional display name for the run group.
    pub group_name: Option<String>,
}

/// A step of a workflow with its materialized configuration row.
#[derive(Debug, Clone)]
pub struct MaterializedStep {
    /// The definition's step spec.
    pub spec: StepSpec,
    /// 1-based position.
    pub step_number: i64,
    /// True for the final step.
    pub is_last: bool,
    /// Persisted step-config row id.
    pub step_config_id: i64,
}

fn registry_error(err: RegistryError) -> IngestError {
    match err {
        RegistryError::UnknownId { kind, id } => IngestError::not_found(
            match kind {
                "workflow" => "workflow",
                _ => "parameter_set",
            },
            id,
        ),
        other => IngestError::validation("registry", other.to_string()),
    }
}

/// The effective option map for one step: the definition's static
/// parameters overlaid by the parameter set's options for that step name.
fn effective_config(
    spec: &StepSpec,
    params: &ParameterSet,
) -> serde_json::Map<String, serde_json::Value> {
    let mut effective = spec.parameters.clone();
    if let Some(options) = params.config.get(&spec.name) {
        for (key, value) in options {
            effective.insert(key.clone(), value.clone());
        }
    }
    effective
}

/// Materialize (or find) the step-config rows for every step of a
/// definition under a parameter set.
///
/// The cumulative snapshot for step N is the ordered map of step name to
/// effective config over steps 1..N, serialized canonically; it is the
/// dedup key, so identical prefixes across parameter sets share rows.
pub async fn materialize_step_configs(
    persistence: &dyn Persistence,
    definition: &WorkflowDefinition,
    params: &ParameterSet,
) -> Result<Vec<MaterializedStep>, IngestError> {
    let mut cumulative: BTreeMap<String, serde_json::Value> = BTreeMap::new();
    let mut materialized = Vec::with_capacity(definition.item_steps.len());
    let last_index = definition.item_steps.len().saturating_sub(1);

    for (index, spec) in definition.item_steps.iter().enumerate() {
        let effective = effective_config(spec, params);
        cumulative.insert(spec.name.clone(), serde_json::Value::Object(effective.clone()));
        let snapshot = serde_json::to_string(&cumulative)?;

        let step_config_id = persistence
            .get_or_create_step_config(
                spec.step_type,
                &serde_json::Value::Object(effective),
                &snapshot,
            )
            .await?;

        materialized.push(MaterializedStep {
            spec: spec.clone(),
            step_number: (index + 1) as i64,
            is_last: index == last_index,
            step_config_id,
        });
    }

    Ok(materialized)
}

impl MaterializedStep {
    /// Blueprint for inserting this step as a PENDING row.
    pub fn as_new_run_step(&self, priority: i64) -> NewRunStep {
        NewRunStep {
            step_number: self.step_number,
            step_name: self.spec.name.clone(),
            step_type: self.spec.step_type,
            step_config_id: self.step_config_id,
            is_last_step: self.is_last,
            retries: self.spec.retries,
            priority,
        }
    }
}

/// Start workflows for every document in a batch.
///
/// Creates the run group, materializes step configs, and creates one
/// workflow run per distinct document with step 1 seeded PENDING. Returns
/// the group and the created run ids.
pub async fn start_workflows_for_batch(
    persistence: &dyn Persistence,
    registry: &Registry,
    batch_id: i64,
    default_workflow_id: &str,
    default_param_id: &str,
    opts: StartOptions,
) -> Result<(RunGroupRecord, Vec<i64>), IngestError> {
    let workflow_id = opts
        .workflow_id
        .as_deref()
        .unwrap_or(default_workflow_id);
    let param_id = opts.param_id.as_deref().unwrap_or(default_param_id);

    let workflow = registry.workflow(workflow_id).await.map_err(registry_error)?;
    let params = registry.param_set(param_id).await.map_err(registry_error)?;
    Registry::validate_params_for(&workflow.definition, &params.params)
        .map_err(registry_error)?;

    let batch = persistence
        .get_batch(batch_id)
        .await?
        .ok_or_else(|| IngestError::not_found("batch", batch_id))?;

    let group = persistence
        .create_run_group(opts.group_name.as_deref(), workflow_id, param_id, batch_id)
        .await?;

    let materialized =
        materialize_step_configs(persistence, &workflow.definition, &params.params).await?;
    let first = materialized
        .first()
        .ok_or_else(|| IngestError::validation("workflow", "workflow has no steps"))?;

    let documents = persistence.documents_in_batch(batch_id).await?;
    let run_params = serde_json::json!({
        "workflow_id": workflow_id,
        "param_id": param_id,
        "source": batch.source,
    });

    let mut run_ids = Vec::with_capacity(documents.len());
    for doc in &documents {
        let (run_id, _step_id) = persistence
            .create_workflow_run(&NewWorkflowRun {
                run_group_id: group.id,
                workflow_id: workflow_id.to_string(),
                batch_id,
                doc_hash: doc.hash.clone(),
                priority: opts.priority,
                run_params: run_params.clone(),
                first_step: first.as_new_run_step(opts.priority),
            })
            .await?;
        run_ids.push(run_id);
    }

    info!(
        run_group_id = group.id,
        batch_id,
        workflow_id,
        param_id,
        runs = run_ids.len(),
        "workflows started"
    );

    Ok((group, run_ids))
}

/// Start a workflow for a single document hash.
///
/// The document must be known; the run group is created over the batch the
/// document was first ingested under (or the batch of any of its URIs).
pub async fn start_workflow_for_document(
    persistence: &dyn Persistence,
    registry: &Registry,
    doc_hash: &str,
    default_workflow_id: &str,
    default_param_id: &str,
    opts: StartOptions,
) -> Result<(RunGroupRecord, i64), IngestError> {
    let document = persistence
        .get_document(doc_hash)
        .await?
        .ok_or_else(|| IngestError::not_found("document", doc_hash))?;

    let batch_id = match document.batch_id {
        Some(id) => id,
        None => {
            let uris = persistence.document_uris_by_hash(doc_hash).await?;
            uris.iter()
                .find_map(|u| u.batch_id)
                .ok_or_else(|| IngestError::validation("doc_hash", "document has no batch"))?
        }
    };

    let workflow_id = opts
        .workflow_id
        .as_deref()
        .unwrap_or(default_workflow_id);
    let param_id = opts.param_id.as_deref().unwrap_or(default_param_id);

    let workflow = registry.workflow(workflow_id).await.map_err(registry_error)?;
    let params = registry.param_set(param_id).await.map_err(registry_error)?;
    Registry::validate_params_for(&workflow.definition, &params.params)
        .map_err(registry_error)?;

    let group = persistence
        .create_run_group(
            Some(&format!("single run {}", doc_hash)),
            workflow_id,
            param_id,
            batch_id,
        )
        .await?;

    let materialized =
        materialize_step_configs(persistence, &workflow.definition, &params.params).await?;
    let first = materialized
        .first()
        .ok_or_else(|| IngestError::validation("workflow", "workflow has no steps"))?;

    let run_params = serde_json::json!({
        "workflow_id": workflow_id,
        "param_id": param_id,
    });

    let (run_id, _step_id) = persistence
        .create_workflow_run(&NewWorkflowRun {
            run_group_id: group.id,
            workflow_id: workflow_id.to_string(),
            batch_id,
            doc_hash: doc_hash.to_string(),
            priority: opts.priority,
            run_params,
            first_step: first.as_new_run_step(opts.priority),
        })
        .await?;

    Ok((group, run_id))
}
