// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow definition and parameter set registry.
//!
//! Declarative YAML files from two configured directories describe what the
//! engine can run:
//!
//! - **Workflow definitions**: an id and an ordered list of item-steps, each
//!   naming a handler by fully-qualified reference with an optional retry
//!   budget and static parameters.
//! - **Parameter sets**: an id and a mapping from step name to an option map
//!   drawn from the step type's recognized options.
//!
//! Files shipped with the application are *built-in*: immutable and
//! undeletable through the registry surface. Files prefixed `user_` (the
//! form uploads are saved in) belong to the *user* origin and can be
//! replaced or deleted freely. The full textual form of every entry is
//! preserved verbatim for re-export.

#![deny(missing_docs)]

mod types;

pub use types::{
    Origin, ParameterSet, StepSpec, WorkflowDefinition, recognized_options, validate_step_options,
};

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::sync::RwLock;
use tracing::{debug, info};

/// Registry errors.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RegistryError {
    /// Reading a registry directory or file failed.
    #[error("registry io error: {0}")]
    Io(#[from] std::io::Error),

    /// A YAML file did not parse into the expected shape.
    #[error("failed to parse {path}: {details}")]
    Parse {
        /// Offending file.
        path: String,
        /// Parser message.
        details: String,
    },

    /// Two entries (of any origin) share an id.
    #[error("duplicate {kind} id '{id}' ({first} and {second})")]
    DuplicateId {
        /// Entry kind ("workflow" or "parameter set").
        kind: &'static str,
        /// The contested id.
        id: String,
        /// File that loaded first.
        first: String,
        /// File that collided.
        second: String,
    },

    /// Lookup by id found nothing.
    #[error("{kind} '{id}' not found")]
    UnknownId {
        /// Entry kind.
        kind: &'static str,
        /// The missing id.
        id: String,
    },

    /// The entry is built-in and cannot be replaced or deleted.
    #[error("{kind} '{id}' is built-in and cannot be modified")]
    BuiltIn {
        /// Entry kind.
        kind: &'static str,
        /// The protected id.
        id: String,
    },

    /// The entry failed structural validation.
    #[error("invalid {kind} '{id}': {details}")]
    Invalid {
        /// Entry kind.
        kind: &'static str,
        /// The invalid id.
        id: String,
        /// What is wrong.
        details: String,
    },

    /// A parameter set option is not recognized by its step type.
    #[error("step '{step}' ({step_type}) does not recognize option '{option}'")]
    UnknownOption {
        /// Step name from the parameter set.
        step: String,
        /// The step's type.
        step_type: &'static str,
        /// The unrecognized option key.
        option: String,
    },
}

/// A loaded workflow definition with its origin and verbatim text.
#[derive(Debug, Clone)]
pub struct LoadedWorkflow {
    /// The parsed definition.
    pub definition: WorkflowDefinition,
    /// Built-in or user-uploaded.
    pub origin: Origin,
    /// The YAML exactly as loaded, for re-export.
    pub raw_yaml: String,
    /// File the entry was loaded from.
    pub path: PathBuf,
}

/// A loaded parameter set with its origin and verbatim text.
#[derive(Debug, Clone)]
pub struct LoadedParamSet {
    /// The parsed parameter set.
    pub params: ParameterSet,
    /// Built-in or user-uploaded.
    pub origin: Origin,
    /// The YAML exactly as loaded, for re-export.
    pub raw_yaml: String,
    /// File the entry was loaded from.
    pub path: PathBuf,
}

#[derive(Default, Debug)]
struct Inner {
    workflows: HashMap<String, LoadedWorkflow>,
    params: HashMap<String, LoadedParamSet>,
}

/// Registry of workflow definitions and parameter sets.
///
/// Created once at startup; reload and upload operations take the write
/// lock, everything else reads. There is deliberately no process-wide
/// instance: owners pass the registry where it is needed.
#[derive(Debug)]
pub struct Registry {
    workflow_dir: PathBuf,
    param_dir: PathBuf,
    inner: RwLock<Inner>,
}

impl Registry {
    /// Load both directories. Missing directories are treated as empty.
    pub async fn load(
        workflow_dir: impl AsRef<Path>,
        param_dir: impl AsRef<Path>,
    ) -> Result<Self, RegistryError> {
        let registry = Self {
            workflow_dir: workflow_dir.as_ref().to_path_buf(),
            param_dir: param_dir.as_ref().to_path_buf(),
            inner: RwLock::new(Inner::default()),
        };
        registry.reload().await?;
        Ok(registry)
    }

    /// Rescan both directories, replacing the in-memory state.
    pub async fn reload(&self) -> Result<(), RegistryError> {
        let mut next = Inner::default();

        for path in yaml_files(&self.workflow_dir).await? {
            let raw = tokio::fs::read_to_string(&path).await?;
            let definition: WorkflowDefinition =
                serde_yaml::from_str(&raw).map_err(|e| RegistryError::Parse {
                    path: path.display().to_string(),
                    details: e.to_string(),
                })?;
            definition.validate().map_err(|details| RegistryError::Invalid {
                kind: "workflow",
                id: definition.id.clone(),
                details,
            })?;

            if let Some(existing) = next.workflows.get(&definition.id) {
                return Err(RegistryError::DuplicateId {
                    kind: "workflow",
                    id: definition.id.clone(),
                    first: existing.path.display().to_string(),
                    second: path.display().to_string(),
                });
            }

            debug!(id = %definition.id, path = %path.display(), "loaded workflow definition");
            next.workflows.insert(
                definition.id.clone(),
                LoadedWorkflow {
                    origin: Origin::from_path(&path),
                    raw_yaml: raw,
                    path,
                    definition,
                },
            );
        }

        for path in yaml_files(&self.param_dir).await? {
            let raw = tokio::fs::read_to_string(&path).await?;
            let params: ParameterSet =
                serde_yaml::from_str(&raw).map_err(|e| RegistryError::Parse {
                    path: path.display().to_string(),
                    details: e.to_string(),
                })?;
            if params.id.is_empty() {
                return Err(RegistryError::Invalid {
                    kind: "parameter set",
                    id: String::new(),
                    details: "id must not be empty".to_string(),
                });
            }

            if let Some(existing) = next.params.get(&params.id) {
                return Err(RegistryError::DuplicateId {
                    kind: "parameter set",
                    id: params.id.clone(),
                    first: existing.path.display().to_string(),
                    second: path.display().to_string(),
                });
            }

            debug!(id = %params.id, path = %path.display(), "loaded parameter set");
            next.params.insert(
                params.id.clone(),
                LoadedParamSet {
                    origin: Origin::from_path(&path),
                    raw_yaml: raw,
                    path,
                    params,
                },
            );
        }

        let mut inner = self.inner.write().await;
        info!(
            workflows = next.workflows.len(),
            param_sets = next.params.len(),
            "registry loaded"
        );
        *inner = next;
        Ok(())
    }

    /// All workflow definitions, unordered.
    pub async fn workflows(&self) -> Vec<LoadedWorkflow> {
        self.inner.read().await.workflows.values().cloned().collect()
    }

    /// Look up one workflow definition.
    pub async fn workflow(&self, id: &str) -> Result<LoadedWorkflow, RegistryError> {
        self.inner
            .read()
            .await
            .workflows
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownId {
                kind: "workflow",
                id: id.to_string(),
            })
    }

    /// All parameter sets, unordered.
    pub async fn param_sets(&self) -> Vec<LoadedParamSet> {
        self.inner.read().await.params.values().cloned().collect()
    }

    /// Look up one parameter set.
    pub async fn param_set(&self, id: &str) -> Result<LoadedParamSet, RegistryError> {
        self.inner
            .read()
            .await
            .params
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownId {
                kind: "parameter set",
                id: id.to_string(),
            })
    }

    /// Upload a new user parameter set from its YAML text. The file is
    /// written to the parameter directory as `user_<id>.yaml`.
    pub async fn upload_param_set(&self, raw_yaml: &str) -> Result<ParameterSet, RegistryError> {
        let params: ParameterSet =
            serde_yaml::from_str(raw_yaml).map_err(|e| RegistryError::Parse {
                path: "<upload>".to_string(),
                details: e.to_string(),
            })?;
        if params.id.is_empty() {
            return Err(RegistryError::Invalid {
                kind: "parameter set",
                id: String::new(),
                details: "id must not be empty".to_string(),
            });
        }

        let mut inner = self.inner.write().await;
        if let Some(existing) = inner.params.get(&params.id) {
            if existing.origin == Origin::BuiltIn {
                return Err(RegistryError::BuiltIn {
                    kind: "parameter set",
                    id: params.id.clone(),
                });
            }
        }

        tokio::fs::create_dir_all(&self.param_dir).await?;
        let path = self.param_dir.join(format!("user_{}.yaml", params.id));
        tokio::fs::write(&path, raw_yaml).await?;

        info!(id = %params.id, path = %path.display(), "parameter set uploaded");
        inner.params.insert(
            params.id.clone(),
            LoadedParamSet {
                origin: Origin::User,
                raw_yaml: raw_yaml.to_string(),
                path,
                params: params.clone(),
            },
        );
        Ok(params)
    }

    /// Delete a user-uploaded parameter set. Built-ins are protected.
    pub async fn delete_param_set(&self, id: &str) -> Result<(), RegistryError> {
        let mut inner = self.inner.write().await;
        let entry = inner.params.get(id).ok_or_else(|| RegistryError::UnknownId {
            kind: "parameter set",
            id: id.to_string(),
        })?;
        if entry.origin == Origin::BuiltIn {
            return Err(RegistryError::BuiltIn {
                kind: "parameter set",
                id: id.to_string(),
            });
        }

        let path = entry.path.clone();
        tokio::fs::remove_file(&path).await?;
        inner.params.remove(id);
        info!(id, path = %path.display(), "parameter set deleted");
        Ok(())
    }

    /// Upload a new user workflow definition from its YAML text.
    pub async fn upload_workflow(&self, raw_yaml: &str) -> Result<WorkflowDefinition, RegistryError> {
        let definition: WorkflowDefinition =
            serde_yaml::from_str(raw_yaml).map_err(|e| RegistryError::Parse {
                path: "<upload>".to_string(),
                details: e.to_string(),
            })?;
        definition.validate().map_err(|details| RegistryError::Invalid {
            kind: "workflow",
            id: definition.id.clone(),
            details,
        })?;

        let mut inner = self.inner.write().await;
        if let Some(existing) = inner.workflows.get(&definition.id) {
            if existing.origin == Origin::BuiltIn {
                return Err(RegistryError::BuiltIn {
                    kind: "workflow",
                    id: definition.id.clone(),
                });
            }
        }

        tokio::fs::create_dir_all(&self.workflow_dir).await?;
        let path = self.workflow_dir.join(format!("user_{}.yaml", definition.id));
        tokio::fs::write(&path, raw_yaml).await?;

        info!(id = %definition.id, path = %path.display(), "workflow uploaded");
        inner.workflows.insert(
            definition.id.clone(),
            LoadedWorkflow {
                origin: Origin::User,
                raw_yaml: raw_yaml.to_string(),
                path,
                definition: definition.clone(),
            },
        );
        Ok(definition)
    }

    /// Delete a user-uploaded workflow definition. Built-ins are protected.
    pub async fn delete_workflow(&self, id: &str) -> Result<(), RegistryError> {
        let mut inner = self.inner.write().await;
        let entry = inner
            .workflows
            .get(id)
            .ok_or_else(|| RegistryError::UnknownId {
                kind: "workflow",
                id: id.to_string(),
            })?;
        if entry.origin == Origin::BuiltIn {
            return Err(RegistryError::BuiltIn {
                kind: "workflow",
                id: id.to_string(),
            });
        }

        let path = entry.path.clone();
        tokio::fs::remove_file(&path).await?;
        inner.workflows.remove(id);
        info!(id, path = %path.display(), "workflow deleted");
        Ok(())
    }

    /// Validate a parameter set against a workflow definition: every option
    /// configured for a step of this workflow must be recognized by that
    /// step's type. Entries for step names the workflow does not have are
    /// ignored, since a shared parameter set may configure steps that only
    /// some workflows contain.
    pub fn validate_params_for(
        definition: &WorkflowDefinition,
        params: &ParameterSet,
    ) -> Result<(), RegistryError> {
        for (step_name, options) in &params.config {
            let Some(step) = definition.item_steps.iter().find(|s| &s.name == step_name) else {
                continue;
            };
            validate_step_options(&step.name, step.step_type, options)?;
        }
        Ok(())
    }

    /// Validate that every handler referenced by every workflow definition
    /// is known. Called at startup with the handler registry's membership
    /// test; unknown handlers fail loading, not execution.
    pub async fn validate_handlers(
        &self,
        known: impl Fn(&str) -> bool,
    ) -> Result<(), RegistryError> {
        let inner = self.inner.read().await;
        for entry in inner.workflows.values() {
            for step in &entry.definition.item_steps {
                if !known(&step.handler) {
                    return Err(RegistryError::Invalid {
                        kind: "workflow",
                        id: entry.definition.id.clone(),
                        details: format!(
                            "step '{}' references unknown handler '{}'",
                            step.name, step.handler
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Collect `*.yaml` / `*.yml` files in a directory, sorted for determinism.
async fn yaml_files(dir: &Path) -> Result<Vec<PathBuf>, RegistryError> {
    let mut files = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(files),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => files.push(path),
            _ => {}
        }
    }
    files.sort();
    Ok(files)
}
