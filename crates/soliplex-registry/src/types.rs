// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Declarative types for workflow definitions and parameter sets.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use soliplex_core::model::StepType;

use crate::RegistryError;

/// Where a registry entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Shipped with the application. Immutable and undeletable.
    BuiltIn,
    /// Uploaded by a user. Freely modifiable.
    User,
}

impl Origin {
    /// Uploads are saved with a `user_` filename prefix; everything else in
    /// the directory is built-in.
    pub fn from_path(path: &Path) -> Self {
        let is_user = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with("user_"))
            .unwrap_or(false);
        if is_user { Origin::User } else { Origin::BuiltIn }
    }
}

fn default_retries() -> i64 {
    1
}

/// One item-step of a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    /// Step name, unique within the workflow.
    pub name: String,
    /// The step's type, which fixes its recognized options.
    pub step_type: StepType,
    /// Fully-qualified handler reference, resolved through the handler
    /// registry at startup.
    pub handler: String,
    /// Retry budget for transient failures.
    #[serde(default = "default_retries")]
    pub retries: i64,
    /// Static per-step parameters from the definition itself, merged under
    /// the parameter set's options when the step config is materialized.
    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
}

/// A declarative ordered list of steps and their handlers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Stable identifier.
    pub id: String,
    /// Optional display name.
    #[serde(default)]
    pub name: Option<String>,
    /// Ordered item-steps; position is the 1-based step number.
    pub item_steps: Vec<StepSpec>,
}

impl WorkflowDefinition {
    /// Structural validation: non-empty id, at least one step, unique step
    /// names.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.is_empty() {
            return Err("id must not be empty".to_string());
        }
        if self.item_steps.is_empty() {
            return Err("item_steps must not be empty".to_string());
        }
        let mut seen = std::collections::HashSet::new();
        for step in &self.item_steps {
            if step.name.is_empty() {
                return Err("step names must not be empty".to_string());
            }
            if !seen.insert(step.name.as_str()) {
                return Err(format!("duplicate step name '{}'", step.name));
            }
            if step.retries < 0 {
                return Err(format!("step '{}' has a negative retry budget", step.name));
            }
        }
        Ok(())
    }
}

/// A declarative bundle of per-step options selected at workflow start.
///
/// `config` maps step *names* to option maps; a `BTreeMap` keeps the
/// cumulative-config snapshots canonical.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterSet {
    /// Stable identifier.
    pub id: String,
    /// Optional display name.
    #[serde(default)]
    pub name: Option<String>,
    /// Step name to option map.
    #[serde(default)]
    pub config: BTreeMap<String, serde_json::Map<String, serde_json::Value>>,
}

/// Recognized option keys per step type. `None` means the step type accepts
/// handler-specific options that the engine does not enumerate.
///
/// `timeout_secs` is recognized everywhere: it is the soft deadline the
/// worker enforces around the handler call.
pub fn recognized_options(step_type: StepType) -> Option<&'static [&'static str]> {
    match step_type {
        StepType::Ingest | StepType::Enrich => None,
        StepType::Validate => Some(&["mime_types", "max_file_size", "timeout_secs"]),
        StepType::Parse => Some(&["ocr", "language", "backend", "table_mode", "timeout_secs"]),
        StepType::Chunk => Some(&[
            "chunker",
            "chunk_size",
            "chunk_overlap",
            "strategy",
            "timeout_secs",
        ]),
        StepType::Embed => Some(&[
            "provider",
            "model",
            "dimension",
            "batch_size",
            "timeout_secs",
        ]),
        StepType::Store => Some(&["database", "upsert", "timeout_secs"]),
        StepType::Route => Some(&["predicate", "true_step", "false_step", "timeout_secs"]),
    }
}

/// Check every option key against the step type's recognized set.
pub fn validate_step_options(
    step_name: &str,
    step_type: StepType,
    options: &serde_json::Map<String, serde_json::Value>,
) -> Result<(), RegistryError> {
    let Some(recognized) = recognized_options(step_type) else {
        return Ok(());
    };
    for key in options.keys() {
        if !recognized.contains(&key.as_str()) {
            return Err(RegistryError::UnknownOption {
                step: step_name.to_string(),
                step_type: step_type.as_str(),
                option: key.clone(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_workflow(yaml: &str) -> WorkflowDefinition {
        serde_yaml::from_str(yaml).expect("workflow should parse")
    }

    #[test]
    fn test_workflow_definition_parses() {
        let def = parse_workflow(
            r#"
id: batch_split
name: Batch split pipeline
item_steps:
  - name: parse
    step_type: parse
    handler: soliplex.handlers.parse_document
    retries: 2
  - name: chunk
    step_type: chunk
    handler: soliplex.handlers.chunk_document
"#,
        );
        assert_eq!(def.id, "batch_split");
        assert_eq!(def.item_steps.len(), 2);
        assert_eq!(def.item_steps[0].retries, 2);
        // Default retry budget.
        assert_eq!(def.item_steps[1].retries, 1);
        assert!(def.validate().is_ok());
    }

    #[test]
    fn test_workflow_duplicate_step_names_rejected() {
        let def = parse_workflow(
            r#"
id: bad
item_steps:
  - name: parse
    step_type: parse
    handler: a
  - name: parse
    step_type: chunk
    handler: b
"#,
        );
        let err = def.validate().unwrap_err();
        assert!(err.contains("duplicate step name"));
    }

    #[test]
    fn test_parameter_set_parses() {
        let params: ParameterSet = serde_yaml::from_str(
            r#"
id: default
config:
  parse:
    ocr: true
    language: en
  chunk:
    chunker: docling
    chunk_size: 512
"#,
        )
        .unwrap();
        assert_eq!(params.id, "default");
        assert_eq!(params.config["parse"]["ocr"], serde_json::json!(true));
    }

    #[test]
    fn test_recognized_options() {
        let mut options = serde_json::Map::new();
        options.insert("chunk_size".to_string(), serde_json::json!(512));
        assert!(validate_step_options("chunk", StepType::Chunk, &options).is_ok());

        options.insert("compression".to_string(), serde_json::json!("zstd"));
        let err = validate_step_options("chunk", StepType::Chunk, &options).unwrap_err();
        assert!(matches!(err, RegistryError::UnknownOption { .. }));
    }

    #[test]
    fn test_enrich_accepts_anything() {
        let mut options = serde_json::Map::new();
        options.insert("llm_prompt".to_string(), serde_json::json!("summarize"));
        assert!(validate_step_options("enrich", StepType::Enrich, &options).is_ok());
    }

    #[test]
    fn test_origin_from_path() {
        assert_eq!(
            Origin::from_path(Path::new("config/params/default.yaml")),
            Origin::BuiltIn
        );
        assert_eq!(
            Origin::from_path(Path::new("config/params/user_custom.yaml")),
            Origin::User
        );
    }
}
