// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The step-handler contract.
//!
//! A handler implements one step of a workflow and is identified by a
//! fully-qualified name in the workflow definition. Names are resolved
//! through an explicit [`HandlerRegistry`] populated at startup; workflow
//! definitions referencing unknown names fail loading, not execution.
//!
//! Handlers signal failure through [`HandlerError`]: `Retryable` moves the
//! step into the retry path, `Fatal` fails it immediately regardless of the
//! retry budget. Anything a handler cannot classify should be `Retryable`;
//! the engine treats untyped failures (including panics) the same way.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use soliplex_core::artifact::ArtifactStore;
use soliplex_core::model::{ClaimedStep, StepType};
use soliplex_core::persistence::Persistence;

/// Failure modes a handler can signal.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HandlerError {
    /// Transient fault (network timeout, parser overloaded); the step moves
    /// to the retry path and may run again after backoff.
    #[error("retryable: {0}")]
    Retryable(String),

    /// Permanent impossibility (corrupt input); the step fails immediately
    /// regardless of the retry budget.
    #[error("fatal: {0}")]
    Fatal(String),
}

/// Metadata map returned by a successful handler invocation.
pub type HandlerOutput = serde_json::Map<String, serde_json::Value>;

/// Everything a handler may consult while executing one step.
///
/// The cumulative-config snapshot on the step is the single source of truth
/// for "what this step was told to do"; handlers read `config` (their own
/// options) and prior-step outputs through `artifacts`.
#[derive(Clone)]
pub struct StepContext {
    /// Batch the document belongs to.
    pub batch_id: i64,
    /// Source system tag of the batch.
    pub source: String,
    /// Content hash of the document being processed.
    pub doc_hash: String,
    /// The run this step belongs to.
    pub workflow_run_id: i64,
    /// Step name from the workflow definition.
    pub step_name: String,
    /// The step's type.
    pub step_type: StepType,
    /// This step's options from the materialized step config.
    pub config: serde_json::Value,
    /// Cumulative options of this step and all predecessors.
    pub cumulative_config: serde_json::Value,
    /// Ambient parameters recorded on the run.
    pub run_params: serde_json::Value,
    /// Artifact store for reading prior outputs and writing this step's.
    pub artifacts: Arc<dyn ArtifactStore>,
    /// Persistence access, for handlers that touch document metadata.
    pub persistence: Arc<dyn Persistence>,
}

impl StepContext {
    /// Build a context from a claimed step and the worker's shared handles.
    pub fn from_claimed(
        claimed: &ClaimedStep,
        artifacts: Arc<dyn ArtifactStore>,
        persistence: Arc<dyn Persistence>,
    ) -> Self {
        let step_type = StepType::parse(&claimed.step_type).unwrap_or(StepType::Enrich);
        let cumulative_config = serde_json::from_str(&claimed.cumulative_config)
            .unwrap_or(serde_json::Value::Null);
        Self {
            batch_id: claimed.batch_id,
            source: claimed.batch_source.clone(),
            doc_hash: claimed.doc_hash.clone(),
            workflow_run_id: claimed.workflow_run_id,
            step_name: claimed.step_name.clone(),
            step_type,
            config: claimed.config.clone(),
            cumulative_config,
            run_params: claimed.run_params.clone(),
            artifacts,
            persistence,
        }
    }

    /// The soft deadline configured for this step, if any.
    ///
    /// The worker cancels the handler at the deadline and reports a
    /// retryable failure.
    pub fn timeout(&self) -> Option<Duration> {
        self.config
            .get("timeout_secs")
            .and_then(|v| v.as_u64())
            .map(Duration::from_secs)
    }
}

/// A callable implementing one step of a workflow.
///
/// Handlers MUST be idempotent: re-invoked with the same inputs they must
/// either produce the same artifact or find and reuse the existing one.
#[async_trait]
pub trait StepHandler: Send + Sync {
    /// Execute the step, returning metadata for the audit trail.
    async fn run(&self, ctx: &StepContext) -> Result<HandlerOutput, HandlerError>;
}

/// Registry of step handlers keyed by fully-qualified name.
///
/// Populated once at startup; workflow definitions are validated against it
/// before any work is accepted.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn StepHandler>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its fully-qualified name. The last
    /// registration for a name wins.
    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn StepHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    /// Resolve a handler by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn StepHandler>> {
        self.handlers.get(name).cloned()
    }

    /// Whether a name is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// All registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}
