// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The worker runtime.
//!
//! A worker is a long-running process with cooperative single-threaded
//! concurrency internally: a task pool of `concurrency` handler invocations
//! multiplexed on the async runtime. Multiple worker processes run in
//! parallel and coordinate only through the persistence layer.
//!
//! Main loop: heartbeat when due, sweep for stale workers when due, claim
//! up to the free pool capacity, dispatch claimed steps to their handlers,
//! advance each step transactionally when its handler terminates, and sleep
//! a jittered poll interval when nothing was claimed.
//!
//! On shutdown the worker stops claiming, waits up to the drain deadline
//! for in-flight steps, then cancels the rest. Cancelled steps stay RUNNING
//! on purpose: stale-worker recovery is the single mechanism that unsticks
//! RUNNING steps, and it will reclaim them once this worker's check-in row
//! is gone or stale.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;
use rand::Rng;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use soliplex_core::config::Config;
use soliplex_core::error::IngestError;
use soliplex_core::model::{AdvanceRequest, ClaimedStep, NewRunStep, StepOutcome};
use soliplex_core::persistence::Persistence;
use soliplex_core::artifact::ArtifactStore;
use soliplex_registry::Registry;

use crate::backoff::BackoffPolicy;
use crate::dispatcher::materialize_step_configs;
use crate::handler::{HandlerError, HandlerOutput, HandlerRegistry, StepContext};

/// Worker runtime configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Size of the internal task pool.
    pub concurrency: usize,
    /// Steps claimed per poll.
    pub claim_batch_size: usize,
    /// Heartbeat interval.
    pub checkin_interval: Duration,
    /// Staleness threshold for reclaiming other workers' steps.
    pub checkin_timeout: Duration,
    /// Sleep between empty polls, jittered +-20%.
    pub poll_interval: Duration,
    /// How long shutdown waits for in-flight steps.
    pub drain_deadline: Duration,
    /// Retry backoff policy.
    pub backoff: BackoffPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            claim_batch_size: 5,
            checkin_interval: Duration::from_secs(120),
            checkin_timeout: Duration::from_secs(600),
            poll_interval: Duration::from_secs(1),
            drain_deadline: Duration::from_secs(30),
            backoff: BackoffPolicy::default(),
        }
    }
}

impl WorkerConfig {
    /// Derive the worker configuration from the engine configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            concurrency: config.worker_concurrency,
            claim_batch_size: config.claim_batch_size,
            checkin_interval: config.worker_checkin_interval,
            checkin_timeout: config.worker_checkin_timeout,
            poll_interval: config.poll_interval,
            drain_deadline: config.drain_deadline,
            backoff: BackoffPolicy::new(config.retry_base, config.retry_cap),
        }
    }
}

type StepResult = (ClaimedStep, Result<HandlerOutput, HandlerError>);

/// A long-running step-execution process.
pub struct Worker {
    id: String,
    persistence: Arc<dyn Persistence>,
    artifacts: Arc<dyn ArtifactStore>,
    handlers: Arc<HandlerRegistry>,
    registry: Arc<Registry>,
    config: WorkerConfig,
    shutdown: CancellationToken,
}

impl Worker {
    /// Create a worker with a fresh UUID identity.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        artifacts: Arc<dyn ArtifactStore>,
        handlers: Arc<HandlerRegistry>,
        registry: Arc<Registry>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            persistence,
            artifacts,
            handlers,
            registry,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// The worker's identity, as recorded on claimed steps and check-ins.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Token that stops the main loop when cancelled.
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run until shutdown. Claims, executes, and advances steps.
    pub async fn run(&self) -> Result<(), IngestError> {
        info!(
            worker_id = %self.id,
            concurrency = self.config.concurrency,
            "worker starting"
        );

        self.persistence.worker_checkin(&self.id, Utc::now()).await?;
        let mut last_checkin = Instant::now();

        // Reclaim anything left RUNNING by dead workers before taking work.
        self.recover_stale().await;
        let mut last_sweep = Instant::now();

        let mut tasks: JoinSet<StepResult> = JoinSet::new();

        while !self.shutdown.is_cancelled() {
            if last_checkin.elapsed() >= self.config.checkin_interval {
                if let Err(e) = self.persistence.worker_checkin(&self.id, Utc::now()).await {
                    warn!(worker_id = %self.id, error = %e, "heartbeat failed");
                }
                last_checkin = Instant::now();
            }

            if last_sweep.elapsed() >= self.config.checkin_interval {
                self.recover_stale().await;
                last_sweep = Instant::now();
            }

            let free = self.config.concurrency.saturating_sub(tasks.len());
            let mut claimed_count = 0;
            if free > 0 {
                let want = free.min(self.config.claim_batch_size);
                match self.persistence.claim_steps(&self.id, want, Utc::now()).await {
                    Ok(steps) => {
                        claimed_count = steps.len();
                        for step in steps {
                            self.dispatch(&mut tasks, step).await;
                        }
                    }
                    Err(e) => {
                        error!(worker_id = %self.id, error = %e, "claim failed");
                    }
                }
            }

            if claimed_count == 0 {
                tokio::select! {
                    biased;

                    _ = self.shutdown.cancelled() => break,

                    joined = tasks.join_next(), if !tasks.is_empty() => {
                        if let Some(joined) = joined {
                            self.finish(joined).await;
                        }
                    }

                    _ = tokio::time::sleep(self.poll_delay()) => {}
                }
            } else {
                // Work arrived: collect anything already finished and poll
                // again immediately.
                while let Some(joined) = tasks.try_join_next() {
                    self.finish(joined).await;
                }
            }
        }

        info!(
            worker_id = %self.id,
            in_flight = tasks.len(),
            "worker shutting down, draining"
        );

        let deadline = Instant::now() + self.config.drain_deadline;
        while !tasks.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, tasks.join_next()).await {
                Ok(Some(joined)) => self.finish(joined).await,
                Ok(None) => break,
                Err(_) => break,
            }
        }

        if !tasks.is_empty() {
            warn!(
                worker_id = %self.id,
                cancelled = tasks.len(),
                "drain deadline passed; cancelled steps stay RUNNING for recovery"
            );
            tasks.abort_all();
        }

        if let Err(e) = self.persistence.remove_worker(&self.id).await {
            warn!(worker_id = %self.id, error = %e, "failed to remove worker check-in");
        }

        info!(worker_id = %self.id, "worker stopped");
        Ok(())
    }

    /// Jittered poll interval, +-20%.
    fn poll_delay(&self) -> Duration {
        let factor = rand::thread_rng().gen_range(0.8..=1.2);
        Duration::from_secs_f64(self.config.poll_interval.as_secs_f64() * factor)
    }

    async fn recover_stale(&self) {
        match self
            .persistence
            .recover_stale_steps(Utc::now(), self.config.checkin_timeout)
            .await
        {
            Ok(reclaimed) if !reclaimed.is_empty() => {
                info!(
                    worker_id = %self.id,
                    reclaimed = reclaimed.len(),
                    "reclaimed steps from stale workers"
                );
            }
            Ok(_) => {}
            Err(e) => {
                warn!(worker_id = %self.id, error = %e, "stale-worker sweep failed");
            }
        }
    }

    /// Resolve the handler for a claimed step and spawn it on the pool.
    ///
    /// Resolution failures never reach the pool: the step is advanced as
    /// failed right away. The registry validated handlers at startup, so a
    /// miss here means the definition changed underneath the run.
    async fn dispatch(&self, tasks: &mut JoinSet<StepResult>, claimed: ClaimedStep) {
        let handler_name = {
            let definition = match self.registry.workflow(&claimed.workflow_id).await {
                Ok(workflow) => workflow.definition,
                Err(e) => {
                    self.advance(
                        &claimed,
                        StepOutcome::Failed {
                            message: format!("workflow definition unavailable: {}", e),
                        },
                        None,
                    )
                    .await;
                    return;
                }
            };
            match definition
                .item_steps
                .iter()
                .find(|s| s.name == claimed.step_name)
            {
                Some(spec) => spec.handler.clone(),
                None => {
                    self.advance(
                        &claimed,
                        StepOutcome::Failed {
                            message: format!(
                                "step '{}' no longer exists in workflow '{}'",
                                claimed.step_name, claimed.workflow_id
                            ),
                        },
                        None,
                    )
                    .await;
                    return;
                }
            }
        };

        let Some(handler) = self.handlers.get(&handler_name) else {
            self.advance(
                &claimed,
                StepOutcome::Failed {
                    message: format!("unknown handler '{}'", handler_name),
                },
                None,
            )
            .await;
            return;
        };

        let ctx = StepContext::from_claimed(
            &claimed,
            self.artifacts.clone(),
            self.persistence.clone(),
        );
        let deadline = ctx.timeout();

        debug!(
            worker_id = %self.id,
            step_id = claimed.step_id,
            run_id = claimed.workflow_run_id,
            step = %claimed.step_name,
            handler = %handler_name,
            attempt = claimed.retry,
            retries = claimed.retries,
            "dispatching step"
        );

        tasks.spawn(async move {
            let call = std::panic::AssertUnwindSafe(handler.run(&ctx)).catch_unwind();
            let result = match deadline {
                Some(limit) => match tokio::time::timeout(limit, call).await {
                    Ok(outcome) => outcome,
                    Err(_) => Ok(Err(HandlerError::Retryable(format!(
                        "step exceeded its {}s deadline",
                        limit.as_secs()
                    )))),
                },
                None => call.await,
            };

            let result = match result {
                Ok(result) => result,
                Err(_) => Err(HandlerError::Retryable("handler panicked".to_string())),
            };

            (claimed, result)
        });
    }

    /// Turn a finished handler invocation into a step advance.
    async fn finish(&self, joined: Result<StepResult, tokio::task::JoinError>) {
        let (claimed, result) = match joined {
            Ok(pair) => pair,
            Err(e) => {
                // Aborted during drain; the step stays RUNNING for recovery.
                if !e.is_cancelled() {
                    error!(worker_id = %self.id, error = %e, "step task failed to join");
                }
                return;
            }
        };

        let outcome = match result {
            Ok(metadata) => StepOutcome::Completed {
                metadata: serde_json::Value::Object(metadata),
            },
            Err(HandlerError::Retryable(message)) => {
                if claimed.retry < claimed.retries {
                    let attempt = (claimed.retry + 1) as u32;
                    let not_before = self.config.backoff.not_before(Utc::now(), attempt);
                    StepOutcome::Retry {
                        message,
                        not_before,
                    }
                } else {
                    StepOutcome::Failed {
                        message: format!("retries exhausted: {}", message),
                    }
                }
            }
            Err(HandlerError::Fatal(message)) => StepOutcome::Failed { message },
        };

        let next_step = match &outcome {
            StepOutcome::Completed { .. } if !claimed.is_last_step => {
                match self.next_step_blueprint(&claimed).await {
                    Ok(next) => Some(next),
                    Err(message) => {
                        self.advance(&claimed, StepOutcome::Failed { message }, None)
                            .await;
                        return;
                    }
                }
            }
            _ => None,
        };

        self.advance(&claimed, outcome, next_step).await;
    }

    async fn advance(
        &self,
        claimed: &ClaimedStep,
        outcome: StepOutcome,
        next_step: Option<NewRunStep>,
    ) {
        let request = AdvanceRequest {
            step_id: claimed.step_id,
            worker_id: self.id.clone(),
            outcome,
            next_step,
        };
        match self.persistence.advance_step(&request).await {
            Ok(result) => {
                debug!(
                    worker_id = %self.id,
                    step_id = claimed.step_id,
                    run_terminal = result.run_terminal,
                    group_terminal = result.group_terminal,
                    batch_completed = result.batch_completed,
                    "step advanced"
                );
            }
            Err(e) => {
                // The transaction rolled back; the step stays RUNNING and
                // crash recovery will eventually reclaim it.
                error!(
                    worker_id = %self.id,
                    step_id = claimed.step_id,
                    error = %e,
                    "failed to advance step"
                );
            }
        }
    }

    /// Blueprint for the step after `claimed`, rebuilt from the workflow
    /// definition and parameter set. The step-config lookup is a dedup hit
    /// on the rows materialized at group start.
    async fn next_step_blueprint(&self, claimed: &ClaimedStep) -> Result<NewRunStep, String> {
        let workflow = self
            .registry
            .workflow(&claimed.workflow_id)
            .await
            .map_err(|e| format!("workflow definition unavailable: {}", e))?;
        let params = self
            .registry
            .param_set(&claimed.param_id)
            .await
            .map_err(|e| format!("parameter set unavailable: {}", e))?;

        let materialized = materialize_step_configs(
            self.persistence.as_ref(),
            &workflow.definition,
            &params.params,
        )
        .await
        .map_err(|e| format!("failed to materialize step configs: {}", e))?;

        // step_number is 1-based, so it doubles as the 0-based index of the
        // next step.
        materialized
            .get(claimed.step_number as usize)
            .map(|step| step.as_new_run_step(claimed.priority))
            .ok_or_else(|| {
                format!(
                    "workflow '{}' has no step {} but step {} is not last",
                    claimed.workflow_id,
                    claimed.step_number + 1,
                    claimed.step_number
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_config_default() {
        let config = WorkerConfig::default();
        assert_eq!(config.concurrency, 10);
        assert_eq!(config.claim_batch_size, 5);
        assert_eq!(config.checkin_interval, Duration::from_secs(120));
        assert_eq!(config.checkin_timeout, Duration::from_secs(600));
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.drain_deadline, Duration::from_secs(30));
    }

    #[test]
    fn test_checkin_timeout_exceeds_interval() {
        let config = WorkerConfig::default();
        assert!(config.checkin_timeout >= config.checkin_interval * 5);
    }
}
