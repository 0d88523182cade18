//! Stage pipeline executor: runs one task's canonical stage sequence.
//!
//! Flow per run:
//! 1. Resolve the implemented stage set (module or injected override)
//! 2. Walk the canonical order, skipping unimplemented stages
//! 3. At `refine`, loop refine → validate → critique while the flags bag
//!    asks for it and the pass budget allows
//! 4. Halt on the first failing stage

use std::any::Any;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::StageError;
use crate::llm::{ModelInvoker, TokenUsage};
use crate::pipeline::module::{PipelineModule, StageContext};
use crate::pipeline::types::{
    ExecutionContext, RunOutcome, Stage, StageLogEntry, StageOutcome,
};

/// Default refine pass budget.
pub const DEFAULT_MAX_REFINEMENT_ATTEMPTS: u32 = 2;

/// Notified as stages start, so callers can publish progress.
#[async_trait]
pub trait StageObserver: Send + Sync {
    async fn stage_started(&self, stage: Stage);
}

/// Identity of the task being run, for logging and stage context.
#[derive(Debug, Clone, Default)]
pub struct TaskScope {
    pub job_id: String,
    pub task: String,
}

impl TaskScope {
    pub fn new(job_id: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            task: task.into(),
        }
    }
}

/// Runs pipeline modules.
pub struct PipelineExecutor {
    max_refinement_attempts: u32,
    stage_override: Option<Vec<Stage>>,
    invoker: Option<Arc<dyn ModelInvoker>>,
}

impl Default for PipelineExecutor {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_REFINEMENT_ATTEMPTS)
    }
}

impl PipelineExecutor {
    pub fn new(max_refinement_attempts: u32) -> Self {
        Self {
            max_refinement_attempts,
            stage_override: None,
            invoker: None,
        }
    }

    /// Use this stage set instead of asking the module.
    pub fn with_stage_override(mut self, stages: Vec<Stage>) -> Self {
        self.stage_override = Some(stages);
        self
    }

    pub fn with_invoker(mut self, invoker: Arc<dyn ModelInvoker>) -> Self {
        self.invoker = Some(invoker);
        self
    }

    /// Run a module's stages against a fresh context seeded with `seed`.
    pub async fn run(
        &self,
        module: &dyn PipelineModule,
        scope: &TaskScope,
        seed: Value,
        observer: Option<&dyn StageObserver>,
    ) -> RunOutcome {
        self.run_with_context(module, scope, ExecutionContext::new(seed), observer)
            .await
    }

    /// Run a module's stages starting from `context`.
    pub async fn run_with_context(
        &self,
        module: &dyn PipelineModule,
        scope: &TaskScope,
        context: ExecutionContext,
        observer: Option<&dyn StageObserver>,
    ) -> RunOutcome {
        let implemented: HashSet<Stage> = match &self.stage_override {
            Some(stages) => stages.iter().copied().collect(),
            None => module.stages().into_iter().collect(),
        };

        info!(
            job_id = %scope.job_id,
            task = %scope.task,
            module = module.name(),
            stages = implemented.len(),
            "Running task pipeline"
        );

        let mut run = Run {
            module,
            scope,
            observer,
            invoker: self.invoker.as_ref(),
            context,
            logs: Vec::with_capacity(Stage::CANONICAL.len()),
            usage: Mutex::new(TokenUsage::default()),
            refinement_attempts: 0,
        };

        for stage in Stage::CANONICAL {
            if !implemented.contains(&stage) {
                debug!(task = %scope.task, stage = %stage, "Stage not implemented, skipping");
                run.logs.push(StageLogEntry::skipped(stage));
                continue;
            }

            let result = if stage == Stage::Refine {
                run.refinement_loop(&implemented, self.max_refinement_attempts)
                    .await
            } else {
                run.execute(stage).await
            };

            if let Err((failed, error)) = result {
                return run.finish(Some(failed), Some(error));
            }
        }

        run.finish(None, None)
    }
}

/// Mutable state of one executor run.
struct Run<'a> {
    module: &'a dyn PipelineModule,
    scope: &'a TaskScope,
    observer: Option<&'a dyn StageObserver>,
    invoker: Option<&'a Arc<dyn ModelInvoker>>,
    context: ExecutionContext,
    logs: Vec<StageLogEntry>,
    usage: Mutex<TokenUsage>,
    refinement_attempts: u32,
}

impl Run<'_> {
    /// Invoke one stage and fold its result into the context.
    async fn execute(&mut self, stage: Stage) -> Result<(), (Stage, String)> {
        if let Some(observer) = self.observer {
            observer.stage_started(stage).await;
        }

        let timestamp = Utc::now();
        let started = Instant::now();
        let result = {
            let ctx = StageContext::new(
                &self.scope.job_id,
                &self.scope.task,
                stage,
                self.refinement_attempts,
                &self.context,
                self.invoker,
                &self.usage,
            );
            // A panicking stage fails the task like any other stage error.
            AssertUnwindSafe(self.module.run_stage(stage, &ctx))
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| {
                    Err(StageError::failed(
                        stage.as_str(),
                        format!("panicked: {}", panic_message(payload.as_ref())),
                    ))
                })
        };
        let duration_ms = started.elapsed().as_millis() as u64;
        let refinement_attempt = (self.refinement_attempts > 0).then_some(self.refinement_attempts);

        match result {
            Ok(out) => {
                self.context.merge_flags(out.flags);
                self.context.record(stage, out.output);
                self.logs.push(StageLogEntry {
                    stage,
                    outcome: StageOutcome::Ok,
                    skipped: false,
                    timestamp,
                    duration_ms: Some(duration_ms),
                    refinement_attempt,
                    error: None,
                });
                debug!(task = %self.scope.task, stage = %stage, duration_ms, "Stage complete");
                Ok(())
            }
            Err(e) => {
                let message = e.to_string();
                warn!(
                    job_id = %self.scope.job_id,
                    task = %self.scope.task,
                    stage = %stage,
                    error = %message,
                    "Stage failed, halting task"
                );
                self.logs.push(StageLogEntry {
                    stage,
                    outcome: StageOutcome::Failed,
                    skipped: false,
                    timestamp,
                    duration_ms: Some(duration_ms),
                    refinement_attempt,
                    error: Some(message.clone()),
                });
                Err((stage, message))
            }
        }
    }

    /// Refine while the flags bag asks for it, re-running the validation
    /// cycle after each pass. Always terminates: the pass count is capped.
    async fn refinement_loop(
        &mut self,
        implemented: &HashSet<Stage>,
        max_attempts: u32,
    ) -> Result<(), (Stage, String)> {
        loop {
            if !self.context.needs_refinement() {
                if self.refinement_attempts == 0 {
                    self.logs
                        .push(StageLogEntry::marker(Stage::Refine, StageOutcome::NotNeeded));
                }
                return Ok(());
            }

            if self.refinement_attempts >= max_attempts {
                warn!(
                    task = %self.scope.task,
                    attempts = self.refinement_attempts,
                    "Refinement budget exhausted, continuing with current output"
                );
                let mut entry = StageLogEntry::marker(Stage::Refine, StageOutcome::MaxAttemptsReached);
                entry.refinement_attempt = Some(self.refinement_attempts);
                self.logs.push(entry);
                return Ok(());
            }

            self.refinement_attempts += 1;
            info!(
                task = %self.scope.task,
                attempt = self.refinement_attempts,
                max = max_attempts,
                "Refinement pass"
            );
            self.execute(Stage::Refine).await?;
            self.context.clear_refinement_flags();

            for stage in Stage::VALIDATION_CYCLE {
                if implemented.contains(&stage) {
                    self.execute(stage).await?;
                }
            }
        }
    }

    fn finish(self, failed_stage: Option<Stage>, error: Option<String>) -> RunOutcome {
        let token_usage = self.usage.into_inner().unwrap_or_default();
        let ok = failed_stage.is_none();
        if ok {
            info!(
                job_id = %self.scope.job_id,
                task = %self.scope.task,
                refinements = self.refinement_attempts,
                "Task pipeline complete"
            );
        }
        RunOutcome {
            ok,
            context: self.context,
            logs: self.logs,
            refinement_attempts: self.refinement_attempts,
            token_usage,
            failed_stage,
            error,
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
