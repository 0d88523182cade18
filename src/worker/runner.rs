//! Worker runtime: drives one job's tasks through the pipeline executor.
//!
//! Runs inside the detached worker process:
//! 1. Write the pid marker
//! 2. Select tasks (all, from a task, or a single task) and skip finished ones
//! 3. Per task: mark running, execute stages, write artifacts, record outcome
//! 4. Remove the pid marker, then retire the job to complete/rejected

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs;
use tracing::{error, info, warn};

use crate::config::{OrchestratorConfig, WorkerEnv};
use crate::error::WorkerError;
use crate::jobs::definition::PipelineDefinition;
use crate::jobs::id::JobId;
use crate::jobs::location::{self, JobPaths, Location};
use crate::pipeline::{PipelineExecutor, PipelineRegistry, RunOutcome, Stage, StageObserver, TaskScope};
use crate::store::{StatusStore, TaskFiles, TaskState, write_atomic};
use crate::worker::signals;

pub const OUTPUT_FILE: &str = "output.json";
pub const LOGS_FILE: &str = "execution-logs.json";

/// `output.json`: a task's final output plus every stage's output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskArtifact {
    /// Output of the last executed stage; seeds the next task.
    pub output: Value,
    pub previous_stage: String,
    pub data: IndexMap<String, Value>,
}

/// How a worker run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub job_id: String,
    /// Tasks executed this run, in order.
    pub executed: Vec<String>,
    pub failed_task: Option<String>,
    /// Where the job resides after the run.
    pub location: Location,
}

/// Outcome of one task; failures are already recorded in the snapshot.
enum TaskResult {
    Done(Value),
    Failed,
}

/// Publishes stage progress into the status snapshot.
struct StatusObserver<'a> {
    store: &'a StatusStore,
    job_dir: &'a Path,
    task: &'a str,
}

#[async_trait]
impl StageObserver for StatusObserver<'_> {
    async fn stage_started(&self, stage: Stage) {
        let result = self
            .store
            .write(self.job_dir, |s| {
                if let Some(task) = s.tasks.get_mut(self.task) {
                    task.current_stage = Some(stage.to_string());
                }
                s.current_stage = Some(stage.to_string());
            })
            .await;
        if let Err(e) = result {
            warn!(task = self.task, stage = %stage, error = %e, "Failed to record stage progress");
        }
    }
}

/// Executes a job inside the worker process.
pub struct JobRunner {
    config: OrchestratorConfig,
    store: Arc<StatusStore>,
    registry: Arc<PipelineRegistry>,
    executor: PipelineExecutor,
}

impl JobRunner {
    pub fn new(
        config: OrchestratorConfig,
        store: Arc<StatusStore>,
        registry: Arc<PipelineRegistry>,
    ) -> Self {
        let executor = PipelineExecutor::new(config.max_refinement_attempts);
        Self {
            config,
            store,
            registry,
            executor,
        }
    }

    pub fn with_executor(mut self, executor: PipelineExecutor) -> Self {
        self.executor = executor;
        self
    }

    /// Run the job's selected tasks. The job must reside in `current`.
    pub async fn run(&self, job_id: &JobId, env: &WorkerEnv) -> Result<RunSummary, WorkerError> {
        let paths = JobPaths::at(&self.config.data_dir, Location::Current, job_id);
        if !fs::metadata(&paths.dir).await.map(|m| m.is_dir()).unwrap_or(false) {
            return Err(WorkerError::JobNotCurrent {
                job_id: job_id.to_string(),
            });
        }

        signals::write_pid(&paths.pid_file(), std::process::id()).await?;
        let result = self.run_tasks(job_id, &paths, env).await;
        signals::remove_pid(&paths.pid_file()).await;

        let (executed, failed_task, all_done) = match result {
            Ok(progress) => progress,
            Err(e) => {
                error!(job_id = %job_id, error = %e, "Worker run aborted");
                self.mark_job_error(&paths, &e.to_string()).await;
                self.retire(job_id, Location::Rejected).await?;
                return Err(e);
            }
        };

        let location = if failed_task.is_some() {
            self.retire(job_id, Location::Rejected).await?
        } else if all_done {
            self.retire(job_id, Location::Complete).await?
        } else {
            Location::Current
        };

        info!(
            job_id = %job_id,
            executed = executed.len(),
            failed = ?failed_task,
            location = %location,
            "Worker run finished"
        );
        Ok(RunSummary {
            job_id: job_id.to_string(),
            executed,
            failed_task,
            location,
        })
    }

    /// Returns (executed tasks, failed task, whether every task is done).
    async fn run_tasks(
        &self,
        job_id: &JobId,
        paths: &JobPaths,
        env: &WorkerEnv,
    ) -> Result<(Vec<String>, Option<String>, bool), WorkerError> {
        let definition = PipelineDefinition::load(&paths.pipeline_file())
            .await
            .map_err(|e| WorkerError::Definition(e.to_string()))?;
        let names = definition.task_names();
        self.store
            .initialize(&paths.dir, job_id.as_str(), names.iter().cloned())
            .await?;

        let start = match &env.start_from_task {
            Some(task) => definition
                .position(task)
                .ok_or_else(|| WorkerError::UnknownTask { task: task.clone() })?,
            None => 0,
        };
        let end = if env.single_task && env.start_from_task.is_some() {
            start + 1
        } else {
            names.len()
        };

        let mut seed = self.initial_seed(paths, &names, start).await?;
        let mut executed = Vec::new();

        for task in &names[start..end] {
            let snapshot = self.store.read(&paths.dir).await?;
            if snapshot.tasks.get(task).map(|t| t.state) == Some(TaskState::Done) {
                info!(job_id = %job_id, task = %task, "Task already done, skipping");
                seed = read_task_output(paths, task).await?.unwrap_or(seed);
                continue;
            }

            executed.push(task.clone());
            match self.run_task(job_id, paths, task, seed).await? {
                TaskResult::Done(output) => seed = output,
                TaskResult::Failed => return Ok((executed, Some(task.clone()), false)),
            }
        }

        let snapshot = self
            .store
            .write(&paths.dir, |s| {
                let all_done = s.tasks.values().all(|t| t.state == TaskState::Done);
                s.state = if all_done {
                    TaskState::Done
                } else {
                    TaskState::Pending
                };
                s.current = None;
                s.current_stage = None;
                s.recompute_progress();
            })
            .await?;
        Ok((executed, None, snapshot.state == TaskState::Done))
    }

    /// Seed for the first selected task: `seed.json` at the head of the
    /// pipeline, the upstream task's output otherwise.
    async fn initial_seed(
        &self,
        paths: &JobPaths,
        names: &[String],
        start: usize,
    ) -> Result<Value, WorkerError> {
        if start > 0 {
            if let Some(output) = read_task_output(paths, &names[start - 1]).await? {
                return Ok(output);
            }
            warn!(task = %names[start - 1], "Upstream output missing, seeding from job seed");
        }
        match fs::read_to_string(paths.seed_file()).await {
            Ok(raw) => Ok(serde_json::from_str(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Value::Object(Default::default())),
            Err(e) => Err(e.into()),
        }
    }

    async fn run_task(
        &self,
        job_id: &JobId,
        paths: &JobPaths,
        task: &str,
        seed: Value,
    ) -> Result<TaskResult, WorkerError> {
        let started_at = Utc::now();
        self.store
            .write(&paths.dir, |s| {
                let status = s.tasks.entry(task.to_string()).or_default();
                status.state = TaskState::Running;
                status.attempts += 1;
                status.started_at = Some(started_at);
                status.ended_at = None;
                status.execution_time_ms = None;
                status.current_stage = None;
                status.failed_stage = None;
                status.error = None;
                s.current = Some(task.to_string());
                s.current_stage = None;
                s.state = TaskState::Running;
            })
            .await?;

        let task_dir = paths.task_dir(task);
        fs::create_dir_all(&task_dir).await?;

        let Some(module) = self.registry.get(task).await else {
            let message = format!("no pipeline module registered for task {}", task);
            self.record_failure(paths, task, None, &message).await?;
            return Ok(TaskResult::Failed);
        };

        info!(job_id = %job_id, task = %task, module = module.name(), "Starting task");
        let observer = StatusObserver {
            store: &self.store,
            job_dir: &paths.dir,
            task,
        };
        let scope = TaskScope::new(job_id.as_str(), task);
        let outcome = self
            .executor
            .run(module.as_ref(), &scope, seed, Some(&observer))
            .await;

        self.write_artifacts(&task_dir, &outcome).await?;

        if !outcome.ok {
            let message = outcome.error.clone().unwrap_or_else(|| "stage failed".into());
            self.record_failure(paths, task, outcome.failed_stage, &message)
                .await?;
            return Ok(TaskResult::Failed);
        }

        let ended_at = Utc::now();
        let elapsed = (ended_at - started_at).num_milliseconds().max(0) as u64;
        self.store
            .write(&paths.dir, |s| {
                if let Some(status) = s.tasks.get_mut(task) {
                    status.state = TaskState::Done;
                    status.ended_at = Some(ended_at);
                    status.execution_time_ms = Some(elapsed);
                    status.current_stage = None;
                    status.refinement_attempts = outcome.refinement_attempts;
                    status.token_usage.add(outcome.token_usage);
                    TaskFiles::add(&mut status.files.artifacts, OUTPUT_FILE);
                    TaskFiles::add(&mut status.files.logs, LOGS_FILE);
                }
                s.current = None;
                s.current_stage = None;
                s.recompute_progress();
                s.recompute_token_usage();
            })
            .await?;
        info!(job_id = %job_id, task = %task, elapsed_ms = elapsed, "Task done");

        Ok(TaskResult::Done(outcome.context.output().clone()))
    }

    async fn write_artifacts(&self, task_dir: &Path, outcome: &RunOutcome) -> Result<(), WorkerError> {
        let artifact = TaskArtifact {
            output: outcome.context.output().clone(),
            previous_stage: outcome.context.previous_stage.clone(),
            data: outcome
                .context
                .stage_outputs()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };
        write_atomic(
            &task_dir.join(OUTPUT_FILE),
            serde_json::to_string_pretty(&artifact)?.as_bytes(),
        )
        .await?;
        write_atomic(
            &task_dir.join(LOGS_FILE),
            serde_json::to_string_pretty(&outcome.logs)?.as_bytes(),
        )
        .await?;
        Ok(())
    }

    async fn record_failure(
        &self,
        paths: &JobPaths,
        task: &str,
        failed_stage: Option<Stage>,
        message: &str,
    ) -> Result<(), WorkerError> {
        error!(task, stage = ?failed_stage, error = message, "Task failed");
        self.store
            .write(&paths.dir, |s| {
                if let Some(status) = s.tasks.get_mut(task) {
                    status.state = TaskState::Error;
                    status.ended_at = Some(Utc::now());
                    status.failed_stage = failed_stage.map(|st| st.to_string());
                    status.current_stage = None;
                    status.error = Some(message.to_string());
                    if failed_stage.is_some() {
                        TaskFiles::add(&mut status.files.logs, LOGS_FILE);
                    }
                }
                s.state = TaskState::Error;
                s.current = None;
                s.current_stage = None;
                s.recompute_progress();
            })
            .await?;
        Ok(())
    }

    async fn mark_job_error(&self, paths: &JobPaths, message: &str) {
        let result = self
            .store
            .write(&paths.dir, |s| {
                s.state = TaskState::Error;
                s.current = None;
                s.current_stage = None;
                s.extra
                    .insert("error".into(), Value::String(message.to_string()));
            })
            .await;
        if let Err(e) = result {
            warn!(error = %e, "Failed to record job error");
        }
    }

    async fn retire(&self, job_id: &JobId, to: Location) -> Result<Location, WorkerError> {
        location::move_to(&self.config.data_dir, job_id, Location::Current, to).await?;
        Ok(to)
    }
}

async fn read_task_output(paths: &JobPaths, task: &str) -> Result<Option<Value>, WorkerError> {
    match fs::read_to_string(paths.task_dir(task).join(OUTPUT_FILE)).await {
        Ok(raw) => {
            let artifact: TaskArtifact = serde_json::from_str(&raw)?;
            Ok(Some(artifact.output))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
