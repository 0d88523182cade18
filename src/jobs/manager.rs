//! Job lifecycle manager: serializes operator actions per job.
//!
//! Every operation validates the job id first, then resolves residency.
//! Start/stop/restart hold an in-flight guard for the duration of the
//! manager-side mutation only; workers run detached and report through the
//! status store.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tokio::fs;
use tracing::{info, warn};

use crate::config::OrchestratorConfig;
use crate::error::LifecycleError;
use crate::jobs::definition::{JobMetadata, PipelineDefinition};
use crate::jobs::guards::{InFlightGuard, InFlightGuards, Operation};
use crate::jobs::id::JobId;
use crate::jobs::location::{self, JobPaths, Location};
use crate::store::{ResetOptions, StatusSnapshot, StatusStore, TaskState, TaskStatus};
use crate::worker::signals;
use crate::worker::{WorkerRequest, WorkerSpawner};

/// Result of `rescan`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RescanOutcome {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl RescanOutcome {
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Which reset a restart applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetMode {
    CleanSlate,
    FromTask,
    SingleTask,
}

/// Result of `restart`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestartOutcome {
    pub job_id: String,
    pub reset: ResetMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_task: Option<String>,
    pub pid: Option<u32>,
}

/// Result of `stop`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopOutcome {
    /// Whether a worker process was actually signaled.
    pub stopped: bool,
    pub signal: Option<&'static str>,
    pub reset_task: Option<String>,
}

/// Result of `start`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartOutcome {
    pub job_id: String,
    pub task: String,
    pub pid: Option<u32>,
}

/// Result of `status`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub location: Location,
    pub snapshot: Option<StatusSnapshot>,
}

fn internal(context: &str, e: impl std::fmt::Display) -> LifecycleError {
    LifecycleError::Internal(format!("{}: {}", context, e))
}

/// Coordinates operator actions against jobs on disk.
pub struct JobLifecycleManager {
    config: OrchestratorConfig,
    store: Arc<StatusStore>,
    spawner: Arc<dyn WorkerSpawner>,
    guards: InFlightGuards,
}

impl JobLifecycleManager {
    pub fn new(
        config: OrchestratorConfig,
        store: Arc<StatusStore>,
        spawner: Arc<dyn WorkerSpawner>,
    ) -> Self {
        Self {
            config,
            store,
            spawner,
            guards: InFlightGuards::new(),
        }
    }

    pub fn guards(&self) -> &InFlightGuards {
        &self.guards
    }

    fn acquire(&self, op: Operation, id: &JobId) -> Result<InFlightGuard, LifecycleError> {
        self.guards.try_acquire(op, id.as_str()).map_err(|active| {
            LifecycleError::running(id.as_str(), format!("{} already in progress", active))
        })
    }

    async fn resolve(&self, id: &JobId) -> Result<(Location, JobPaths), LifecycleError> {
        location::resolve(&self.config.data_dir, id)
            .await
            .ok_or_else(|| LifecycleError::JobNotFound {
                job_id: id.to_string(),
            })
    }

    async fn pinned_definition(&self, paths: &JobPaths) -> Result<PipelineDefinition, LifecycleError> {
        PipelineDefinition::load(&paths.pipeline_file())
            .await
            .map_err(|e| internal("reading pinned pipeline definition", e))
    }

    /// Move the job into `current` unless it is already there.
    async fn ensure_current(
        &self,
        id: &JobId,
        from: Location,
        paths: JobPaths,
    ) -> Result<JobPaths, LifecycleError> {
        if from == Location::Current {
            return Ok(paths);
        }
        location::move_to(&self.config.data_dir, id, from, Location::Current)
            .await
            .map_err(|e| internal("moving job to current", e))
    }

    // ── rescan ──────────────────────────────────────────────────────

    /// Bring the pinned definition in line with the authoritative one.
    pub async fn rescan(&self, job_id: &str) -> Result<RescanOutcome, LifecycleError> {
        let id = JobId::parse(job_id)?;
        let (_, paths) = self.resolve(&id).await?;

        let pinned = match PipelineDefinition::load(&paths.pipeline_file()).await {
            Ok(def) => def,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => PipelineDefinition::default(),
            Err(e) => return Err(internal("reading pinned pipeline definition", e)),
        };

        let pipeline = match JobMetadata::load(&paths.job_file()).await {
            Ok(meta) => meta.pipeline,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(internal("reading job metadata", e)),
        }
        .or_else(|| pinned.name.clone())
        .ok_or_else(|| {
            LifecycleError::BadRequest(format!("job {} does not reference a pipeline", id))
        })?;

        let source_path = self.config.pipeline_definition_path(&pipeline);
        let authoritative = PipelineDefinition::load(&source_path)
            .await
            .map_err(|e| internal(&format!("reading {}", source_path.display()), e))?;

        let old_names = pinned.task_names();
        let new_names = authoritative.task_names();
        let old_set: HashSet<&String> = old_names.iter().collect();
        let new_set: HashSet<&String> = new_names.iter().collect();
        let outcome = RescanOutcome {
            added: new_names
                .iter()
                .filter(|n| !old_set.contains(n))
                .cloned()
                .collect(),
            removed: old_names
                .iter()
                .filter(|n| !new_set.contains(n))
                .cloned()
                .collect(),
        };
        if outcome.is_noop() {
            info!(job_id = %id, "Rescan found no definition changes");
            return Ok(outcome);
        }

        authoritative
            .save_atomic(&paths.pipeline_file())
            .await
            .map_err(|e| internal("rewriting pinned pipeline definition", e))?;
        for name in &new_names {
            fs::create_dir_all(paths.task_dir(name))
                .await
                .map_err(|e| internal("creating task directory", e))?;
        }

        self.store
            .write(&paths.dir, |s| {
                let mut previous = std::mem::take(&mut s.tasks);
                s.tasks = new_names
                    .iter()
                    .map(|name| {
                        let record = previous.shift_remove(name).unwrap_or_else(TaskStatus::pending);
                        (name.clone(), record)
                    })
                    .collect();
                if s.current.as_ref().is_some_and(|c| !s.tasks.contains_key(c.as_str())) {
                    s.current = None;
                    s.current_stage = None;
                }
                s.recompute_progress();
                s.recompute_token_usage();
            })
            .await?;

        info!(
            job_id = %id,
            added = ?outcome.added,
            removed = ?outcome.removed,
            "Rescan reconciled pipeline definition"
        );
        Ok(outcome)
    }

    // ── restart ─────────────────────────────────────────────────────

    /// Reset (all, from a task, or a single task) and spawn a worker.
    pub async fn restart(
        &self,
        job_id: &str,
        from_task: Option<&str>,
        single_task: bool,
    ) -> Result<RestartOutcome, LifecycleError> {
        let id = JobId::parse(job_id)?;
        if single_task && from_task.is_none() {
            return Err(LifecycleError::BadRequest(
                "single-task restart requires a task".into(),
            ));
        }

        let _guard = self.acquire(Operation::Restart, &id)?;

        let (from, paths) = self.resolve(&id).await?;
        if let Some(snapshot) = self.store.read_optional(&paths.dir).await? {
            if snapshot.state == TaskState::Running {
                return Err(LifecycleError::running(id.as_str(), "job is running"));
            }
        }

        let definition = self.pinned_definition(&paths).await?;
        if let Some(task) = from_task {
            if definition.position(task).is_none() {
                return Err(LifecycleError::TaskNotFound {
                    job_id: id.to_string(),
                    task: task.to_string(),
                });
            }
        }

        let paths = self.ensure_current(&id, from, paths).await?;
        self.store
            .initialize(&paths.dir, id.as_str(), definition.task_names())
            .await?;

        let reset = match (from_task, single_task) {
            (Some(task), true) => {
                self.store
                    .reset_single_task(&paths.dir, task, ResetOptions::default())
                    .await?;
                ResetMode::SingleTask
            }
            (Some(task), false) => {
                self.store
                    .reset_from_task(&paths.dir, task, ResetOptions::default())
                    .await?;
                ResetMode::FromTask
            }
            (None, _) => {
                self.store
                    .reset_clean_slate(
                        &paths.dir,
                        ResetOptions {
                            clear_token_usage: true,
                        },
                    )
                    .await?;
                ResetMode::CleanSlate
            }
        };

        let request = match from_task {
            Some(task) => WorkerRequest::from_task(id.as_str(), task, single_task),
            None => WorkerRequest::full(id.as_str()),
        };
        let pid = self.spawner.spawn(&request).await?;

        info!(job_id = %id, reset = ?reset, from_task = ?from_task, "Job restarted");
        Ok(RestartOutcome {
            job_id: id.to_string(),
            reset,
            from_task: from_task.map(str::to_string),
            pid,
        })
    }

    // ── stop ────────────────────────────────────────────────────────

    /// Terminate the job's worker, reset the task it was running, and clear
    /// the job's progress pointers.
    pub async fn stop(&self, job_id: &str) -> Result<StopOutcome, LifecycleError> {
        let id = JobId::parse(job_id)?;
        let _guard = self.acquire(Operation::Stop, &id)?;
        let (_, paths) = self.resolve(&id).await?;

        let pid_file = paths.pid_file();
        let termination = match signals::read_pid(&pid_file).await {
            Some(pid) => signals::terminate(pid, self.config.stop_grace).await,
            None => {
                info!(job_id = %id, "No worker pid recorded");
                signals::TerminateOutcome::NOT_SIGNALED
            }
        };
        signals::remove_pid(&pid_file).await;

        let mut reset_task = None;
        if self.store.read_optional(&paths.dir).await?.is_some() {
            self.store
                .write(&paths.dir, |s| {
                    reset_task = s.active_task();
                    if let Some(task) = &reset_task {
                        s.reset_single_task(task, ResetOptions::default());
                    }
                    s.current = None;
                    s.current_stage = None;
                    if s.state == TaskState::Running && s.running_task().is_none() {
                        s.state = TaskState::Pending;
                    }
                })
                .await?;
        } else {
            warn!(job_id = %id, "No status snapshot to reset after stop");
        }

        info!(
            job_id = %id,
            stopped = termination.signaled,
            signal = ?termination.signal,
            reset_task = ?reset_task,
            "Job stopped"
        );
        Ok(StopOutcome {
            stopped: termination.signaled,
            signal: termination.signal,
            reset_task,
        })
    }

    // ── start ───────────────────────────────────────────────────────

    /// Run exactly one pending task whose upstream tasks are all done.
    pub async fn start(&self, job_id: &str, task: &str) -> Result<StartOutcome, LifecycleError> {
        let id = JobId::parse(job_id)?;
        if task.trim().is_empty() {
            return Err(LifecycleError::BadRequest("task name is required".into()));
        }
        let _guard = self.acquire(Operation::Start, &id)?;
        let (from, paths) = self.resolve(&id).await?;

        let definition = self.pinned_definition(&paths).await?;
        let (snapshot, persisted) = match self.store.read_optional(&paths.dir).await? {
            Some(snapshot) => (snapshot, true),
            None => (StatusSnapshot::new(id.as_str(), definition.task_names()), false),
        };

        if let Some(running) = snapshot.running_task() {
            return Err(LifecycleError::running(
                id.as_str(),
                format!("task {} is running", running),
            ));
        }
        if snapshot.state == TaskState::Running {
            return Err(LifecycleError::running(id.as_str(), "job is running"));
        }

        let Some(upstream) = definition.upstream_of(task) else {
            return Err(LifecycleError::TaskNotFound {
                job_id: id.to_string(),
                task: task.to_string(),
            });
        };
        let state = snapshot
            .tasks
            .get(task)
            .map(|t| t.state)
            .unwrap_or_default();
        if state != TaskState::Pending {
            return Err(LifecycleError::TaskNotPending {
                task: task.to_string(),
                state: state.to_string(),
            });
        }

        let missing: Vec<String> = upstream
            .into_iter()
            .filter(|name| snapshot.tasks.get(name).map(|t| t.state) != Some(TaskState::Done))
            .collect();
        if !missing.is_empty() {
            return Err(LifecycleError::DependenciesNotSatisfied {
                task: task.to_string(),
                missing,
            });
        }

        let paths = self.ensure_current(&id, from, paths).await?;
        if !persisted {
            self.store
                .initialize(&paths.dir, id.as_str(), definition.task_names())
                .await?;
        }
        let pid = self
            .spawner
            .spawn(&WorkerRequest::from_task(id.as_str(), task, true))
            .await?;

        info!(job_id = %id, task, "Task started");
        Ok(StartOutcome {
            job_id: id.to_string(),
            task: task.to_string(),
            pid,
        })
    }

    // ── status ──────────────────────────────────────────────────────

    pub async fn status(&self, job_id: &str) -> Result<StatusReport, LifecycleError> {
        let id = JobId::parse(job_id)?;
        let (location, paths) = self.resolve(&id).await?;
        let snapshot = self.store.read_optional(&paths.dir).await?;
        Ok(StatusReport { location, snapshot })
    }
}
