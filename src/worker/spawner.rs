//! Fire-and-forget worker process submission.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::info;

use crate::config::{OrchestratorConfig, WorkerEnv};
use crate::error::LifecycleError;

/// What a worker should run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerRequest {
    pub job_id: String,
    /// First task to run; `None` runs the whole pipeline.
    pub start_from_task: Option<String>,
    /// Run only `start_from_task`.
    pub single_task: bool,
}

impl WorkerRequest {
    pub fn full(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            start_from_task: None,
            single_task: false,
        }
    }

    pub fn from_task(job_id: impl Into<String>, task: impl Into<String>, single_task: bool) -> Self {
        Self {
            job_id: job_id.into(),
            start_from_task: Some(task.into()),
            single_task,
        }
    }
}

/// Submits worker runs. Completion is observed through the status store,
/// never through a return value.
#[async_trait]
pub trait WorkerSpawner: Send + Sync {
    /// Launch a worker; returns its pid when the backend has one.
    async fn spawn(&self, request: &WorkerRequest) -> Result<Option<u32>, LifecycleError>;
}

/// Launches `<program> worker <jobId>` as a detached OS process.
pub struct ProcessSpawner {
    program: PathBuf,
    root_dir: PathBuf,
    data_dir: PathBuf,
    pipeline_dir: PathBuf,
}

impl ProcessSpawner {
    pub fn new(config: &OrchestratorConfig) -> Self {
        Self {
            program: config.worker_program.clone(),
            root_dir: config.root_dir.clone(),
            data_dir: config.data_dir.clone(),
            pipeline_dir: config.pipeline_dir.clone(),
        }
    }

    fn command(&self, request: &WorkerRequest) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("worker")
            .arg(&request.job_id)
            .env("PO_ROOT", &self.root_dir)
            .env("PO_DATA_DIR", &self.data_dir)
            .env("PO_PIPELINE_DIR", &self.pipeline_dir)
            .env_remove(WorkerEnv::START_FROM_TASK)
            .env_remove(WorkerEnv::RUN_SINGLE_TASK)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(false);

        if let Some(task) = &request.start_from_task {
            cmd.env(WorkerEnv::START_FROM_TASK, task);
            if request.single_task {
                cmd.env(WorkerEnv::RUN_SINGLE_TASK, "true");
            }
        }

        // Detach from the manager's process group.
        #[cfg(unix)]
        cmd.process_group(0);

        cmd
    }
}

#[async_trait]
impl WorkerSpawner for ProcessSpawner {
    async fn spawn(&self, request: &WorkerRequest) -> Result<Option<u32>, LifecycleError> {
        let child = self
            .command(request)
            .spawn()
            .map_err(|e| LifecycleError::SpawnFailed {
                job_id: request.job_id.clone(),
                reason: e.to_string(),
            })?;
        let pid = child.id();
        info!(
            job_id = %request.job_id,
            pid = ?pid,
            start_from = ?request.start_from_task,
            single_task = request.single_task,
            "Spawned worker"
        );
        // Dropped unawaited; the worker reports through its status file.
        drop(child);
        Ok(pid)
    }
}
