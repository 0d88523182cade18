//! Error types for the job orchestrator.

use std::path::PathBuf;

/// Failures reading or writing a job's status snapshot.
#[derive(Debug, thiserror::Error)]
pub enum StatusError {
    #[error("Status file not found: {path}")]
    NotFound { path: PathBuf },

    #[error("Status file {path} is not valid JSON: {reason}")]
    InvalidJson { path: PathBuf, reason: String },

    #[error("Filesystem error on {path}: {source}")]
    FsError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Status file {path} is {size} bytes, limit is {limit}")]
    TooLarge { path: PathBuf, size: u64, limit: u64 },

    #[error("Invalid job directory: {0}")]
    InvalidPath(String),
}

impl StatusError {
    /// Stable failure code reported to callers.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::InvalidJson { .. } => "invalid_json",
            Self::FsError { .. } | Self::TooLarge { .. } | Self::InvalidPath(_) => "fs_error",
        }
    }

    /// Whether a reader may retry after this failure. A writer may be mid-write
    /// when the JSON is torn, and transient IO errors clear on their own.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::InvalidJson { .. } | Self::FsError { .. })
    }

    pub(crate) fn fs(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::NotFound {
            Self::NotFound { path: path.into() }
        } else {
            Self::FsError {
                path: path.into(),
                source,
            }
        }
    }
}

/// A single stage invocation failed.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("Stage {stage} failed: {reason}")]
    Failed { stage: String, reason: String },

    #[error("Stage {stage} model call failed: {source}")]
    Model {
        stage: String,
        #[source]
        source: ModelError,
    },
}

impl StageError {
    pub fn failed(stage: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Failed {
            stage: stage.into(),
            reason: reason.into(),
        }
    }
}

/// Model invocation boundary errors.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("No model invoker configured")]
    Unavailable,

    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },
}

/// Operator-facing lifecycle failures. `code()` is the stable taxonomy string
/// a transport layer maps to its own status codes.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Job {job_id} not found")]
    JobNotFound { job_id: String },

    #[error("Job {job_id} is busy: {reason}")]
    JobRunning { job_id: String, reason: String },

    #[error("Dependencies not satisfied for task {task}: {}", missing.join(", "))]
    DependenciesNotSatisfied { task: String, missing: Vec<String> },

    #[error("Task {task} not found in job {job_id}")]
    TaskNotFound { job_id: String, task: String },

    #[error("Task {task} is {state}, expected pending")]
    TaskNotPending { task: String, state: String },

    #[error("Failed to spawn worker for job {job_id}: {reason}")]
    SpawnFailed { job_id: String, reason: String },

    #[error("Status read failed: {0}")]
    Status(#[from] StatusError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl LifecycleError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "bad_request",
            Self::JobNotFound { .. } => "job_not_found",
            Self::JobRunning { .. } => "job_running",
            Self::DependenciesNotSatisfied { .. } => "dependencies_not_satisfied",
            Self::TaskNotFound { .. } => "task_not_found",
            Self::TaskNotPending { .. } => "task_not_pending",
            Self::SpawnFailed { .. } => "spawn_failed",
            Self::Status(e) => e.code(),
            Self::Internal(_) => "internal_error",
        }
    }

    pub(crate) fn running(job_id: &str, reason: impl Into<String>) -> Self {
        Self::JobRunning {
            job_id: job_id.to_string(),
            reason: reason.into(),
        }
    }
}

/// Worker-side runtime failures.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Job {job_id} is not in the current directory")]
    JobNotCurrent { job_id: String },

    #[error("Pipeline definition error: {0}")]
    Definition(String),

    #[error("Task {task} not in pipeline definition")]
    UnknownTask { task: String },

    #[error("Status error: {0}")]
    Status(#[from] StatusError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
