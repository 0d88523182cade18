//! Lifecycle residency: which of the four directories a job lives in.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::info;

use crate::jobs::id::JobId;

/// Lifecycle location of a job. A job resides in exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Location {
    Pending,
    Current,
    Complete,
    Rejected,
}

impl Location {
    /// Resolution order when looking a job up.
    pub const SEARCH_ORDER: [Location; 4] = [
        Location::Current,
        Location::Pending,
        Location::Complete,
        Location::Rejected,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Current => "current",
            Self::Complete => "complete",
            Self::Rejected => "rejected",
        }
    }

    pub fn dir(&self, data_dir: &Path) -> PathBuf {
        data_dir.join(self.as_str())
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Well-known files inside a job directory.
#[derive(Debug, Clone)]
pub struct JobPaths {
    pub dir: PathBuf,
}

impl JobPaths {
    pub const JOB_FILE: &'static str = "job.json";
    pub const PIPELINE_FILE: &'static str = "pipeline.json";
    pub const PID_FILE: &'static str = "runner.pid";
    pub const SEED_FILE: &'static str = "seed.json";
    pub const TASKS_DIR: &'static str = "tasks";

    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn at(data_dir: &Path, location: Location, id: &JobId) -> Self {
        Self::new(location.dir(data_dir).join(id.as_str()))
    }

    pub fn job_file(&self) -> PathBuf {
        self.dir.join(Self::JOB_FILE)
    }

    pub fn pipeline_file(&self) -> PathBuf {
        self.dir.join(Self::PIPELINE_FILE)
    }

    pub fn pid_file(&self) -> PathBuf {
        self.dir.join(Self::PID_FILE)
    }

    pub fn seed_file(&self) -> PathBuf {
        self.dir.join(Self::SEED_FILE)
    }

    pub fn tasks_dir(&self) -> PathBuf {
        self.dir.join(Self::TASKS_DIR)
    }

    pub fn task_dir(&self, task: &str) -> PathBuf {
        self.tasks_dir().join(task)
    }
}

/// Find the job's current location, checking `current` first.
pub async fn resolve(data_dir: &Path, id: &JobId) -> Option<(Location, JobPaths)> {
    for location in Location::SEARCH_ORDER {
        let paths = JobPaths::at(data_dir, location, id);
        if fs::metadata(&paths.dir)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
        {
            return Some((location, paths));
        }
    }
    None
}

/// Move a job between locations with a single rename, so it is never
/// visible in two places or in none.
pub async fn move_to(
    data_dir: &Path,
    id: &JobId,
    from: Location,
    to: Location,
) -> std::io::Result<JobPaths> {
    let source = JobPaths::at(data_dir, from, id);
    if from == to {
        return Ok(source);
    }
    let target = JobPaths::at(data_dir, to, id);
    fs::create_dir_all(to.dir(data_dir)).await?;
    if fs::metadata(&target.dir).await.is_ok() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            format!("job {} already present in {}", id, to),
        ));
    }
    fs::rename(&source.dir, &target.dir).await?;
    info!(job_id = %id, from = %from, to = %to, "Moved job");
    Ok(target)
}
