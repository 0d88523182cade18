//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

/// Upper bound on status read attempts, regardless of configuration.
pub const MAX_STATUS_READ_ATTEMPTS: u32 = 5;

/// Upper bound on the delay between status read attempts.
pub const MAX_STATUS_READ_DELAY: Duration = Duration::from_millis(50);

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Project root handed to workers.
    pub root_dir: PathBuf,
    /// Directory holding the pending/current/complete/rejected job trees.
    pub data_dir: PathBuf,
    /// Directory holding authoritative pipeline definitions.
    pub pipeline_dir: PathBuf,
    /// Maximum refine passes per task run.
    pub max_refinement_attempts: u32,
    /// Status read attempts for retryable failures (capped at 5).
    pub status_read_attempts: u32,
    /// Delay between status read attempts (capped at 50ms).
    pub status_read_delay: Duration,
    /// Grace window between the graceful and forceful stop signals.
    pub stop_grace: Duration,
    /// Executable spawned for worker processes.
    pub worker_program: PathBuf,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::with_root(PathBuf::from("."))
    }
}

impl OrchestratorConfig {
    /// Defaults laid out under `root`.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let root_dir = root.into();
        Self {
            data_dir: root_dir.join("pipeline-data"),
            pipeline_dir: root_dir.join("pipeline-config"),
            root_dir,
            max_refinement_attempts: 2,
            status_read_attempts: MAX_STATUS_READ_ATTEMPTS,
            status_read_delay: MAX_STATUS_READ_DELAY,
            stop_grace: Duration::from_millis(1500),
            worker_program: std::env::current_exe()
                .unwrap_or_else(|_| PathBuf::from("job-orchestrator")),
        }
    }

    /// Build configuration from `PO_*` environment variables.
    pub fn from_env() -> Self {
        let root = std::env::var("PO_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        let mut config = Self::with_root(root);

        if let Ok(dir) = std::env::var("PO_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("PO_PIPELINE_DIR") {
            config.pipeline_dir = PathBuf::from(dir);
        }
        if let Ok(bin) = std::env::var("PO_WORKER_BIN") {
            config.worker_program = PathBuf::from(bin);
        }

        config.max_refinement_attempts = std::env::var("PO_MAX_REFINEMENT_ATTEMPTS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(config.max_refinement_attempts);

        let attempts: u32 = std::env::var("PO_STATUS_READ_ATTEMPTS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(MAX_STATUS_READ_ATTEMPTS);
        let delay_ms: u64 = std::env::var("PO_STATUS_READ_DELAY_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(50);
        config = config.with_status_retry(attempts, Duration::from_millis(delay_ms));

        config.stop_grace = std::env::var("PO_STOP_GRACE_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(config.stop_grace);

        config
    }

    /// Set the status read retry policy, clamped to the supported bounds.
    pub fn with_status_retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.status_read_attempts = attempts.clamp(1, MAX_STATUS_READ_ATTEMPTS);
        self.status_read_delay = delay.min(MAX_STATUS_READ_DELAY);
        self
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    /// Authoritative definition file for a named pipeline.
    pub fn pipeline_definition_path(&self, pipeline: &str) -> PathBuf {
        self.pipeline_dir.join(pipeline).join("pipeline.json")
    }
}

/// Worker-only settings passed through the environment by the spawner.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerEnv {
    pub start_from_task: Option<String>,
    pub single_task: bool,
}

impl WorkerEnv {
    pub const START_FROM_TASK: &'static str = "PO_START_FROM_TASK";
    pub const RUN_SINGLE_TASK: &'static str = "PO_RUN_SINGLE_TASK";

    pub fn from_env() -> Self {
        let start_from_task = std::env::var(Self::START_FROM_TASK)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        let single_task = std::env::var(Self::RUN_SINGLE_TASK)
            .map(|s| matches!(s.trim(), "true" | "1"))
            .unwrap_or(false);
        Self {
            start_from_task,
            single_task,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = OrchestratorConfig::with_root("/srv/po");
        assert_eq!(config.data_dir, PathBuf::from("/srv/po/pipeline-data"));
        assert_eq!(config.pipeline_dir, PathBuf::from("/srv/po/pipeline-config"));
        assert_eq!(config.max_refinement_attempts, 2);
        assert_eq!(config.status_read_attempts, 5);
        assert_eq!(config.status_read_delay, Duration::from_millis(50));
        assert_eq!(config.stop_grace, Duration::from_millis(1500));
    }

    #[test]
    fn status_retry_is_clamped() {
        let config =
            OrchestratorConfig::default().with_status_retry(20, Duration::from_secs(3));
        assert_eq!(config.status_read_attempts, 5);
        assert_eq!(config.status_read_delay, Duration::from_millis(50));

        let config = OrchestratorConfig::default().with_status_retry(0, Duration::ZERO);
        assert_eq!(config.status_read_attempts, 1);
        assert_eq!(config.status_read_delay, Duration::ZERO);
    }

    #[test]
    fn pipeline_definition_path_layout() {
        let config = OrchestratorConfig::with_root("/r");
        assert_eq!(
            config.pipeline_definition_path("content"),
            PathBuf::from("/r/pipeline-config/content/pipeline.json")
        );
    }
}
