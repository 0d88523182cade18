//! File-backed status store.
//!
//! Reads are retry-tolerant (a writer may be mid-write); writes are
//! read-modify-write through a temp file renamed over the original, so a
//! reader only ever sees a complete snapshot. Lock sentinels are advisory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{MAX_STATUS_READ_ATTEMPTS, MAX_STATUS_READ_DELAY, OrchestratorConfig};
use crate::error::StatusError;
use crate::store::status::{ResetOptions, StatusSnapshot};

/// Status file name inside a job directory.
pub const STATUS_FILE: &str = "tasks-status.json";

/// Size ceiling for a status file (5 MB).
pub const MAX_STATUS_SIZE: u64 = 5 * 1024 * 1024;

/// Reserved suffix for advisory lock sentinel files.
pub const LOCK_SUFFIX: &str = ".lock";

const BOM: char = '\u{feff}';

/// Durable per-job status store.
pub struct StatusStore {
    read_attempts: u32,
    read_delay: Duration,
    /// Serializes read-modify-write cycles per status file within this process.
    write_locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl Default for StatusStore {
    fn default() -> Self {
        Self::new(MAX_STATUS_READ_ATTEMPTS, MAX_STATUS_READ_DELAY)
    }
}

impl StatusStore {
    pub fn new(read_attempts: u32, read_delay: Duration) -> Self {
        Self {
            read_attempts: read_attempts.clamp(1, MAX_STATUS_READ_ATTEMPTS),
            read_delay: read_delay.min(MAX_STATUS_READ_DELAY),
            write_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self::new(config.status_read_attempts, config.status_read_delay)
    }

    pub fn status_path(job_dir: &Path) -> PathBuf {
        job_dir.join(STATUS_FILE)
    }

    // ── Read path ───────────────────────────────────────────────────

    /// Read a job's snapshot, retrying transient failures.
    pub async fn read(&self, job_dir: &Path) -> Result<StatusSnapshot, StatusError> {
        validate_job_dir(job_dir)?;

        if is_locked(job_dir).await {
            warn!(job_dir = %job_dir.display(), "Job directory locked, retrying read once");
            tokio::time::sleep(self.read_delay).await;
            if is_locked(job_dir).await {
                warn!(job_dir = %job_dir.display(), "Lock still present, reading anyway");
            }
        }

        let path = Self::status_path(job_dir);
        let mut attempt = 1;
        loop {
            match read_once(&path).await {
                Ok(snapshot) => return Ok(snapshot),
                Err(e) if e.is_retryable() && attempt < self.read_attempts => {
                    debug!(
                        path = %path.display(),
                        attempt,
                        code = e.code(),
                        "Status read failed, retrying"
                    );
                    attempt += 1;
                    tokio::time::sleep(self.read_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Read, returning `None` when no status file exists yet.
    pub async fn read_optional(
        &self,
        job_dir: &Path,
    ) -> Result<Option<StatusSnapshot>, StatusError> {
        match self.read(job_dir).await {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(StatusError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    // ── Write path ──────────────────────────────────────────────────

    /// Atomic read-modify-write. `mutate` sees the current snapshot (or a
    /// fresh one named after the directory if none exists yet).
    pub async fn write<F>(&self, job_dir: &Path, mutate: F) -> Result<StatusSnapshot, StatusError>
    where
        F: FnOnce(&mut StatusSnapshot),
    {
        validate_job_dir(job_dir)?;
        let lock = self.write_lock(job_dir);
        let _held = lock.lock().await;

        let mut snapshot = match self.read(job_dir).await {
            Ok(snapshot) => snapshot,
            Err(StatusError::NotFound { .. }) => StatusSnapshot::new(job_id_of(job_dir), Vec::<String>::new()),
            Err(e) => return Err(e),
        };

        mutate(&mut snapshot);
        snapshot.last_updated = Some(Utc::now());

        persist(&Self::status_path(job_dir), &snapshot).await?;
        Ok(snapshot)
    }

    /// Create the snapshot if none exists; an existing one is returned as is.
    pub async fn initialize<I, S>(
        &self,
        job_dir: &Path,
        job_id: &str,
        task_names: I,
    ) -> Result<StatusSnapshot, StatusError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        validate_job_dir(job_dir)?;
        let lock = self.write_lock(job_dir);
        let _held = lock.lock().await;

        if let Some(existing) = self.read_optional(job_dir).await? {
            return Ok(existing);
        }
        let snapshot = StatusSnapshot::new(job_id, task_names);
        persist(&Self::status_path(job_dir), &snapshot).await?;
        debug!(job_id, tasks = snapshot.tasks.len(), "Initialized status snapshot");
        Ok(snapshot)
    }

    // ── Reset primitives ────────────────────────────────────────────

    pub async fn reset_clean_slate(
        &self,
        job_dir: &Path,
        opts: ResetOptions,
    ) -> Result<StatusSnapshot, StatusError> {
        self.write(job_dir, |s| s.reset_clean_slate(opts)).await
    }

    pub async fn reset_from_task(
        &self,
        job_dir: &Path,
        task: &str,
        opts: ResetOptions,
    ) -> Result<StatusSnapshot, StatusError> {
        self.write(job_dir, |s| {
            if !s.reset_from_task(task, opts) {
                warn!(task, "Reset-from target not in snapshot, nothing reset");
            }
        })
        .await
    }

    pub async fn reset_single_task(
        &self,
        job_dir: &Path,
        task: &str,
        opts: ResetOptions,
    ) -> Result<StatusSnapshot, StatusError> {
        self.write(job_dir, |s| {
            if !s.reset_single_task(task, opts) {
                warn!(task, "Reset target not in snapshot, nothing reset");
            }
        })
        .await
    }

    fn write_lock(&self, job_dir: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .write_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(locks.entry(Self::status_path(job_dir)).or_default())
    }
}

fn validate_job_dir(job_dir: &Path) -> Result<(), StatusError> {
    let raw = job_dir.as_os_str();
    if raw.is_empty() {
        return Err(StatusError::InvalidPath("empty path".to_string()));
    }
    if raw.to_string_lossy().contains('\0') {
        return Err(StatusError::InvalidPath(format!(
            "path contains NUL: {}",
            job_dir.display()
        )));
    }
    Ok(())
}

fn job_id_of(job_dir: &Path) -> String {
    job_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

async fn read_once(path: &Path) -> Result<StatusSnapshot, StatusError> {
    let metadata = fs::metadata(path)
        .await
        .map_err(|e| StatusError::fs(path, e))?;
    if metadata.len() > MAX_STATUS_SIZE {
        return Err(StatusError::TooLarge {
            path: path.to_path_buf(),
            size: metadata.len(),
            limit: MAX_STATUS_SIZE,
        });
    }

    let raw = fs::read_to_string(path)
        .await
        .map_err(|e| StatusError::fs(path, e))?;
    let content = raw.strip_prefix(BOM).unwrap_or(&raw);

    serde_json::from_str(content).map_err(|e| StatusError::InvalidJson {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Write `value` as pretty JSON via temp file + rename.
pub(crate) async fn persist<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), StatusError> {
    let json = serde_json::to_string_pretty(value).map_err(|e| StatusError::InvalidJson {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    write_atomic(path, json.as_bytes())
        .await
        .map_err(|e| StatusError::fs(path, e))
}

/// Write bytes to a sibling temp file, then rename over `path`.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "file".to_string());
    let tmp = path.with_file_name(format!(".{}.{}.tmp", file_name, Uuid::new_v4()));

    fs::write(&tmp, bytes).await?;
    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(e);
    }
    Ok(())
}

/// A job directory is locked when it, or an immediate child directory,
/// holds a file ending in [`LOCK_SUFFIX`].
pub async fn is_locked(job_dir: &Path) -> bool {
    let Ok(mut entries) = fs::read_dir(job_dir).await else {
        return false;
    };
    let mut children = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let Ok(file_type) = entry.file_type().await else {
            continue;
        };
        if file_type.is_dir() {
            children.push(entry.path());
        } else if has_lock_suffix(&entry.path()) {
            return true;
        }
    }

    for child in children {
        let Ok(mut entries) = fs::read_dir(&child).await else {
            continue;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
            if is_file && has_lock_suffix(&entry.path()) {
                return true;
            }
        }
    }
    false
}

fn has_lock_suffix(path: &Path) -> bool {
    path.file_name()
        .map(|n| n.to_string_lossy().ends_with(LOCK_SUFFIX))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::status::TaskState;
    use tempfile::TempDir;

    fn store() -> StatusStore {
        StatusStore::new(3, Duration::from_millis(5))
    }

    #[tokio::test]
    async fn read_missing_is_not_found_without_retry() {
        let dir = TempDir::new().unwrap();
        let err = store().read(dir.path()).await.unwrap_err();
        assert_eq!(err.code(), "not_found");
        assert!(store().read_optional(dir.path()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn read_strips_byte_order_mark() {
        let dir = TempDir::new().unwrap();
        let body = format!("{}{}", BOM, r#"{"id":"j1","tasks":{"a":{"state":"done"}}}"#);
        std::fs::write(dir.path().join(STATUS_FILE), body).unwrap();

        let snap = store().read(dir.path()).await.unwrap();
        assert_eq!(snap.id, "j1");
        assert_eq!(snap.tasks["a"].state, TaskState::Done);
    }

    #[tokio::test]
    async fn read_invalid_json_reports_after_retries() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(STATUS_FILE), "{\"id\": ").unwrap();
        let err = store().read(dir.path()).await.unwrap_err();
        assert_eq!(err.code(), "invalid_json");
    }

    #[tokio::test]
    async fn read_recovers_when_writer_finishes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(STATUS_FILE);
        std::fs::write(&path, "{\"id\": \"j").unwrap();

        let fixer = {
            let path = path.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(8)).await;
                std::fs::write(&path, r#"{"id":"j1"}"#).unwrap();
            })
        };
        let snap = StatusStore::new(5, Duration::from_millis(50))
            .read(dir.path())
            .await
            .unwrap();
        fixer.await.unwrap();
        assert_eq!(snap.id, "j1");
    }

    #[tokio::test]
    async fn read_rejects_oversized_file() {
        let dir = TempDir::new().unwrap();
        let file = std::fs::File::create(dir.path().join(STATUS_FILE)).unwrap();
        file.set_len(MAX_STATUS_SIZE + 1).unwrap();
        let err = store().read(dir.path()).await.unwrap_err();
        assert!(matches!(err, StatusError::TooLarge { .. }));
    }

    #[tokio::test]
    async fn read_rejects_empty_path() {
        let err = store().read(Path::new("")).await.unwrap_err();
        assert!(matches!(err, StatusError::InvalidPath(_)));
    }

    #[tokio::test]
    async fn write_creates_then_mutates_atomically() {
        let root = TempDir::new().unwrap();
        let job_dir = root.path().join("job-42");
        std::fs::create_dir(&job_dir).unwrap();
        let store = store();

        let snap = store
            .write(&job_dir, |s| {
                s.tasks.insert("a".into(), Default::default());
            })
            .await
            .unwrap();
        assert_eq!(snap.id, "job-42");
        assert!(snap.last_updated.is_some());

        store
            .write(&job_dir, |s| {
                s.tasks.get_mut("a").unwrap().state = TaskState::Done;
            })
            .await
            .unwrap();
        let reread = store.read(&job_dir).await.unwrap();
        assert_eq!(reread.tasks["a"].state, TaskState::Done);

        let leftovers: Vec<_> = std::fs::read_dir(&job_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn write_refuses_to_clobber_corrupt_snapshot() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(STATUS_FILE), "not json").unwrap();
        let err = store().write(dir.path(), |_| {}).await.unwrap_err();
        assert_eq!(err.code(), "invalid_json");
        assert_eq!(
            std::fs::read_to_string(dir.path().join(STATUS_FILE)).unwrap(),
            "not json"
        );
    }

    #[tokio::test]
    async fn concurrent_writes_do_not_lose_updates() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(store());
        store
            .initialize(dir.path(), "j", ["a"])
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..10 {
            let store = Arc::clone(&store);
            let path = dir.path().to_path_buf();
            handles.push(tokio::spawn(async move {
                store
                    .write(&path, |s| s.tasks.get_mut("a").unwrap().attempts += 1)
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(store.read(dir.path()).await.unwrap().tasks["a"].attempts, 10);
    }

    #[tokio::test]
    async fn initialize_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = store();
        store.initialize(dir.path(), "j", ["a", "b"]).await.unwrap();
        store
            .write(dir.path(), |s| s.tasks.get_mut("a").unwrap().state = TaskState::Done)
            .await
            .unwrap();

        let again = store.initialize(dir.path(), "j", ["x"]).await.unwrap();
        assert_eq!(again.tasks.len(), 2);
        assert_eq!(again.tasks["a"].state, TaskState::Done);
    }

    #[tokio::test]
    async fn lock_detection_checks_dir_and_children_only() {
        let dir = TempDir::new().unwrap();
        assert!(!is_locked(dir.path()).await);

        let nested = dir.path().join("tasks").join("a").join("deep");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("x.lock"), "").unwrap();
        assert!(!is_locked(dir.path()).await);

        std::fs::write(dir.path().join("tasks").join("writer.lock"), "").unwrap();
        assert!(is_locked(dir.path()).await);
    }

    #[tokio::test]
    async fn locked_read_still_returns_snapshot() {
        let dir = TempDir::new().unwrap();
        let store = store();
        store.initialize(dir.path(), "j", ["a"]).await.unwrap();
        std::fs::write(dir.path().join("status.lock"), "").unwrap();
        let snap = store.read(dir.path()).await.unwrap();
        assert_eq!(snap.id, "j");
    }

    #[tokio::test]
    async fn reset_wrappers_persist() {
        let dir = TempDir::new().unwrap();
        let store = store();
        store.initialize(dir.path(), "j", ["a", "b", "c"]).await.unwrap();
        store
            .write(dir.path(), |s| {
                for t in s.tasks.values_mut() {
                    t.state = TaskState::Done;
                    t.attempts = 2;
                }
            })
            .await
            .unwrap();

        store
            .reset_single_task(dir.path(), "b", ResetOptions::default())
            .await
            .unwrap();
        let snap = store.read(dir.path()).await.unwrap();
        assert_eq!(snap.tasks["a"].state, TaskState::Done);
        assert_eq!(snap.tasks["b"].state, TaskState::Pending);
        assert_eq!(snap.tasks["c"].state, TaskState::Done);

        store
            .reset_from_task(dir.path(), "b", ResetOptions::default())
            .await
            .unwrap();
        let snap = store.read(dir.path()).await.unwrap();
        assert_eq!(snap.tasks["a"].attempts, 2);
        assert_eq!(snap.tasks["c"].state, TaskState::Pending);

        store
            .reset_clean_slate(dir.path(), ResetOptions::default())
            .await
            .unwrap();
        let snap = store.read(dir.path()).await.unwrap();
        assert!(snap.tasks.values().all(|t| t.state == TaskState::Pending && t.attempts == 0));
    }
}
