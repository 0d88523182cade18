//! Integration tests for the job lifecycle.
//!
//! Each test lays out a data directory in a temp dir, drives the lifecycle
//! manager through its public API, and runs workers in-process through a
//! recording spawner instead of launching real processes.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::time::timeout;

use job_orchestrator::config::{OrchestratorConfig, WorkerEnv};
use job_orchestrator::error::LifecycleError;
use job_orchestrator::jobs::{
    JobId, JobLifecycleManager, JobPaths, Location, OperationResult, PipelineDefinition,
};
use job_orchestrator::pipeline::{FnPipelineModule, PipelineRegistry, Stage, StageLogEntry, StageOutput};
use job_orchestrator::llm::TokenUsage;
use job_orchestrator::store::{StatusStore, TaskState, TaskStatus};
use job_orchestrator::worker::{JobRunner, TaskArtifact, WorkerRequest, WorkerSpawner};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

const JOB: &str = "job-1";

/// Records worker requests instead of launching processes.
#[derive(Default)]
struct RecordingSpawner {
    requests: Mutex<Vec<WorkerRequest>>,
}

#[async_trait]
impl WorkerSpawner for RecordingSpawner {
    async fn spawn(&self, request: &WorkerRequest) -> Result<Option<u32>, LifecycleError> {
        self.requests.lock().unwrap().push(request.clone());
        Ok(None)
    }
}

struct Harness {
    _root: TempDir,
    config: OrchestratorConfig,
    store: Arc<StatusStore>,
    spawner: Arc<RecordingSpawner>,
    manager: Arc<JobLifecycleManager>,
}

impl Harness {
    fn new() -> Self {
        let root = TempDir::new().unwrap();
        let config = OrchestratorConfig::with_root(root.path())
            .with_status_retry(2, Duration::from_millis(1))
            .with_stop_grace(Duration::from_millis(200));
        let store = Arc::new(StatusStore::from_config(&config));
        let spawner = Arc::new(RecordingSpawner::default());
        let manager = Arc::new(JobLifecycleManager::new(
            config.clone(),
            Arc::clone(&store),
            spawner.clone(),
        ));
        Self {
            _root: root,
            config,
            store,
            spawner,
            manager,
        }
    }

    fn job_id() -> JobId {
        JobId::parse(JOB).unwrap()
    }

    fn paths(&self, location: Location) -> JobPaths {
        JobPaths::at(&self.config.data_dir, location, &Self::job_id())
    }

    /// Create a job with the given task states and pinned definition.
    async fn create_job(&self, location: Location, tasks: &[(&str, TaskState)]) -> JobPaths {
        let paths = self.paths(location);
        std::fs::create_dir_all(&paths.dir).unwrap();
        std::fs::write(
            paths.job_file(),
            json!({"id": JOB, "name": "Test job", "pipeline": "content"}).to_string(),
        )
        .unwrap();
        PipelineDefinition::from_names(tasks.iter().map(|(n, _)| *n))
            .save_atomic(&paths.pipeline_file())
            .await
            .unwrap();
        self.store
            .write(&paths.dir, |s| {
                for (name, state) in tasks {
                    let mut status = TaskStatus::pending();
                    status.state = *state;
                    s.tasks.insert(name.to_string(), status);
                }
            })
            .await
            .unwrap();
        paths
    }

    fn write_pipeline_source(&self, body: Value) -> PathBuf {
        let path = self.config.pipeline_definition_path("content");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, body.to_string()).unwrap();
        path
    }

    fn residency(&self) -> Vec<Location> {
        Location::SEARCH_ORDER
            .into_iter()
            .filter(|l| self.paths(*l).dir.is_dir())
            .collect()
    }

    fn requests(&self) -> Vec<WorkerRequest> {
        self.spawner.requests.lock().unwrap().clone()
    }
}

fn read_json(path: &Path) -> Value {
    serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
}

// ── restart ─────────────────────────────────────────────────────────

#[tokio::test]
async fn concurrent_restarts_admit_exactly_one() {
    let h = Harness::new();
    h.create_job(Location::Complete, &[("a", TaskState::Done), ("b", TaskState::Done)])
        .await;

    let (first, second) = timeout(
        TEST_TIMEOUT,
        async {
            tokio::join!(
                h.manager.restart(JOB, None, false),
                h.manager.restart(JOB, None, false)
            )
        },
    )
    .await
    .unwrap();

    let results = [first, second];
    let ok = results.iter().filter(|r| r.is_ok()).count();
    let conflicts: Vec<_> = results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .map(|e| e.code())
        .collect();
    assert_eq!(ok, 1);
    assert_eq!(conflicts, vec!["job_running"]);
    assert_eq!(h.requests(), vec![WorkerRequest::full(JOB)]);
    assert_eq!(h.residency(), vec![Location::Current]);
}

#[tokio::test]
async fn restart_from_task_leaves_upstream_untouched() {
    use TaskState::*;
    let h = Harness::new();
    let paths = h
        .create_job(Location::Rejected, &[("a", Done), ("b", Done), ("c", Error)])
        .await;
    h.store
        .write(&paths.dir, |s| s.tasks.get_mut("a").unwrap().attempts = 3)
        .await
        .unwrap();

    h.manager.restart(JOB, Some("b"), false).await.unwrap();

    let snap = h.store.read(&h.paths(Location::Current).dir).await.unwrap();
    assert_eq!(snap.tasks["a"].state, Done);
    assert_eq!(snap.tasks["a"].attempts, 3);
    assert_eq!(snap.tasks["b"].state, Pending);
    assert_eq!(snap.tasks["c"].state, Pending);
    assert_eq!(h.requests(), vec![WorkerRequest::from_task(JOB, "b", false)]);
    assert_eq!(h.residency(), vec![Location::Current]);
}

#[tokio::test]
async fn clean_slate_restart_clears_token_usage() {
    use TaskState::*;
    let h = Harness::new();
    let paths = h.create_job(Location::Complete, &[("a", Done), ("b", Done)]).await;
    h.store
        .write(&paths.dir, |s| {
            for status in s.tasks.values_mut() {
                status.token_usage = TokenUsage {
                    input_tokens: 100,
                    output_tokens: 40,
                };
            }
            s.recompute_token_usage();
        })
        .await
        .unwrap();

    h.manager.restart(JOB, Some("b"), false).await.unwrap();
    let current = h.paths(Location::Current);
    let snap = h.store.read(&current.dir).await.unwrap();
    assert_eq!(snap.tasks["b"].token_usage.input_tokens, 100);
    assert_eq!(snap.token_usage.total(), 280);

    h.manager.restart(JOB, None, false).await.unwrap();
    let snap = h.store.read(&current.dir).await.unwrap();
    assert!(snap.tasks.values().all(|t| t.token_usage.is_empty()));
    assert!(snap.token_usage.is_empty());
    assert!(read_json(&StatusStore::status_path(&current.dir)).get("tokenUsage").is_none());
}

#[tokio::test]
async fn start_and_restart_together_spawn_one_worker() {
    use TaskState::*;
    let h = Harness::new();
    h.create_job(Location::Current, &[("a", Done), ("b", Pending)]).await;

    let (start, restart) = timeout(
        TEST_TIMEOUT,
        async { tokio::join!(h.manager.start(JOB, "b"), h.manager.restart(JOB, None, false)) },
    )
    .await
    .unwrap();

    let admitted = [start.is_ok(), restart.is_ok()].iter().filter(|ok| **ok).count();
    assert_eq!(admitted, 1);
    assert_eq!(h.requests().len(), 1);
}

// ── rescan ──────────────────────────────────────────────────────────

#[tokio::test]
async fn rescan_without_changes_is_byte_identical() {
    let h = Harness::new();
    let paths = h
        .create_job(Location::Current, &[("a", TaskState::Done), ("b", TaskState::Pending)])
        .await;
    h.write_pipeline_source(json!({"name": "content", "tasks": ["a", {"name": "b", "model": "m"}]}));

    let status_file = StatusStore::status_path(&paths.dir);
    let before = std::fs::read(&status_file).unwrap();

    let outcome = h.manager.rescan(JOB).await.unwrap();
    assert!(outcome.added.is_empty());
    assert!(outcome.removed.is_empty());
    assert_eq!(std::fs::read(&status_file).unwrap(), before);

    let result = OperationResult::from_result(&Ok::<_, LifecycleError>(outcome));
    assert_eq!(
        serde_json::to_value(result).unwrap(),
        json!({"ok": true, "added": [], "removed": []})
    );
}

#[tokio::test]
async fn rescan_keeps_removed_task_directories() {
    let h = Harness::new();
    let paths = h
        .create_job(Location::Current, &[("a", TaskState::Done), ("b", TaskState::Done)])
        .await;
    std::fs::create_dir_all(paths.task_dir("b")).unwrap();
    std::fs::write(paths.task_dir("b").join("output.json"), "{}").unwrap();
    h.store
        .write(&paths.dir, |s| s.current = Some("b".into()))
        .await
        .unwrap();
    h.write_pipeline_source(json!({"tasks": ["a", "c", "d"]}));

    let outcome = h.manager.rescan(JOB).await.unwrap();
    assert_eq!(outcome.added, vec!["c", "d"]);
    assert_eq!(outcome.removed, vec!["b"]);

    assert!(paths.task_dir("b").join("output.json").is_file());
    assert!(paths.task_dir("c").is_dir());
    assert!(paths.task_dir("d").is_dir());

    let snap = h.store.read(&paths.dir).await.unwrap();
    assert_eq!(snap.tasks.keys().collect::<Vec<_>>(), vec!["a", "c", "d"]);
    assert_eq!(snap.current, None);
    assert_eq!(read_json(&paths.pipeline_file())["tasks"], json!(["a", "c", "d"]));
}

// ── start ───────────────────────────────────────────────────────────

#[tokio::test]
async fn start_lists_exactly_the_unfinished_upstream_tasks() {
    use TaskState::*;
    let h = Harness::new();
    h.create_job(
        Location::Pending,
        &[("a", Done), ("b", Pending), ("c", Error), ("d", Done), ("e", Pending)],
    )
    .await;

    let result = OperationResult::from_result(&h.manager.start(JOB, "e").await);
    let value = serde_json::to_value(result).unwrap();
    assert_eq!(value["ok"], json!(false));
    assert_eq!(value["code"], json!("dependencies_not_satisfied"));
    assert_eq!(value["missing"], json!(["b", "c"]));
    assert!(h.requests().is_empty());
    assert_eq!(h.residency(), vec![Location::Pending]);
}

#[tokio::test]
async fn start_on_done_task_is_not_pending() {
    let h = Harness::new();
    h.create_job(Location::Current, &[("a", TaskState::Done)]).await;
    let err = h.manager.start(JOB, "a").await.unwrap_err();
    assert_eq!(err.code(), "task_not_pending");
}

// ── stop ────────────────────────────────────────────────────────────

#[tokio::test]
async fn stop_without_marker_normalizes_pointers() {
    let h = Harness::new();
    let paths = h
        .create_job(Location::Current, &[("a", TaskState::Done), ("b", TaskState::Pending)])
        .await;
    h.store
        .write(&paths.dir, |s| {
            s.current = Some("b".into());
            s.current_stage = Some("parsing".into());
        })
        .await
        .unwrap();

    let result = OperationResult::from_result(&h.manager.stop(JOB).await);
    let value = serde_json::to_value(result).unwrap();
    assert_eq!(value["ok"], json!(true));
    assert_eq!(value["stopped"], json!(false));
    assert_eq!(value["signal"], Value::Null);

    let raw = read_json(&StatusStore::status_path(&paths.dir));
    assert_eq!(raw["current"], Value::Null);
    assert_eq!(raw["currentStage"], Value::Null);
}

#[cfg(unix)]
#[tokio::test]
async fn stop_terminates_recorded_worker() {
    use TaskState::*;
    let h = Harness::new();
    let paths = h.create_job(Location::Current, &[("a", Done), ("b", Running)]).await;

    let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
    let pid = child.id();
    let reaper = std::thread::spawn(move || child.wait());
    std::fs::write(paths.pid_file(), pid.to_string()).unwrap();

    let outcome = timeout(TEST_TIMEOUT, h.manager.stop(JOB)).await.unwrap().unwrap();
    assert!(outcome.stopped);
    assert_eq!(outcome.signal, Some("SIGTERM"));
    assert_eq!(outcome.reset_task.as_deref(), Some("b"));
    assert!(!paths.pid_file().exists());
    reaper.join().unwrap().unwrap();

    let snap = h.store.read(&paths.dir).await.unwrap();
    assert_eq!(snap.tasks["b"].state, Pending);
    assert_eq!(snap.tasks["a"].state, Done);
}

// ── end to end ──────────────────────────────────────────────────────

#[tokio::test]
async fn restart_then_worker_runs_sparse_pipeline_to_completion() {
    let h = Harness::new();
    let pending = h.create_job(Location::Pending, &[("summarize", TaskState::Pending)]).await;
    std::fs::write(pending.seed_file(), json!({"a": 1}).to_string()).unwrap();

    h.manager.restart(JOB, None, false).await.unwrap();
    assert_eq!(h.residency(), vec![Location::Current]);

    let registry = PipelineRegistry::new();
    registry
        .register(
            "summarize",
            Arc::new(
                FnPipelineModule::new("summarize")
                    .with_stage(Stage::Ingestion, |ctx| {
                        let a = ctx.output()["a"].as_i64().unwrap_or(0);
                        Ok(StageOutput::new(json!({"ingested": a})))
                    })
                    .with_stage(Stage::Integration, |ctx| {
                        Ok(StageOutput::new(json!({"final": ctx.output()["ingested"]})))
                    }),
            ),
        )
        .await;

    let runner = JobRunner::new(h.config.clone(), Arc::clone(&h.store), Arc::new(registry));
    let summary = timeout(TEST_TIMEOUT, runner.run(&Harness::job_id(), &WorkerEnv::default()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(summary.location, Location::Complete);
    assert_eq!(h.residency(), vec![Location::Complete]);

    let done = h.paths(Location::Complete);
    let artifact: TaskArtifact =
        serde_json::from_value(read_json(&done.task_dir("summarize").join("output.json"))).unwrap();
    assert_eq!(artifact.data.len(), 2);
    assert_eq!(artifact.data["ingestion"], json!({"ingested": 1}));
    assert_eq!(artifact.data["integration"], json!({"final": 1}));

    let logs: Vec<StageLogEntry> =
        serde_json::from_value(read_json(&done.task_dir("summarize").join("execution-logs.json")))
            .unwrap();
    assert_eq!(logs.iter().filter(|l| l.is_skipped()).count(), 9);

    let status = h.manager.status(JOB).await.unwrap();
    assert_eq!(status.location, Location::Complete);
    let snap = status.snapshot.unwrap();
    assert_eq!(snap.state, TaskState::Done);
    assert_eq!(snap.tasks["summarize"].attempts, 1);
}
