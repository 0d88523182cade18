//! Status snapshot: the durable projection of a job's tasks.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::llm::TokenUsage;

/// State of a task (and, at job level, of the job as a whole).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    #[default]
    Pending,
    Running,
    Done,
    Error,
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Done => "done",
            Self::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// Per-category file lists for a task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFiles {
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub logs: Vec<String>,
    #[serde(default)]
    pub tmp: Vec<String>,
}

impl TaskFiles {
    /// Record a file name once per category.
    pub fn add(list: &mut Vec<String>, name: &str) {
        if !list.iter().any(|f| f == name) {
            list.push(name.to_string());
        }
    }
}

/// Durable record for one task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    #[serde(default)]
    pub state: TaskState,
    #[serde(default)]
    pub current_stage: Option<String>,
    #[serde(default)]
    pub failed_stage: Option<String>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub refinement_attempts: u32,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub execution_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "TokenUsage::is_empty")]
    pub token_usage: TokenUsage,
    #[serde(default)]
    pub files: TaskFiles,
    /// Fields owned by other collaborators, carried through untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TaskStatus {
    pub fn pending() -> Self {
        Self::default()
    }

    /// Return the task to a clean pending state. Files and foreign fields stay.
    pub fn reset(&mut self, opts: ResetOptions) {
        self.state = TaskState::Pending;
        self.current_stage = None;
        self.failed_stage = None;
        self.attempts = 0;
        self.refinement_attempts = 0;
        self.started_at = None;
        self.ended_at = None;
        self.execution_time_ms = None;
        self.error = None;
        if opts.clear_token_usage {
            self.token_usage = TokenUsage::default();
        }
    }
}

/// Options shared by the reset primitives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResetOptions {
    /// Also zero accumulated token usage counters.
    pub clear_token_usage: bool,
}

/// Durable record of all of a job's tasks plus job-level pointers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub state: TaskState,
    #[serde(default)]
    pub progress: u8,
    #[serde(default)]
    pub current: Option<String>,
    #[serde(default)]
    pub current_stage: Option<String>,
    /// Task records in pipeline order.
    #[serde(default)]
    pub tasks: IndexMap<String, TaskStatus>,
    #[serde(default, skip_serializing_if = "TokenUsage::is_empty")]
    pub token_usage: TokenUsage,
    /// Fields owned by other collaborators, carried through untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl StatusSnapshot {
    /// Fresh snapshot with every task pending.
    pub fn new<I, S>(id: impl Into<String>, task_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let id = id.into();
        let now = Utc::now();
        Self {
            name: id.clone(),
            id,
            created_at: Some(now),
            last_updated: Some(now),
            tasks: task_names
                .into_iter()
                .map(|name| (name.into(), TaskStatus::pending()))
                .collect(),
            ..Default::default()
        }
    }

    /// First task currently marked running, if any.
    pub fn running_task(&self) -> Option<&str> {
        self.tasks
            .iter()
            .find(|(_, t)| t.state == TaskState::Running)
            .map(|(name, _)| name.as_str())
    }

    /// The task a stop should reset: the explicit pointer when it names a
    /// known task, otherwise the first running task.
    pub fn active_task(&self) -> Option<String> {
        self.current
            .as_ref()
            .filter(|name| self.tasks.contains_key(name.as_str()))
            .cloned()
            .or_else(|| self.running_task().map(str::to_string))
    }

    /// Whether the job or any task is marked running.
    pub fn is_running(&self) -> bool {
        self.state == TaskState::Running || self.running_task().is_some()
    }

    /// Recompute `progress` (percent of tasks done).
    pub fn recompute_progress(&mut self) {
        let total = self.tasks.len();
        let done = self
            .tasks
            .values()
            .filter(|t| t.state == TaskState::Done)
            .count();
        self.progress = if total == 0 {
            0
        } else {
            ((done * 100) / total) as u8
        };
    }

    /// Sum of per-task token usage.
    pub fn recompute_token_usage(&mut self) {
        let mut total = TokenUsage::default();
        for task in self.tasks.values() {
            total.add(task.token_usage);
        }
        self.token_usage = total;
    }

    // ── Reset primitives ────────────────────────────────────────────

    /// Every task back to pending; job pointers cleared.
    pub fn reset_clean_slate(&mut self, opts: ResetOptions) {
        for task in self.tasks.values_mut() {
            task.reset(opts);
        }
        self.after_reset(opts);
    }

    /// Tasks ordered before `task` are untouched; `task` and everything after
    /// it are reset. Returns false (and changes nothing) if `task` is unknown.
    pub fn reset_from_task(&mut self, task: &str, opts: ResetOptions) -> bool {
        let Some(start) = self.tasks.get_index_of(task) else {
            return false;
        };
        for (_, status) in self.tasks.iter_mut().skip(start) {
            status.reset(opts);
        }
        self.after_reset(opts);
        true
    }

    /// Only `task` is reset; siblings are untouched. Returns false if unknown.
    pub fn reset_single_task(&mut self, task: &str, opts: ResetOptions) -> bool {
        let Some(status) = self.tasks.get_mut(task) else {
            return false;
        };
        status.reset(opts);
        if self.current.as_deref() == Some(task) {
            self.current = None;
            self.current_stage = None;
        }
        if self.state == TaskState::Running && self.running_task().is_none() {
            self.state = TaskState::Pending;
        }
        self.recompute_progress();
        if opts.clear_token_usage {
            self.recompute_token_usage();
        }
        true
    }

    fn after_reset(&mut self, opts: ResetOptions) {
        self.current = None;
        self.current_stage = None;
        self.state = TaskState::Pending;
        self.recompute_progress();
        if opts.clear_token_usage {
            self.recompute_token_usage();
        }
    }
}
