//! Pipeline definitions and job metadata files.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::fs;

use crate::jobs::id::is_path_token;
use crate::store::write_atomic;

/// A task entry as it appears in a definition: a bare name or an object
/// carrying at least `name`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TaskDescriptor {
    Name(String),
    Detailed {
        name: String,
        #[serde(flatten)]
        extra: Map<String, Value>,
    },
}

impl TaskDescriptor {
    pub fn name(&self) -> &str {
        match self {
            Self::Name(name) => name,
            Self::Detailed { name, .. } => name,
        }
    }
}

/// Ordered task list for a pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub tasks: Vec<TaskDescriptor>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PipelineDefinition {
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tasks: names
                .into_iter()
                .map(|n| TaskDescriptor::Name(n.into()))
                .collect(),
            ..Default::default()
        }
    }

    /// Task names in pipeline order, descriptors normalized away.
    pub fn task_names(&self) -> Vec<String> {
        self.tasks.iter().map(|t| t.name().to_string()).collect()
    }

    pub fn position(&self, task: &str) -> Option<usize> {
        self.tasks.iter().position(|t| t.name() == task)
    }

    /// Names ordered before `task`; `None` if `task` is not in the pipeline.
    pub fn upstream_of(&self, task: &str) -> Option<Vec<String>> {
        let index = self.position(task)?;
        Some(
            self.tasks[..index]
                .iter()
                .map(|t| t.name().to_string())
                .collect(),
        )
    }

    /// Reject task names that are not single path components, and duplicates.
    pub fn validate(&self) -> Result<(), String> {
        let mut seen = std::collections::HashSet::new();
        for name in self.tasks.iter().map(TaskDescriptor::name) {
            if !is_path_token(name) {
                return Err(format!(
                    "invalid task name {:?}: expected 1-128 characters of [A-Za-z0-9_-]",
                    name
                ));
            }
            if !seen.insert(name) {
                return Err(format!("duplicate task name {:?}", name));
            }
        }
        Ok(())
    }

    /// Read and validate a definition file.
    pub async fn load(path: &Path) -> std::io::Result<Self> {
        let raw = fs::read_to_string(path).await?;
        let def: Self = serde_json::from_str(&raw)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        def.validate()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        Ok(def)
    }

    /// Replace the file at `path` with this definition via temp + rename.
    pub async fn save_atomic(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        write_atomic(path, json.as_bytes()).await
    }
}

/// `job.json`: identity and the pipeline a job was created from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobMetadata {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl JobMetadata {
    pub async fn load(path: &Path) -> std::io::Result<Self> {
        let raw = fs::read_to_string(path).await?;
        serde_json::from_str(&raw)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}
