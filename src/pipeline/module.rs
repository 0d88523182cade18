//! Pipeline modules: the stage code a task runs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::{ModelError, StageError};
use crate::llm::{InvokeOptions, ModelInvoker, ModelResponse, TokenUsage};
use crate::pipeline::types::{ExecutionContext, Stage, StageOutput};

/// What a stage sees while it runs.
///
/// `output()` and `data()` read the same underlying [`ExecutionContext`]; stage
/// code written against either accessor observes identical values.
pub struct StageContext<'a> {
    pub job_id: &'a str,
    pub task: &'a str,
    pub stage: Stage,
    /// Refine passes completed so far in this run.
    pub refinement_attempt: u32,
    execution: &'a ExecutionContext,
    invoker: Option<&'a Arc<dyn ModelInvoker>>,
    usage: &'a Mutex<TokenUsage>,
}

impl<'a> StageContext<'a> {
    pub(crate) fn new(
        job_id: &'a str,
        task: &'a str,
        stage: Stage,
        refinement_attempt: u32,
        execution: &'a ExecutionContext,
        invoker: Option<&'a Arc<dyn ModelInvoker>>,
        usage: &'a Mutex<TokenUsage>,
    ) -> Self {
        Self {
            job_id,
            task,
            stage,
            refinement_attempt,
            execution,
            invoker,
            usage,
        }
    }

    /// Output of the nearest previously executed stage (or the seed).
    pub fn output(&self) -> &Value {
        self.execution.output()
    }

    /// Name of the stage that produced `output()`.
    pub fn previous_stage(&self) -> &str {
        &self.execution.previous_stage
    }

    /// Accumulated outputs keyed by stage name, including `"seed"`.
    pub fn data(&self) -> &indexmap::IndexMap<String, Value> {
        &self.execution.data
    }

    pub fn seed(&self) -> &Value {
        self.execution.seed()
    }

    pub fn flags(&self) -> &Map<String, Value> {
        &self.execution.flags
    }

    /// Call a model through the configured invoker, tallying token usage.
    pub async fn invoke_model(
        &self,
        provider: &str,
        prompt: &str,
        options: &InvokeOptions,
    ) -> Result<ModelResponse, StageError> {
        let invoker = self.invoker.ok_or(StageError::Model {
            stage: self.stage.to_string(),
            source: ModelError::Unavailable,
        })?;
        let response = invoker
            .invoke(provider, prompt, options)
            .await
            .map_err(|source| StageError::Model {
                stage: self.stage.to_string(),
                source,
            })?;
        if let Ok(mut usage) = self.usage.lock() {
            usage.add(response.usage);
        }
        Ok(response)
    }
}

/// A pipeline variant: implements any subset of the canonical stages.
#[async_trait]
pub trait PipelineModule: Send + Sync {
    fn name(&self) -> &str;

    /// Canonical stages this module implements.
    fn stages(&self) -> Vec<Stage>;

    async fn run_stage(
        &self,
        stage: Stage,
        ctx: &StageContext<'_>,
    ) -> Result<StageOutput, StageError>;
}

type StageFn = dyn Fn(&StageContext<'_>) -> Result<StageOutput, StageError> + Send + Sync;

/// A module assembled from synchronous closures, one per stage.
pub struct FnPipelineModule {
    name: String,
    handlers: HashMap<Stage, Arc<StageFn>>,
}

impl FnPipelineModule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handlers: HashMap::new(),
        }
    }

    pub fn with_stage<F>(mut self, stage: Stage, handler: F) -> Self
    where
        F: Fn(&StageContext<'_>) -> Result<StageOutput, StageError> + Send + Sync + 'static,
    {
        self.handlers.insert(stage, Arc::new(handler));
        self
    }
}

#[async_trait]
impl PipelineModule for FnPipelineModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn stages(&self) -> Vec<Stage> {
        Stage::CANONICAL
            .into_iter()
            .filter(|s| self.handlers.contains_key(s))
            .collect()
    }

    async fn run_stage(
        &self,
        stage: Stage,
        ctx: &StageContext<'_>,
    ) -> Result<StageOutput, StageError> {
        let handler = self
            .handlers
            .get(&stage)
            .ok_or_else(|| StageError::failed(stage.as_str(), "stage not implemented"))?;
        handler(ctx)
    }
}

/// Echo module used when no task-specific module is registered: ingestion
/// takes the seed, integration publishes whatever came before it.
pub struct PassthroughModule;

#[async_trait]
impl PipelineModule for PassthroughModule {
    fn name(&self) -> &str {
        "passthrough"
    }

    fn stages(&self) -> Vec<Stage> {
        vec![Stage::Ingestion, Stage::Integration]
    }

    async fn run_stage(
        &self,
        _stage: Stage,
        ctx: &StageContext<'_>,
    ) -> Result<StageOutput, StageError> {
        Ok(StageOutput::new(ctx.output().clone()))
    }
}

/// Registry of pipeline modules keyed by task name.
pub struct PipelineRegistry {
    modules: tokio::sync::RwLock<HashMap<String, Arc<dyn PipelineModule>>>,
    fallback: Option<Arc<dyn PipelineModule>>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self {
            modules: tokio::sync::RwLock::new(HashMap::new()),
            fallback: None,
        }
    }

    /// Module returned for task names with no registration.
    pub fn with_fallback(mut self, module: Arc<dyn PipelineModule>) -> Self {
        self.fallback = Some(module);
        self
    }

    /// Register a module for a task name, replacing any previous one.
    pub async fn register(&self, task: impl Into<String>, module: Arc<dyn PipelineModule>) {
        let task = task.into();
        tracing::debug!(task = %task, module = module.name(), "Registered pipeline module");
        self.modules.write().await.insert(task, module);
    }

    /// Resolve the module for a task, falling back when configured.
    pub async fn get(&self, task: &str) -> Option<Arc<dyn PipelineModule>> {
        self.modules
            .read()
            .await
            .get(task)
            .cloned()
            .or_else(|| self.fallback.clone())
    }
}

impl Default for PipelineRegistry {
    fn default() -> Self {
        Self::new()
    }
}
