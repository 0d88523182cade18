//! Shared types for the stage pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::llm::TokenUsage;

/// Key under which the task's seed payload lives in [`ExecutionContext::data`].
pub const SEED_KEY: &str = "seed";

/// Flags-bag key set by validation stages when the output is not acceptable.
pub const FLAG_VALIDATION_FAILED: &str = "validationFailed";

/// Flags-bag key set by critique when another refine pass is wanted.
pub const FLAG_NEEDS_REFINEMENT: &str = "needsRefinement";

// ── Stage ───────────────────────────────────────────────────────────

/// One named step of a task's execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Stage {
    Ingestion,
    PreProcessing,
    PromptTemplating,
    Inference,
    Parsing,
    ValidateStructure,
    ValidateQuality,
    Critique,
    Refine,
    FinalValidation,
    Integration,
}

impl Stage {
    /// Fixed execution order every pipeline module is walked in.
    pub const CANONICAL: [Stage; 11] = [
        Stage::Ingestion,
        Stage::PreProcessing,
        Stage::PromptTemplating,
        Stage::Inference,
        Stage::Parsing,
        Stage::ValidateStructure,
        Stage::ValidateQuality,
        Stage::Critique,
        Stage::Refine,
        Stage::FinalValidation,
        Stage::Integration,
    ];

    /// Stages re-run after each refine pass.
    pub const VALIDATION_CYCLE: [Stage; 3] = [
        Stage::ValidateStructure,
        Stage::ValidateQuality,
        Stage::Critique,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ingestion => "ingestion",
            Self::PreProcessing => "preProcessing",
            Self::PromptTemplating => "promptTemplating",
            Self::Inference => "inference",
            Self::Parsing => "parsing",
            Self::ValidateStructure => "validateStructure",
            Self::ValidateQuality => "validateQuality",
            Self::Critique => "critique",
            Self::Refine => "refine",
            Self::FinalValidation => "finalValidation",
            Self::Integration => "integration",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::CANONICAL
            .iter()
            .copied()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| format!("unknown stage: {s}"))
    }
}

// ── Execution context ───────────────────────────────────────────────

/// Ephemeral per-task-run state.
///
/// The seed and every stage output live in one `data` map. The "previous
/// output" is not stored separately: it is `data[previous_stage]`, so the
/// `output()` accessor and the nested `data` view can never disagree.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContext {
    /// Seed plus per-stage outputs, keyed by stage name, in execution order.
    pub data: IndexMap<String, Value>,
    /// Name of the stage whose output is current (`"seed"` before any stage).
    pub previous_stage: String,
    /// Flags shared across stages.
    pub flags: Map<String, Value>,
}

impl ExecutionContext {
    /// Start a run from the task's seed payload.
    pub fn new(seed: Value) -> Self {
        let mut data = IndexMap::new();
        data.insert(SEED_KEY.to_string(), seed);
        Self {
            data,
            previous_stage: SEED_KEY.to_string(),
            flags: Map::new(),
        }
    }

    /// The seed payload.
    pub fn seed(&self) -> &Value {
        self.data.get(SEED_KEY).unwrap_or(&Value::Null)
    }

    /// Output of the most recently executed stage, or the seed.
    pub fn output(&self) -> &Value {
        self.data.get(&self.previous_stage).unwrap_or(&Value::Null)
    }

    /// Output recorded for a specific stage.
    pub fn stage_output(&self, stage: Stage) -> Option<&Value> {
        self.data.get(stage.as_str())
    }

    /// Record a stage's output and make it the current output.
    pub fn record(&mut self, stage: Stage, output: Value) {
        let name = stage.as_str().to_string();
        // Re-insert so a refined stage moves to the end of the execution order.
        self.data.shift_remove(&name);
        self.data.insert(name.clone(), output);
        self.previous_stage = name;
    }

    /// Merge stage flags into the shared bag (later writes win).
    pub fn merge_flags(&mut self, flags: Map<String, Value>) {
        for (key, value) in flags {
            self.flags.insert(key, value);
        }
    }

    pub fn flag(&self, key: &str) -> bool {
        self.flags.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    /// Whether the flags bag says the current result is not yet acceptable.
    pub fn needs_refinement(&self) -> bool {
        self.flag(FLAG_VALIDATION_FAILED) || self.flag(FLAG_NEEDS_REFINEMENT)
    }

    /// Clear refinement signals before a validation cycle re-runs.
    pub fn clear_refinement_flags(&mut self) {
        self.flags.remove(FLAG_VALIDATION_FAILED);
        self.flags.remove(FLAG_NEEDS_REFINEMENT);
    }

    /// Stage outputs without the seed entry.
    pub fn stage_outputs(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.data.iter().filter(|(k, _)| k.as_str() != SEED_KEY)
    }
}

/// What a stage hands back to the executor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageOutput {
    pub output: Value,
    #[serde(default)]
    pub flags: Map<String, Value>,
}

impl StageOutput {
    pub fn new(output: Value) -> Self {
        Self {
            output,
            flags: Map::new(),
        }
    }

    pub fn with_flag(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.flags.insert(key.into(), value.into());
        self
    }
}

// ── Stage log ───────────────────────────────────────────────────────

/// How a stage slot ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    /// Stage ran and produced output.
    Ok,
    /// The module does not implement the stage.
    Skipped,
    /// Refine is implemented but the flags bag never asked for it.
    NotNeeded,
    /// Refinement was still requested when the pass budget ran out.
    MaxAttemptsReached,
    /// Stage invocation failed; the run halted here.
    Failed,
}

/// One entry of a run's ordered stage log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageLogEntry {
    pub stage: Stage,
    pub outcome: StageOutcome,
    pub skipped: bool,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refinement_attempt: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StageLogEntry {
    pub fn skipped(stage: Stage) -> Self {
        Self::marker(stage, StageOutcome::Skipped)
    }

    pub fn marker(stage: Stage, outcome: StageOutcome) -> Self {
        Self {
            stage,
            outcome,
            skipped: outcome == StageOutcome::Skipped,
            timestamp: Utc::now(),
            duration_ms: None,
            refinement_attempt: None,
            error: None,
        }
    }

    pub fn is_skipped(&self) -> bool {
        self.skipped
    }
}

/// Result of running one task's pipeline.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOutcome {
    pub ok: bool,
    pub context: ExecutionContext,
    pub logs: Vec<StageLogEntry>,
    pub refinement_attempts: u32,
    pub token_usage: TokenUsage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<Stage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunOutcome {
    pub fn skipped_stages(&self) -> Vec<Stage> {
        self.logs
            .iter()
            .filter(|entry| entry.is_skipped())
            .map(|entry| entry.stage)
            .collect()
    }
}
