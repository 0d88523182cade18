//! Stage pipeline: runs one task's canonical stage sequence.
//!
//! Every task walks the same fixed order:
//! ingestion → preProcessing → promptTemplating → inference → parsing →
//! validateStructure → validateQuality → critique → refine →
//! finalValidation → integration
//!
//! A pipeline module implements any subset; the rest are logged as skipped.
//! Each stage sees the nearest previously executed stage's output.

pub mod executor;
pub mod module;
pub mod types;

pub use executor::{PipelineExecutor, StageObserver, TaskScope};
pub use module::{FnPipelineModule, PassthroughModule, PipelineModule, PipelineRegistry, StageContext};
pub use types::{ExecutionContext, RunOutcome, Stage, StageLogEntry, StageOutcome, StageOutput};
