//! Worker process controller.
//!
//! Core components:
//! - `spawner`: detached worker submission (`WorkerSpawner`, `ProcessSpawner`)
//! - `signals`: pid markers and graceful-then-forceful termination
//! - `runner`: the worker-side runtime that executes a job's tasks

pub mod runner;
pub mod signals;
pub mod spawner;

pub use runner::{JobRunner, RunSummary, TaskArtifact};
pub use signals::{TerminateOutcome, is_alive, terminate};
pub use spawner::{ProcessSpawner, WorkerRequest, WorkerSpawner};
