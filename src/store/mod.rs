//! Persistence layer: file-backed job status snapshots.

pub mod status;
pub mod status_store;

pub use status::{ResetOptions, StatusSnapshot, TaskFiles, TaskState, TaskStatus};
pub use status_store::{StatusStore, is_locked, write_atomic};
