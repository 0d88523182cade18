//! Job orchestrator: durable multi-stage pipeline jobs.

pub mod cli;
pub mod config;
pub mod error;
pub mod jobs;
pub mod llm;
pub mod pipeline;
pub mod store;
pub mod worker;
