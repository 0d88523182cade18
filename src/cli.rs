//! Command-line interface.
//!
//! Operator subcommands (`start`, `restart`, `stop`, `rescan`, `status`)
//! print an [`OperationResult`](crate::jobs::OperationResult) as JSON.
//! `worker` is the entry point the spawner launches in the detached process.

use clap::{Parser, Subcommand};

/// Job orchestrator for multi-stage pipeline jobs.
#[derive(Debug, Parser)]
#[command(name = "job-orchestrator", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run one pending task whose upstream tasks are done.
    Start {
        job_id: String,
        task: String,
    },

    /// Reset a job and run it again.
    Restart {
        job_id: String,

        /// Reset this task and everything after it.
        #[arg(long)]
        from_task: Option<String>,

        /// With --from-task, reset and run only that task.
        #[arg(long, requires = "from_task", default_value_t = false)]
        single_task: bool,
    },

    /// Terminate a job's worker and reset its running task.
    Stop { job_id: String },

    /// Reconcile a job with its pipeline's current definition.
    Rescan { job_id: String },

    /// Show a job's location and status snapshot.
    Status { job_id: String },

    /// Execute a job (launched by the orchestrator, not by operators).
    #[command(hide = true)]
    Worker { job_id: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_restart_flags() {
        let cli = Cli::parse_from([
            "job-orchestrator",
            "restart",
            "job1",
            "--from-task",
            "draft",
            "--single-task",
        ]);
        match cli.command {
            Command::Restart {
                job_id,
                from_task,
                single_task,
            } => {
                assert_eq!(job_id, "job1");
                assert_eq!(from_task.as_deref(), Some("draft"));
                assert!(single_task);
            }
            _ => panic!("expected Restart command"),
        }
    }

    #[test]
    fn single_task_requires_from_task() {
        let result = Cli::try_parse_from(["job-orchestrator", "restart", "job1", "--single-task"]);
        assert!(result.is_err());
    }
}
