use std::sync::Arc;

use clap::Parser;

use job_orchestrator::cli::{Cli, Command};
use job_orchestrator::config::{OrchestratorConfig, WorkerEnv};
use job_orchestrator::error::LifecycleError;
use job_orchestrator::jobs::{JobId, JobLifecycleManager, OperationResult};
use job_orchestrator::pipeline::{PassthroughModule, PipelineRegistry};
use job_orchestrator::store::StatusStore;
use job_orchestrator::worker::{JobRunner, ProcessSpawner};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries the JSON result.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = OrchestratorConfig::from_env();
    let store = Arc::new(StatusStore::from_config(&config));

    match cli.command {
        Command::Worker { job_id } => run_worker(config, store, &job_id).await,
        command => {
            let result = run_operation(config, store, command).await;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.ok {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}

async fn run_worker(
    config: OrchestratorConfig,
    store: Arc<StatusStore>,
    job_id: &str,
) -> anyhow::Result<()> {
    let job_id = JobId::parse(job_id)?;
    // Tasks without a registered module pass their input through.
    let registry = Arc::new(PipelineRegistry::new().with_fallback(Arc::new(PassthroughModule)));
    let summary = JobRunner::new(config, store, registry)
        .run(&job_id, &WorkerEnv::from_env())
        .await?;
    tracing::info!(
        job_id = %summary.job_id,
        executed = summary.executed.len(),
        location = %summary.location,
        "Worker exiting"
    );
    Ok(())
}

async fn run_operation(
    config: OrchestratorConfig,
    store: Arc<StatusStore>,
    command: Command,
) -> OperationResult {
    let spawner = Arc::new(ProcessSpawner::new(&config));
    let manager = JobLifecycleManager::new(config, store, spawner);

    match command {
        Command::Start { job_id, task } => {
            OperationResult::from_result(&manager.start(&job_id, &task).await)
        }
        Command::Restart {
            job_id,
            from_task,
            single_task,
        } => OperationResult::from_result(
            &manager
                .restart(&job_id, from_task.as_deref(), single_task)
                .await,
        ),
        Command::Stop { job_id } => OperationResult::from_result(&manager.stop(&job_id).await),
        Command::Rescan { job_id } => OperationResult::from_result(&manager.rescan(&job_id).await),
        Command::Status { job_id } => OperationResult::from_result(&manager.status(&job_id).await),
        Command::Worker { .. } => OperationResult::failure(&LifecycleError::BadRequest(
            "worker is not an operator command".into(),
        )),
    }
}
