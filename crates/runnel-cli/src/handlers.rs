//! Command handlers.

use console::style;
use futures::StreamExt;
use runnel_agent::{Agent, AgentConfig, SYSTEM_LOG};
use runnel_core::Status;
use runnel_core::events::Event;
use runnel_core::ids::JobId;
use runnel_core::model::{Job, JobExecution, PipelineDefinition};
use runnel_core::ports::{EventBus, EventStream, SandboxProvider};
use runnel_runner::ShellProvider;
use runnel_scheduler::{SchedulerConfig, Server};
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

fn load_definition(path: &str) -> CliResult<PipelineDefinition> {
    let content = std::fs::read_to_string(path)?;
    let definition: PipelineDefinition = serde_yaml::from_str(&content)?;
    runnel_scheduler::pipeline::validate(&definition)?;
    Ok(definition)
}

/// Validate a pipeline definition.
pub fn validate(path: &str) -> CliResult<()> {
    let definition = load_definition(path)?;

    println!("{} {} is valid", style("✓").green(), path);
    println!("  Jobs: {}", definition.jobs.len());
    for job in &definition.jobs {
        println!(
            "    - {} on {} ({} steps)",
            job.name,
            job.runs_on.label,
            job.steps.len()
        );
    }
    Ok(())
}

/// Run a pipeline to completion against an in-process server.
pub async fn run(path: &str, workspace: Option<PathBuf>, config: Option<PathBuf>) -> CliResult<()> {
    let definition = load_definition(path)?;
    let base_config = match config {
        Some(config) => AgentConfig::from_file(&config)?,
        None => AgentConfig::default(),
    };

    let server = Arc::new(Server::in_memory(SchedulerConfig::default()));
    // Subscribe first so the initial dispatch is reported too.
    let events = server.events().subscribe("job_execution.>").await?;
    let created = server.create_pipeline(definition).await?;
    println!(
        "{} Running {} ({} jobs)",
        style("▶").cyan(),
        style(path).bold(),
        created.jobs.len()
    );
    let names = created.jobs.iter().map(|j| (j.id, j.name.clone())).collect();
    let progress = tokio::spawn(print_dispatches(events, names));

    let provider: Arc<dyn SandboxProvider> = Arc::new(match workspace {
        Some(dir) => ShellProvider::new(dir),
        None => ShellProvider::default(),
    });
    let labels: BTreeSet<String> = created
        .jobs
        .iter()
        .map(|j| j.runs_on.label.clone())
        .collect();
    let agents: Vec<Agent> = labels
        .into_iter()
        .map(|label| {
            Agent::new(
                AgentConfig {
                    label,
                    ..base_config.clone()
                },
                server.clone(),
                Arc::clone(&provider),
            )
        })
        .collect();

    // Dependents are queued or skipped as part of each status update, so
    // nothing left to claim means the pipeline is done.
    loop {
        let mut progressed = false;
        for agent in &agents {
            if let Some(execution) = agent.run_once().await? {
                progressed = true;
                if let Some(job) = created.jobs.iter().find(|j| j.id == execution.job_id) {
                    print_job(&server, job, &execution).await?;
                }
            }
        }
        if !progressed {
            break;
        }
    }
    progress.abort();

    let mut failed = 0;
    println!();
    for job in &created.jobs {
        let status = server
            .list_job_executions(job.id)
            .await?
            .last()
            .map(|e| e.status)
            .unwrap_or(Status::Created);
        if status != Status::Succeeded {
            failed += 1;
        }
        println!("  {} {}", status_mark(status), job.name);
    }

    if failed > 0 {
        return Err(format!("{failed} job(s) did not succeed").into());
    }
    println!("{} Pipeline succeeded", style("✓").green());
    Ok(())
}

async fn print_job(server: &Server, job: &Job, execution: &JobExecution) -> CliResult<()> {
    let reason = execution
        .reason
        .as_ref()
        .map(|r| format!(" ({}: {})", r.reason, r.message))
        .unwrap_or_default();
    println!(
        "{} job {} {}{}",
        status_mark(execution.status),
        style(&job.name).bold(),
        execution.status,
        style(reason).dim()
    );

    for line in server.get_log_lines(execution.id, SYSTEM_LOG, 0, usize::MAX).await? {
        println!("    {}", style(line.output).dim());
    }
    for step_execution in server.list_step_executions(execution.id).await? {
        let Some(step) = job.steps.iter().find(|s| s.id == step_execution.step_id) else {
            continue;
        };
        let exit = step_execution
            .exit_code
            .map(|code| format!(" (exit {code})"))
            .unwrap_or_default();
        println!(
            "  {} step {} {}{}",
            status_mark(step_execution.status),
            step.name,
            step_execution.status,
            exit
        );
        for line in server
            .get_log_lines(execution.id, &step.name, 0, usize::MAX)
            .await?
        {
            println!("    {}", line.output);
        }
    }
    Ok(())
}

/// Report jobs as they are queued or skipped. Finished jobs are printed by
/// [`print_job`].
async fn print_dispatches(mut events: EventStream, names: HashMap<JobId, String>) {
    while let Some(event) = events.next().await {
        let Ok(Event::JobExecutionUpdated(update)) = event else {
            continue;
        };
        if !matches!(update.status, Status::Queued | Status::Skipped) {
            continue;
        }
        if let Some(name) = names.get(&update.job_id) {
            println!(
                "{} job {} {}",
                status_mark(update.status),
                style(name).bold(),
                update.status
            );
        }
    }
}

fn status_mark(status: Status) -> console::StyledObject<&'static str> {
    match status {
        Status::Queued => style("·").cyan(),
        Status::Succeeded => style("✓").green(),
        Status::Failed => style("✗").red(),
        Status::Skipped => style("-").dim(),
        _ => style("?").yellow(),
    }
}
