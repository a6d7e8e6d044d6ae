//! Runs one claimed job from Preparing to its final status.

use crate::config::AgentConfig;
use crate::log_collector::LogCollector;
use crate::monitor::{Abort, HeartbeatSettings, Monitors};
use runnel_core::dag::Dag;
use runnel_core::ids::StepId;
use runnel_core::model::*;
use runnel_core::ports::{Sandbox, SandboxProvider, ServerApi};
use runnel_core::{Error, Result, Status};
use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

/// Name of the job-level log stream.
pub const SYSTEM_LOG: &str = "_";

const UPDATE_RETRIES: u32 = 3;
const INITIAL_BACKOFF: Duration = Duration::from_millis(500);

/// Execution state of one claimed job.
pub struct Execution {
    pub(crate) server: Arc<dyn ServerApi>,
    provider: Arc<dyn SandboxProvider>,
    pub(crate) config: AgentConfig,
    pub(crate) job: Job,
    pub(crate) execution: JobExecution,
    pub(crate) step_executions: HashMap<StepId, StepExecution>,
    pub(crate) abort: Arc<Abort>,
    /// Steps skipped because the job was aborted before they started.
    pub(crate) aborted_steps: usize,
}

impl Execution {
    pub fn new(
        server: Arc<dyn ServerApi>,
        provider: Arc<dyn SandboxProvider>,
        config: AgentConfig,
        claimed: ClaimedJob,
    ) -> Self {
        let step_executions = claimed
            .step_executions
            .into_iter()
            .map(|s| (s.step_id, s))
            .collect();
        Self {
            server,
            provider,
            config,
            job: claimed.job,
            execution: claimed.execution,
            step_executions,
            abort: Arc::new(Abort::new()),
            aborted_steps: 0,
        }
    }

    /// Shared abort signal of this job.
    pub fn abort_handle(&self) -> Arc<Abort> {
        Arc::clone(&self.abort)
    }

    /// Run the job to completion and return its final execution row.
    pub async fn execute(mut self) -> Result<JobExecution> {
        info!(
            job_execution_id = %self.execution.id,
            job = %self.job.name,
            steps = self.job.steps.len(),
            "Starting job execution"
        );
        let system = LogCollector::new(
            Arc::clone(&self.server),
            self.execution.id,
            SYSTEM_LOG,
            self.config.log_flush_interval(),
        );
        let monitors = Monitors::start(
            Arc::clone(&self.server),
            self.execution.id,
            Arc::clone(&self.abort),
            Duration::from_secs(self.job.timeout_secs),
            HeartbeatSettings {
                interval: self.config.heartbeat_interval(),
                max_failure: self.config.max_heartbeat_failure(),
            },
        );

        let result = self.run(&system).await;

        monitors.stop().await;
        if let Err(e) = system.close().await {
            warn!(job_execution_id = %self.execution.id, error = %e, "Failed to close system log");
        }
        match &result {
            Ok(execution) => info!(
                job_execution_id = %execution.id,
                status = %execution.status,
                reason = ?execution.reason.as_ref().map(|r| r.reason),
                "Job execution finished"
            ),
            Err(e) => error!(job_execution_id = %self.execution.id, error = %e, "Job execution failed"),
        }
        result
    }

    async fn run(&mut self, system: &LogCollector) -> Result<JobExecution> {
        self.update_job(Status::Preparing, None).await?;
        note(system, format_args!("Preparing job {}", self.job.name));

        let dag = match self.job.step_dag() {
            Ok(dag) => dag,
            Err(e) => {
                return self
                    .fail_early(system, FailedReason::InvalidSteps, e.to_string())
                    .await;
            }
        };

        let sandbox = match self.start_sandbox().await {
            Ok(sandbox) => sandbox,
            Err(e) => {
                return self
                    .fail_early(system, FailedReason::SandboxError, e.to_string())
                    .await;
            }
        };

        if let Err(e) = self.update_job(Status::Running, None).await {
            self.teardown(&sandbox).await;
            return match e {
                Error::InvalidTransition {
                    from: Status::Canceling,
                    ..
                } => {
                    self.fail_early(system, FailedReason::Cancelled, "cancelled while preparing")
                        .await
                }
                e => Err(e),
            };
        }
        note(system, "Sandbox ready, running steps");

        self.execute_steps(&sandbox, &dag, system).await;
        self.teardown(&sandbox).await;

        let (status, reason) = self.final_status();
        note(system, format_args!("Job finished: {status}"));
        self.update_job(status, reason).await
    }

    /// Steps run one at a time in topological order, even where the graph
    /// would allow parallel branches.
    async fn execute_steps(&mut self, sandbox: &Arc<dyn Sandbox>, dag: &Dag<Step>, system: &LogCollector) {
        for step in dag.topological_order() {
            if let Err(e) = self.execute_step(sandbox, dag, step).await {
                error!(
                    job_execution_id = %self.execution.id,
                    step = %step.name,
                    error = %e,
                    "Failed to execute step"
                );
                note(system, format_args!("Step {} errored: {e}", step.name));
            }
        }
    }

    async fn start_sandbox(&self) -> Result<Arc<dyn Sandbox>> {
        let sandbox = self.provider.create(&self.job).await?;
        let limit = self.config.sandbox_start_timeout();
        match timeout(limit, sandbox.start()).await {
            Ok(Ok(())) => Ok(sandbox),
            Ok(Err(e)) => {
                self.teardown(&sandbox).await;
                Err(e)
            }
            Err(_) => {
                self.teardown(&sandbox).await;
                Err(Error::Sandbox(format!(
                    "sandbox did not start within {}s",
                    limit.as_secs()
                )))
            }
        }
    }

    async fn teardown(&self, sandbox: &Arc<dyn Sandbox>) {
        match timeout(self.config.sandbox_stop_timeout(), sandbox.stop()).await {
            Ok(Ok(())) => debug!(job_execution_id = %self.execution.id, "Sandbox stopped"),
            Ok(Err(e)) => error!(
                job_execution_id = %self.execution.id,
                error = %e,
                "Failed to stop sandbox, the environment might leak"
            ),
            Err(_) => error!(
                job_execution_id = %self.execution.id,
                "Sandbox did not stop in time, the environment might leak"
            ),
        }
    }

    /// Fail the job before any step ran. Steps that never started are skipped.
    async fn fail_early(
        &mut self,
        system: &LogCollector,
        reason: FailedReason,
        message: impl Into<String>,
    ) -> Result<JobExecution> {
        let message = message.into();
        warn!(job_execution_id = %self.execution.id, reason = %reason, message = %message, "Job failed before running steps");
        note(system, format_args!("Job failed: {message}"));

        let pending: Vec<StepId> = self
            .step_executions
            .iter()
            .filter(|(_, s)| !s.status.is_completed())
            .map(|(id, _)| *id)
            .collect();
        for step_id in pending {
            if let Err(e) = self.update_step(step_id, Status::Skipped, None).await {
                warn!(job_execution_id = %self.execution.id, error = %e, "Failed to skip step");
            }
        }
        self.update_job(Status::Failed, Some(Reason::new(reason, message)))
            .await
    }

    /// Failed when any step failed or never finished, or when an abort
    /// skipped steps. The abort reason takes precedence over StepFailed.
    fn final_status(&self) -> (Status, Option<Reason>) {
        let step_failed = self
            .step_executions
            .values()
            .any(|s| s.status == Status::Failed || !s.status.is_completed());
        let aborted = self.abort.reason();
        if !step_failed && (aborted.is_none() || self.aborted_steps == 0) {
            return (Status::Succeeded, None);
        }
        let reason = match aborted {
            Some(reason) => Reason::new(reason.failed_reason(), "job aborted"),
            None => Reason::from(FailedReason::StepFailed),
        };
        (Status::Failed, Some(reason))
    }

    pub(crate) async fn update_job(
        &mut self,
        status: Status,
        reason: Option<Reason>,
    ) -> Result<JobExecution> {
        let server = Arc::clone(&self.server);
        let update = UpdateJobExecution {
            id: self.execution.id,
            status,
            reason,
        };
        let updated = with_retry("update job execution", || {
            server.update_job_execution(update.clone())
        })
        .await?;
        debug!(job_execution_id = %updated.id, status = %updated.status, "Job status updated");
        self.execution = updated.clone();
        Ok(updated)
    }

    /// Record a step status locally, then persist it.
    pub(crate) async fn update_step(
        &mut self,
        step_id: StepId,
        status: Status,
        exit_code: Option<i32>,
    ) -> Result<()> {
        let step = self
            .step_executions
            .get_mut(&step_id)
            .ok_or_else(|| Error::not_found("step execution", step_id))?;
        step.status = status;
        if exit_code.is_some() {
            step.exit_code = exit_code;
        }
        let update = UpdateStepExecution {
            id: step.id,
            status,
            exit_code,
        };
        let server = Arc::clone(&self.server);
        with_retry("update step execution", || {
            server.update_step_execution(update.clone())
        })
        .await?;
        Ok(())
    }

    pub(crate) fn step_status(&self, step_id: StepId) -> Option<Status> {
        self.step_executions.get(&step_id).map(|s| s.status)
    }
}

/// Write one line to a log stream. Losing it is not worth failing the job.
pub(crate) fn note(log: &LogCollector, message: impl Display) {
    if let Err(e) = log.write(format!("{message}\n").as_bytes()) {
        debug!(name = %log.name(), error = %e, "Dropped log note");
    }
}

/// Retry transient failures with exponential backoff.
pub(crate) async fn with_retry<T, F, Fut>(what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = INITIAL_BACKOFF;
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < UPDATE_RETRIES => {
                attempt += 1;
                warn!(what, attempt, error = %e, "Retrying after transient error");
                sleep(delay).await;
                delay *= 2;
            }
            Err(e) => return Err(e),
        }
    }
}
