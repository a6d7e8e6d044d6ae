//! Running a single step inside the job's sandbox.

use crate::execution::Execution;
use crate::log_collector::LogCollector;
use crate::monitor::{Abort, AbortReason};
use crate::script;
use futures::StreamExt;
use runnel_core::dag::Dag;
use runnel_core::model::Step;
use runnel_core::ports::{CommandLogStream, Executor, Sandbox, StartCommand};
use runnel_core::{Result, Status};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const MAX_PROBE_FAILURES: u32 = 3;
const LOG_DRAIN_GRACE: Duration = Duration::from_secs(5);
const LOG_READ_BACKOFF: Duration = Duration::from_secs(1);

/// Whether a step may start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Gate {
    Run,
    SkipAborted,
    SkipFailedPredecessor,
}

impl Execution {
    pub(crate) fn pre_step(&self, dag: &Dag<Step>, step: &Step) -> Result<Gate> {
        if self.abort.is_aborted() {
            return Ok(Gate::SkipAborted);
        }
        let predecessors = dag.deep_pre(&step.name)?;
        let failed = predecessors
            .iter()
            .any(|pre| self.step_status(pre.id) == Some(Status::Failed));
        Ok(if failed {
            Gate::SkipFailedPredecessor
        } else {
            Gate::Run
        })
    }

    /// Run `step` or skip it. Errors inside the step fail the step, not the
    /// job; only a failed status update is returned.
    pub(crate) async fn execute_step(
        &mut self,
        sandbox: &Arc<dyn Sandbox>,
        dag: &Dag<Step>,
        step: &Step,
    ) -> Result<()> {
        match self.pre_step(dag, step)? {
            Gate::Run => {}
            gate => {
                info!(
                    job_execution_id = %self.execution.id,
                    step = %step.name,
                    ?gate,
                    "Skipping step"
                );
                if gate == Gate::SkipAborted {
                    self.aborted_steps += 1;
                }
                return self.update_step(step.id, Status::Skipped, None).await;
            }
        }

        info!(job_execution_id = %self.execution.id, step = %step.name, "Running step");
        let collector = LogCollector::new(
            Arc::clone(&self.server),
            self.execution.id,
            step.name.as_str(),
            self.config.log_flush_interval(),
        );

        let (status, exit_code) = match self.run_step(sandbox, step, &collector).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(
                    job_execution_id = %self.execution.id,
                    step = %step.name,
                    error = %e,
                    "Step errored"
                );
                if let Err(e) = collector.write(format!("$$ Internal Error: {e}").as_bytes()) {
                    debug!(step = %step.name, error = %e, "Could not record step error");
                }
                (Status::Failed, Some(1))
            }
        };

        if let Err(e) = collector.close().await {
            warn!(job_execution_id = %self.execution.id, step = %step.name, error = %e, "Failed to close step log");
        }
        info!(
            job_execution_id = %self.execution.id,
            step = %step.name,
            status = %status,
            exit_code = ?exit_code,
            "Step finished"
        );
        self.update_step(step.id, status, exit_code).await
    }

    async fn run_step(
        &mut self,
        sandbox: &Arc<dyn Sandbox>,
        step: &Step,
        log: &LogCollector,
    ) -> Result<(Status, Option<i32>)> {
        self.update_step(step.id, Status::Running, None).await?;

        let executor = sandbox.executor(step).await?;
        let runtime = executor.runtime_info().await?;
        let compiled = script::compile(&runtime.os, &step.commands)?;

        let mut env = executor.environment().await?;
        env.extend(sorted_env(&self.job.env));
        env.extend(sorted_env(&step.env));
        env.push(compiled.env());

        let probe = CancellationToken::new();
        let _probe_guard = probe.clone().drop_guard();
        tokio::spawn(probe_executor(
            Arc::clone(&executor),
            Arc::clone(&self.abort),
            self.config.executor_probe_interval(),
            probe,
        ));

        let command_id = executor
            .start_command(StartCommand {
                commands: compiled.launcher,
                dir: step
                    .working_directory
                    .clone()
                    .or_else(|| self.job.working_directory.clone()),
                env,
                user: step.user.clone(),
            })
            .await?;
        debug!(step = %step.name, command_id = %command_id, "Command started");

        let stream = executor.command_log(&command_id).await?;
        let drain = tokio::spawn(drain_log(
            stream,
            log.clone(),
            self.abort.token().clone(),
        ));

        let outcome = self.wait_command(executor.as_ref(), &command_id).await;

        if timeout(LOG_DRAIN_GRACE, drain).await.is_err() {
            warn!(step = %step.name, "Command log was not drained in time");
        }
        outcome
    }

    /// Wait for the command to exit, polling in `step_wait_timeout` slices.
    /// An abort fails the step without an exit code.
    async fn wait_command(
        &self,
        executor: &dyn Executor,
        command_id: &str,
    ) -> Result<(Status, Option<i32>)> {
        let token = self.abort.token().clone();
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    info!(command_id, reason = ?self.abort.reason(), "Job aborted, no longer waiting for command");
                    return Ok((Status::Failed, None));
                }
                status = executor.wait_command(command_id, self.config.step_wait_timeout()) => {
                    let status = status?;
                    if !status.exit {
                        debug!(command_id, "Command still running");
                        continue;
                    }
                    return Ok(if status.exit_code == 0 {
                        (Status::Succeeded, Some(0))
                    } else {
                        (Status::Failed, Some(status.exit_code))
                    });
                }
            }
        }
    }
}

fn sorted_env(env: &HashMap<String, String>) -> Vec<String> {
    let mut pairs: Vec<String> = env.iter().map(|(k, v)| format!("{k}={v}")).collect();
    pairs.sort();
    pairs
}

/// Copy command output into the step log until the stream ends.
async fn drain_log(mut stream: CommandLogStream, log: LogCollector, abort: CancellationToken) {
    loop {
        let chunk = tokio::select! {
            _ = abort.cancelled() => return,
            chunk = stream.next() => chunk,
        };
        match chunk {
            None => return,
            Some(Ok(bytes)) => {
                if let Err(e) = log.write(&bytes) {
                    debug!(name = %log.name(), error = %e, "Stopped draining command log");
                    return;
                }
            }
            Some(Err(e)) => {
                warn!(name = %log.name(), error = %e, "Failed to read command log");
                tokio::select! {
                    _ = abort.cancelled() => return,
                    _ = sleep(LOG_READ_BACKOFF) => {}
                }
            }
        }
    }
}

/// Ping the executor every `interval`. More than [`MAX_PROBE_FAILURES`]
/// failures in a row abort the job.
async fn probe_executor(
    executor: Arc<dyn Executor>,
    abort: Arc<Abort>,
    interval: Duration,
    stop: CancellationToken,
) {
    let mut failures = 0;
    loop {
        tokio::select! {
            _ = sleep(interval) => {}
            _ = stop.cancelled() => return,
            _ = abort.token().cancelled() => return,
        }
        match executor.ping().await {
            Ok(()) => failures = 0,
            Err(e) => {
                failures += 1;
                warn!(failures, error = %e, "Executor ping failed");
                if failures > MAX_PROBE_FAILURES {
                    error!("Executor is unreachable, aborting job");
                    abort.abort(AbortReason::ExecutorDown);
                    return;
                }
            }
        }
    }
}
