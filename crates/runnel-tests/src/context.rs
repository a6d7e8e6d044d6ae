//! Test context wiring a server, agents and the shell sandbox.

use runnel_agent::{Agent, AgentConfig};
use runnel_core::ids::{JobExecutionId, JobId};
use runnel_core::model::{JobExecution, StepExecution};
use runnel_runner::ShellProvider;
use runnel_scheduler::{SchedulerConfig, Server};
use std::sync::Arc;
use tempfile::TempDir;

/// In-process server plus a scratch workspace for shell steps.
///
/// Drop this to remove the workspace.
pub struct TestContext {
    pub server: Arc<Server>,
    pub provider: Arc<ShellProvider>,
    pub workspace: TempDir,
}

impl TestContext {
    pub fn new() -> anyhow::Result<Self> {
        Self::with_config(SchedulerConfig::default())
    }

    pub fn with_config(config: SchedulerConfig) -> anyhow::Result<Self> {
        crate::init_test_logging();

        let workspace = tempfile::tempdir()?;
        Ok(Self {
            server: Arc::new(Server::in_memory(config)),
            provider: Arc::new(ShellProvider::new(workspace.path())),
            workspace,
        })
    }

    /// Agent settings scaled down so tests finish quickly.
    pub fn agent_config(label: &str) -> AgentConfig {
        AgentConfig {
            label: label.to_string(),
            poll_interval_ms: 50,
            heartbeat_interval_ms: 100,
            log_flush_interval_ms: 20,
            executor_probe_interval_ms: 100,
            ..Default::default()
        }
    }

    pub fn agent(&self, label: &str) -> Agent {
        self.agent_with(Self::agent_config(label))
    }

    pub fn agent_with(&self, config: AgentConfig) -> Agent {
        Agent::new(config, self.server.clone(), self.provider.clone())
    }

    /// Claim and execute jobs for `label` until none are left. Returns the
    /// finished executions in execution order.
    pub async fn run_until_idle(&self, label: &str) -> anyhow::Result<Vec<JobExecution>> {
        let agent = self.agent(label);
        let mut finished = Vec::new();
        while let Some(execution) = agent.run_once().await? {
            finished.push(execution);
        }
        Ok(finished)
    }

    /// Most recent execution of a job.
    pub async fn latest_execution(&self, job_id: JobId) -> anyhow::Result<JobExecution> {
        self.server
            .list_job_executions(job_id)
            .await?
            .pop()
            .ok_or_else(|| anyhow::anyhow!("job {job_id} has no execution"))
    }

    pub async fn step_executions(&self, id: JobExecutionId) -> anyhow::Result<Vec<StepExecution>> {
        Ok(self.server.list_step_executions(id).await?)
    }

    /// Every line of one log stream.
    pub async fn log_output(&self, id: JobExecutionId, name: &str) -> anyhow::Result<Vec<String>> {
        Ok(self
            .server
            .get_log_lines(id, name, 0, usize::MAX)
            .await?
            .into_iter()
            .map(|line| line.output)
            .collect())
    }
}
