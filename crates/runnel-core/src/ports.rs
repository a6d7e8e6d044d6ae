//! Port traits (hexagonal architecture).
//!
//! These traits define the interfaces between the orchestration core and its
//! collaborators: persistence, locking, event delivery, log storage, the
//! server API seen by agents, and the sandboxes commands run in.

use crate::events::Event;
use crate::ids::*;
use crate::model::*;
use crate::status::Status;
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Stream of events.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<Event>> + Send>>;

/// Event bus for publishing and subscribing to events.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish an event.
    async fn publish(&self, event: Event) -> Result<()>;

    /// Subscribe to events matching a pattern.
    /// Pattern supports wildcards: `job_execution.*.>`, `step_execution.>`
    async fn subscribe(&self, pattern: &str) -> Result<EventStream>;
}

/// Distributed lock without renewal. Entries expire after their TTL.
#[async_trait]
pub trait Locker: Send + Sync {
    /// Returns false if an unexpired entry already holds `key`.
    async fn lock(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Returns false if there was nothing to release.
    async fn unlock(&self, key: &str) -> Result<bool>;
}

/// One write in an atomic [`Store::apply`] batch.
#[derive(Debug, Clone)]
pub enum Mutation {
    CreatePipeline(Pipeline),
    CreateJob(Job),
    CreateJobExecution(JobExecution),
    UpdateJobExecution(JobExecution),
    CreateStepExecution(StepExecution),
    UpdateStepExecution(StepExecution),
    Enqueue {
        job_execution_id: JobExecutionId,
        label: String,
        status: Status,
    },
    UpdateQueueStatus {
        job_execution_id: JobExecutionId,
        status: Status,
    },
    Dequeue(JobExecutionId),
}

/// Persistence for pipelines, jobs, executions and the job queue.
#[async_trait]
pub trait Store: Send + Sync {
    /// Apply every mutation or none of them.
    async fn apply(&self, batch: Vec<Mutation>) -> Result<()>;

    async fn get_pipeline(&self, id: PipelineId) -> Result<Option<Pipeline>>;

    async fn get_job(&self, id: JobId) -> Result<Option<Job>>;

    /// Jobs of a pipeline in declaration order.
    async fn list_jobs(&self, pipeline_id: PipelineId) -> Result<Vec<Job>>;

    async fn get_job_execution(&self, id: JobExecutionId) -> Result<Option<JobExecution>>;

    /// Executions of a job, oldest first.
    async fn list_job_executions(&self, job_id: JobId) -> Result<Vec<JobExecution>>;

    async fn get_step_execution(&self, id: StepExecutionId) -> Result<Option<StepExecution>>;

    async fn list_step_executions(
        &self,
        job_execution_id: JobExecutionId,
    ) -> Result<Vec<StepExecution>>;

    async fn get_queue_entry(&self, id: JobExecutionId) -> Result<Option<JobQueueEntry>>;

    /// Queued executions for `label`, FIFO by queue id.
    async fn get_queued_job_execution_ids(
        &self,
        label: &str,
        limit: usize,
    ) -> Result<Vec<JobExecutionId>>;

    async fn touch_heartbeat(&self, id: JobExecutionId, at: DateTime<Utc>) -> Result<()>;

    /// Active executions whose last heartbeat (or start, if they never sent
    /// one) is older than `deadline`.
    async fn list_heartbeat_timeouts(&self, deadline: DateTime<Utc>) -> Result<Vec<JobExecution>>;

    /// Pipelines with at least one execution still in Created.
    async fn list_pipelines_with_created(&self) -> Result<Vec<PipelineId>>;
}

/// Storage for uploaded log lines.
#[async_trait]
pub trait LogStorage: Send + Sync {
    async fn append(
        &self,
        job_execution_id: JobExecutionId,
        name: &str,
        lines: Vec<LogLine>,
    ) -> Result<()>;

    async fn get_lines(
        &self,
        job_execution_id: JobExecutionId,
        name: &str,
        offset: u64,
        limit: usize,
    ) -> Result<Vec<LogLine>>;

    /// Move the logs of a finished execution to long-term storage.
    async fn archive(&self, job_execution_id: JobExecutionId) -> Result<()>;
}

/// The server surface agents talk to.
#[async_trait]
pub trait ServerApi: Send + Sync {
    /// Claim one queued job for `label`. `None` means nothing is claimable.
    async fn request_job(&self, label: &str) -> Result<Option<ClaimedJob>>;

    async fn update_job_execution(&self, update: UpdateJobExecution) -> Result<JobExecution>;

    async fn update_step_execution(&self, update: UpdateStepExecution) -> Result<StepExecution>;

    async fn upload_log_lines(
        &self,
        job_execution_id: JobExecutionId,
        name: &str,
        lines: Vec<LogLine>,
    ) -> Result<()>;

    /// Record liveness and return the execution's current status.
    async fn heartbeat(&self, job_execution_id: JobExecutionId) -> Result<Status>;

    async fn cancel_job_execution(&self, id: JobExecutionId) -> Result<JobExecution>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeInfo {
    pub os: String,
    pub arch: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartCommand {
    pub commands: Vec<String>,
    pub dir: Option<String>,
    /// `KEY=VALUE` pairs.
    pub env: Vec<String>,
    pub user: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandStatus {
    /// False when the wait timed out before the command finished.
    pub exit: bool,
    pub exit_code: i32,
}

/// Raw output chunks of a running command.
pub type CommandLogStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>>> + Send>>;

/// Command execution capability of a sandbox.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn ping(&self) -> Result<()>;

    async fn runtime_info(&self) -> Result<RuntimeInfo>;

    /// Default environment of the sandbox as `KEY=VALUE` pairs.
    async fn environment(&self) -> Result<Vec<String>>;

    /// Start a command and return its id.
    async fn start_command(&self, command: StartCommand) -> Result<String>;

    async fn wait_command(&self, command_id: &str, timeout: Duration) -> Result<CommandStatus>;

    async fn command_log(&self, command_id: &str) -> Result<CommandLogStream>;
}

/// An isolated environment a job runs in.
#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    /// Executor that runs commands for `step`.
    async fn executor(&self, step: &Step) -> Result<Arc<dyn Executor>>;
}

/// Creates sandboxes for claimed jobs.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    async fn create(&self, job: &Job) -> Result<Arc<dyn Sandbox>>;
}
