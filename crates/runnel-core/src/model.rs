//! Pipelines, jobs, steps and their executions.

use crate::dag::{Dag, DagError, DagNode};
use crate::ids::*;
use crate::status::Status;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: PipelineId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Sandbox requirement of a job. Agents only claim jobs whose label they serve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunsOn {
    pub label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub pipeline_id: PipelineId,
    pub name: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub runs_on: RunsOn,
    #[serde(default)]
    pub working_directory: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Job timeout in seconds, 0 means no timeout.
    #[serde(default)]
    pub timeout_secs: u64,
    pub steps: Vec<Step>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// Step graph of this job. When no step declares a dependency the steps
    /// run as a chain in declaration order.
    pub fn step_dag(&self) -> Result<Dag<Step>, DagError> {
        Dag::build_or_chain(self.steps.clone(), |s| &mut s.depends_on)
    }
}

impl DagNode for Job {
    fn id(&self) -> &str {
        &self.name
    }

    fn depends(&self) -> &[String] {
        &self.depends_on
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    pub job_id: JobId,
    pub name: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub commands: Vec<String>,
    #[serde(default)]
    pub working_directory: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub user: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl DagNode for Step {
    fn id(&self) -> &str {
        &self.name
    }

    fn depends(&self) -> &[String] {
        &self.depends_on
    }
}

/// Why an execution ended up Failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailedReason {
    StepFailed,
    Timeout,
    HeartbeatTimeout,
    Cancelled,
    DispatchError,
    InvalidSteps,
    SandboxError,
    ExecutorDown,
    InternalError,
}

impl fmt::Display for FailedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailedReason::StepFailed => "step_failed",
            FailedReason::Timeout => "timeout",
            FailedReason::HeartbeatTimeout => "heartbeat_timeout",
            FailedReason::Cancelled => "cancelled",
            FailedReason::DispatchError => "dispatch_error",
            FailedReason::InvalidSteps => "invalid_steps",
            FailedReason::SandboxError => "sandbox_error",
            FailedReason::ExecutorDown => "executor_down",
            FailedReason::InternalError => "internal_error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reason {
    pub reason: FailedReason,
    #[serde(default)]
    pub message: String,
}

impl Reason {
    pub fn new(reason: FailedReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }
}

impl From<FailedReason> for Reason {
    fn from(reason: FailedReason) -> Self {
        Self::new(reason, "")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobExecution {
    pub id: JobExecutionId,
    pub job_id: JobId,
    pub pipeline_id: PipelineId,
    pub status: Status,
    #[serde(default)]
    pub reason: Option<Reason>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

impl JobExecution {
    pub fn new(job: &Job) -> Self {
        Self {
            id: JobExecutionId::new(),
            job_id: job.id,
            pipeline_id: job.pipeline_id,
            status: Status::Created,
            reason: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            last_heartbeat_at: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecution {
    pub id: StepExecutionId,
    pub step_id: StepId,
    pub job_execution_id: JobExecutionId,
    pub status: Status,
    pub exit_code: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl StepExecution {
    pub fn new(step: &Step, job_execution_id: JobExecutionId) -> Self {
        Self {
            id: StepExecutionId::new(),
            step_id: step.id,
            job_execution_id,
            status: Status::Created,
            exit_code: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }
}

/// Queue row. Present only while the execution is queued or active.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobQueueEntry {
    /// Monotonic sequence, the FIFO key.
    pub id: u64,
    pub job_execution_id: JobExecutionId,
    pub label: String,
    pub status: Status,
}

/// Everything an agent needs to run one job execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimedJob {
    pub job: Job,
    pub execution: JobExecution,
    pub step_executions: Vec<StepExecution>,
}

impl ClaimedJob {
    pub fn step_execution(&self, step_id: StepId) -> Option<&StepExecution> {
        self.step_executions.iter().find(|s| s.step_id == step_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    /// Starts at 0 for each log stream.
    pub number: u64,
    /// Whole seconds since the stream was opened.
    pub timestamp: u64,
    pub output: String,
}

/// Guarded job status write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateJobExecution {
    pub id: JobExecutionId,
    pub status: Status,
    #[serde(default)]
    pub reason: Option<Reason>,
}

/// Guarded step status write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateStepExecution {
    pub id: StepExecutionId,
    pub status: Status,
    #[serde(default)]
    pub exit_code: Option<i32>,
}

/// Authoring shape of a pipeline, before ids are assigned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub jobs: Vec<JobDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefinition {
    pub name: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub runs_on: RunsOn,
    #[serde(default)]
    pub working_directory: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub timeout_secs: u64,
    pub steps: Vec<StepDefinition>,
}

impl JobDefinition {
    /// See [`Job::step_dag`].
    pub fn step_dag(&self) -> Result<Dag<StepDefinition>, DagError> {
        Dag::build_or_chain(self.steps.clone(), |s| &mut s.depends_on)
    }
}

impl DagNode for JobDefinition {
    fn id(&self) -> &str {
        &self.name
    }

    fn depends(&self) -> &[String] {
        &self.depends_on
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    pub name: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub commands: Vec<String>,
    #[serde(default)]
    pub working_directory: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub user: Option<String>,
}

impl DagNode for StepDefinition {
    fn id(&self) -> &str {
        &self.name
    }

    fn depends(&self) -> &[String] {
        &self.depends_on
    }
}
