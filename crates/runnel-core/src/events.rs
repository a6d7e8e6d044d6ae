//! Events emitted after state changes.

use crate::ids::*;
use crate::model::Reason;
use crate::status::Status;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// All events in the Runnel system.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    PipelineCreated(PipelineCreatedPayload),
    JobExecutionUpdated(JobExecutionUpdatedPayload),
    StepExecutionUpdated(StepExecutionUpdatedPayload),
}

impl Event {
    /// Routing subject for this event.
    pub fn subject(&self) -> String {
        match self {
            Event::PipelineCreated(p) => format!("pipeline.created.{}", p.pipeline_id),
            Event::JobExecutionUpdated(p) => {
                format!("job_execution.{}.{}", p.status, p.job_execution_id)
            }
            Event::StepExecutionUpdated(p) => {
                format!("step_execution.{}.{}", p.status, p.step_execution_id)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineCreatedPayload {
    pub pipeline_id: PipelineId,
    pub job_count: usize,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobExecutionUpdatedPayload {
    pub job_execution_id: JobExecutionId,
    pub job_id: JobId,
    pub pipeline_id: PipelineId,
    pub previous: Status,
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<Reason>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecutionUpdatedPayload {
    pub step_execution_id: StepExecutionId,
    pub job_execution_id: JobExecutionId,
    pub previous: Status,
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub updated_at: DateTime<Utc>,
}
