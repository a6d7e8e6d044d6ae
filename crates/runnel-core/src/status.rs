//! Execution status and the legal transition tables for jobs and steps.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Status shared by job executions and step executions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Created,
    Queued,
    Preparing,
    Running,
    Canceling,
    Failed,
    Skipped,
    Succeeded,
}

/// The three disjoint groups a [`Status`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusBand {
    /// Not yet claimed by an agent.
    PreDispatch,
    /// Claimed and being worked on.
    Active,
    /// Terminal.
    Completed,
}

impl Status {
    pub const ALL: [Status; 8] = [
        Status::Created,
        Status::Queued,
        Status::Preparing,
        Status::Running,
        Status::Canceling,
        Status::Failed,
        Status::Skipped,
        Status::Succeeded,
    ];

    pub fn band(&self) -> StatusBand {
        match self {
            Status::Created | Status::Queued => StatusBand::PreDispatch,
            Status::Preparing | Status::Running | Status::Canceling => StatusBand::Active,
            Status::Failed | Status::Skipped | Status::Succeeded => StatusBand::Completed,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.band() == StatusBand::Completed
    }

    /// Preparing, Running or Canceling.
    pub fn is_running(&self) -> bool {
        self.band() == StatusBand::Active
    }

    /// Created or Queued.
    pub fn is_pre_dispatch(&self) -> bool {
        self.band() == StatusBand::PreDispatch
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Created => "created",
            Status::Queued => "queued",
            Status::Preparing => "preparing",
            Status::Running => "running",
            Status::Canceling => "canceling",
            Status::Failed => "failed",
            Status::Skipped => "skipped",
            Status::Succeeded => "succeeded",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for Status {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Status::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

/// Whether a job execution may move from `from` to `to`.
pub fn check_job_status(from: Status, to: Status) -> bool {
    if from == to {
        return true;
    }
    match from {
        Status::Created => matches!(to, Status::Queued | Status::Failed | Status::Skipped),
        Status::Queued => matches!(to, Status::Preparing | Status::Canceling | Status::Failed),
        Status::Preparing => to.is_completed() || matches!(to, Status::Running | Status::Canceling),
        Status::Running => to.is_completed() || to == Status::Canceling,
        Status::Canceling => to.is_completed(),
        Status::Failed | Status::Skipped | Status::Succeeded => false,
    }
}

/// Whether a step execution may move from `from` to `to`.
pub fn check_step_status(from: Status, to: Status) -> bool {
    if from == to {
        return true;
    }
    match from {
        Status::Created => matches!(to, Status::Running | Status::Failed | Status::Skipped),
        Status::Running => to.is_completed() || to == Status::Canceling,
        Status::Canceling => to.is_completed(),
        _ => false,
    }
}
