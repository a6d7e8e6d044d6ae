//! Claim protocol: hand one queued execution to one agent.

use crate::config::SchedulerConfig;
use crate::lock::claim_lock_key;
use runnel_core::ids::JobExecutionId;
use runnel_core::model::ClaimedJob;
use runnel_core::ports::{Locker, Store};
use runnel_core::{Error, Result, Status};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct ClaimService {
    store: Arc<dyn Store>,
    locker: Arc<dyn Locker>,
    config: SchedulerConfig,
}

impl ClaimService {
    pub fn new(store: Arc<dyn Store>, locker: Arc<dyn Locker>, config: SchedulerConfig) -> Self {
        Self {
            store,
            locker,
            config,
        }
    }

    /// Scan the queue for `label` and return the first execution whose claim
    /// lock could be taken.
    ///
    /// The claim lock is kept on success. It expires on its own; by then the
    /// agent has moved the execution out of Queued or the reaper has failed it.
    pub async fn request_job(&self, label: &str) -> Result<Option<ClaimedJob>> {
        let candidates = self
            .store
            .get_queued_job_execution_ids(label, self.config.claim_scan_limit)
            .await?;
        debug!(label = %label, candidates = candidates.len(), "Scanning job queue");

        for id in candidates {
            let key = claim_lock_key(id);
            if !self
                .locker
                .lock(&key, "request_job", self.config.claim_lock_ttl())
                .await?
            {
                continue;
            }
            match self.load(id).await {
                Ok(Some(claimed)) => {
                    info!(
                        job_execution_id = %id,
                        job = %claimed.job.name,
                        label = %label,
                        "Job claimed"
                    );
                    return Ok(Some(claimed));
                }
                Ok(None) => {
                    debug!(job_execution_id = %id, "Execution left the queue before it was claimed");
                }
                Err(e) => {
                    warn!(job_execution_id = %id, error = %e, "Failed to load claimed job");
                }
            }
            if let Err(e) = self.locker.unlock(&key).await {
                warn!(job_execution_id = %id, error = %e, "Failed to release claim lock");
            }
        }
        Ok(None)
    }

    async fn load(&self, id: JobExecutionId) -> Result<Option<ClaimedJob>> {
        let Some(execution) = self.store.get_job_execution(id).await? else {
            return Ok(None);
        };
        if execution.status != Status::Queued {
            return Ok(None);
        }
        let job = self
            .store
            .get_job(execution.job_id)
            .await?
            .ok_or_else(|| Error::not_found("job", execution.job_id))?;
        let step_executions = self.store.list_step_executions(id).await?;
        Ok(Some(ClaimedJob {
            job,
            execution,
            step_executions,
        }))
    }
}
