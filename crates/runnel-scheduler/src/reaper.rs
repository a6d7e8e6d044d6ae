//! Background recovery of executions whose agent stopped sending heartbeats
//! and of pipelines whose dependents were never dispatched.

use crate::config::SchedulerConfig;
use crate::dispatch::DispatchService;
use chrono::Utc;
use runnel_core::Result;
use runnel_core::model::{FailedReason, Reason};
use runnel_core::ports::Store;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval, timeout};
use tracing::{error, info, warn};

pub struct Reaper {
    dispatch: Arc<DispatchService>,
    store: Arc<dyn Store>,
    config: SchedulerConfig,
}

impl Reaper {
    pub fn new(dispatch: Arc<DispatchService>, store: Arc<dyn Store>, config: SchedulerConfig) -> Self {
        Self {
            dispatch,
            store,
            config,
        }
    }

    /// One sweep. Returns how many executions were failed.
    pub async fn recycle_heartbeat_timeouts(&self) -> Result<usize> {
        let window = chrono::Duration::from_std(self.config.heartbeat_timeout())
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let deadline = Utc::now() - window;
        let timed_out = self.store.list_heartbeat_timeouts(deadline).await?;

        let mut recycled = 0;
        for execution in timed_out {
            let reason = Reason::new(FailedReason::HeartbeatTimeout, "");
            match self.dispatch.recycle_job_execution(execution.id, reason).await {
                Ok(Some(_)) => recycled += 1,
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        job_execution_id = %execution.id,
                        error = %e,
                        "Failed to recycle heartbeat timeout"
                    );
                }
            }
        }
        Ok(recycled)
    }

    /// Dispatch every pipeline that still has executions in Created. Picks up
    /// dependents left behind when dispatch after a completion gave up on a
    /// contended lock. Returns how many executions moved.
    pub async fn dispatch_stalled_pipelines(&self) -> Result<usize> {
        let mut dispatched = 0;
        for pipeline_id in self.store.list_pipelines_with_created().await? {
            match self.dispatch.dispatch_pipeline(pipeline_id).await {
                Ok(updated) => dispatched += updated.len(),
                Err(e) => {
                    warn!(pipeline_id = %pipeline_id, error = %e, "Failed to dispatch stalled pipeline");
                }
            }
        }
        Ok(dispatched)
    }

    /// Sweep on every tick until shutdown. A sweep may not outlast the interval.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let period = self.config.reaper_interval();
        let mut ticker = interval(period);

        info!(interval_secs = period.as_secs(), "Starting heartbeat reaper");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match timeout(period, self.recycle_heartbeat_timeouts()).await {
                        Ok(Ok(0)) => {}
                        Ok(Ok(recycled)) => info!(recycled, "Recycled heartbeat timeouts"),
                        Ok(Err(e)) => error!(error = %e, "Heartbeat sweep failed"),
                        Err(_) => warn!("Heartbeat sweep timed out"),
                    }
                    match timeout(period, self.dispatch_stalled_pipelines()).await {
                        Ok(Ok(0)) => {}
                        Ok(Ok(dispatched)) => info!(dispatched, "Dispatched stalled pipelines"),
                        Ok(Err(e)) => error!(error = %e, "Dispatch sweep failed"),
                        Err(_) => warn!("Dispatch sweep timed out"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Heartbeat reaper shutting down");
                        break;
                    }
                }
            }
        }
    }
}
