//! Polling loop that claims jobs and executes them.

use crate::config::AgentConfig;
use crate::execution::Execution;
use runnel_core::model::JobExecution;
use runnel_core::ports::{SandboxProvider, ServerApi};
use runnel_core::{Error, Result};
use std::sync::Arc;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// The job agent.
pub struct Agent {
    config: AgentConfig,
    server: Arc<dyn ServerApi>,
    provider: Arc<dyn SandboxProvider>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    job_semaphore: Arc<Semaphore>,
}

impl Agent {
    pub fn new(
        config: AgentConfig,
        server: Arc<dyn ServerApi>,
        provider: Arc<dyn SandboxProvider>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let job_semaphore = Arc::new(Semaphore::new(config.concurrency));
        Self {
            config,
            server,
            provider,
            shutdown_tx,
            shutdown_rx,
            job_semaphore,
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Poll with `concurrency` workers until [`Agent::shutdown`] is called.
    pub async fn run(&self) -> Result<()> {
        self.config.validate()?;
        info!(
            label = %self.config.label,
            concurrency = self.config.concurrency,
            "Starting agent"
        );

        let mut workers = JoinSet::new();
        for worker in 0..self.config.concurrency {
            workers.spawn(poll_jobs(
                worker,
                self.config.clone(),
                Arc::clone(&self.server),
                Arc::clone(&self.provider),
                Arc::clone(&self.job_semaphore),
                self.shutdown_rx.clone(),
            ));
        }
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Agent worker failed");
            }
        }

        info!("Agent stopped");
        Ok(())
    }

    /// Claim and execute at most one job. Returns `None` when nothing is
    /// queued for this agent's label.
    pub async fn run_once(&self) -> Result<Option<JobExecution>> {
        let _permit = self
            .job_semaphore
            .acquire()
            .await
            .map_err(|_| Error::Internal("Job semaphore closed".to_string()))?;
        match self.server.request_job(&self.config.label).await? {
            Some(claimed) => Execution::new(
                Arc::clone(&self.server),
                Arc::clone(&self.provider),
                self.config.clone(),
                claimed,
            )
            .execute()
            .await
            .map(Some),
            None => Ok(None),
        }
    }

    /// Stop polling and wait for in-flight jobs to finish.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Initiating graceful shutdown");
        let _ = self.shutdown_tx.send(true);

        info!("Waiting for in-progress jobs to complete...");
        let _permits = self
            .job_semaphore
            .acquire_many(self.config.concurrency as u32)
            .await
            .map_err(|_| Error::Internal("Job semaphore closed".to_string()))?;

        info!("Agent shutdown complete");
        Ok(())
    }
}

async fn poll_jobs(
    worker: usize,
    config: AgentConfig,
    server: Arc<dyn ServerApi>,
    provider: Arc<dyn SandboxProvider>,
    job_semaphore: Arc<Semaphore>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            debug!(worker, "Worker stopping");
            return;
        }

        let claimed = {
            let Ok(_permit) = job_semaphore.acquire().await else {
                return;
            };
            match server.request_job(&config.label).await {
                Ok(Some(claimed)) => {
                    info!(
                        worker,
                        job_execution_id = %claimed.execution.id,
                        job = %claimed.job.name,
                        "Claimed job"
                    );
                    let result = Execution::new(
                        Arc::clone(&server),
                        Arc::clone(&provider),
                        config.clone(),
                        claimed,
                    )
                    .execute()
                    .await;
                    if let Err(e) = result {
                        error!(worker, error = %e, "Job execution error");
                    }
                    true
                }
                Ok(None) => false,
                Err(e) => {
                    warn!(worker, error = %e, "Failed to request job");
                    false
                }
            }
        };
        if claimed {
            continue;
        }

        tokio::select! {
            _ = tokio::time::sleep(config.poll_interval()) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeProvider, FakeSandbox, FakeServer, claimed_job};
    use runnel_core::Status;
    use std::time::Duration;

    fn agent(server: &Arc<FakeServer>) -> Agent {
        let config = AgentConfig {
            concurrency: 2,
            poll_interval_ms: 100,
            log_flush_interval_ms: 10,
            ..Default::default()
        };
        let provider = Arc::new(FakeProvider::new(Arc::new(FakeSandbox::new([]))));
        Agent::new(config, server.clone(), provider)
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_once_without_work() {
        let server = Arc::new(FakeServer::new());
        assert!(agent(&server).run_once().await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_once_executes_claimed_job() {
        let server = Arc::new(FakeServer::new());
        server.push_job(claimed_job(&["build"], &[], 0));
        let finished = agent(&server).run_once().await.unwrap().unwrap();
        assert_eq!(finished.status, Status::Succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_workers_drain_queue_until_shutdown() {
        let server = Arc::new(FakeServer::new());
        for _ in 0..3 {
            server.push_job(claimed_job(&["build"], &[], 0));
        }
        let agent = Arc::new(agent(&server));
        let running = tokio::spawn({
            let agent = Arc::clone(&agent);
            async move { agent.run().await }
        });

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(
            server
                .job_statuses()
                .iter()
                .filter(|s| **s == Status::Succeeded)
                .count(),
            3
        );

        tokio_test::assert_ok!(agent.shutdown().await);
        tokio_test::assert_ok!(running.await.unwrap());
    }
}
