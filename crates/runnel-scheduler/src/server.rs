//! The server facade agents and clients talk to.

use crate::claim::ClaimService;
use crate::config::SchedulerConfig;
use crate::dispatch::DispatchService;
use crate::events::BroadcastEventBus;
use crate::lock::MemoryLocker;
use crate::logs::MemoryLogStorage;
use crate::pipeline::{CreatedPipeline, PipelineService};
use crate::reaper::Reaper;
use crate::store::MemoryStore;
use async_trait::async_trait;
use runnel_core::ids::*;
use runnel_core::model::*;
use runnel_core::ports::{EventBus, LogStorage, Locker, ServerApi, Store};
use runnel_core::{Error, Result, Status};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

pub struct Server {
    store: Arc<dyn Store>,
    logs: Arc<dyn LogStorage>,
    events: Arc<dyn EventBus>,
    dispatch: Arc<DispatchService>,
    claims: ClaimService,
    pipelines: PipelineService,
    config: SchedulerConfig,
}

impl Server {
    pub fn new(
        store: Arc<dyn Store>,
        locker: Arc<dyn Locker>,
        events: Arc<dyn EventBus>,
        logs: Arc<dyn LogStorage>,
        config: SchedulerConfig,
    ) -> Self {
        let dispatch = Arc::new(DispatchService::new(
            Arc::clone(&store),
            Arc::clone(&locker),
            Arc::clone(&events),
            Arc::clone(&logs),
            config.clone(),
        ));
        let claims = ClaimService::new(Arc::clone(&store), locker, config.clone());
        let pipelines =
            PipelineService::new(Arc::clone(&store), Arc::clone(&dispatch), Arc::clone(&events));
        Self {
            store,
            logs,
            events,
            dispatch,
            claims,
            pipelines,
            config,
        }
    }

    /// A server backed entirely by in-process adapters.
    pub fn in_memory(config: SchedulerConfig) -> Self {
        Self::new(
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryLocker::new()),
            Arc::new(BroadcastEventBus::default()),
            Arc::new(MemoryLogStorage::new()),
            config,
        )
    }

    pub fn events(&self) -> Arc<dyn EventBus> {
        Arc::clone(&self.events)
    }

    pub fn reaper(&self) -> Reaper {
        Reaper::new(
            Arc::clone(&self.dispatch),
            Arc::clone(&self.store),
            self.config.clone(),
        )
    }

    /// Run the reaper in the background until `shutdown` flips to true.
    pub fn spawn_reaper(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let reaper = self.reaper();
        tokio::spawn(async move { reaper.run(shutdown).await })
    }

    pub async fn create_pipeline(&self, definition: PipelineDefinition) -> Result<CreatedPipeline> {
        self.pipelines.create_pipeline(definition).await
    }

    pub async fn get_job_execution(&self, id: JobExecutionId) -> Result<JobExecution> {
        self.store
            .get_job_execution(id)
            .await?
            .ok_or_else(|| Error::not_found("job execution", id))
    }

    /// Executions of a job, oldest first.
    pub async fn list_job_executions(&self, job_id: JobId) -> Result<Vec<JobExecution>> {
        self.store.list_job_executions(job_id).await
    }

    pub async fn list_step_executions(&self, id: JobExecutionId) -> Result<Vec<StepExecution>> {
        self.store.list_step_executions(id).await
    }

    pub async fn get_log_lines(
        &self,
        id: JobExecutionId,
        name: &str,
        offset: u64,
        limit: usize,
    ) -> Result<Vec<LogLine>> {
        self.logs.get_lines(id, name, offset, limit).await
    }
}

#[async_trait]
impl ServerApi for Server {
    async fn request_job(&self, label: &str) -> Result<Option<ClaimedJob>> {
        self.claims.request_job(label).await
    }

    async fn update_job_execution(&self, update: UpdateJobExecution) -> Result<JobExecution> {
        self.dispatch.update_job_execution(update).await
    }

    async fn update_step_execution(&self, update: UpdateStepExecution) -> Result<StepExecution> {
        self.dispatch.update_step_execution(update).await
    }

    async fn upload_log_lines(
        &self,
        job_execution_id: JobExecutionId,
        name: &str,
        lines: Vec<LogLine>,
    ) -> Result<()> {
        self.get_job_execution(job_execution_id).await?;
        debug!(
            job_execution_id = %job_execution_id,
            name = %name,
            lines = lines.len(),
            "Uploading log lines"
        );
        self.logs.append(job_execution_id, name, lines).await
    }

    async fn heartbeat(&self, job_execution_id: JobExecutionId) -> Result<Status> {
        self.dispatch.heartbeat(job_execution_id).await
    }

    async fn cancel_job_execution(&self, id: JobExecutionId) -> Result<JobExecution> {
        self.dispatch.cancel_job_execution(id).await
    }
}
