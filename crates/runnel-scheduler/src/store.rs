//! In-memory [`Store`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use runnel_core::ids::*;
use runnel_core::model::*;
use runnel_core::ports::{Mutation, Store};
use runnel_core::{Error, Result};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Default)]
struct Tables {
    pipelines: HashMap<PipelineId, Pipeline>,
    jobs: HashMap<JobId, Job>,
    jobs_by_pipeline: HashMap<PipelineId, Vec<JobId>>,
    job_executions: HashMap<JobExecutionId, JobExecution>,
    executions_by_job: HashMap<JobId, Vec<JobExecutionId>>,
    step_executions: HashMap<StepExecutionId, StepExecution>,
    steps_by_execution: HashMap<JobExecutionId, Vec<StepExecutionId>>,
    queue: BTreeMap<u64, JobQueueEntry>,
    queue_index: HashMap<JobExecutionId, u64>,
    next_queue_id: u64,
}

impl Tables {
    /// Apply one mutation and return what reverts it.
    fn apply(&mut self, mutation: Mutation) -> Result<Undo> {
        let undo = match mutation {
            Mutation::CreatePipeline(pipeline) => {
                if self.pipelines.contains_key(&pipeline.id) {
                    return Err(duplicate("pipeline", pipeline.id));
                }
                let id = pipeline.id;
                self.pipelines.insert(id, pipeline);
                Undo::CreatePipeline(id)
            }
            Mutation::CreateJob(job) => {
                if self.jobs.contains_key(&job.id) {
                    return Err(duplicate("job", job.id));
                }
                if !self.pipelines.contains_key(&job.pipeline_id) {
                    return Err(Error::not_found("pipeline", job.pipeline_id));
                }
                self.jobs_by_pipeline
                    .entry(job.pipeline_id)
                    .or_default()
                    .push(job.id);
                let undo = Undo::CreateJob {
                    id: job.id,
                    pipeline_id: job.pipeline_id,
                };
                self.jobs.insert(job.id, job);
                undo
            }
            Mutation::CreateJobExecution(execution) => {
                if self.job_executions.contains_key(&execution.id) {
                    return Err(duplicate("job execution", execution.id));
                }
                if !self.jobs.contains_key(&execution.job_id) {
                    return Err(Error::not_found("job", execution.job_id));
                }
                self.executions_by_job
                    .entry(execution.job_id)
                    .or_default()
                    .push(execution.id);
                let undo = Undo::CreateJobExecution {
                    id: execution.id,
                    job_id: execution.job_id,
                };
                self.job_executions.insert(execution.id, execution);
                undo
            }
            Mutation::UpdateJobExecution(execution) => {
                let slot = self
                    .job_executions
                    .get_mut(&execution.id)
                    .ok_or_else(|| Error::not_found("job execution", execution.id))?;
                Undo::UpdateJobExecution(std::mem::replace(slot, execution))
            }
            Mutation::CreateStepExecution(step) => {
                if self.step_executions.contains_key(&step.id) {
                    return Err(duplicate("step execution", step.id));
                }
                if !self.job_executions.contains_key(&step.job_execution_id) {
                    return Err(Error::not_found("job execution", step.job_execution_id));
                }
                self.steps_by_execution
                    .entry(step.job_execution_id)
                    .or_default()
                    .push(step.id);
                let undo = Undo::CreateStepExecution {
                    id: step.id,
                    job_execution_id: step.job_execution_id,
                };
                self.step_executions.insert(step.id, step);
                undo
            }
            Mutation::UpdateStepExecution(step) => {
                let slot = self
                    .step_executions
                    .get_mut(&step.id)
                    .ok_or_else(|| Error::not_found("step execution", step.id))?;
                Undo::UpdateStepExecution(std::mem::replace(slot, step))
            }
            Mutation::Enqueue {
                job_execution_id,
                label,
                status,
            } => {
                if self.queue_index.contains_key(&job_execution_id) {
                    return Err(Error::Database(format!(
                        "job execution {job_execution_id} is already queued"
                    )));
                }
                self.next_queue_id += 1;
                let id = self.next_queue_id;
                self.queue.insert(
                    id,
                    JobQueueEntry {
                        id,
                        job_execution_id,
                        label,
                        status,
                    },
                );
                self.queue_index.insert(job_execution_id, id);
                Undo::Enqueue(id)
            }
            // Like an UPDATE/DELETE matching no row, a missing queue entry is not an error.
            Mutation::UpdateQueueStatus {
                job_execution_id,
                status,
            } => {
                match self
                    .queue_index
                    .get(&job_execution_id)
                    .and_then(|id| self.queue.get_mut(id))
                {
                    Some(entry) => Undo::UpdateQueueStatus {
                        id: entry.id,
                        status: std::mem::replace(&mut entry.status, status),
                    },
                    None => Undo::Nothing,
                }
            }
            Mutation::Dequeue(job_execution_id) => {
                match self
                    .queue_index
                    .remove(&job_execution_id)
                    .and_then(|id| self.queue.remove(&id))
                {
                    Some(entry) => Undo::Dequeue(entry),
                    None => Undo::Nothing,
                }
            }
        };
        Ok(undo)
    }

    /// Mutations are undone in reverse order, so every index vector pushed
    /// to by a create has that id at its end.
    fn undo(&mut self, undo: Undo) {
        match undo {
            Undo::CreatePipeline(id) => {
                self.pipelines.remove(&id);
            }
            Undo::CreateJob { id, pipeline_id } => {
                self.jobs.remove(&id);
                pop_index(&mut self.jobs_by_pipeline, pipeline_id);
            }
            Undo::CreateJobExecution { id, job_id } => {
                self.job_executions.remove(&id);
                pop_index(&mut self.executions_by_job, job_id);
            }
            Undo::UpdateJobExecution(previous) => {
                self.job_executions.insert(previous.id, previous);
            }
            Undo::CreateStepExecution {
                id,
                job_execution_id,
            } => {
                self.step_executions.remove(&id);
                pop_index(&mut self.steps_by_execution, job_execution_id);
            }
            Undo::UpdateStepExecution(previous) => {
                self.step_executions.insert(previous.id, previous);
            }
            Undo::Enqueue(id) => {
                if let Some(entry) = self.queue.remove(&id) {
                    self.queue_index.remove(&entry.job_execution_id);
                }
                self.next_queue_id -= 1;
            }
            Undo::UpdateQueueStatus { id, status } => {
                if let Some(entry) = self.queue.get_mut(&id) {
                    entry.status = status;
                }
            }
            Undo::Dequeue(entry) => {
                self.queue_index.insert(entry.job_execution_id, entry.id);
                self.queue.insert(entry.id, entry);
            }
            Undo::Nothing => {}
        }
    }
}

/// How to revert one applied [`Mutation`].
#[derive(Debug)]
enum Undo {
    CreatePipeline(PipelineId),
    CreateJob {
        id: JobId,
        pipeline_id: PipelineId,
    },
    CreateJobExecution {
        id: JobExecutionId,
        job_id: JobId,
    },
    UpdateJobExecution(JobExecution),
    CreateStepExecution {
        id: StepExecutionId,
        job_execution_id: JobExecutionId,
    },
    UpdateStepExecution(StepExecution),
    Enqueue(u64),
    UpdateQueueStatus {
        id: u64,
        status: runnel_core::Status,
    },
    Dequeue(JobQueueEntry),
    Nothing,
}

fn pop_index<K: std::hash::Hash + Eq, V>(index: &mut HashMap<K, Vec<V>>, key: K) {
    if let Some(ids) = index.get_mut(&key) {
        ids.pop();
        if ids.is_empty() {
            index.remove(&key);
        }
    }
}

fn duplicate(kind: &str, id: impl std::fmt::Display) -> Error {
    Error::Database(format!("{kind} {id} already exists"))
}

/// Batches are applied in place under the write lock; a failing mutation
/// reverts the ones before it.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows currently in the job queue.
    pub fn queue_len(&self) -> usize {
        self.tables.read().queue.len()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn apply(&self, batch: Vec<Mutation>) -> Result<()> {
        let mut tables = self.tables.write();
        let mut applied = Vec::with_capacity(batch.len());
        for mutation in batch {
            match tables.apply(mutation) {
                Ok(undo) => applied.push(undo),
                Err(e) => {
                    for undo in applied.into_iter().rev() {
                        tables.undo(undo);
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    async fn get_pipeline(&self, id: PipelineId) -> Result<Option<Pipeline>> {
        Ok(self.tables.read().pipelines.get(&id).cloned())
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>> {
        Ok(self.tables.read().jobs.get(&id).cloned())
    }

    async fn list_jobs(&self, pipeline_id: PipelineId) -> Result<Vec<Job>> {
        let tables = self.tables.read();
        Ok(tables
            .jobs_by_pipeline
            .get(&pipeline_id)
            .into_iter()
            .flatten()
            .filter_map(|id| tables.jobs.get(id).cloned())
            .collect())
    }

    async fn get_job_execution(&self, id: JobExecutionId) -> Result<Option<JobExecution>> {
        Ok(self.tables.read().job_executions.get(&id).cloned())
    }

    async fn list_job_executions(&self, job_id: JobId) -> Result<Vec<JobExecution>> {
        let tables = self.tables.read();
        Ok(tables
            .executions_by_job
            .get(&job_id)
            .into_iter()
            .flatten()
            .filter_map(|id| tables.job_executions.get(id).cloned())
            .collect())
    }

    async fn get_step_execution(&self, id: StepExecutionId) -> Result<Option<StepExecution>> {
        Ok(self.tables.read().step_executions.get(&id).cloned())
    }

    async fn list_step_executions(
        &self,
        job_execution_id: JobExecutionId,
    ) -> Result<Vec<StepExecution>> {
        let tables = self.tables.read();
        Ok(tables
            .steps_by_execution
            .get(&job_execution_id)
            .into_iter()
            .flatten()
            .filter_map(|id| tables.step_executions.get(id).cloned())
            .collect())
    }

    async fn get_queue_entry(&self, id: JobExecutionId) -> Result<Option<JobQueueEntry>> {
        let tables = self.tables.read();
        Ok(tables
            .queue_index
            .get(&id)
            .and_then(|seq| tables.queue.get(seq))
            .cloned())
    }

    async fn get_queued_job_execution_ids(
        &self,
        label: &str,
        limit: usize,
    ) -> Result<Vec<JobExecutionId>> {
        let tables = self.tables.read();
        Ok(tables
            .queue
            .values()
            .filter(|e| e.label == label && e.status == runnel_core::Status::Queued)
            .take(limit)
            .map(|e| e.job_execution_id)
            .collect())
    }

    async fn touch_heartbeat(&self, id: JobExecutionId, at: DateTime<Utc>) -> Result<()> {
        let mut tables = self.tables.write();
        let execution = tables
            .job_executions
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("job execution", id))?;
        execution.last_heartbeat_at = Some(at);
        Ok(())
    }

    async fn list_heartbeat_timeouts(&self, deadline: DateTime<Utc>) -> Result<Vec<JobExecution>> {
        let tables = self.tables.read();
        let mut timed_out: Vec<JobExecution> = tables
            .job_executions
            .values()
            .filter(|e| e.status.is_running())
            .filter(|e| {
                let last_seen = e
                    .last_heartbeat_at
                    .or(e.started_at)
                    .unwrap_or(e.created_at);
                last_seen < deadline
            })
            .cloned()
            .collect();
        timed_out.sort_by_key(|e| e.id);
        Ok(timed_out)
    }

    async fn list_pipelines_with_created(&self) -> Result<Vec<PipelineId>> {
        let tables = self.tables.read();
        let mut ids: Vec<PipelineId> = tables
            .job_executions
            .values()
            .filter(|e| e.status == runnel_core::Status::Created)
            .map(|e| e.pipeline_id)
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }
}
