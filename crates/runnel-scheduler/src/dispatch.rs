//! Dispatch of job executions and the guarded status update path.
//!
//! Every status change of a job execution goes through [`DispatchService`],
//! which serializes writers with a per-execution lock and keeps the job queue
//! in step with the execution row inside one store batch.

use crate::config::SchedulerConfig;
use crate::lock::update_lock_key;
use chrono::{DateTime, Utc};
use runnel_core::events::{Event, JobExecutionUpdatedPayload, StepExecutionUpdatedPayload};
use runnel_core::ids::*;
use runnel_core::model::*;
use runnel_core::ports::{EventBus, LogStorage, Locker, Mutation, Store};
use runnel_core::status::{check_job_status, check_step_status};
use runnel_core::{Error, Result, Status};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A status change decided by the [`Dispatcher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub job_execution_id: JobExecutionId,
    pub status: Status,
    pub reason: Option<Reason>,
}

/// Decides which executions of a pipeline can move forward. Pure.
pub struct Dispatcher;

impl Dispatcher {
    /// Executions are matched to jobs by job id; when a job has several, the
    /// newest one is used. Only executions still in Created are promoted.
    pub fn plan(jobs: &[Job], executions: &[JobExecution]) -> Result<Vec<Transition>> {
        let mut latest: HashMap<JobId, &JobExecution> = HashMap::new();
        for execution in executions {
            latest.insert(execution.job_id, execution);
        }

        let mut by_name: HashMap<&str, (&Job, &JobExecution)> = HashMap::new();
        for job in jobs {
            let execution = latest.get(&job.id).ok_or_else(|| {
                Error::InvalidPipeline(format!("job {} has no execution", job.name))
            })?;
            by_name.insert(job.name.as_str(), (job, execution));
        }

        let mut transitions = Vec::new();
        for job in jobs {
            let (_, execution) = by_name[job.name.as_str()];
            if execution.status != Status::Created {
                continue;
            }
            match Self::readiness(job, &by_name) {
                Ok(Some(status)) => transitions.push(Transition {
                    job_execution_id: execution.id,
                    status,
                    reason: None,
                }),
                Ok(None) => {}
                Err(message) => transitions.push(Transition {
                    job_execution_id: execution.id,
                    status: Status::Failed,
                    reason: Some(Reason::new(
                        FailedReason::DispatchError,
                        format!("failed to dispatch job execution: {message}"),
                    )),
                }),
            }
        }
        Ok(transitions)
    }

    fn readiness(
        job: &Job,
        by_name: &HashMap<&str, (&Job, &JobExecution)>,
    ) -> std::result::Result<Option<Status>, String> {
        let mut all_succeeded = true;
        for dep in &job.depends_on {
            let (_, dep_execution) = by_name
                .get(dep.as_str())
                .ok_or_else(|| format!("the dependency {dep} of {} not found", job.name))?;
            if !dep_execution.status.is_completed() {
                return Ok(None);
            }
            all_succeeded &= dep_execution.status == Status::Succeeded;
        }
        Ok(Some(if all_succeeded {
            Status::Queued
        } else {
            Status::Skipped
        }))
    }
}

/// Server-side owner of job and step execution state.
pub struct DispatchService {
    store: Arc<dyn Store>,
    locker: Arc<dyn Locker>,
    events: Arc<dyn EventBus>,
    logs: Arc<dyn LogStorage>,
    config: SchedulerConfig,
}

impl DispatchService {
    pub fn new(
        store: Arc<dyn Store>,
        locker: Arc<dyn Locker>,
        events: Arc<dyn EventBus>,
        logs: Arc<dyn LogStorage>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            locker,
            events,
            logs,
            config,
        }
    }

    /// Plan and apply transitions for the given jobs as one batch.
    ///
    /// Every affected execution is locked first; if any lock is taken the
    /// whole call fails with [`Error::LockContention`].
    pub async fn dispatch(
        &self,
        jobs: &[Job],
        executions: &[JobExecution],
    ) -> Result<Vec<JobExecution>> {
        let transitions = Dispatcher::plan(jobs, executions)?;
        if transitions.is_empty() {
            return Ok(Vec::new());
        }

        let mut held = Vec::with_capacity(transitions.len());
        for transition in &transitions {
            if let Err(e) = self.acquire_update_lock(transition.job_execution_id, "dispatch").await {
                self.release_all(&held).await;
                return Err(e);
            }
            held.push(transition.job_execution_id);
        }

        let result = self.apply_transitions(jobs, &transitions).await;
        self.release_all(&held).await;
        let updated = result?;

        for (previous, execution) in &updated {
            info!(
                job_execution_id = %execution.id,
                from = %previous,
                to = %execution.status,
                "Dispatched job execution"
            );
            self.emit_job_event(*previous, execution);
        }
        Ok(updated.into_iter().map(|(_, e)| e).collect())
    }

    async fn apply_transitions(
        &self,
        jobs: &[Job],
        transitions: &[Transition],
    ) -> Result<Vec<(Status, JobExecution)>> {
        let jobs_by_id: HashMap<JobId, &Job> = jobs.iter().map(|j| (j.id, j)).collect();
        let now = Utc::now();
        let mut batch = Vec::new();
        let mut updated = Vec::new();
        for transition in transitions {
            let execution = self.load_execution(transition.job_execution_id).await?;
            let job = jobs_by_id
                .get(&execution.job_id)
                .ok_or_else(|| Error::not_found("job", execution.job_id))?;
            let previous = execution.status;
            let (execution, mutations) = job_transition(
                execution,
                job,
                transition.status,
                transition.reason.clone(),
                now,
            )?;
            batch.extend(mutations);
            updated.push((previous, execution));
        }
        self.store.apply(batch).await?;
        Ok(updated)
    }

    /// Dispatch every job of a pipeline until nothing moves, retrying a
    /// bounded number of times when another writer holds one of the locks.
    ///
    /// A pass that skips or fails a job can unblock that job's own
    /// dependents, so passes repeat while they complete executions.
    pub async fn dispatch_pipeline(&self, pipeline_id: PipelineId) -> Result<Vec<JobExecution>> {
        let mut dispatched = Vec::new();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let jobs = self.store.list_jobs(pipeline_id).await?;
            let mut executions = Vec::with_capacity(jobs.len());
            for job in &jobs {
                executions.extend(self.store.list_job_executions(job.id).await?);
            }
            match self.dispatch(&jobs, &executions).await {
                Ok(updated) => {
                    let cascades = updated.iter().any(|e| e.status.is_completed());
                    dispatched.extend(updated);
                    if !cascades {
                        return Ok(dispatched);
                    }
                    attempt = 0;
                }
                Err(Error::LockContention(key)) if attempt < self.config.dispatch_attempts => {
                    debug!(pipeline_id = %pipeline_id, key = %key, attempt, "Dispatch contended, retrying");
                    tokio::time::sleep(Duration::from_millis(50 * u64::from(attempt))).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Guarded status write for a job execution.
    pub async fn update_job_execution(&self, update: UpdateJobExecution) -> Result<JobExecution> {
        self.acquire_update_lock(update.id, "update_job_execution").await?;
        let result = self.update_job_execution_locked(&update).await;
        self.release_update_lock(update.id).await;
        let (previous, execution) = result?;

        info!(
            job_execution_id = %execution.id,
            from = %previous,
            to = %execution.status,
            "Updated job execution"
        );
        self.emit_job_event(previous, &execution);
        if previous != execution.status && execution.status.is_completed() {
            self.after_completion(&execution).await;
        }
        Ok(execution)
    }

    async fn update_job_execution_locked(
        &self,
        update: &UpdateJobExecution,
    ) -> Result<(Status, JobExecution)> {
        let execution = self.load_execution(update.id).await?;
        let job = self
            .store
            .get_job(execution.job_id)
            .await?
            .ok_or_else(|| Error::not_found("job", execution.job_id))?;
        let previous = execution.status;
        let (execution, batch) =
            job_transition(execution, &job, update.status, update.reason.clone(), Utc::now())?;
        self.store.apply(batch).await?;
        Ok((previous, execution))
    }

    /// Guarded status write for a step execution.
    pub async fn update_step_execution(&self, update: UpdateStepExecution) -> Result<StepExecution> {
        let mut step = self
            .store
            .get_step_execution(update.id)
            .await?
            .ok_or_else(|| Error::not_found("step execution", update.id))?;
        let previous = step.status;
        if !check_step_status(previous, update.status) {
            return Err(Error::InvalidTransition {
                from: previous,
                to: update.status,
            });
        }

        let now = Utc::now();
        step.status = update.status;
        if update.exit_code.is_some() {
            step.exit_code = update.exit_code;
        }
        if update.status == Status::Running && step.started_at.is_none() {
            step.started_at = Some(now);
        }
        if update.status.is_completed() && previous != update.status {
            step.completed_at = Some(now);
        }
        self.store
            .apply(vec![Mutation::UpdateStepExecution(step.clone())])
            .await?;

        debug!(
            step_execution_id = %step.id,
            from = %previous,
            to = %step.status,
            exit_code = ?step.exit_code,
            "Updated step execution"
        );
        self.emit(Event::StepExecutionUpdated(StepExecutionUpdatedPayload {
            step_execution_id: step.id,
            job_execution_id: step.job_execution_id,
            previous,
            status: step.status,
            exit_code: step.exit_code,
            updated_at: now,
        }));
        Ok(step)
    }

    /// Cancel an execution. Executions nobody has claimed yet fail right away,
    /// claimed ones move to Canceling and are finished by their agent.
    pub async fn cancel_job_execution(&self, id: JobExecutionId) -> Result<JobExecution> {
        let execution = self.load_execution(id).await?;
        let update = if execution.status.is_pre_dispatch() {
            UpdateJobExecution {
                id,
                status: Status::Failed,
                reason: Some(Reason::new(FailedReason::Cancelled, "cancelled before dispatch")),
            }
        } else {
            UpdateJobExecution {
                id,
                status: Status::Canceling,
                reason: None,
            }
        };
        info!(job_execution_id = %id, status = %update.status, "Cancelling job execution");
        self.update_job_execution(update).await
    }

    /// Record a heartbeat and report the current status back to the agent.
    pub async fn heartbeat(&self, id: JobExecutionId) -> Result<Status> {
        let execution = self.load_execution(id).await?;
        self.store.touch_heartbeat(id, Utc::now()).await?;
        Ok(execution.status)
    }

    /// Fail an active execution and skip its unfinished steps in one batch.
    /// Returns `None` if the execution is no longer active.
    pub async fn recycle_job_execution(
        &self,
        id: JobExecutionId,
        reason: Reason,
    ) -> Result<Option<JobExecution>> {
        self.acquire_update_lock(id, "recycle_job_execution").await?;
        let result = self.recycle_locked(id, reason).await;
        self.release_update_lock(id).await;
        let Some((previous, execution)) = result? else {
            return Ok(None);
        };

        info!(
            job_execution_id = %id,
            from = %previous,
            reason = ?execution.reason,
            "Recycled job execution"
        );
        self.emit_job_event(previous, &execution);
        self.after_completion(&execution).await;
        Ok(Some(execution))
    }

    async fn recycle_locked(
        &self,
        id: JobExecutionId,
        reason: Reason,
    ) -> Result<Option<(Status, JobExecution)>> {
        let execution = self.load_execution(id).await?;
        if !execution.status.is_running() {
            return Ok(None);
        }
        let job = self
            .store
            .get_job(execution.job_id)
            .await?
            .ok_or_else(|| Error::not_found("job", execution.job_id))?;
        let now = Utc::now();

        let mut batch = Vec::new();
        for mut step in self.store.list_step_executions(id).await? {
            if step.status.is_completed() {
                continue;
            }
            step.status = Status::Skipped;
            step.completed_at = Some(now);
            batch.push(Mutation::UpdateStepExecution(step));
        }
        let previous = execution.status;
        let (execution, mutations) =
            job_transition(execution, &job, Status::Failed, Some(reason), now)?;
        batch.extend(mutations);
        self.store.apply(batch).await?;
        Ok(Some((previous, execution)))
    }

    /// Archive logs and let dependents of a finished execution move on.
    /// Failures here never fail the status write that triggered them.
    async fn after_completion(&self, execution: &JobExecution) {
        if let Err(e) = self.logs.archive(execution.id).await {
            warn!(job_execution_id = %execution.id, error = %e, "Failed to archive logs");
        }
        if let Err(e) = self.dispatch_pipeline(execution.pipeline_id).await {
            warn!(
                pipeline_id = %execution.pipeline_id,
                error = %e,
                "Failed to dispatch dependents"
            );
        }
    }

    pub(crate) async fn acquire_update_lock(&self, id: JobExecutionId, holder: &str) -> Result<()> {
        let key = update_lock_key(id);
        if self
            .locker
            .lock(&key, holder, self.config.update_lock_ttl())
            .await?
        {
            Ok(())
        } else {
            Err(Error::LockContention(key))
        }
    }

    pub(crate) async fn release_update_lock(&self, id: JobExecutionId) {
        if let Err(e) = self.locker.unlock(&update_lock_key(id)).await {
            warn!(job_execution_id = %id, error = %e, "Failed to release update lock");
        }
    }

    async fn release_all(&self, ids: &[JobExecutionId]) {
        for id in ids {
            self.release_update_lock(*id).await;
        }
    }

    async fn load_execution(&self, id: JobExecutionId) -> Result<JobExecution> {
        self.store
            .get_job_execution(id)
            .await?
            .ok_or_else(|| Error::not_found("job execution", id))
    }

    fn emit_job_event(&self, previous: Status, execution: &JobExecution) {
        self.emit(Event::JobExecutionUpdated(JobExecutionUpdatedPayload {
            job_execution_id: execution.id,
            job_id: execution.job_id,
            pipeline_id: execution.pipeline_id,
            previous,
            status: execution.status,
            reason: execution.reason.clone(),
            updated_at: Utc::now(),
        }));
    }

    /// Fire and forget.
    fn emit(&self, event: Event) {
        let events = Arc::clone(&self.events);
        tokio::spawn(async move {
            let subject = event.subject();
            if let Err(e) = events.publish(event).await {
                warn!(subject = %subject, error = %e, "Failed to publish event");
            }
        });
    }
}

/// Apply a status change to an execution and build the store batch that
/// keeps the job queue consistent with it.
fn job_transition(
    mut execution: JobExecution,
    job: &Job,
    to: Status,
    reason: Option<Reason>,
    now: DateTime<Utc>,
) -> Result<(JobExecution, Vec<Mutation>)> {
    let from = execution.status;
    if !check_job_status(from, to) {
        return Err(Error::InvalidTransition { from, to });
    }
    // A completed execution keeps the reason it finished with.
    if from.is_completed() {
        return Ok((execution, Vec::new()));
    }

    let mut batch = Vec::with_capacity(2);
    if from != to {
        if to.is_completed() {
            batch.push(Mutation::Dequeue(execution.id));
        } else if to == Status::Queued {
            batch.push(Mutation::Enqueue {
                job_execution_id: execution.id,
                label: job.runs_on.label.clone(),
                status: to,
            });
        } else {
            batch.push(Mutation::UpdateQueueStatus {
                job_execution_id: execution.id,
                status: to,
            });
        }

        match to {
            Status::Preparing => execution.last_heartbeat_at = Some(now),
            Status::Running => execution.started_at = Some(now),
            s if s.is_completed() => execution.completed_at = Some(now),
            _ => {}
        }
    }

    execution.status = to;
    if reason.is_some() {
        execution.reason = reason;
    }
    batch.push(Mutation::UpdateJobExecution(execution.clone()));
    Ok((execution, batch))
}
