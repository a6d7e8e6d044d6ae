//! Pipeline creation.

use crate::dispatch::DispatchService;
use chrono::Utc;
use runnel_core::dag::Dag;
use runnel_core::events::{Event, PipelineCreatedPayload};
use runnel_core::ids::*;
use runnel_core::model::*;
use runnel_core::ports::{EventBus, Mutation, Store};
use runnel_core::{Error, Result};
use std::sync::Arc;
use tracing::{info, warn};

/// A freshly created pipeline with its jobs and their first executions.
#[derive(Debug, Clone)]
pub struct CreatedPipeline {
    pub pipeline: Pipeline,
    pub jobs: Vec<Job>,
    pub executions: Vec<JobExecution>,
}

pub struct PipelineService {
    store: Arc<dyn Store>,
    dispatch: Arc<DispatchService>,
    events: Arc<dyn EventBus>,
}

impl PipelineService {
    pub fn new(
        store: Arc<dyn Store>,
        dispatch: Arc<DispatchService>,
        events: Arc<dyn EventBus>,
    ) -> Self {
        Self {
            store,
            dispatch,
            events,
        }
    }

    /// Validate and persist a pipeline, then dispatch its root jobs.
    ///
    /// Nothing is stored when the job graph or any step graph is invalid.
    pub async fn create_pipeline(&self, definition: PipelineDefinition) -> Result<CreatedPipeline> {
        validate(&definition)?;

        let now = Utc::now();
        let pipeline = Pipeline {
            id: PipelineId::new(),
            created_at: now,
            updated_at: now,
        };
        let mut batch = vec![Mutation::CreatePipeline(pipeline.clone())];
        let mut jobs = Vec::with_capacity(definition.jobs.len());
        let mut executions = Vec::with_capacity(definition.jobs.len());
        let mut step_executions = Vec::new();

        for job_def in definition.jobs {
            let job_id = JobId::new();
            let steps = job_def
                .steps
                .into_iter()
                .map(|s| Step {
                    id: StepId::new(),
                    job_id,
                    name: s.name,
                    depends_on: s.depends_on,
                    commands: s.commands,
                    working_directory: s.working_directory,
                    env: s.env,
                    user: s.user,
                    created_at: now,
                })
                .collect();
            let job = Job {
                id: job_id,
                pipeline_id: pipeline.id,
                name: job_def.name,
                depends_on: job_def.depends_on,
                runs_on: job_def.runs_on,
                working_directory: job_def.working_directory,
                env: job_def.env,
                timeout_secs: job_def.timeout_secs,
                steps,
                created_at: now,
            };
            let execution = JobExecution::new(&job);
            step_executions.extend(job.steps.iter().map(|s| StepExecution::new(s, execution.id)));
            jobs.push(job);
            executions.push(execution);
        }

        batch.extend(jobs.iter().cloned().map(Mutation::CreateJob));
        batch.extend(executions.iter().cloned().map(Mutation::CreateJobExecution));
        batch.extend(step_executions.into_iter().map(Mutation::CreateStepExecution));
        self.store.apply(batch).await?;

        info!(pipeline_id = %pipeline.id, jobs = jobs.len(), "Pipeline created");
        if let Err(e) = self
            .events
            .publish(Event::PipelineCreated(PipelineCreatedPayload {
                pipeline_id: pipeline.id,
                job_count: jobs.len(),
                created_at: now,
            }))
            .await
        {
            warn!(pipeline_id = %pipeline.id, error = %e, "Failed to publish event");
        }

        let dispatched = self.dispatch.dispatch_pipeline(pipeline.id).await?;
        for updated in dispatched {
            if let Some(slot) = executions.iter_mut().find(|e| e.id == updated.id) {
                *slot = updated;
            }
        }

        Ok(CreatedPipeline {
            pipeline,
            jobs,
            executions,
        })
    }
}

/// Reject definitions that could never run.
pub fn validate(definition: &PipelineDefinition) -> Result<()> {
    if definition.jobs.is_empty() {
        return Err(Error::InvalidPipeline("pipeline has no jobs".into()));
    }
    Dag::build(definition.jobs.iter().cloned())?;
    for job in &definition.jobs {
        if job.steps.is_empty() {
            return Err(Error::InvalidPipeline(format!("job {} has no steps", job.name)));
        }
        if job.runs_on.label.is_empty() {
            return Err(Error::InvalidPipeline(format!("job {} has no runs_on label", job.name)));
        }
        job.step_dag()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn step(name: &str, depends_on: &[&str]) -> StepDefinition {
        StepDefinition {
            name: name.into(),
            depends_on: depends_on.iter().map(|d| d.to_string()).collect(),
            commands: vec!["true".into()],
            working_directory: None,
            env: HashMap::new(),
            user: None,
        }
    }

    fn job(name: &str, depends_on: &[&str], steps: Vec<StepDefinition>) -> JobDefinition {
        JobDefinition {
            name: name.into(),
            depends_on: depends_on.iter().map(|d| d.to_string()).collect(),
            runs_on: RunsOn {
                label: "linux".into(),
            },
            working_directory: None,
            env: HashMap::new(),
            timeout_secs: 0,
            steps,
        }
    }

    #[test]
    fn test_validate_rejects_bad_graphs() {
        let cyclic = PipelineDefinition {
            jobs: vec![
                job("a", &["b"], vec![step("s", &[])]),
                job("b", &["a"], vec![step("s", &[])]),
            ],
        };
        assert!(matches!(validate(&cyclic), Err(Error::Graph(_))));

        let bad_steps = PipelineDefinition {
            jobs: vec![job("a", &[], vec![step("s", &["missing"])])],
        };
        assert!(matches!(validate(&bad_steps), Err(Error::Graph(_))));

        let empty = PipelineDefinition { jobs: vec![] };
        assert!(matches!(validate(&empty), Err(Error::InvalidPipeline(_))));
    }

    #[test]
    fn test_validate_accepts_dag() {
        let definition = PipelineDefinition {
            jobs: vec![
                job("build", &[], vec![step("a", &[]), step("b", &[])]),
                job("test", &["build"], vec![step("a", &[])]),
            ],
        };
        assert!(validate(&definition).is_ok());
    }
}
