//! End-to-end pipeline tests: server, agent and shell sandbox in one process.

#![cfg(unix)]

use futures::StreamExt;
use pretty_assertions::assert_eq;
use runnel_core::Status;
use runnel_core::events::Event;
use runnel_core::model::{FailedReason, UpdateJobExecution};
use runnel_core::ports::{EventBus, ServerApi};
use runnel_scheduler::SchedulerConfig;
use runnel_tests::{LABEL, PipelineFixture, TestContext, wait_for, within};
use std::collections::HashMap;
use std::time::Duration;

#[tokio::test]
async fn test_single_step_succeeds_with_logs() {
    let ctx = TestContext::new().unwrap();
    let created = ctx
        .server
        .create_pipeline(PipelineFixture::single("echo hello && echo world"))
        .await
        .unwrap();

    let finished = ctx.run_until_idle(LABEL).await.unwrap();
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].status, Status::Succeeded);

    let execution = ctx.latest_execution(created.jobs[0].id).await.unwrap();
    assert_eq!(execution.status, Status::Succeeded);
    assert!(execution.started_at.is_some());
    assert!(execution.completed_at.is_some());

    let steps = ctx.step_executions(execution.id).await.unwrap();
    assert_eq!(steps[0].status, Status::Succeeded);
    assert_eq!(steps[0].exit_code, Some(0));

    assert_eq!(
        ctx.log_output(execution.id, "run").await.unwrap(),
        vec!["+ echo hello && echo world", "hello", "world"]
    );
}

#[tokio::test]
async fn test_job_and_step_env_reach_the_command() {
    let ctx = TestContext::new().unwrap();
    let mut step = PipelineFixture::step("greet", &["echo \"$GREETING $TARGET\""]);
    step.env = HashMap::from([("TARGET".to_string(), "world".to_string())]);
    let mut job = PipelineFixture::job("build", &[], vec![step]);
    job.env = HashMap::from([("GREETING".to_string(), "hello".to_string())]);
    let created = ctx
        .server
        .create_pipeline(runnel_core::model::PipelineDefinition { jobs: vec![job] })
        .await
        .unwrap();

    ctx.run_until_idle(LABEL).await.unwrap();
    let execution = ctx.latest_execution(created.jobs[0].id).await.unwrap();
    let output = ctx.log_output(execution.id, "greet").await.unwrap();
    assert_eq!(output.last().map(String::as_str), Some("hello world"));
}

#[tokio::test]
async fn test_dependent_jobs_run_after_success() {
    let ctx = TestContext::new().unwrap();
    let created = ctx
        .server
        .create_pipeline(PipelineFixture::diamond("echo building"))
        .await
        .unwrap();

    let finished = ctx.run_until_idle(LABEL).await.unwrap();
    assert_eq!(finished.len(), 4);
    assert_eq!(finished[0].job_id, created.jobs[0].id);
    for job in &created.jobs {
        let execution = ctx.latest_execution(job.id).await.unwrap();
        assert_eq!(execution.status, Status::Succeeded, "job {}", job.name);
    }
}

#[tokio::test]
async fn test_failed_job_skips_dependents() {
    let ctx = TestContext::new().unwrap();
    let created = ctx
        .server
        .create_pipeline(PipelineFixture::diamond("exit 3"))
        .await
        .unwrap();

    let finished = ctx.run_until_idle(LABEL).await.unwrap();
    assert_eq!(finished.len(), 1);

    let build = ctx.latest_execution(created.jobs[0].id).await.unwrap();
    assert_eq!(build.status, Status::Failed);
    assert_eq!(
        build.reason.as_ref().map(|r| r.reason),
        Some(FailedReason::StepFailed)
    );
    let steps = ctx.step_executions(build.id).await.unwrap();
    assert_eq!(steps[0].exit_code, Some(3));

    for job in &created.jobs[1..] {
        let execution = ctx.latest_execution(job.id).await.unwrap();
        assert_eq!(execution.status, Status::Skipped, "job {}", job.name);
    }
}

#[tokio::test]
async fn test_skipped_jobs_are_published() {
    let ctx = TestContext::new().unwrap();
    let events = ctx
        .server
        .events()
        .subscribe("job_execution.skipped.*")
        .await
        .unwrap();
    let created = ctx
        .server
        .create_pipeline(PipelineFixture::diamond("exit 3"))
        .await
        .unwrap();
    ctx.run_until_idle(LABEL).await.unwrap();

    let skipped: Vec<Event> = within(
        Duration::from_secs(3),
        "skipped events",
        events.take(3).map(|e| e.unwrap()).collect(),
    )
    .await
    .unwrap();
    let mut skipped_jobs: Vec<_> = skipped
        .into_iter()
        .map(|event| match event {
            Event::JobExecutionUpdated(update) => update.job_id,
            other => panic!("unexpected event {other:?}"),
        })
        .collect();
    skipped_jobs.sort();
    let mut expected: Vec<_> = created.jobs[1..].iter().map(|j| j.id).collect();
    expected.sort();
    assert_eq!(skipped_jobs, expected);
}

#[tokio::test]
async fn test_failed_step_skips_later_steps() {
    let ctx = TestContext::new().unwrap();
    let job = PipelineFixture::job(
        "build",
        &[],
        vec![
            PipelineFixture::step("first", &["echo one"]),
            PipelineFixture::step("second", &["false"]),
            PipelineFixture::step("third", &["echo three"]),
        ],
    );
    let created = ctx
        .server
        .create_pipeline(runnel_core::model::PipelineDefinition { jobs: vec![job] })
        .await
        .unwrap();

    ctx.run_until_idle(LABEL).await.unwrap();
    let execution = ctx.latest_execution(created.jobs[0].id).await.unwrap();
    assert_eq!(execution.status, Status::Failed);

    let statuses: HashMap<_, _> = ctx
        .step_executions(execution.id)
        .await
        .unwrap()
        .into_iter()
        .map(|s| (s.step_id, s.status))
        .collect();
    let steps = &created.jobs[0].steps;
    assert_eq!(statuses[&steps[0].id], Status::Succeeded);
    assert_eq!(statuses[&steps[1].id], Status::Failed);
    assert_eq!(statuses[&steps[2].id], Status::Skipped);
}

#[tokio::test]
async fn test_job_timeout() {
    let ctx = TestContext::new().unwrap();
    let mut definition = PipelineFixture::single("sleep 5");
    definition.jobs[0].timeout_secs = 1;
    let created = ctx.server.create_pipeline(definition).await.unwrap();

    let finished = within(Duration::from_secs(4), "timed out job", ctx.run_until_idle(LABEL))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(finished[0].status, Status::Failed);

    let execution = ctx.latest_execution(created.jobs[0].id).await.unwrap();
    assert_eq!(
        execution.reason.map(|r| r.reason),
        Some(FailedReason::Timeout)
    );
    let steps = ctx.step_executions(execution.id).await.unwrap();
    assert_eq!(steps[0].status, Status::Failed);
}

#[tokio::test]
async fn test_job_is_claimed_once() {
    let ctx = TestContext::new().unwrap();
    ctx.server
        .create_pipeline(PipelineFixture::single("true"))
        .await
        .unwrap();

    let (a, b) = tokio::join!(
        ctx.server.request_job(LABEL),
        ctx.server.request_job(LABEL)
    );
    let claims = [a.unwrap(), b.unwrap()];
    assert_eq!(claims.iter().filter(|c| c.is_some()).count(), 1);
    assert!(ctx.server.request_job(LABEL).await.unwrap().is_none());
    assert!(ctx.server.request_job("elsewhere").await.unwrap().is_none());
}

#[tokio::test]
async fn test_cancel_running_job() {
    let ctx = TestContext::new().unwrap();
    let created = ctx
        .server
        .create_pipeline(PipelineFixture::single("sleep 5"))
        .await
        .unwrap();
    let job_id = created.jobs[0].id;

    let agent = ctx.agent(LABEL);
    let running = tokio::spawn(async move { agent.run_once().await });

    let server = ctx.server.clone();
    let step_running = wait_for(Duration::from_secs(3), Duration::from_millis(20), || {
        let server = server.clone();
        async move {
            let Ok(executions) = server.list_job_executions(job_id).await else {
                return false;
            };
            let Some(execution) = executions.last() else {
                return false;
            };
            server
                .list_step_executions(execution.id)
                .await
                .map(|steps| steps.iter().any(|s| s.status == Status::Running))
                .unwrap_or(false)
        }
    })
    .await;
    assert!(step_running);

    let execution = ctx.latest_execution(job_id).await.unwrap();
    let canceling = ctx.server.cancel_job_execution(execution.id).await.unwrap();
    assert_eq!(canceling.status, Status::Canceling);

    let finished = within(Duration::from_secs(3), "cancelled job", running)
        .await
        .unwrap()
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(finished.status, Status::Failed);
    assert_eq!(
        finished.reason.map(|r| r.reason),
        Some(FailedReason::Cancelled)
    );
}

#[tokio::test]
async fn test_silent_agent_is_reaped() {
    let ctx = TestContext::with_config(SchedulerConfig {
        heartbeat_timeout_secs: 1,
        ..Default::default()
    })
    .unwrap();
    let created = ctx
        .server
        .create_pipeline(PipelineFixture::single("true"))
        .await
        .unwrap();

    let claimed = ctx.server.request_job(LABEL).await.unwrap().unwrap();
    ctx.server
        .update_job_execution(UpdateJobExecution {
            id: claimed.execution.id,
            status: Status::Preparing,
            reason: None,
        })
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(ctx.server.reaper().recycle_heartbeat_timeouts().await.unwrap(), 1);

    let execution = ctx.latest_execution(created.jobs[0].id).await.unwrap();
    assert_eq!(execution.status, Status::Failed);
    assert_eq!(
        execution.reason.map(|r| r.reason),
        Some(FailedReason::HeartbeatTimeout)
    );
    let steps = ctx.step_executions(execution.id).await.unwrap();
    assert_eq!(steps[0].status, Status::Skipped);
}
