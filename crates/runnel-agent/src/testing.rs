//! In-process fakes of the server and the sandbox for agent tests.

use async_trait::async_trait;
use futures::stream;
use parking_lot::Mutex;
use runnel_core::ids::*;
use runnel_core::model::*;
use runnel_core::ports::*;
use runnel_core::{Error, Result, Status};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Default)]
pub struct FakeServer {
    jobs: Mutex<VecDeque<ClaimedJob>>,
    executions: Mutex<HashMap<JobExecutionId, JobExecution>>,
    steps: Mutex<HashMap<StepExecutionId, StepExecution>>,
    job_updates: Mutex<Vec<UpdateJobExecution>>,
    step_updates: Mutex<Vec<UpdateStepExecution>>,
    logs: Mutex<Vec<(String, LogLine)>>,
    upload_calls: AtomicUsize,
    fail_uploads: AtomicBool,
    fail_heartbeats: AtomicBool,
    heartbeat_status: Mutex<Option<Status>>,
    heartbeat_calls: AtomicUsize,
    step_update_failures: AtomicUsize,
}

impl FakeServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a claimable job.
    pub fn push_job(&self, claimed: ClaimedJob) {
        self.executions
            .lock()
            .insert(claimed.execution.id, claimed.execution.clone());
        let mut steps = self.steps.lock();
        for step in &claimed.step_executions {
            steps.insert(step.id, step.clone());
        }
        self.jobs.lock().push_back(claimed);
    }

    pub fn fail_uploads(&self, fail: bool) {
        self.fail_uploads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_heartbeats(&self, fail: bool) {
        self.fail_heartbeats.store(fail, Ordering::SeqCst);
    }

    /// Status answered to heartbeats instead of the stored one.
    pub fn set_heartbeat_status(&self, status: Status) {
        *self.heartbeat_status.lock() = Some(status);
    }

    /// Fail the next `count` step updates with a transport error.
    pub fn fail_next_step_updates(&self, count: usize) {
        self.step_update_failures.store(count, Ordering::SeqCst);
    }

    pub fn heartbeats(&self) -> usize {
        self.heartbeat_calls.load(Ordering::SeqCst)
    }

    pub fn uploads(&self) -> usize {
        self.upload_calls.load(Ordering::SeqCst)
    }

    pub fn log_lines(&self, name: &str) -> Vec<LogLine> {
        self.logs
            .lock()
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, line)| line.clone())
            .collect()
    }

    pub fn log_output(&self, name: &str) -> Vec<String> {
        self.log_lines(name).into_iter().map(|l| l.output).collect()
    }

    pub fn job_statuses(&self) -> Vec<Status> {
        self.job_updates.lock().iter().map(|u| u.status).collect()
    }

    pub fn last_job_update(&self) -> Option<UpdateJobExecution> {
        self.job_updates.lock().last().cloned()
    }

    pub fn step(&self, id: StepExecutionId) -> Option<StepExecution> {
        self.steps.lock().get(&id).cloned()
    }

    /// Statuses written to one step execution, in order.
    pub fn step_statuses(&self, id: StepExecutionId) -> Vec<Status> {
        self.step_updates
            .lock()
            .iter()
            .filter(|u| u.id == id)
            .map(|u| u.status)
            .collect()
    }
}

#[async_trait]
impl ServerApi for FakeServer {
    async fn request_job(&self, _label: &str) -> Result<Option<ClaimedJob>> {
        Ok(self.jobs.lock().pop_front())
    }

    async fn update_job_execution(&self, update: UpdateJobExecution) -> Result<JobExecution> {
        let mut executions = self.executions.lock();
        let execution = executions
            .get_mut(&update.id)
            .ok_or_else(|| Error::not_found("job execution", update.id))?;
        execution.status = update.status;
        if update.reason.is_some() {
            execution.reason = update.reason.clone();
        }
        self.job_updates.lock().push(update);
        Ok(execution.clone())
    }

    async fn update_step_execution(&self, update: UpdateStepExecution) -> Result<StepExecution> {
        let failures = self.step_update_failures.load(Ordering::SeqCst);
        if failures > 0 {
            self.step_update_failures.store(failures - 1, Ordering::SeqCst);
            return Err(Error::Transport("server unavailable".into()));
        }
        let mut steps = self.steps.lock();
        let step = steps
            .get_mut(&update.id)
            .ok_or_else(|| Error::not_found("step execution", update.id))?;
        step.status = update.status;
        if update.exit_code.is_some() {
            step.exit_code = update.exit_code;
        }
        self.step_updates.lock().push(update);
        Ok(step.clone())
    }

    async fn upload_log_lines(
        &self,
        _job_execution_id: JobExecutionId,
        name: &str,
        lines: Vec<LogLine>,
    ) -> Result<()> {
        self.upload_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(Error::Transport("upload refused".into()));
        }
        self.logs
            .lock()
            .extend(lines.into_iter().map(|l| (name.to_string(), l)));
        Ok(())
    }

    async fn heartbeat(&self, job_execution_id: JobExecutionId) -> Result<Status> {
        self.heartbeat_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_heartbeats.load(Ordering::SeqCst) {
            return Err(Error::Transport("heartbeat refused".into()));
        }
        if let Some(status) = *self.heartbeat_status.lock() {
            return Ok(status);
        }
        self.executions
            .lock()
            .get(&job_execution_id)
            .map(|e| e.status)
            .ok_or_else(|| Error::not_found("job execution", job_execution_id))
    }

    async fn cancel_job_execution(&self, id: JobExecutionId) -> Result<JobExecution> {
        Err(Error::not_found("job execution", id))
    }
}

/// What a fake command does once started.
#[derive(Debug, Clone)]
pub enum Behavior {
    Exit { output: String, code: i32 },
    /// Never finishes on its own.
    Hang,
    FailStart,
    FailWait,
}

/// Sandbox whose steps follow scripted behaviors, keyed by step name.
pub struct FakeSandbox {
    os: String,
    behaviors: HashMap<String, Behavior>,
    fail_start: bool,
    ping_ok: AtomicBool,
    started: AtomicBool,
    stopped: AtomicBool,
    commands: Arc<Mutex<Vec<(String, StartCommand)>>>,
}

impl FakeSandbox {
    pub fn new(behaviors: impl IntoIterator<Item = (&'static str, Behavior)>) -> Self {
        Self {
            os: "linux".into(),
            behaviors: behaviors
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
            fail_start: false,
            ping_ok: AtomicBool::new(true),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            commands: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_os(mut self, os: &str) -> Self {
        self.os = os.to_string();
        self
    }

    pub fn failing_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    pub fn set_ping_ok(&self, ok: bool) {
        self.ping_ok.store(ok, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Started commands as (step name, command).
    pub fn commands(&self) -> Vec<(String, StartCommand)> {
        self.commands.lock().clone()
    }
}

#[async_trait]
impl Sandbox for FakeSandbox {
    async fn start(&self) -> Result<()> {
        if self.fail_start {
            return Err(Error::Sandbox("no capacity".into()));
        }
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn executor(&self, step: &Step) -> Result<Arc<dyn Executor>> {
        let behavior = self
            .behaviors
            .get(&step.name)
            .cloned()
            .unwrap_or(Behavior::Exit {
                output: String::new(),
                code: 0,
            });
        Ok(Arc::new(FakeExecutor {
            step: step.name.clone(),
            os: self.os.clone(),
            behavior,
            sandbox_ping: self.ping_ok.load(Ordering::SeqCst),
            commands: Arc::clone(&self.commands),
        }))
    }
}

struct FakeExecutor {
    step: String,
    os: String,
    behavior: Behavior,
    sandbox_ping: bool,
    commands: Arc<Mutex<Vec<(String, StartCommand)>>>,
}

#[async_trait]
impl Executor for FakeExecutor {
    async fn ping(&self) -> Result<()> {
        if self.sandbox_ping {
            Ok(())
        } else {
            Err(Error::Transport("executor unreachable".into()))
        }
    }

    async fn runtime_info(&self) -> Result<RuntimeInfo> {
        Ok(RuntimeInfo {
            os: self.os.clone(),
            arch: "x86_64".into(),
        })
    }

    async fn environment(&self) -> Result<Vec<String>> {
        Ok(vec!["PATH=/usr/bin:/bin".into()])
    }

    async fn start_command(&self, command: StartCommand) -> Result<String> {
        if matches!(self.behavior, Behavior::FailStart) {
            return Err(Error::Transport("connection reset".into()));
        }
        self.commands.lock().push((self.step.clone(), command));
        Ok(format!("cmd-{}", self.step))
    }

    async fn wait_command(&self, _command_id: &str, timeout: Duration) -> Result<CommandStatus> {
        match &self.behavior {
            Behavior::Exit { code, .. } => Ok(CommandStatus {
                exit: true,
                exit_code: *code,
            }),
            Behavior::Hang => {
                tokio::time::sleep(timeout).await;
                Ok(CommandStatus {
                    exit: false,
                    exit_code: 0,
                })
            }
            Behavior::FailWait => Err(Error::Transport("connection reset".into())),
            Behavior::FailStart => Err(Error::Internal("not started".into())),
        }
    }

    async fn command_log(&self, _command_id: &str) -> Result<CommandLogStream> {
        let chunks = match &self.behavior {
            Behavior::Exit { output, .. } => vec![Ok(output.clone().into_bytes())],
            _ => Vec::new(),
        };
        Ok(Box::pin(stream::iter(chunks)))
    }
}

pub struct FakeProvider {
    sandbox: Arc<FakeSandbox>,
}

impl FakeProvider {
    pub fn new(sandbox: Arc<FakeSandbox>) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl SandboxProvider for FakeProvider {
    async fn create(&self, _job: &Job) -> Result<Arc<dyn Sandbox>> {
        Ok(self.sandbox.clone())
    }
}

/// A claimed job whose steps run in declaration order unless `depends`
/// lists explicit dependencies as (step, dependencies).
pub fn claimed_job(
    steps: &[&str],
    depends: &[(&str, &[&str])],
    timeout_secs: u64,
) -> ClaimedJob {
    let now = chrono::Utc::now();
    let job_id = JobId::new();
    let steps: Vec<Step> = steps
        .iter()
        .map(|name| Step {
            id: StepId::new(),
            job_id,
            name: name.to_string(),
            depends_on: depends
                .iter()
                .find(|(step, _)| step == name)
                .map(|(_, deps)| deps.iter().map(|d| d.to_string()).collect())
                .unwrap_or_default(),
            commands: vec![format!("echo {name}")],
            working_directory: None,
            env: HashMap::from([("STEP".to_string(), name.to_string())]),
            user: None,
            created_at: now,
        })
        .collect();
    let job = Job {
        id: job_id,
        pipeline_id: PipelineId::new(),
        name: "job".into(),
        depends_on: vec![],
        runs_on: RunsOn {
            label: "linux".into(),
        },
        working_directory: None,
        env: HashMap::new(),
        timeout_secs,
        steps,
        created_at: now,
    };
    let mut execution = JobExecution::new(&job);
    execution.status = Status::Queued;
    let step_executions = job
        .steps
        .iter()
        .map(|s| StepExecution::new(s, execution.id))
        .collect();
    ClaimedJob {
        job,
        execution,
        step_executions,
    }
}
