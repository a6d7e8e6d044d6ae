//! Job-lifetime monitors and the shared abort signal they trip.

use runnel_core::Status;
use runnel_core::ids::JobExecutionId;
use runnel_core::model::FailedReason;
use runnel_core::ports::ServerApi;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Why a job stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AbortReason {
    Timeout = 1,
    HeartbeatTimeout = 2,
    Cancelled = 3,
    ExecutorDown = 4,
}

impl AbortReason {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Timeout),
            2 => Some(Self::HeartbeatTimeout),
            3 => Some(Self::Cancelled),
            4 => Some(Self::ExecutorDown),
            _ => None,
        }
    }

    pub fn failed_reason(self) -> FailedReason {
        match self {
            Self::Timeout => FailedReason::Timeout,
            Self::HeartbeatTimeout => FailedReason::HeartbeatTimeout,
            Self::Cancelled => FailedReason::Cancelled,
            Self::ExecutorDown => FailedReason::ExecutorDown,
        }
    }
}

/// Cancellation token plus the reason of whoever tripped it first.
#[derive(Debug, Default)]
pub struct Abort {
    reason: AtomicU8,
    token: CancellationToken,
}

impl Abort {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `reason` unless another one is already set, then cancel.
    /// Returns whether this call set the reason.
    pub fn abort(&self, reason: AbortReason) -> bool {
        let first = self
            .reason
            .compare_exchange(0, reason as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        self.token.cancel();
        first
    }

    pub fn reason(&self) -> Option<AbortReason> {
        AbortReason::from_u8(self.reason.load(Ordering::SeqCst))
    }

    pub fn is_aborted(&self) -> bool {
        self.reason().is_some()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// Fire once `timeout` has passed, unless stopped first.
pub async fn monitor_timeout(abort: Arc<Abort>, timeout: Duration, stop: CancellationToken) {
    tokio::select! {
        _ = sleep(timeout) => {
            info!(timeout_secs = timeout.as_secs(), "Job timed out");
            abort.abort(AbortReason::Timeout);
        }
        _ = stop.cancelled() => {}
    }
}

/// Heartbeat settings for [`monitor_heartbeat`].
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatSettings {
    pub interval: Duration,
    pub max_failure: Duration,
}

/// Send a heartbeat every interval. Aborts when heartbeats keep failing for
/// longer than `max_failure`, or when the server reports the execution as
/// canceling or already finished.
pub async fn monitor_heartbeat(
    server: Arc<dyn ServerApi>,
    job_execution_id: JobExecutionId,
    abort: Arc<Abort>,
    settings: HeartbeatSettings,
    stop: CancellationToken,
) {
    let mut ticker = interval_at(Instant::now() + settings.interval, settings.interval);
    let mut last_heartbeat = Instant::now();

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop.cancelled() => return,
        }
        match server.heartbeat(job_execution_id).await {
            Ok(status) => {
                last_heartbeat = Instant::now();
                debug!(job_execution_id = %job_execution_id, status = %status, "Heartbeat sent");
                if (status == Status::Canceling || status.is_completed())
                    && abort.abort(AbortReason::Cancelled)
                {
                    info!(job_execution_id = %job_execution_id, status = %status, "Job cancelled by server");
                }
            }
            Err(e) => {
                warn!(job_execution_id = %job_execution_id, error = %e, "Failed to send heartbeat");
                if last_heartbeat.elapsed() > settings.max_failure {
                    error!(
                        job_execution_id = %job_execution_id,
                        failing_secs = last_heartbeat.elapsed().as_secs(),
                        "Heartbeats keep failing, stopping execution"
                    );
                    abort.abort(AbortReason::HeartbeatTimeout);
                }
            }
        }
    }
}

/// The monitors running for one job.
pub struct Monitors {
    stop: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl Monitors {
    /// Start the heartbeat monitor and, for a positive `job_timeout`, the
    /// timeout monitor.
    pub fn start(
        server: Arc<dyn ServerApi>,
        job_execution_id: JobExecutionId,
        abort: Arc<Abort>,
        job_timeout: Duration,
        heartbeat: HeartbeatSettings,
    ) -> Self {
        let stop = CancellationToken::new();
        let mut handles = Vec::with_capacity(2);
        if !job_timeout.is_zero() {
            handles.push(tokio::spawn(monitor_timeout(
                Arc::clone(&abort),
                job_timeout,
                stop.clone(),
            )));
        }
        handles.push(tokio::spawn(monitor_heartbeat(
            server,
            job_execution_id,
            abort,
            heartbeat,
            stop.clone(),
        )));
        Self { stop, handles }
    }

    pub async fn stop(self) {
        self.stop.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Monitor task failed");
            }
        }
    }
}
