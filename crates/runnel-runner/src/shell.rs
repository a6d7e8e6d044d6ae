//! Host sandbox: steps run as child processes of the agent.

use async_trait::async_trait;
use futures::stream;
use parking_lot::Mutex;
use runnel_core::model::{Job, Step};
use runnel_core::ports::{
    CommandLogStream, CommandStatus, Executor, RuntimeInfo, Sandbox, SandboxProvider, StartCommand,
};
use runnel_core::{Error, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const READ_CHUNK: usize = 4096;

/// Creates one [`ShellSandbox`] per job.
#[derive(Debug, Clone, Default)]
pub struct ShellProvider {
    workspace: Option<PathBuf>,
}

impl ShellProvider {
    /// Jobs without a working directory run under `workspace`.
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: Some(workspace.into()),
        }
    }
}

#[async_trait]
impl SandboxProvider for ShellProvider {
    async fn create(&self, job: &Job) -> Result<Arc<dyn Sandbox>> {
        let dir = job
            .working_directory
            .as_ref()
            .map(PathBuf::from)
            .or_else(|| self.workspace.clone());
        Ok(Arc::new(ShellSandbox::new(dir)))
    }
}

pub struct ShellSandbox {
    dir: Option<PathBuf>,
    executor: Arc<ShellExecutor>,
}

impl ShellSandbox {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self {
            executor: Arc::new(ShellExecutor::new(dir.clone())),
            dir,
        }
    }
}

#[async_trait]
impl Sandbox for ShellSandbox {
    async fn start(&self) -> Result<()> {
        if let Some(dir) = &self.dir {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| Error::Sandbox(format!("Failed to create {}: {e}", dir.display())))?;
        }
        info!(dir = ?self.dir, "Shell sandbox started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let killed = self.executor.kill_all();
        info!(killed, "Shell sandbox stopped");
        Ok(())
    }

    async fn executor(&self, _step: &Step) -> Result<Arc<dyn Executor>> {
        Ok(self.executor.clone())
    }
}

struct RunningCommand {
    exit: watch::Receiver<Option<i32>>,
    log: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
    kill: Option<oneshot::Sender<()>>,
}

/// Runs commands on the host through `tokio::process`.
pub struct ShellExecutor {
    dir: Option<PathBuf>,
    commands: Mutex<HashMap<String, RunningCommand>>,
    stopped: AtomicBool,
}

impl ShellExecutor {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self {
            dir,
            commands: Mutex::new(HashMap::new()),
            stopped: AtomicBool::new(false),
        }
    }

    /// Kill every command still running. Returns how many were signalled.
    pub fn kill_all(&self) -> usize {
        self.stopped.store(true, Ordering::SeqCst);
        let mut commands = self.commands.lock();
        commands
            .values_mut()
            .filter_map(|c| c.kill.take())
            .map(|kill| kill.send(()).is_ok())
            .filter(|sent| *sent)
            .count()
    }

    fn ensure_running(&self) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(Error::Sandbox("sandbox is stopped".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Executor for ShellExecutor {
    async fn ping(&self) -> Result<()> {
        self.ensure_running()
    }

    async fn runtime_info(&self) -> Result<RuntimeInfo> {
        Ok(RuntimeInfo {
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
        })
    }

    async fn environment(&self) -> Result<Vec<String>> {
        Ok(std::env::vars().map(|(k, v)| format!("{k}={v}")).collect())
    }

    async fn start_command(&self, command: StartCommand) -> Result<String> {
        self.ensure_running()?;
        let (program, args) = command
            .commands
            .split_first()
            .ok_or_else(|| Error::Sandbox("empty command".into()))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .env_clear()
            .envs(command.env.iter().filter_map(|pair| pair.split_once('=')))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = command.dir.as_ref().map(PathBuf::from).or_else(|| self.dir.clone()) {
            cmd.current_dir(dir);
        }
        if let Some(user) = &command.user {
            warn!(user = %user, "Shell sandbox runs commands as the agent user");
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Sandbox(format!("Failed to spawn {program}: {e}")))?;

        let (log_tx, log_rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward(stdout, log_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward(stderr, log_tx));
        }

        let id = Uuid::new_v4().to_string();
        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let task_id = id.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    debug!(command_id = %task_id, "Killing command");
                    if let Err(e) = child.kill().await {
                        warn!(command_id = %task_id, error = %e, "Failed to kill command");
                    }
                    child.wait().await
                }
            };
            let code = match status {
                Ok(status) => status.code().unwrap_or(-1),
                Err(e) => {
                    error!(command_id = %task_id, error = %e, "Failed to wait for command");
                    -1
                }
            };
            debug!(command_id = %task_id, exit_code = code, "Command exited");
            let _ = exit_tx.send(Some(code));
        });

        debug!(command_id = %id, program = %program, "Command started");
        self.commands.lock().insert(
            id.clone(),
            RunningCommand {
                exit: exit_rx,
                log: Some(log_rx),
                kill: Some(kill_tx),
            },
        );
        Ok(id)
    }

    async fn wait_command(&self, command_id: &str, timeout: Duration) -> Result<CommandStatus> {
        let mut exit = self
            .commands
            .lock()
            .get(command_id)
            .map(|c| c.exit.clone())
            .ok_or_else(|| Error::not_found("command", command_id))?;

        match tokio::time::timeout(timeout, exit.wait_for(Option::is_some)).await {
            Ok(Ok(code)) => Ok(CommandStatus {
                exit: true,
                exit_code: (*code).unwrap_or(-1),
            }),
            Ok(Err(_)) => Err(Error::Sandbox(format!(
                "command {command_id} vanished without an exit status"
            ))),
            Err(_) => Ok(CommandStatus {
                exit: false,
                exit_code: 0,
            }),
        }
    }

    async fn command_log(&self, command_id: &str) -> Result<CommandLogStream> {
        let rx = self
            .commands
            .lock()
            .get_mut(command_id)
            .ok_or_else(|| Error::not_found("command", command_id))?
            .log
            .take()
            .ok_or_else(|| Error::Sandbox(format!("log of {command_id} already taken")))?;

        Ok(Box::pin(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|chunk| (Ok(chunk), rx))
        })))
    }
}

async fn forward<R: AsyncRead + Unpin>(mut reader: R, tx: mpsc::UnboundedSender<Vec<u8>>) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to read command output");
                break;
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn sh(script: &str, env: &[&str]) -> StartCommand {
        let mut env: Vec<String> = env.iter().map(|e| e.to_string()).collect();
        env.push(format!("PATH={}", std::env::var("PATH").unwrap_or_default()));
        StartCommand {
            commands: vec!["/bin/sh".into(), "-c".into(), script.into()],
            dir: None,
            env,
            user: None,
        }
    }

    async fn collect(executor: &ShellExecutor, id: &str) -> String {
        let chunks: Vec<_> = executor.command_log(id).await.unwrap().collect().await;
        let bytes: Vec<u8> = chunks.into_iter().flat_map(|c| c.unwrap()).collect();
        String::from_utf8(bytes).unwrap()
    }

    #[tokio::test]
    async fn test_runs_command_and_reports_exit_code() {
        let executor = ShellExecutor::new(None);
        let id = executor
            .start_command(sh("echo hello; echo oops >&2; exit 3", &[]))
            .await
            .unwrap();

        let status = executor
            .wait_command(&id, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(
            status,
            CommandStatus {
                exit: true,
                exit_code: 3
            }
        );
        let output = collect(&executor, &id).await;
        assert!(output.contains("hello\n"));
        assert!(output.contains("oops\n"));
    }

    #[tokio::test]
    async fn test_env_and_dir_are_applied() {
        let dir = tempfile::tempdir().unwrap();
        let executor = ShellExecutor::new(Some(dir.path().to_path_buf()));
        let id = executor
            .start_command(sh(
                "printf '%s' \"$GREETING\"; : > marker",
                &["GREETING=hi there"],
            ))
            .await
            .unwrap();

        let status = executor
            .wait_command(&id, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(status.exit_code, 0);
        assert_eq!(collect(&executor, &id).await, "hi there");
        assert!(dir.path().join("marker").exists());
    }

    #[tokio::test]
    async fn test_wait_times_out_and_stop_kills() {
        let sandbox = ShellSandbox::new(None);
        let executor = sandbox.executor.clone();
        let id = executor.start_command(sh("sleep 30", &[])).await.unwrap();

        let status = executor
            .wait_command(&id, Duration::from_millis(50))
            .await
            .unwrap();
        assert!(!status.exit);

        tokio_test::assert_ok!(sandbox.stop().await);
        let status = executor
            .wait_command(&id, Duration::from_secs(10))
            .await
            .unwrap();
        assert!(status.exit);
        assert_ne!(status.exit_code, 0);
        assert!(executor.ping().await.is_err());
        assert!(executor.start_command(sh("true", &[])).await.is_err());
    }

    #[tokio::test]
    async fn test_log_can_be_taken_once() {
        let executor = ShellExecutor::new(None);
        let id = executor.start_command(sh("true", &[])).await.unwrap();
        tokio_test::assert_ok!(executor.command_log(&id).await);
        assert!(matches!(
            executor.command_log(&id).await,
            Err(Error::Sandbox(_))
        ));
        assert!(matches!(
            executor.wait_command("missing", Duration::from_millis(1)).await,
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_empty_command_is_rejected() {
        let executor = ShellExecutor::new(None);
        let err = executor
            .start_command(StartCommand::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Sandbox(_)));
    }

    #[tokio::test]
    async fn test_runtime_info_matches_host() {
        let executor = ShellExecutor::new(None);
        let info = executor.runtime_info().await.unwrap();
        assert_eq!(info.os, std::env::consts::OS);
        assert!(executor.environment().await.unwrap().iter().all(|e| e.contains('=')));
    }
}
