//! Buffers raw command output as numbered lines and uploads them in the
//! background.
//!
//! Writers append under a mutex and poke a single worker. The worker waits
//! one flush interval after a poke, then uploads whatever has not been sent
//! yet. Only the worker flushes while the collector is open; after it has
//! stopped, [`LogCollector::close`] performs the final flush itself.

use parking_lot::Mutex;
use runnel_core::ids::JobExecutionId;
use runnel_core::model::LogLine;
use runnel_core::ports::ServerApi;
use runnel_core::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const WORKER_STOP_TIMEOUT: Duration = Duration::from_secs(1);
const CLOSE_FLUSH_ATTEMPTS: usize = 3;

#[derive(Default)]
struct Buffer {
    lines: Vec<LogLine>,
    incomplete: Vec<u8>,
    next_number: u64,
    closed: bool,
}

struct Shared {
    server: Arc<dyn ServerApi>,
    job_execution_id: JobExecutionId,
    name: String,
    start: Instant,
    buffer: Mutex<Buffer>,
    notify: Notify,
    shutdown: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// One log stream of a job execution. Cloning yields another handle to the
/// same stream.
#[derive(Clone)]
pub struct LogCollector {
    shared: Arc<Shared>,
}

impl LogCollector {
    /// Open a stream and start its worker. Must be called inside a runtime.
    pub fn new(
        server: Arc<dyn ServerApi>,
        job_execution_id: JobExecutionId,
        name: impl Into<String>,
        flush_interval: Duration,
    ) -> Self {
        let shared = Arc::new(Shared {
            server,
            job_execution_id,
            name: name.into(),
            start: Instant::now(),
            buffer: Mutex::new(Buffer::default()),
            notify: Notify::new(),
            shutdown: CancellationToken::new(),
            worker: Mutex::new(None),
        });
        let worker = tokio::spawn(work(Arc::clone(&shared), flush_interval));
        *shared.worker.lock() = Some(worker);
        Self { shared }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Append raw output. Incomplete trailing bytes are kept and prefixed to
    /// the next write.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        {
            let mut buffer = self.shared.buffer.lock();
            if buffer.closed {
                return Err(Error::LogAlreadyClosed);
            }
            self.shared.append(&mut buffer, data);
        }
        self.shared.notify.notify_one();
        Ok(data.len())
    }

    /// Terminate a pending partial line, stop the worker and flush what is
    /// left. Fails on a second call.
    pub async fn close(&self) -> Result<()> {
        {
            let mut buffer = self.shared.buffer.lock();
            if buffer.closed {
                return Err(Error::LogAlreadyClosed);
            }
            buffer.closed = true;
            if !buffer.incomplete.is_empty() {
                self.shared.append(&mut buffer, b"\n");
            }
        }

        self.shared.shutdown.cancel();
        let worker = self.shared.worker.lock().take();
        if let Some(mut worker) = worker
            && timeout(WORKER_STOP_TIMEOUT, &mut worker).await.is_err()
        {
            warn!(name = %self.shared.name, "Log worker did not stop in time, aborting it");
            worker.abort();
            let _ = worker.await;
        }

        if self.shared.buffer.lock().lines.is_empty() {
            return Ok(());
        }
        let mut last_error = None;
        for attempt in 1..=CLOSE_FLUSH_ATTEMPTS {
            match self.shared.flush().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    debug!(name = %self.shared.name, attempt, error = %e, "Final log flush failed");
                    last_error = Some(e);
                }
            }
        }
        Err(Error::LogFlush(
            last_error.map(|e| e.to_string()).unwrap_or_default(),
        ))
    }
}

impl Shared {
    fn append(&self, buffer: &mut Buffer, data: &[u8]) {
        let mut joined = std::mem::take(&mut buffer.incomplete);
        joined.extend_from_slice(data);
        let timestamp = self.start.elapsed().as_secs();
        let (lines, rest) = split_lines(&joined);
        for line in lines {
            buffer.lines.push(LogLine {
                number: buffer.next_number,
                timestamp,
                output: String::from_utf8_lossy(line).into_owned(),
            });
            buffer.next_number += 1;
        }
        buffer.incomplete = rest.to_vec();
    }

    /// Upload the lines buffered so far and drop them once acknowledged.
    async fn flush(&self) -> Result<()> {
        let lines = self.buffer.lock().lines.clone();
        if lines.is_empty() {
            return Ok(());
        }
        let sent = lines.len();
        self.server
            .upload_log_lines(self.job_execution_id, &self.name, lines)
            .await?;
        self.buffer.lock().lines.drain(..sent);
        Ok(())
    }
}

async fn work(shared: Arc<Shared>, flush_interval: Duration) {
    loop {
        tokio::select! {
            _ = shared.notify.notified() => {}
            _ = shared.shutdown.cancelled() => return,
        }
        tokio::select! {
            _ = sleep(flush_interval) => {
                if let Err(e) = shared.flush().await {
                    warn!(
                        job_execution_id = %shared.job_execution_id,
                        name = %shared.name,
                        error = %e,
                        "Failed to flush log"
                    );
                }
            }
            _ = shared.shutdown.cancelled() => return,
        }
    }
}

/// Split `data` into complete lines and the trailing incomplete remainder.
///
/// `\r\n` is one boundary. A `\r` ends a line on its own when no `\n`
/// follows it directly.
pub fn split_lines(data: &[u8]) -> (Vec<&[u8]>, &[u8]) {
    let mut lines = Vec::new();
    let mut rest = data;
    loop {
        let cr = rest.iter().position(|&b| b == b'\r');
        let lf = rest.iter().position(|&b| b == b'\n');
        let (end, skip) = match (cr, lf) {
            (Some(r), Some(n)) if r + 1 == n => (r, 2),
            (Some(r), None) => (r, 1),
            (Some(r), Some(n)) if r < n => (r, 1),
            (_, Some(n)) => (n, 1),
            (None, None) => return (lines, rest),
        };
        lines.push(&rest[..end]);
        rest = &rest[end + skip..];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeServer;
    use pretty_assertions::assert_eq;

    const FLUSH: Duration = Duration::from_millis(10);

    fn collector(server: &Arc<FakeServer>) -> LogCollector {
        LogCollector::new(server.clone(), JobExecutionId::new(), "build", FLUSH)
    }

    #[test]
    fn test_split_lines() {
        let (lines, rest) = split_lines(b"a\nb\r\nc\rd");
        assert_eq!(lines, vec![&b"a"[..], &b"b"[..], &b"c"[..]]);
        assert_eq!(rest, &b"d"[..]);

        let (lines, rest) = split_lines(b"\r\na\nb\rc");
        assert_eq!(lines, vec![&b""[..], &b"a"[..], &b"b"[..]]);
        assert_eq!(rest, &b"c"[..]);

        let (lines, rest) = split_lines(b"x\n\ry");
        assert_eq!(lines, vec![&b"x"[..], &b""[..]]);
        assert_eq!(rest, &b"y"[..]);

        let (lines, rest) = split_lines(b"");
        assert!(lines.is_empty());
        assert!(rest.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_complete_lines_are_flushed() {
        let server = Arc::new(FakeServer::new());
        let log = collector(&server);
        log.write(b"a\nb\n").unwrap();
        sleep(FLUSH * 2).await;
        assert_eq!(server.log_output("build"), vec!["a", "b"]);

        log.close().await.unwrap();
        let numbers: Vec<u64> = server.log_lines("build").iter().map(|l| l.number).collect();
        assert_eq!(numbers, vec![0, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_incomplete_line_carries_over() {
        let server = Arc::new(FakeServer::new());
        let log = collector(&server);
        log.write(b"a\nb\nc").unwrap();
        sleep(FLUSH * 3).await;
        assert_eq!(server.log_output("build"), vec!["a", "b"]);

        log.write(b"d\ne").unwrap();
        sleep(FLUSH * 3).await;
        assert_eq!(server.log_output("build"), vec!["a", "b", "cd"]);

        log.close().await.unwrap();
        assert_eq!(server.log_output("build"), vec!["a", "b", "cd", "e"]);
        let numbers: Vec<u64> = server.log_lines("build").iter().map(|l| l.number).collect();
        assert_eq!(numbers, vec![0, 1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_carriage_returns() {
        let server = Arc::new(FakeServer::new());
        let log = collector(&server);
        log.write(b"\r\na\nb\rc").unwrap();
        sleep(FLUSH * 2).await;
        assert_eq!(server.log_output("build"), vec!["", "a", "b"]);

        log.write(b"d\re").unwrap();
        sleep(FLUSH * 2).await;
        assert_eq!(server.log_output("build"), vec!["", "a", "b", "cd"]);

        log.close().await.unwrap();
        assert_eq!(server.log_output("build"), vec!["", "a", "b", "cd", "e"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timestamps_are_seconds_since_open() {
        let server = Arc::new(FakeServer::new());
        let log = collector(&server);
        log.write(b"early\n").unwrap();
        sleep(Duration::from_secs(3)).await;
        log.write(b"late\n").unwrap();
        log.close().await.unwrap();

        let timestamps: Vec<u64> = server.log_lines("build").iter().map(|l| l.timestamp).collect();
        assert_eq!(timestamps, vec![0, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_twice() {
        let server = Arc::new(FakeServer::new());
        let log = collector(&server);
        log.close().await.unwrap();
        assert!(matches!(log.close().await, Err(Error::LogAlreadyClosed)));
        assert!(matches!(log.write(b"x\n"), Err(Error::LogAlreadyClosed)));
        assert_eq!(server.uploads(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_upload_keeps_lines_for_retry() {
        let server = Arc::new(FakeServer::new());
        server.fail_uploads(true);
        let log = collector(&server);
        log.write(b"one\n").unwrap();
        sleep(FLUSH * 2).await;
        assert!(server.log_output("build").is_empty());

        server.fail_uploads(false);
        log.write(b"two\n").unwrap();
        sleep(FLUSH * 2).await;
        assert_eq!(server.log_output("build"), vec!["one", "two"]);
        log.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_reports_persistent_flush_failure() {
        let server = Arc::new(FakeServer::new());
        server.fail_uploads(true);
        let log = LogCollector::new(server.clone(), JobExecutionId::new(), "build", Duration::ZERO);
        log.write(b"abcd").unwrap();

        let err = log.close().await.unwrap_err();
        assert!(matches!(&err, Error::LogFlush(msg) if msg.contains("upload refused")));
    }
}
