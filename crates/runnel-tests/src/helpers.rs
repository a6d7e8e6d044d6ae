//! Test helper functions and utilities.

use std::future::Future;
use std::time::Duration;

/// Wait for a condition with timeout.
pub async fn wait_for<F, Fut>(timeout: Duration, interval: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout {
        if condition().await {
            return true;
        }
        tokio::time::sleep(interval).await;
    }
    false
}

/// Fail with `what` unless `future` completes within `timeout`.
pub async fn within<F, T>(timeout: Duration, what: &str, future: F) -> anyhow::Result<T>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(timeout, future)
        .await
        .map_err(|_| anyhow::anyhow!("{what} did not complete within {timeout:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_for_immediate() {
        let result = wait_for(Duration::from_secs(1), Duration::from_millis(10), || async {
            true
        })
        .await;
        assert!(result);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_timeout() {
        let result = wait_for(Duration::from_millis(100), Duration::from_millis(10), || async {
            false
        })
        .await;
        assert!(!result);
    }

    #[tokio::test(start_paused = true)]
    async fn test_within_reports_slow_futures() {
        let err = within(
            Duration::from_millis(10),
            "sleep",
            tokio::time::sleep(Duration::from_secs(1)),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("sleep"));
    }
}
