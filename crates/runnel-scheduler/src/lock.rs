//! In-process [`Locker`] with TTL expiry.

use async_trait::async_trait;
use parking_lot::Mutex;
use runnel_core::Result;
use runnel_core::ids::JobExecutionId;
use runnel_core::ports::Locker;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Key guarding status updates of one execution.
pub fn update_lock_key(id: JobExecutionId) -> String {
    format!("job_execution:{id}:lock")
}

/// Key an agent holds once it claimed an execution.
pub fn claim_lock_key(id: JobExecutionId) -> String {
    format!("job_request:{id}:lock")
}

struct Entry {
    value: String,
    expires_at: Instant,
}

/// Locks live in a map. Expired entries are treated as absent.
#[derive(Default)]
pub struct MemoryLocker {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryLocker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value stored under `key` if the lock is still held.
    pub fn holder(&self, key: &str) -> Option<String> {
        let entries = self.entries.lock();
        entries
            .get(key)
            .filter(|e| e.expires_at > Instant::now())
            .map(|e| e.value.clone())
    }
}

#[async_trait]
impl Locker for MemoryLocker {
    async fn lock(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get(key)
            && entry.expires_at > now
        {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn unlock(&self, key: &str) -> Result<bool> {
        let mut entries = self.entries.lock();
        match entries.remove(key) {
            Some(entry) => Ok(entry.expires_at > Instant::now()),
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lock_is_exclusive_until_unlocked() {
        let locker = MemoryLocker::new();
        let ttl = Duration::from_secs(10);

        assert!(locker.lock("k", "a", ttl).await.unwrap());
        assert!(!locker.lock("k", "b", ttl).await.unwrap());
        assert_eq!(locker.holder("k").as_deref(), Some("a"));

        assert!(locker.unlock("k").await.unwrap());
        assert!(!locker.unlock("k").await.unwrap());
        assert!(locker.lock("k", "b", ttl).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_expires_after_ttl() {
        let locker = MemoryLocker::new();
        assert!(locker.lock("k", "a", Duration::from_secs(1)).await.unwrap());

        tokio::time::advance(Duration::from_millis(1500)).await;

        assert!(locker.holder("k").is_none());
        assert!(locker.lock("k", "b", Duration::from_secs(1)).await.unwrap());
    }

    #[test]
    fn test_lock_keys() {
        let id = JobExecutionId::new();
        assert_eq!(update_lock_key(id), format!("job_execution:{id}:lock"));
        assert!(claim_lock_key(id).starts_with("job_request:jex_"));
    }
}
