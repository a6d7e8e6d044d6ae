//! Scheduler configuration.

use runnel_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Server-side scheduling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// How many queued executions a single claim request looks at.
    #[serde(default = "default_claim_scan_limit")]
    pub claim_scan_limit: usize,
    /// TTL of the claim lock. Never released on success.
    #[serde(default = "default_claim_lock_ttl")]
    pub claim_lock_ttl_secs: u64,
    /// TTL of the lock guarding status updates.
    #[serde(default = "default_update_lock_ttl")]
    pub update_lock_ttl_ms: u64,
    /// Active executions without a heartbeat for this long are failed.
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: u64,
    /// How often the reaper sweeps.
    #[serde(default = "default_reaper_interval")]
    pub reaper_interval_secs: u64,
    /// Attempts to re-dispatch a pipeline when its locks are contended.
    /// Pipelines still stalled after that wait for the next reaper sweep.
    #[serde(default = "default_dispatch_attempts")]
    pub dispatch_attempts: u32,
}

fn default_claim_scan_limit() -> usize {
    100
}

fn default_claim_lock_ttl() -> u64 {
    90
}

fn default_update_lock_ttl() -> u64 {
    1000
}

fn default_heartbeat_timeout() -> u64 {
    60
}

fn default_reaper_interval() -> u64 {
    60
}

fn default_dispatch_attempts() -> u32 {
    3
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            claim_scan_limit: default_claim_scan_limit(),
            claim_lock_ttl_secs: default_claim_lock_ttl(),
            update_lock_ttl_ms: default_update_lock_ttl(),
            heartbeat_timeout_secs: default_heartbeat_timeout(),
            reaper_interval_secs: default_reaper_interval(),
            dispatch_attempts: default_dispatch_attempts(),
        }
    }
}

impl SchedulerConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self =
            serde_yaml::from_str(&contents).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// A claimed execution that never reports back must be reaped before its
    /// claim lock expires, otherwise a second agent could claim it.
    pub fn validate(&self) -> Result<()> {
        if self.claim_scan_limit == 0 {
            return Err(Error::Config("claim_scan_limit must be positive".into()));
        }
        if self.heartbeat_timeout_secs >= self.claim_lock_ttl_secs {
            return Err(Error::Config(format!(
                "heartbeat_timeout_secs ({}) must be shorter than claim_lock_ttl_secs ({})",
                self.heartbeat_timeout_secs, self.claim_lock_ttl_secs
            )));
        }
        if self.dispatch_attempts == 0 {
            return Err(Error::Config("dispatch_attempts must be positive".into()));
        }
        Ok(())
    }

    pub fn claim_lock_ttl(&self) -> Duration {
        Duration::from_secs(self.claim_lock_ttl_secs)
    }

    pub fn update_lock_ttl(&self) -> Duration {
        Duration::from_millis(self.update_lock_ttl_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }
}
