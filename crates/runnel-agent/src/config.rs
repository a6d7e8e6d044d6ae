//! Agent configuration.

use runnel_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Queue label this agent claims jobs from.
    #[serde(default = "default_label")]
    pub label: String,
    /// Jobs executed at the same time.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Delay between two empty claim requests.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,
    /// A job is aborted once heartbeats have failed for this long.
    #[serde(default = "default_max_heartbeat_failure")]
    pub max_heartbeat_failure_secs: u64,
    /// Debounce before buffered log lines are uploaded.
    #[serde(default = "default_log_flush_interval")]
    pub log_flush_interval_ms: u64,
    /// Timeout of a single wait call on a running command.
    #[serde(default = "default_step_wait_timeout")]
    pub step_wait_timeout_secs: u64,
    /// How often a running step pings its executor.
    #[serde(default = "default_executor_probe_interval")]
    pub executor_probe_interval_ms: u64,
    #[serde(default = "default_sandbox_start_timeout")]
    pub sandbox_start_timeout_secs: u64,
    #[serde(default = "default_sandbox_stop_timeout")]
    pub sandbox_stop_timeout_secs: u64,
}

fn default_label() -> String {
    "default".to_string()
}

fn default_concurrency() -> usize {
    1
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_heartbeat_interval() -> u64 {
    5000
}

fn default_max_heartbeat_failure() -> u64 {
    30
}

fn default_log_flush_interval() -> u64 {
    1000
}

fn default_step_wait_timeout() -> u64 {
    3600
}

fn default_executor_probe_interval() -> u64 {
    5000
}

fn default_sandbox_start_timeout() -> u64 {
    120
}

fn default_sandbox_stop_timeout() -> u64 {
    600
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            label: default_label(),
            concurrency: default_concurrency(),
            poll_interval_ms: default_poll_interval(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            max_heartbeat_failure_secs: default_max_heartbeat_failure(),
            log_flush_interval_ms: default_log_flush_interval(),
            step_wait_timeout_secs: default_step_wait_timeout(),
            executor_probe_interval_ms: default_executor_probe_interval(),
            sandbox_start_timeout_secs: default_sandbox_start_timeout(),
            sandbox_stop_timeout_secs: default_sandbox_stop_timeout(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self =
            serde_yaml::from_str(&contents).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.label.is_empty() {
            return Err(Error::Config("label must not be empty".into()));
        }
        if self.concurrency == 0 {
            return Err(Error::Config("concurrency must be positive".into()));
        }
        if self.heartbeat_interval_ms == 0 || self.executor_probe_interval_ms == 0 {
            return Err(Error::Config("intervals must be positive".into()));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn max_heartbeat_failure(&self) -> Duration {
        Duration::from_secs(self.max_heartbeat_failure_secs)
    }

    pub fn log_flush_interval(&self) -> Duration {
        Duration::from_millis(self.log_flush_interval_ms)
    }

    pub fn step_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.step_wait_timeout_secs)
    }

    pub fn executor_probe_interval(&self) -> Duration {
        Duration::from_millis(self.executor_probe_interval_ms)
    }

    pub fn sandbox_start_timeout(&self) -> Duration {
        Duration::from_secs(self.sandbox_start_timeout_secs)
    }

    pub fn sandbox_stop_timeout(&self) -> Duration {
        Duration::from_secs(self.sandbox_stop_timeout_secs)
    }
}
