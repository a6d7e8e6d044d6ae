//! Job agent for Runnel.
//!
//! Claims jobs from the server, runs their steps in a sandbox and streams
//! logs and status back.

pub mod agent;
pub mod config;
pub mod execution;
pub mod log_collector;
pub mod monitor;
pub mod script;
mod step;

#[cfg(test)]
mod testing;

pub use agent::Agent;
pub use config::AgentConfig;
pub use execution::{Execution, SYSTEM_LOG};
pub use log_collector::LogCollector;
pub use monitor::{Abort, AbortReason};
