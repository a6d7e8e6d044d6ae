//! Sandboxes that run Runnel steps.

pub mod shell;

pub use shell::{ShellExecutor, ShellProvider, ShellSandbox};
