//! End-to-end test infrastructure for Runnel.
//!
//! Wires an in-memory server, agents and the shell sandbox together in one
//! process.
//!
//! # Usage
//!
//! ```ignore
//! use runnel_tests::{TestContext, PipelineFixture};
//!
//! #[tokio::test]
//! async fn test_something() {
//!     let ctx = TestContext::new().unwrap();
//!     let created = ctx.server.create_pipeline(PipelineFixture::single("echo hi")).await.unwrap();
//!     ctx.run_until_idle("local").await.unwrap();
//! }
//! ```

pub mod context;
pub mod fixtures;
pub mod helpers;

pub use context::TestContext;
pub use fixtures::*;
pub use helpers::*;

/// Initialize test logging (call once per test binary).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,runnel=debug")),
        )
        .with_test_writer()
        .try_init();
}
