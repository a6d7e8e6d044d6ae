//! Runnel Core
//!
//! Domain types, the dependency graph, the status state machine and the
//! port traits shared by the scheduler, the agent and the sandboxes.

pub mod dag;
pub mod error;
pub mod events;
pub mod ids;
pub mod model;
pub mod ports;
pub mod status;

pub use error::{Error, Result};
pub use ids::*;
pub use status::Status;
