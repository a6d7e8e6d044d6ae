//! Server side of Runnel: pipeline creation, dispatch, the claim protocol
//! and heartbeat recovery.

pub mod claim;
pub mod config;
pub mod dispatch;
pub mod events;
pub mod lock;
pub mod logs;
pub mod pipeline;
pub mod reaper;
pub mod server;
pub mod store;

pub use config::SchedulerConfig;
pub use dispatch::{DispatchService, Dispatcher, Transition};
pub use server::Server;
