//! Event system for Keystone
//!
//! Scheduler and research lifecycle transitions are published on a tokio
//! broadcast bus so operator surfaces can follow a run without polling the store.

mod bus;
mod types;

pub use bus::{drain, EventBus};
pub use types::*;
