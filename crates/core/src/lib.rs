//! Domain model for Keystone.
//!
//! Milestones and tasks form the two-level work hierarchy driven by the
//! scheduler. Research opportunities, executions and technologies describe
//! the research reconciliation protocol. This crate holds no I/O.

pub mod domain;
mod error;

pub use domain::*;
pub use error::CoreError;
