//! State store for Keystone: SQLite schema, row mappings and repositories.
//!
//! Every entity has one table. Status columns are closed enumerations; a
//! value outside the set surfaces as [`DbError::Corrupt`].

mod error;
pub mod models;
mod pool;
pub mod repositories;

pub use error::*;
pub use pool::*;
pub use repositories::*;
pub use sqlx::SqlitePool;
