mod milestone;
mod research;
mod task;
mod technology;

pub use milestone::*;
pub use research::*;
pub use task::*;
pub use technology::*;

use chrono::{DateTime, TimeZone, Utc};
use uuid::Uuid;

use crate::error::DbError;

pub(crate) fn timestamp_to_datetime(ts: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(ts, 0).single().unwrap_or_default()
}

pub(crate) fn datetime_to_timestamp(dt: DateTime<Utc>) -> i64 {
    dt.timestamp()
}

pub(crate) fn parse_uuid(table: &'static str, column: &'static str, value: &str) -> Result<Uuid, DbError> {
    Uuid::parse_str(value).map_err(|_| DbError::corrupt(table, column, value))
}
