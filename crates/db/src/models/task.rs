use keystone_core::{Task, TaskStatus};

use super::{datetime_to_timestamp, parse_uuid, timestamp_to_datetime};
use crate::error::DbError;

pub(crate) const TASK_COLUMNS: &str = "id, milestone_id, title, description, ordering, status, \
     attempts, last_release_reason, started_at, completed_at, created_at";

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TaskRow {
    pub id: String,
    pub milestone_id: String,
    pub title: String,
    pub description: String,
    pub ordering: i64,
    pub status: String,
    pub attempts: i64,
    pub last_release_reason: Option<String>,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub created_at: i64,
}

impl TaskRow {
    pub fn into_domain(self) -> Result<Task, DbError> {
        Ok(Task {
            id: parse_uuid("tasks", "id", &self.id)?,
            milestone_id: parse_uuid("tasks", "milestone_id", &self.milestone_id)?,
            status: TaskStatus::parse(&self.status)
                .ok_or_else(|| DbError::corrupt("tasks", "status", &self.status))?,
            title: self.title,
            description: self.description,
            ordering: self.ordering,
            attempts: u32::try_from(self.attempts).unwrap_or_default(),
            last_release_reason: self.last_release_reason,
            started_at: self.started_at.map(timestamp_to_datetime),
            completed_at: self.completed_at.map(timestamp_to_datetime),
            created_at: timestamp_to_datetime(self.created_at),
        })
    }
}

impl From<&Task> for TaskRow {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id.to_string(),
            milestone_id: task.milestone_id.to_string(),
            title: task.title.clone(),
            description: task.description.clone(),
            ordering: task.ordering,
            status: task.status.as_str().to_string(),
            attempts: i64::from(task.attempts),
            last_release_reason: task.last_release_reason.clone(),
            started_at: task.started_at.map(datetime_to_timestamp),
            completed_at: task.completed_at.map(datetime_to_timestamp),
            created_at: datetime_to_timestamp(task.created_at),
        }
    }
}
