use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Task {
    pub id: Uuid,
    pub milestone_id: Uuid,
    pub title: String,
    pub description: String,
    pub ordering: i64,
    pub status: TaskStatus,
    /// Number of times the task has been dispatched.
    pub attempts: u32,
    pub last_release_reason: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn new(
        milestone_id: Uuid,
        title: impl Into<String>,
        description: impl Into<String>,
        ordering: i64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            milestone_id,
            title: title.into(),
            description: description.into(),
            ordering,
            status: TaskStatus::default(),
            attempts: 0,
            last_release_reason: None,
            started_at: None,
            completed_at: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    /// Wall-clock time between the last claim and completion.
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.completed_at) {
            (Some(started), Some(completed)) => Some(completed - started),
            _ => None,
        }
    }
}

/// Directed edge: `task_id` cannot start before `depends_on` is completed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TaskDependency {
    pub task_id: Uuid,
    pub depends_on: Uuid,
}

impl TaskDependency {
    pub fn new(task_id: Uuid, depends_on: Uuid) -> Self {
        Self {
            task_id,
            depends_on,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_task_creation() {
        let milestone_id = Uuid::new_v4();
        let task = Task::new(milestone_id, "Schema", "Create the schema", 2);

        assert_eq!(task.milestone_id, milestone_id);
        assert_eq!(task.title, "Schema");
        assert_eq!(task.ordering, 2);
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempts, 0);
        assert!(task.duration().is_none());
    }

    #[test]
    fn test_task_status_parsing() {
        assert_eq!(TaskStatus::parse("pending"), Some(TaskStatus::Pending));
        assert_eq!(
            TaskStatus::parse("in_progress"),
            Some(TaskStatus::InProgress)
        );
        assert_eq!(TaskStatus::parse("done"), None);
        assert_eq!(TaskStatus::InProgress.as_str(), "in_progress");
    }

    #[test]
    fn test_task_duration() {
        let mut task = Task::new(Uuid::new_v4(), "Build", "", 1);
        let started = Utc::now();
        task.started_at = Some(started);
        task.completed_at = Some(started + Duration::seconds(90));

        assert_eq!(task.duration(), Some(Duration::seconds(90)));
    }
}
