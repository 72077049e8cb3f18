use chrono::{DateTime, Utc};
use keystone_core::{Task, TaskDependency};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::DbError;
use crate::models::{parse_uuid, TaskRow, TASK_COLUMNS};

/// Tasks whose prerequisites are all completed. Used as a SQL fragment
/// against an outer `tasks` row.
const PREREQUISITES_MET: &str = "NOT EXISTS (
    SELECT 1 FROM task_dependencies d
    JOIN tasks p ON p.id = d.depends_on
    WHERE d.task_id = tasks.id AND p.status <> 'completed'
)";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskCounts {
    pub pending: i64,
    pub in_progress: i64,
    pub completed: i64,
}

impl TaskCounts {
    pub fn total(&self) -> i64 {
        self.pending + self.in_progress + self.completed
    }

    pub fn incomplete(&self) -> i64 {
        self.pending + self.in_progress
    }
}

#[derive(Clone)]
pub struct TaskRepository {
    pool: SqlitePool,
}

impl TaskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<Task>, DbError> {
        let row: Option<TaskRow> =
            sqlx::query_as(&format!("SELECT {} FROM tasks WHERE id = ?", TASK_COLUMNS))
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await?;

        row.map(TaskRow::into_domain).transpose()
    }

    pub async fn find_by_milestone(&self, milestone_id: Uuid) -> Result<Vec<Task>, DbError> {
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            "SELECT {} FROM tasks WHERE milestone_id = ? ORDER BY ordering, created_at",
            TASK_COLUMNS
        ))
        .bind(milestone_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TaskRow::into_domain).collect()
    }

    pub async fn find_in_progress(&self) -> Result<Vec<Task>, DbError> {
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            "SELECT {} FROM tasks WHERE status = 'in_progress' ORDER BY started_at",
            TASK_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TaskRow::into_domain).collect()
    }

    /// Prerequisite task ids of `task_id`.
    pub async fn dependencies_of(&self, task_id: Uuid) -> Result<Vec<Uuid>, DbError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT depends_on FROM task_dependencies WHERE task_id = ?")
                .bind(task_id.to_string())
                .fetch_all(&self.pool)
                .await?;

        rows.iter()
            .map(|(id,)| parse_uuid("task_dependencies", "depends_on", id))
            .collect()
    }

    pub async fn all_dependencies(&self) -> Result<Vec<TaskDependency>, DbError> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT task_id, depends_on FROM task_dependencies")
                .fetch_all(&self.pool)
                .await?;

        rows.iter()
            .map(|(task_id, depends_on)| {
                Ok(TaskDependency::new(
                    parse_uuid("task_dependencies", "task_id", task_id)?,
                    parse_uuid("task_dependencies", "depends_on", depends_on)?,
                ))
            })
            .collect()
    }

    /// The lowest-ordered pending task of the milestone whose prerequisites
    /// are all completed.
    pub async fn next_eligible(&self, milestone_id: Uuid) -> Result<Option<Task>, DbError> {
        let row: Option<TaskRow> = sqlx::query_as(&format!(
            "SELECT {} FROM tasks WHERE milestone_id = ? AND status = 'pending' AND {} \
             ORDER BY ordering, created_at LIMIT 1",
            TASK_COLUMNS, PREREQUISITES_MET
        ))
        .bind(milestone_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(TaskRow::into_domain).transpose()
    }

    /// Claims a pending task whose prerequisites are completed by moving it
    /// to `in_progress`. Returns `false` if another caller got there first or
    /// the task is no longer eligible.
    pub async fn claim(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, DbError> {
        let result = sqlx::query(&format!(
            "UPDATE tasks SET status = 'in_progress', started_at = ?, completed_at = NULL, \
             attempts = attempts + 1 \
             WHERE id = ? AND status = 'pending' AND {}",
            PREREQUISITES_MET
        ))
        .bind(now.timestamp())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// `in_progress` → `completed`. Returns `false` when the task is not in progress.
    pub async fn complete(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, DbError> {
        let result = sqlx::query(
            "UPDATE tasks SET status = 'completed', completed_at = ? \
             WHERE id = ? AND status = 'in_progress'",
        )
        .bind(now.timestamp())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// `in_progress` → `pending`, keeping the ordering index. Returns `false`
    /// when the task is not in progress.
    pub async fn release(&self, id: Uuid, reason: &str) -> Result<bool, DbError> {
        let result = sqlx::query(
            "UPDATE tasks SET status = 'pending', started_at = NULL, last_release_reason = ? \
             WHERE id = ? AND status = 'in_progress'",
        )
        .bind(reason)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn counts(&self) -> Result<TaskCounts, DbError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM tasks GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = TaskCounts::default();
        for (status, count) in rows {
            match status.as_str() {
                "pending" => counts.pending = count,
                "in_progress" => counts.in_progress = count,
                "completed" => counts.completed = count,
                _ => return Err(DbError::corrupt("tasks", "status", status)),
            }
        }
        Ok(counts)
    }

    /// Mean `completed_at - started_at` over completed tasks, in seconds.
    pub async fn average_duration_secs(&self) -> Result<Option<f64>, DbError> {
        let (avg,): (Option<f64>,) = sqlx::query_as(
            "SELECT AVG(completed_at - started_at) FROM tasks \
             WHERE status = 'completed' AND started_at IS NOT NULL AND completed_at IS NOT NULL",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(avg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{connect, MilestoneRepository};
    use keystone_core::{PlanGraph, PlanRecords, PlannedMilestone, PlannedTask, TaskStatus};

    fn planned(key: &str, deps: &[&str]) -> PlannedTask {
        PlannedTask {
            key: key.to_string(),
            title: key.to_uppercase(),
            description: String::new(),
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
        }
    }

    async fn setup() -> (TaskRepository, PlanRecords) {
        let pool = connect("sqlite::memory:").await.unwrap();
        let plan = PlanGraph {
            milestones: vec![PlannedMilestone {
                name: "M1".to_string(),
                tasks: vec![planned("a", &[]), planned("b", &["a"]), planned("c", &[])],
            }],
        }
        .into_records()
        .unwrap();
        MilestoneRepository::new(pool.clone())
            .insert_plan(&plan)
            .await
            .unwrap();
        (TaskRepository::new(pool), plan)
    }

    #[tokio::test]
    async fn test_next_eligible_respects_ordering_and_dependencies() {
        let (repo, plan) = setup().await;
        let milestone = plan.milestones[0].id;
        let (a, b, c) = (plan.tasks[0].id, plan.tasks[1].id, plan.tasks[2].id);
        let now = Utc::now();

        assert_eq!(repo.next_eligible(milestone).await.unwrap().unwrap().id, a);
        assert!(repo.claim(a, now).await.unwrap());

        // b waits on a, so c is next
        assert_eq!(repo.next_eligible(milestone).await.unwrap().unwrap().id, c);
        assert!(!repo.claim(b, now).await.unwrap());

        assert!(repo.complete(a, now).await.unwrap());
        assert_eq!(repo.next_eligible(milestone).await.unwrap().unwrap().id, b);
        assert_eq!(repo.dependencies_of(b).await.unwrap(), vec![a]);
    }

    #[tokio::test]
    async fn test_claim_is_single_flight() {
        let (repo, plan) = setup().await;
        let a = plan.tasks[0].id;
        let now = Utc::now();

        assert!(repo.claim(a, now).await.unwrap());
        assert!(!repo.claim(a, now).await.unwrap());

        let task = repo.find_by_id(a).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.attempts, 1);
    }

    #[tokio::test]
    async fn test_complete_only_from_in_progress() {
        let (repo, plan) = setup().await;
        let a = plan.tasks[0].id;
        let now = Utc::now();

        assert!(!repo.complete(a, now).await.unwrap());
        assert!(repo.claim(a, now).await.unwrap());
        assert!(repo.complete(a, now).await.unwrap());
        assert!(!repo.complete(a, now).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_returns_task_to_pending() {
        let (repo, plan) = setup().await;
        let a = plan.tasks[0].id;
        let now = Utc::now();

        assert!(!repo.release(a, "not started").await.unwrap());
        repo.claim(a, now).await.unwrap();
        assert!(repo.release(a, "executor crashed").await.unwrap());

        let task = repo.find_by_id(a).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.ordering, 1);
        assert!(task.started_at.is_none());
        assert_eq!(task.last_release_reason.as_deref(), Some("executor crashed"));

        // Reclaim counts a second attempt
        repo.claim(a, now).await.unwrap();
        assert_eq!(repo.find_by_id(a).await.unwrap().unwrap().attempts, 2);
    }

    #[tokio::test]
    async fn test_counts_and_in_progress() {
        let (repo, plan) = setup().await;
        let now = Utc::now();
        repo.claim(plan.tasks[0].id, now).await.unwrap();

        let counts = repo.counts().await.unwrap();
        assert_eq!(counts.pending, 2);
        assert_eq!(counts.in_progress, 1);
        assert_eq!(counts.total(), 3);
        assert_eq!(counts.incomplete(), 3);

        let in_progress = repo.find_in_progress().await.unwrap();
        assert_eq!(in_progress.len(), 1);
        assert_eq!(repo.all_dependencies().await.unwrap().len(), 1);
    }
}
