use chrono::{DateTime, Utc};
use keystone_core::{Milestone, PlanRecords};
use sqlx::SqlitePool;
use uuid::Uuid;

use super::process_state_repository::{remove, upsert, CURRENT_MILESTONE_KEY};
use crate::error::DbError;
use crate::models::{MilestoneRow, TaskRow};

const MILESTONE_COLUMNS: &str = "id, name, ordering, status, completed_at, created_at";

#[derive(Clone)]
pub struct MilestoneRepository {
    pool: SqlitePool,
}

impl MilestoneRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Inserts a whole planned graph (milestones, tasks, dependency edges) in
    /// one transaction.
    pub async fn insert_plan(&self, plan: &PlanRecords) -> Result<(), DbError> {
        let mut tx = self.pool.begin().await?;

        for milestone in &plan.milestones {
            let row = MilestoneRow::from(milestone);
            sqlx::query(
                r#"
                INSERT INTO milestones (id, name, ordering, status, completed_at, created_at)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&row.id)
            .bind(&row.name)
            .bind(row.ordering)
            .bind(&row.status)
            .bind(row.completed_at)
            .bind(row.created_at)
            .execute(&mut *tx)
            .await?;
        }

        for task in &plan.tasks {
            let row = TaskRow::from(task);
            sqlx::query(
                r#"
                INSERT INTO tasks (id, milestone_id, title, description, ordering, status,
                                   attempts, last_release_reason, started_at, completed_at, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&row.id)
            .bind(&row.milestone_id)
            .bind(&row.title)
            .bind(&row.description)
            .bind(row.ordering)
            .bind(&row.status)
            .bind(row.attempts)
            .bind(&row.last_release_reason)
            .bind(row.started_at)
            .bind(row.completed_at)
            .bind(row.created_at)
            .execute(&mut *tx)
            .await?;
        }

        for dependency in &plan.dependencies {
            sqlx::query("INSERT INTO task_dependencies (task_id, depends_on) VALUES (?, ?)")
                .bind(dependency.task_id.to_string())
                .bind(dependency.depends_on.to_string())
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        tracing::info!(
            milestones = plan.milestones.len(),
            tasks = plan.tasks.len(),
            dependencies = plan.dependencies.len(),
            "Plan stored"
        );
        Ok(())
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<Milestone>, DbError> {
        let row: Option<MilestoneRow> = sqlx::query_as(&format!(
            "SELECT {} FROM milestones WHERE id = ?",
            MILESTONE_COLUMNS
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(MilestoneRow::into_domain).transpose()
    }

    pub async fn find_all(&self) -> Result<Vec<Milestone>, DbError> {
        let rows: Vec<MilestoneRow> = sqlx::query_as(&format!(
            "SELECT {} FROM milestones ORDER BY ordering, created_at",
            MILESTONE_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(MilestoneRow::into_domain).collect()
    }

    /// The pending milestone with the lowest ordering index.
    pub async fn first_pending(&self) -> Result<Option<Milestone>, DbError> {
        let row: Option<MilestoneRow> = sqlx::query_as(&format!(
            "SELECT {} FROM milestones WHERE status = 'pending' ORDER BY ordering, created_at LIMIT 1",
            MILESTONE_COLUMNS
        ))
        .fetch_optional(&self.pool)
        .await?;

        row.map(MilestoneRow::into_domain).transpose()
    }

    /// The pending milestone with the lowest ordering index other than `exclude`.
    pub async fn next_pending_after(&self, exclude: Uuid) -> Result<Option<Milestone>, DbError> {
        let row: Option<MilestoneRow> = sqlx::query_as(&format!(
            "SELECT {} FROM milestones WHERE status = 'pending' AND id <> ? \
             ORDER BY ordering, created_at LIMIT 1",
            MILESTONE_COLUMNS
        ))
        .bind(exclude.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(MilestoneRow::into_domain).transpose()
    }

    pub async fn count(&self) -> Result<i64, DbError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM milestones")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Marks `id` completed and moves the current-milestone marker to `next`
    /// (or clears it) in one transaction.
    ///
    /// The status change only applies while every task of the milestone is
    /// completed; returns `false` without side effects otherwise, or when the
    /// milestone was already completed.
    pub async fn complete_and_advance(
        &self,
        id: Uuid,
        next: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<bool, DbError> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE milestones
            SET status = 'completed', completed_at = ?
            WHERE id = ? AND status = 'pending'
              AND NOT EXISTS (
                  SELECT 1 FROM tasks WHERE milestone_id = milestones.id AND status <> 'completed'
              )
            "#,
        )
        .bind(now.timestamp())
        .bind(id.to_string())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        match next {
            Some(next) => upsert(&mut *tx, CURRENT_MILESTONE_KEY, &next.to_string()).await?,
            None => remove(&mut *tx, CURRENT_MILESTONE_KEY).await?,
        }

        tx.commit().await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{connect, ProcessStateRepository, TaskRepository};
    use keystone_core::{PlanGraph, PlannedMilestone, PlannedTask};

    pub(crate) fn two_milestone_plan() -> PlanRecords {
        PlanGraph {
            milestones: vec![
                PlannedMilestone {
                    name: "M1".to_string(),
                    tasks: vec![PlannedTask {
                        key: "a".to_string(),
                        title: "A".to_string(),
                        description: String::new(),
                        depends_on: vec![],
                    }],
                },
                PlannedMilestone {
                    name: "M2".to_string(),
                    tasks: vec![PlannedTask {
                        key: "b".to_string(),
                        title: "B".to_string(),
                        description: String::new(),
                        depends_on: vec!["a".to_string()],
                    }],
                },
            ],
        }
        .into_records()
        .unwrap()
    }

    #[tokio::test]
    async fn test_insert_plan_and_ordering() {
        let pool = connect("sqlite::memory:").await.unwrap();
        let repo = MilestoneRepository::new(pool.clone());
        let plan = two_milestone_plan();

        repo.insert_plan(&plan).await.unwrap();

        let all = repo.find_all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].name, "M1");
        assert_eq!(repo.count().await.unwrap(), 2);

        let first = repo.first_pending().await.unwrap().unwrap();
        assert_eq!(first.id, plan.milestones[0].id);

        let next = repo.next_pending_after(first.id).await.unwrap().unwrap();
        assert_eq!(next.id, plan.milestones[1].id);
    }

    #[tokio::test]
    async fn test_insert_plan_is_atomic() {
        let pool = connect("sqlite::memory:").await.unwrap();
        let repo = MilestoneRepository::new(pool.clone());
        let mut plan = two_milestone_plan();
        // Edge pointing at a task that does not exist violates the foreign key
        plan.dependencies[0].depends_on = Uuid::new_v4();

        assert!(repo.insert_plan(&plan).await.is_err());
        assert_eq!(repo.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_complete_requires_all_tasks_completed() {
        let pool = connect("sqlite::memory:").await.unwrap();
        let repo = MilestoneRepository::new(pool.clone());
        let tasks = TaskRepository::new(pool.clone());
        let state = ProcessStateRepository::new(pool.clone());
        let plan = two_milestone_plan();
        repo.insert_plan(&plan).await.unwrap();

        let m1 = plan.milestones[0].id;
        let m2 = plan.milestones[1].id;
        let now = Utc::now();

        assert!(!repo.complete_and_advance(m1, Some(m2), now).await.unwrap());
        assert_eq!(state.current_milestone().await.unwrap(), None);

        let task = plan.tasks[0].id;
        assert!(tasks.claim(task, now).await.unwrap());
        assert!(tasks.complete(task, now).await.unwrap());

        assert!(repo.complete_and_advance(m1, Some(m2), now).await.unwrap());
        assert_eq!(state.current_milestone().await.unwrap(), Some(m2));
        assert!(repo.find_by_id(m1).await.unwrap().unwrap().is_completed());

        // Second transition is a no-op
        assert!(!repo.complete_and_advance(m1, Some(m2), now).await.unwrap());
    }
}
