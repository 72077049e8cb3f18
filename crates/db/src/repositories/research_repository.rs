use chrono::{DateTime, Utc};
use keystone_core::{ExecutionStatus, OpportunityId, ResearchExecution, ResearchOpportunity};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::DbError;
use crate::models::{ExecutionRow, OpportunityRow, EXECUTION_COLUMNS, OPPORTUNITY_COLUMNS};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpportunityCounts {
    pub pending: i64,
    pub in_progress: i64,
    pub completed: i64,
    pub skipped: i64,
}

impl OpportunityCounts {
    pub fn total(&self) -> i64 {
        self.pending + self.in_progress + self.completed + self.skipped
    }
}

#[derive(Clone)]
pub struct ResearchRepository {
    pool: SqlitePool,
}

impl ResearchRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Creates one pending row per selected opportunity, all or nothing.
    pub async fn create_opportunities(
        &self,
        opportunities: &[ResearchOpportunity],
    ) -> Result<(), DbError> {
        let mut tx = self.pool.begin().await?;

        for opportunity in opportunities {
            let row = OpportunityRow::from(opportunity);
            sqlx::query(
                r#"
                INSERT INTO research_opportunities (id, catalog_index, status, result_summary, confidence,
                                                    skip_reason, redispatch_count, created_at, started_at, completed_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&row.id)
            .bind(row.catalog_index)
            .bind(&row.status)
            .bind(&row.result_summary)
            .bind(&row.confidence)
            .bind(&row.skip_reason)
            .bind(row.redispatch_count)
            .bind(row.created_at)
            .bind(row.started_at)
            .bind(row.completed_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn find_opportunity(
        &self,
        id: OpportunityId,
    ) -> Result<Option<ResearchOpportunity>, DbError> {
        let row: Option<OpportunityRow> = sqlx::query_as(&format!(
            "SELECT {} FROM research_opportunities WHERE id = ?",
            OPPORTUNITY_COLUMNS
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(OpportunityRow::into_domain).transpose()
    }

    /// All selected opportunities in catalog order.
    pub async fn find_all_opportunities(&self) -> Result<Vec<ResearchOpportunity>, DbError> {
        let rows: Vec<OpportunityRow> = sqlx::query_as(&format!(
            "SELECT {} FROM research_opportunities ORDER BY catalog_index",
            OPPORTUNITY_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(OpportunityRow::into_domain).collect()
    }

    /// `pending`/`in_progress` → `in_progress`. Returns `false` for
    /// opportunities already completed or skipped.
    pub async fn mark_in_progress(
        &self,
        id: OpportunityId,
        now: DateTime<Utc>,
    ) -> Result<bool, DbError> {
        let result = sqlx::query(
            "UPDATE research_opportunities \
             SET status = 'in_progress', started_at = COALESCE(started_at, ?) \
             WHERE id = ? AND status IN ('pending', 'in_progress')",
        )
        .bind(now.timestamp())
        .bind(id.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn mark_skipped(
        &self,
        id: OpportunityId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, DbError> {
        let result = sqlx::query(
            "UPDATE research_opportunities \
             SET status = 'skipped', skip_reason = ?, completed_at = ? \
             WHERE id = ? AND status IN ('pending', 'in_progress')",
        )
        .bind(reason)
        .bind(now.timestamp())
        .bind(id.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Explicit reset of an interrupted opportunity back to `pending`.
    pub async fn reset_to_pending(&self, id: OpportunityId) -> Result<bool, DbError> {
        let result = sqlx::query(
            "UPDATE research_opportunities SET status = 'pending', started_at = NULL \
             WHERE id = ? AND status = 'in_progress'",
        )
        .bind(id.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Records one more targeted re-dispatch round; returns the new count.
    pub async fn increment_redispatch(&self, id: OpportunityId) -> Result<u32, DbError> {
        let row: Option<(i64,)> = sqlx::query_as(
            "UPDATE research_opportunities SET redispatch_count = redispatch_count + 1 \
             WHERE id = ? RETURNING redispatch_count",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((count,)) => Ok(u32::try_from(count).unwrap_or_default()),
            None => Err(DbError::OpportunityNotFound(id.as_str().to_string())),
        }
    }

    pub async fn delete_opportunity(&self, id: OpportunityId) -> Result<bool, DbError> {
        let result = sqlx::query("DELETE FROM research_opportunities WHERE id = ?")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn counts(&self) -> Result<OpportunityCounts, DbError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM research_opportunities GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts = OpportunityCounts::default();
        for (status, count) in rows {
            match status.as_str() {
                "pending" => counts.pending = count,
                "in_progress" => counts.in_progress = count,
                "completed" => counts.completed = count,
                "skipped" => counts.skipped = count,
                _ => return Err(DbError::corrupt("research_opportunities", "status", status)),
            }
        }
        Ok(counts)
    }

    // =========================================================================
    // Executions (append-only audit trail)
    // =========================================================================

    pub async fn create_execution(&self, execution: &ResearchExecution) -> Result<(), DbError> {
        let row = ExecutionRow::from(execution);

        sqlx::query(
            r#"
            INSERT INTO research_executions (id, opportunity_id, round, status, prompt, raw_response,
                                             retry_count, error, started_at, finished_at, seq)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?,
                    (SELECT COALESCE(MAX(seq), 0) + 1 FROM research_executions))
            "#,
        )
        .bind(&row.id)
        .bind(&row.opportunity_id)
        .bind(row.round)
        .bind(&row.status)
        .bind(&row.prompt)
        .bind(&row.raw_response)
        .bind(row.retry_count)
        .bind(&row.error)
        .bind(row.started_at)
        .bind(row.finished_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Moves a `started` execution to its outcome. The raw response is stored
    /// verbatim whether or not it parsed.
    pub async fn finish_execution(
        &self,
        id: Uuid,
        status: ExecutionStatus,
        raw_response: Option<&str>,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, DbError> {
        let result = sqlx::query(
            "UPDATE research_executions \
             SET status = ?, raw_response = ?, error = ?, finished_at = ? \
             WHERE id = ? AND status = 'started'",
        )
        .bind(status.as_str())
        .bind(raw_response)
        .bind(error)
        .bind(now.timestamp())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn executions_for(
        &self,
        opportunity_id: OpportunityId,
    ) -> Result<Vec<ResearchExecution>, DbError> {
        let rows: Vec<ExecutionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM research_executions WHERE opportunity_id = ? ORDER BY seq",
            EXECUTION_COLUMNS
        ))
        .bind(opportunity_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ExecutionRow::into_domain).collect()
    }

    pub async fn latest_execution(
        &self,
        opportunity_id: OpportunityId,
    ) -> Result<Option<ResearchExecution>, DbError> {
        let row: Option<ExecutionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM research_executions WHERE opportunity_id = ? ORDER BY seq DESC LIMIT 1",
            EXECUTION_COLUMNS
        ))
        .bind(opportunity_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(ExecutionRow::into_domain).transpose()
    }

    /// The most recent completed execution of an opportunity.
    pub async fn latest_completed_execution(
        &self,
        opportunity_id: OpportunityId,
    ) -> Result<Option<ResearchExecution>, DbError> {
        let row: Option<ExecutionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM research_executions WHERE opportunity_id = ? AND status = 'completed' \
             ORDER BY seq DESC LIMIT 1",
            EXECUTION_COLUMNS
        ))
        .bind(opportunity_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(ExecutionRow::into_domain).transpose()
    }

    /// Marks every execution still `started` as failed. Used on restart, when
    /// no worker can still be answering them.
    pub async fn abandon_started_executions(&self, now: DateTime<Utc>) -> Result<u64, DbError> {
        let result = sqlx::query(
            "UPDATE research_executions SET status = 'failed', error = 'abandoned', finished_at = ? \
             WHERE status = 'started'",
        )
        .bind(now.timestamp())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
