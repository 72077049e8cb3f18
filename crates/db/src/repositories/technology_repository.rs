use chrono::{DateTime, Utc};
use keystone_core::{Confidence, OpportunityId, ResearchPhase, TechCategory, Technology};
use sqlx::SqlitePool;
use std::collections::HashMap;

use super::process_state_repository::{upsert, RESEARCH_PHASE_KEY};
use crate::error::DbError;
use crate::models::{TechnologyRow, TechnologySourceRow, TECHNOLOGY_COLUMNS};

/// Final state of one opportunity written by the research commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpportunityOutcome {
    Completed {
        id: OpportunityId,
        summary: String,
        confidence: Option<Confidence>,
    },
    Skipped {
        id: OpportunityId,
        reason: String,
    },
}

/// The reconciled decision set, written atomically.
#[derive(Debug, Clone, Default)]
pub struct ResearchCommit {
    pub technologies: Vec<Technology>,
    pub outcomes: Vec<OpportunityOutcome>,
}

#[derive(Clone)]
pub struct TechnologyRepository {
    pool: SqlitePool,
}

impl TechnologyRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Writes every technology and source, finalises opportunity statuses and
    /// sets the research-phase marker to `completed`, all in one transaction.
    ///
    /// Returns `false` without writing anything if research was already
    /// committed.
    pub async fn commit_research(
        &self,
        commit: &ResearchCommit,
        now: DateTime<Utc>,
    ) -> Result<bool, DbError> {
        let mut tx = self.pool.begin().await?;

        let phase: Option<(String,)> =
            sqlx::query_as("SELECT value FROM process_state WHERE key = ?")
                .bind(RESEARCH_PHASE_KEY)
                .fetch_optional(&mut *tx)
                .await?;
        if phase.as_ref().map(|(p,)| p.as_str()) == Some(ResearchPhase::Completed.as_str()) {
            tx.rollback().await?;
            return Ok(false);
        }

        for technology in &commit.technologies {
            let row = TechnologyRow::try_from(technology)?;
            sqlx::query(
                r#"
                INSERT INTO technologies (id, name, category, version, confidence, alternatives,
                                          compatibility_notes, rationale, opportunity_id, provenance, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&row.id)
            .bind(&row.name)
            .bind(&row.category)
            .bind(&row.version)
            .bind(&row.confidence)
            .bind(&row.alternatives)
            .bind(&row.compatibility_notes)
            .bind(&row.rationale)
            .bind(&row.opportunity_id)
            .bind(&row.provenance)
            .bind(row.created_at)
            .execute(&mut *tx)
            .await?;

            for source in &technology.sources {
                let row = TechnologySourceRow::from(source);
                sqlx::query(
                    r#"
                    INSERT INTO technology_sources (id, technology_id, url, verified, verification_note, checked_at)
                    VALUES (?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&row.id)
                .bind(&row.technology_id)
                .bind(&row.url)
                .bind(row.verified)
                .bind(&row.verification_note)
                .bind(row.checked_at)
                .execute(&mut *tx)
                .await?;
            }
        }

        for outcome in &commit.outcomes {
            match outcome {
                OpportunityOutcome::Completed {
                    id,
                    summary,
                    confidence,
                } => {
                    sqlx::query(
                        "UPDATE research_opportunities \
                         SET status = 'completed', result_summary = ?, confidence = ?, completed_at = ? \
                         WHERE id = ?",
                    )
                    .bind(summary)
                    .bind(confidence.map(|c| c.as_str()))
                    .bind(now.timestamp())
                    .bind(id.as_str())
                    .execute(&mut *tx)
                    .await?;
                }
                OpportunityOutcome::Skipped { id, reason } => {
                    sqlx::query(
                        "UPDATE research_opportunities \
                         SET status = 'skipped', skip_reason = ?, completed_at = COALESCE(completed_at, ?) \
                         WHERE id = ?",
                    )
                    .bind(reason)
                    .bind(now.timestamp())
                    .bind(id.as_str())
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }

        upsert(&mut *tx, RESEARCH_PHASE_KEY, ResearchPhase::Completed.as_str()).await?;
        tx.commit().await?;

        tracing::info!(
            technologies = commit.technologies.len(),
            opportunities = commit.outcomes.len(),
            "Research decisions committed"
        );
        Ok(true)
    }

    /// Every committed technology with its sources, ordered by category.
    pub async fn find_all(&self) -> Result<Vec<Technology>, DbError> {
        let rows: Vec<TechnologyRow> = sqlx::query_as(&format!(
            "SELECT {} FROM technologies ORDER BY category",
            TECHNOLOGY_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        let source_rows: Vec<TechnologySourceRow> = sqlx::query_as(
            "SELECT id, technology_id, url, verified, verification_note, checked_at \
             FROM technology_sources ORDER BY url",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut sources_by_tech: HashMap<String, Vec<_>> = HashMap::new();
        for row in source_rows {
            let key = row.technology_id.clone();
            sources_by_tech.entry(key).or_default().push(row.into_domain()?);
        }

        rows.into_iter()
            .map(|row| {
                let sources = sources_by_tech.remove(&row.id).unwrap_or_default();
                row.into_domain(sources)
            })
            .collect()
    }

    pub async fn find_by_category(
        &self,
        category: TechCategory,
    ) -> Result<Option<Technology>, DbError> {
        Ok(self
            .find_all()
            .await?
            .into_iter()
            .find(|t| t.category == category))
    }

    pub async fn count(&self) -> Result<i64, DbError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM technologies")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}
