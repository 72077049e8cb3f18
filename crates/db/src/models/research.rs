use keystone_core::{
    Confidence, ExecutionStatus, OpportunityId, OpportunityStatus, ResearchExecution,
    ResearchOpportunity,
};

use super::{datetime_to_timestamp, parse_uuid, timestamp_to_datetime};
use crate::error::DbError;

pub(crate) const OPPORTUNITY_COLUMNS: &str = "id, catalog_index, status, result_summary, \
     confidence, skip_reason, redispatch_count, created_at, started_at, completed_at";

pub(crate) const EXECUTION_COLUMNS: &str = "id, opportunity_id, round, status, prompt, \
     raw_response, retry_count, error, started_at, finished_at";

pub(crate) fn parse_opportunity_id(table: &'static str, value: &str) -> Result<OpportunityId, DbError> {
    OpportunityId::parse(value).ok_or_else(|| DbError::corrupt(table, "opportunity_id", value))
}

pub(crate) fn parse_confidence(table: &'static str, value: &str) -> Result<Confidence, DbError> {
    Confidence::parse(value).ok_or_else(|| DbError::corrupt(table, "confidence", value))
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OpportunityRow {
    pub id: String,
    pub catalog_index: i64,
    pub status: String,
    pub result_summary: Option<String>,
    pub confidence: Option<String>,
    pub skip_reason: Option<String>,
    pub redispatch_count: i64,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

impl OpportunityRow {
    pub fn into_domain(self) -> Result<ResearchOpportunity, DbError> {
        Ok(ResearchOpportunity {
            id: OpportunityId::parse(&self.id)
                .ok_or_else(|| DbError::corrupt("research_opportunities", "id", &self.id))?,
            status: OpportunityStatus::parse(&self.status).ok_or_else(|| {
                DbError::corrupt("research_opportunities", "status", &self.status)
            })?,
            confidence: self
                .confidence
                .as_deref()
                .map(|c| parse_confidence("research_opportunities", c))
                .transpose()?,
            result_summary: self.result_summary,
            skip_reason: self.skip_reason,
            redispatch_count: u32::try_from(self.redispatch_count).unwrap_or_default(),
            created_at: timestamp_to_datetime(self.created_at),
            started_at: self.started_at.map(timestamp_to_datetime),
            completed_at: self.completed_at.map(timestamp_to_datetime),
        })
    }
}

impl From<&ResearchOpportunity> for OpportunityRow {
    fn from(opportunity: &ResearchOpportunity) -> Self {
        Self {
            id: opportunity.id.as_str().to_string(),
            catalog_index: opportunity.id.catalog_index() as i64,
            status: opportunity.status.as_str().to_string(),
            result_summary: opportunity.result_summary.clone(),
            confidence: opportunity.confidence.map(|c| c.as_str().to_string()),
            skip_reason: opportunity.skip_reason.clone(),
            redispatch_count: i64::from(opportunity.redispatch_count),
            created_at: datetime_to_timestamp(opportunity.created_at),
            started_at: opportunity.started_at.map(datetime_to_timestamp),
            completed_at: opportunity.completed_at.map(datetime_to_timestamp),
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ExecutionRow {
    pub id: String,
    pub opportunity_id: String,
    pub round: i64,
    pub status: String,
    pub prompt: String,
    pub raw_response: Option<String>,
    pub retry_count: i64,
    pub error: Option<String>,
    pub started_at: i64,
    pub finished_at: Option<i64>,
}

impl ExecutionRow {
    pub fn into_domain(self) -> Result<ResearchExecution, DbError> {
        Ok(ResearchExecution {
            id: parse_uuid("research_executions", "id", &self.id)?,
            opportunity_id: parse_opportunity_id("research_executions", &self.opportunity_id)?,
            status: ExecutionStatus::parse(&self.status)
                .ok_or_else(|| DbError::corrupt("research_executions", "status", &self.status))?,
            round: u32::try_from(self.round).unwrap_or_default(),
            prompt: self.prompt,
            raw_response: self.raw_response,
            retry_count: u32::try_from(self.retry_count).unwrap_or_default(),
            error: self.error,
            started_at: timestamp_to_datetime(self.started_at),
            finished_at: self.finished_at.map(timestamp_to_datetime),
        })
    }
}

impl From<&ResearchExecution> for ExecutionRow {
    fn from(execution: &ResearchExecution) -> Self {
        Self {
            id: execution.id.to_string(),
            opportunity_id: execution.opportunity_id.as_str().to_string(),
            round: i64::from(execution.round),
            status: execution.status.as_str().to_string(),
            prompt: execution.prompt.clone(),
            raw_response: execution.raw_response.clone(),
            retry_count: i64::from(execution.retry_count),
            error: execution.error.clone(),
            started_at: datetime_to_timestamp(execution.started_at),
            finished_at: execution.finished_at.map(datetime_to_timestamp),
        }
    }
}
