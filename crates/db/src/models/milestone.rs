use keystone_core::{Milestone, MilestoneStatus};

use super::{datetime_to_timestamp, parse_uuid, timestamp_to_datetime};
use crate::error::DbError;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MilestoneRow {
    pub id: String,
    pub name: String,
    pub ordering: i64,
    pub status: String,
    pub completed_at: Option<i64>,
    pub created_at: i64,
}

impl MilestoneRow {
    pub fn into_domain(self) -> Result<Milestone, DbError> {
        Ok(Milestone {
            id: parse_uuid("milestones", "id", &self.id)?,
            status: MilestoneStatus::parse(&self.status)
                .ok_or_else(|| DbError::corrupt("milestones", "status", &self.status))?,
            name: self.name,
            ordering: self.ordering,
            completed_at: self.completed_at.map(timestamp_to_datetime),
            created_at: timestamp_to_datetime(self.created_at),
        })
    }
}

impl From<&Milestone> for MilestoneRow {
    fn from(milestone: &Milestone) -> Self {
        Self {
            id: milestone.id.to_string(),
            name: milestone.name.clone(),
            ordering: milestone.ordering,
            status: milestone.status.as_str().to_string(),
            completed_at: milestone.completed_at.map(datetime_to_timestamp),
            created_at: datetime_to_timestamp(milestone.created_at),
        }
    }
}
