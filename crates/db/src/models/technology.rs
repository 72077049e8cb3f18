use keystone_core::{Provenance, TechCategory, Technology, TechnologySource};

use super::research::{parse_confidence, parse_opportunity_id};
use super::{datetime_to_timestamp, parse_uuid, timestamp_to_datetime};
use crate::error::DbError;

pub(crate) const TECHNOLOGY_COLUMNS: &str = "id, name, category, version, confidence, \
     alternatives, compatibility_notes, rationale, opportunity_id, provenance, created_at";

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TechnologyRow {
    pub id: String,
    pub name: String,
    pub category: String,
    pub version: Option<String>,
    pub confidence: String,
    pub alternatives: String,
    pub compatibility_notes: String,
    pub rationale: Option<String>,
    pub opportunity_id: Option<String>,
    pub provenance: String,
    pub created_at: i64,
}

impl TechnologyRow {
    /// Sources are loaded separately and attached by the repository.
    pub fn into_domain(self, sources: Vec<TechnologySource>) -> Result<Technology, DbError> {
        Ok(Technology {
            id: parse_uuid("technologies", "id", &self.id)?,
            category: TechCategory::parse(&self.category)
                .ok_or_else(|| DbError::corrupt("technologies", "category", &self.category))?,
            confidence: parse_confidence("technologies", &self.confidence)?,
            provenance: Provenance::parse(&self.provenance)
                .ok_or_else(|| DbError::corrupt("technologies", "provenance", &self.provenance))?,
            opportunity_id: self
                .opportunity_id
                .as_deref()
                .map(|id| parse_opportunity_id("technologies", id))
                .transpose()?,
            alternatives: serde_json::from_str(&self.alternatives)?,
            compatibility_notes: serde_json::from_str(&self.compatibility_notes)?,
            name: self.name,
            version: self.version,
            rationale: self.rationale,
            sources,
            created_at: timestamp_to_datetime(self.created_at),
        })
    }
}

impl TryFrom<&Technology> for TechnologyRow {
    type Error = DbError;

    fn try_from(technology: &Technology) -> Result<Self, Self::Error> {
        Ok(Self {
            id: technology.id.to_string(),
            name: technology.name.clone(),
            category: technology.category.as_str().to_string(),
            version: technology.version.clone(),
            confidence: technology.confidence.as_str().to_string(),
            alternatives: serde_json::to_string(&technology.alternatives)?,
            compatibility_notes: serde_json::to_string(&technology.compatibility_notes)?,
            rationale: technology.rationale.clone(),
            opportunity_id: technology.opportunity_id.map(|id| id.as_str().to_string()),
            provenance: technology.provenance.as_str().to_string(),
            created_at: datetime_to_timestamp(technology.created_at),
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TechnologySourceRow {
    pub id: String,
    pub technology_id: String,
    pub url: String,
    pub verified: bool,
    pub verification_note: Option<String>,
    pub checked_at: Option<i64>,
}

impl TechnologySourceRow {
    pub fn into_domain(self) -> Result<TechnologySource, DbError> {
        Ok(TechnologySource {
            id: parse_uuid("technology_sources", "id", &self.id)?,
            technology_id: parse_uuid("technology_sources", "technology_id", &self.technology_id)?,
            url: self.url,
            verified: self.verified,
            verification_note: self.verification_note,
            checked_at: self.checked_at.map(timestamp_to_datetime),
        })
    }
}

impl From<&TechnologySource> for TechnologySourceRow {
    fn from(source: &TechnologySource) -> Self {
        Self {
            id: source.id.to_string(),
            technology_id: source.technology_id.to_string(),
            url: source.url.clone(),
            verified: source.verified,
            verification_note: source.verification_note.clone(),
            checked_at: source.checked_at.map(datetime_to_timestamp),
        }
    }
}
