use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Confidence, OpportunityId, TechCategory};

/// Where a committed technology decision came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
pub enum Provenance {
    ExplicitRequirement,
    Researched,
    Default,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExplicitRequirement => "explicit-requirement",
            Self::Researched => "researched",
            Self::Default => "default",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "explicit-requirement" => Some(Self::ExplicitRequirement),
            "researched" => Some(Self::Researched),
            "default" => Some(Self::Default),
            _ => None,
        }
    }
}

/// Supporting citation for a technology decision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TechnologySource {
    pub id: Uuid,
    pub technology_id: Uuid,
    pub url: String,
    /// True only when the URL was actually fetched, not merely cited.
    pub verified: bool,
    pub verification_note: Option<String>,
    pub checked_at: Option<DateTime<Utc>>,
}

impl TechnologySource {
    pub fn cited(technology_id: Uuid, url: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            technology_id,
            url: url.into(),
            verified: false,
            verification_note: None,
            checked_at: None,
        }
    }
}

/// A committed technology decision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Technology {
    pub id: Uuid,
    pub name: String,
    pub category: TechCategory,
    pub version: Option<String>,
    pub confidence: Confidence,
    pub alternatives: Vec<String>,
    pub compatibility_notes: Vec<String>,
    pub rationale: Option<String>,
    pub opportunity_id: Option<OpportunityId>,
    pub provenance: Provenance,
    pub sources: Vec<TechnologySource>,
    pub created_at: DateTime<Utc>,
}

impl Technology {
    pub fn new(name: impl Into<String>, category: TechCategory, provenance: Provenance) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            category,
            version: None,
            confidence: Confidence::default(),
            alternatives: Vec::new(),
            compatibility_notes: Vec::new(),
            rationale: None,
            opportunity_id: None,
            provenance,
            sources: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_version(mut self, version: Option<String>) -> Self {
        self.version = version;
        self
    }

    pub fn with_confidence(mut self, confidence: Confidence) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn with_opportunity(mut self, opportunity: Option<OpportunityId>) -> Self {
        self.opportunity_id = opportunity;
        self
    }

    pub fn add_source(&mut self, url: impl Into<String>) -> &mut TechnologySource {
        let source = TechnologySource::cited(self.id, url);
        self.sources.push(source);
        let last = self.sources.len() - 1;
        &mut self.sources[last]
    }

    /// `name version`, or just `name` when no version is pinned.
    pub fn label(&self) -> String {
        match &self.version {
            Some(version) if !version.is_empty() => format!("{} {}", self.name, version),
            _ => self.name.clone(),
        }
    }
}
