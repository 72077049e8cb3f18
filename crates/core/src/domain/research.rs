use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use super::{OpportunityId, TechCategory};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum OpportunityStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Skipped,
}

impl OpportunityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    #[default]
    Started,
    Completed,
    Failed,
    Retrying,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "started" => Some(Self::Started),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "retrying" => Some(Self::Retrying),
            _ => None,
        }
    }
}

/// Ordered `Low < Medium < High`.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Confidence {
    Low,
    #[default]
    Medium,
    High,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "HIGH" => Some(Self::High),
            "MEDIUM" => Some(Self::Medium),
            "LOW" => Some(Self::Low),
            _ => None,
        }
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Value of the `research_phase` process-state marker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResearchPhase {
    #[default]
    NotStarted,
    Foundation,
    Dispatching,
    Reconciling,
    Completed,
}

impl ResearchPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Foundation => "foundation",
            Self::Dispatching => "dispatching",
            Self::Reconciling => "reconciling",
            Self::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "not_started" => Some(Self::NotStarted),
            "foundation" => Some(Self::Foundation),
            "dispatching" => Some(Self::Dispatching),
            "reconciling" => Some(Self::Reconciling),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResearchOpportunity {
    pub id: OpportunityId,
    pub status: OpportunityStatus,
    pub result_summary: Option<String>,
    pub confidence: Option<Confidence>,
    pub skip_reason: Option<String>,
    /// Targeted re-dispatch rounds spent during reconciliation.
    pub redispatch_count: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ResearchOpportunity {
    pub fn new(id: OpportunityId) -> Self {
        Self {
            id,
            status: OpportunityStatus::default(),
            result_summary: None,
            confidence: None,
            skip_reason: None,
            redispatch_count: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }
}

/// One dispatch attempt of an opportunity to a research worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResearchExecution {
    pub id: Uuid,
    pub opportunity_id: OpportunityId,
    /// 0 for the initial fan-out, incremented by each targeted re-dispatch.
    pub round: u32,
    pub status: ExecutionStatus,
    pub prompt: String,
    /// Worker output, retained verbatim.
    pub raw_response: Option<String>,
    pub retry_count: u32,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ResearchExecution {
    pub fn start(
        opportunity_id: OpportunityId,
        round: u32,
        retry_count: u32,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            opportunity_id,
            round,
            status: ExecutionStatus::Started,
            prompt: prompt.into(),
            raw_response: None,
            retry_count,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum ComplexityTier {
    Simple,
    #[default]
    Standard,
    Complex,
}

/// A technology the requirements name outright.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExplicitRequirement {
    pub category: TechCategory,
    pub technology: String,
    #[serde(default)]
    pub version: Option<String>,
}

/// Something the project needs decided, and the opportunity expected to decide it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Unknown {
    pub question: String,
    pub opportunity: OpportunityId,
}

/// Fallback decision used when research for an opportunity yields nothing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeclaredDefault {
    pub technology: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub rationale: Option<String>,
}

/// Research context threaded through the three research phases.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResearchContext {
    pub project_type: String,
    #[serde(default)]
    pub complexity: ComplexityTier,
    #[serde(default)]
    pub known_facts: Vec<String>,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default)]
    pub explicit_requirements: Vec<ExplicitRequirement>,
    #[serde(default)]
    pub unknowns: Vec<Unknown>,
    #[serde(default)]
    pub defaults: BTreeMap<OpportunityId, DeclaredDefault>,
}

impl ResearchContext {
    pub fn new(project_type: impl Into<String>) -> Self {
        Self {
            project_type: project_type.into(),
            ..Default::default()
        }
    }

    pub fn with_explicit(
        mut self,
        category: TechCategory,
        technology: impl Into<String>,
        version: Option<&str>,
    ) -> Self {
        self.explicit_requirements.push(ExplicitRequirement {
            category,
            technology: technology.into(),
            version: version.map(str::to_string),
        });
        self
    }

    pub fn with_unknown(mut self, question: impl Into<String>, opportunity: OpportunityId) -> Self {
        self.unknowns.push(Unknown {
            question: question.into(),
            opportunity,
        });
        self
    }

    pub fn with_default(mut self, opportunity: OpportunityId, default: DeclaredDefault) -> Self {
        self.defaults.insert(opportunity, default);
        self
    }

    pub fn explicit_for(&self, category: TechCategory) -> Option<&ExplicitRequirement> {
        self.explicit_requirements
            .iter()
            .find(|r| r.category == category)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CompatibilityRelation {
    Requires,
    IncompatibleWith,
    CompatibleWith,
}

/// A compatibility statement a recommendation makes about another technology.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum CompatibilityNote {
    Structured {
        relation: CompatibilityRelation,
        technology: String,
        #[serde(default)]
        category: Option<TechCategory>,
        #[serde(default)]
        note: Option<String>,
    },
    Text(String),
}

impl CompatibilityNote {
    pub fn text(note: impl Into<String>) -> Self {
        Self::Text(note.into())
    }

    pub fn incompatible_with(technology: impl Into<String>) -> Self {
        Self::Structured {
            relation: CompatibilityRelation::IncompatibleWith,
            technology: technology.into(),
            category: None,
            note: None,
        }
    }

    pub fn requires(technology: impl Into<String>, category: Option<TechCategory>) -> Self {
        Self::Structured {
            relation: CompatibilityRelation::Requires,
            technology: technology.into(),
            category,
            note: None,
        }
    }
}

impl fmt::Display for CompatibilityNote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(text) => f.write_str(text),
            Self::Structured {
                relation,
                technology,
                note,
                ..
            } => {
                let verb = match relation {
                    CompatibilityRelation::Requires => "requires",
                    CompatibilityRelation::IncompatibleWith => "incompatible with",
                    CompatibilityRelation::CompatibleWith => "compatible with",
                };
                match note {
                    Some(note) => write!(f, "{} {}: {}", verb, technology, note),
                    None => write!(f, "{} {}", verb, technology),
                }
            }
        }
    }
}

/// Structured record a research worker returns.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Recommendation {
    pub recommendation: String,
    pub version: String,
    pub source: String,
    pub alternatives: Vec<String>,
    pub rationale: String,
    pub compatibility_notes: Vec<CompatibilityNote>,
    pub confidence: Confidence,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confidence_ordering_and_wire_format() {
        assert!(Confidence::High > Confidence::Medium);
        assert!(Confidence::Medium > Confidence::Low);
        assert_eq!(serde_json::to_string(&Confidence::High).unwrap(), "\"HIGH\"");
        assert_eq!(Confidence::parse("low"), Some(Confidence::Low));
        assert_eq!(Confidence::parse("certain"), None);
    }

    #[test]
    fn test_status_parsing_is_closed() {
        assert_eq!(
            OpportunityStatus::parse("skipped"),
            Some(OpportunityStatus::Skipped)
        );
        assert_eq!(OpportunityStatus::parse("abandoned"), None);
        assert_eq!(
            ExecutionStatus::parse("retrying"),
            Some(ExecutionStatus::Retrying)
        );
        assert_eq!(ExecutionStatus::parse("running"), None);
        assert_eq!(
            ResearchPhase::parse("reconciling"),
            Some(ResearchPhase::Reconciling)
        );
    }

    #[test]
    fn test_recommendation_parses_mixed_compatibility_notes() {
        let json = r#"{
            "recommendation": "Mongoose",
            "version": "8.4",
            "source": "https://mongoosejs.com",
            "alternatives": ["Prisma"],
            "rationale": "Document modelling",
            "compatibility_notes": [
                "Works best with Node 20",
                {"relation": "incompatible_with", "technology": "PostgreSQL"}
            ],
            "confidence": "MEDIUM"
        }"#;

        let rec: Recommendation = serde_json::from_str(json).unwrap();
        assert_eq!(rec.confidence, Confidence::Medium);
        assert_eq!(rec.compatibility_notes.len(), 2);
        assert_eq!(
            rec.compatibility_notes[1],
            CompatibilityNote::incompatible_with("PostgreSQL")
        );
        assert_eq!(
            rec.compatibility_notes[1].to_string(),
            "incompatible with PostgreSQL"
        );
    }

    #[test]
    fn test_recommendation_requires_all_fields() {
        let json = r#"{"recommendation": "Redis", "version": "7"}"#;
        assert!(serde_json::from_str::<Recommendation>(json).is_err());
    }

    #[test]
    fn test_context_builders() {
        let context = ResearchContext::new("web_app")
            .with_explicit(TechCategory::Database, "PostgreSQL", Some("16"))
            .with_unknown("How do we test?", OpportunityId::OpsTesting);

        assert_eq!(
            context
                .explicit_for(TechCategory::Database)
                .map(|r| r.technology.as_str()),
            Some("PostgreSQL")
        );
        assert!(context.explicit_for(TechCategory::Orm).is_none());
        assert_eq!(context.unknowns[0].opportunity, OpportunityId::OpsTesting);
    }

    #[test]
    fn test_context_defaults_keyed_by_catalog_id() {
        let context = ResearchContext::new("cli").with_default(
            OpportunityId::OpsTesting,
            DeclaredDefault {
                technology: "cargo test".to_string(),
                version: None,
                rationale: None,
            },
        );
        let json = serde_json::to_value(&context).unwrap();
        assert_eq!(json["defaults"]["OPS_TESTING"]["technology"], "cargo test");
    }
}
