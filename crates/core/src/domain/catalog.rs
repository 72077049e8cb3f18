//! The fixed research opportunity catalog.
//!
//! Opportunity identity is a closed enumeration. Declaration order is the
//! catalog order used by the reconciliation tie-break.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum OpportunityCategory {
    Stack,
    Operations,
    Security,
    Integration,
}

impl OpportunityCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stack => "stack",
            Self::Operations => "operations",
            Self::Security => "security",
            Self::Integration => "integration",
        }
    }
}

/// Slot in the technology stack a recommendation fills. Two recommendations
/// in the same slot are mutually exclusive.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum TechCategory {
    Language,
    BackendFramework,
    FrontendFramework,
    Database,
    Orm,
    Cache,
    Messaging,
    Search,
    Auth,
    Testing,
    Ci,
    Deployment,
    Observability,
    Secrets,
    Payments,
    Email,
}

impl TechCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Language => "language",
            Self::BackendFramework => "backend_framework",
            Self::FrontendFramework => "frontend_framework",
            Self::Database => "database",
            Self::Orm => "orm",
            Self::Cache => "cache",
            Self::Messaging => "messaging",
            Self::Search => "search",
            Self::Auth => "auth",
            Self::Testing => "testing",
            Self::Ci => "ci",
            Self::Deployment => "deployment",
            Self::Observability => "observability",
            Self::Secrets => "secrets",
            Self::Payments => "payments",
            Self::Email => "email",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "language" => Some(Self::Language),
            "backend_framework" => Some(Self::BackendFramework),
            "frontend_framework" => Some(Self::FrontendFramework),
            "database" => Some(Self::Database),
            "orm" => Some(Self::Orm),
            "cache" => Some(Self::Cache),
            "messaging" => Some(Self::Messaging),
            "search" => Some(Self::Search),
            "auth" => Some(Self::Auth),
            "testing" => Some(Self::Testing),
            "ci" => Some(Self::Ci),
            "deployment" => Some(Self::Deployment),
            "observability" => Some(Self::Observability),
            "secrets" => Some(Self::Secrets),
            "payments" => Some(Self::Payments),
            "email" => Some(Self::Email),
            _ => None,
        }
    }
}

impl fmt::Display for TechCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OpportunityId {
    StackLanguage,
    StackBackendFramework,
    StackFrontendFramework,
    StackDatabase,
    StackOrm,
    StackCache,
    StackMessaging,
    StackSearch,
    StackAuth,
    StackRealtime,
    OpsTesting,
    OpsCi,
    OpsDeployment,
    OpsObservability,
    SecSecrets,
    IntPayments,
    IntEmail,
}

/// Static description of one catalog entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatalogEntry {
    pub id: OpportunityId,
    pub category: OpportunityCategory,
    pub technology_category: TechCategory,
    pub name: &'static str,
    pub trigger: &'static str,
    pub research_question: &'static str,
}

impl OpportunityId {
    /// Every catalog entry, in catalog order.
    pub const ALL: [OpportunityId; 17] = [
        Self::StackLanguage,
        Self::StackBackendFramework,
        Self::StackFrontendFramework,
        Self::StackDatabase,
        Self::StackOrm,
        Self::StackCache,
        Self::StackMessaging,
        Self::StackSearch,
        Self::StackAuth,
        Self::StackRealtime,
        Self::OpsTesting,
        Self::OpsCi,
        Self::OpsDeployment,
        Self::OpsObservability,
        Self::SecSecrets,
        Self::IntPayments,
        Self::IntEmail,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StackLanguage => "STACK_LANGUAGE",
            Self::StackBackendFramework => "STACK_BACKEND_FRAMEWORK",
            Self::StackFrontendFramework => "STACK_FRONTEND_FRAMEWORK",
            Self::StackDatabase => "STACK_DATABASE",
            Self::StackOrm => "STACK_ORM",
            Self::StackCache => "STACK_CACHE",
            Self::StackMessaging => "STACK_MESSAGING",
            Self::StackSearch => "STACK_SEARCH",
            Self::StackAuth => "STACK_AUTH",
            Self::StackRealtime => "STACK_REALTIME",
            Self::OpsTesting => "OPS_TESTING",
            Self::OpsCi => "OPS_CI",
            Self::OpsDeployment => "OPS_DEPLOYMENT",
            Self::OpsObservability => "OPS_OBSERVABILITY",
            Self::SecSecrets => "SEC_SECRETS",
            Self::IntPayments => "INT_PAYMENTS",
            Self::IntEmail => "INT_EMAIL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|id| id.as_str() == s)
    }

    /// Position in the catalog; lower wins the final tie-break.
    pub fn catalog_index(&self) -> usize {
        Self::ALL
            .iter()
            .position(|id| id == self)
            .unwrap_or(Self::ALL.len())
    }

    pub fn entry(&self) -> CatalogEntry {
        use OpportunityCategory::*;
        use TechCategory as T;

        let (category, technology_category, name, trigger, research_question) = match self {
            Self::StackLanguage => (
                Stack,
                T::Language,
                "Primary language",
                "No implementation language is mandated by the requirements",
                "Which programming language and toolchain version best fits this project?",
            ),
            Self::StackBackendFramework => (
                Stack,
                T::BackendFramework,
                "Backend framework",
                "The project exposes a server-side API or web backend",
                "Which backend web framework (and current stable version) should be used?",
            ),
            Self::StackFrontendFramework => (
                Stack,
                T::FrontendFramework,
                "Frontend framework",
                "The project has a browser-based user interface",
                "Which frontend framework (and current stable version) should be used?",
            ),
            Self::StackDatabase => (
                Stack,
                T::Database,
                "Primary database",
                "The project persists structured data",
                "Which database engine and version should store the primary data?",
            ),
            Self::StackOrm => (
                Stack,
                T::Orm,
                "Data access layer",
                "The project talks to a relational or document database from application code",
                "Which ORM or query library should be used, compatible with the chosen database?",
            ),
            Self::StackCache => (
                Stack,
                T::Cache,
                "Cache",
                "The requirements mention caching, sessions or hot read paths",
                "Which caching technology should be used?",
            ),
            Self::StackMessaging => (
                Stack,
                T::Messaging,
                "Messaging",
                "Work is processed asynchronously or across services",
                "Which message broker or job queue should be used?",
            ),
            Self::StackSearch => (
                Stack,
                T::Search,
                "Search",
                "Users search or filter large amounts of content",
                "Which full-text search engine should be used?",
            ),
            Self::StackAuth => (
                Stack,
                T::Auth,
                "Authentication",
                "The project has user accounts or protected resources",
                "Which authentication library or identity provider should be used?",
            ),
            Self::StackRealtime => (
                Stack,
                T::Messaging,
                "Realtime transport",
                "Clients receive live updates pushed by the server",
                "Which realtime or pub/sub transport should deliver live updates?",
            ),
            Self::OpsTesting => (
                Operations,
                T::Testing,
                "Testing",
                "Always applicable to projects with executable code",
                "Which test framework and tooling should be used?",
            ),
            Self::OpsCi => (
                Operations,
                T::Ci,
                "Continuous integration",
                "The project is developed in a shared repository",
                "Which CI service and pipeline setup should be used?",
            ),
            Self::OpsDeployment => (
                Operations,
                T::Deployment,
                "Deployment",
                "The project is deployed to a hosted environment",
                "Which deployment target and packaging should be used?",
            ),
            Self::OpsObservability => (
                Operations,
                T::Observability,
                "Observability",
                "The project runs as a long-lived service",
                "Which logging, metrics and tracing tooling should be used?",
            ),
            Self::SecSecrets => (
                Security,
                T::Secrets,
                "Secrets management",
                "The project handles credentials or third-party API keys",
                "How should secrets be stored and injected?",
            ),
            Self::IntPayments => (
                Integration,
                T::Payments,
                "Payments",
                "The requirements mention billing, checkout or subscriptions",
                "Which payment provider and SDK version should be integrated?",
            ),
            Self::IntEmail => (
                Integration,
                T::Email,
                "Email delivery",
                "The project sends transactional email",
                "Which email delivery provider and SDK should be used?",
            ),
        };

        CatalogEntry {
            id: *self,
            category,
            technology_category,
            name,
            trigger,
            research_question,
        }
    }

    pub fn technology_category(&self) -> TechCategory {
        self.entry().technology_category
    }

    pub fn research_question(&self) -> &'static str {
        self.entry().research_question
    }
}

impl fmt::Display for OpportunityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OpportunityId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| CoreError::UnknownOpportunity(s.to_string()))
    }
}

/// The whole catalog, in catalog order.
pub fn catalog() -> Vec<CatalogEntry> {
    OpportunityId::ALL.iter().map(|id| id.entry()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_ids_round_trip_through_strings() {
        for id in OpportunityId::ALL {
            assert_eq!(OpportunityId::parse(id.as_str()), Some(id));
        }
        assert_eq!(OpportunityId::parse("stack_database"), None);
    }

    #[test]
    fn test_unknown_id_is_an_error() {
        let err = "STACK_BLOCKCHAIN".parse::<OpportunityId>().unwrap_err();
        assert_eq!(
            err,
            CoreError::UnknownOpportunity("STACK_BLOCKCHAIN".to_string())
        );
    }

    #[test]
    fn test_serde_uses_catalog_ids() {
        let json = serde_json::to_string(&OpportunityId::OpsTesting).unwrap();
        assert_eq!(json, "\"OPS_TESTING\"");
        let id: OpportunityId = serde_json::from_str("\"STACK_ORM\"").unwrap();
        assert_eq!(id, OpportunityId::StackOrm);
    }

    #[test]
    fn test_catalog_order() {
        assert_eq!(OpportunityId::StackLanguage.catalog_index(), 0);
        assert!(
            OpportunityId::StackDatabase.catalog_index() < OpportunityId::StackOrm.catalog_index()
        );
        assert_eq!(catalog().len(), OpportunityId::ALL.len());
    }

    #[test]
    fn test_shared_technology_category() {
        assert_eq!(
            OpportunityId::StackMessaging.technology_category(),
            OpportunityId::StackRealtime.technology_category()
        );
        assert_ne!(
            OpportunityId::StackDatabase.technology_category(),
            OpportunityId::StackOrm.technology_category()
        );
    }
}
