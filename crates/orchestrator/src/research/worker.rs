use async_trait::async_trait;
use keystone_core::{OpportunityId, ResearchContext};
use serde::Serialize;

use crate::error::Result;

/// What a research worker receives for one dispatch attempt.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ResearchRequest {
    pub opportunity_id: OpportunityId,
    pub research_question: String,
    pub context: ResearchContext,
    /// Conflict description when this is a targeted re-dispatch.
    pub follow_up: Option<String>,
    /// The exact prompt recorded on the execution row.
    pub prompt: String,
}

/// Gathers technology facts for one opportunity.
///
/// The returned text is stored verbatim and parsed afterwards; a response
/// that does not parse counts as a failed attempt.
#[async_trait]
pub trait ResearchWorker: Send + Sync {
    async fn research(&self, request: &ResearchRequest) -> Result<String>;
}
