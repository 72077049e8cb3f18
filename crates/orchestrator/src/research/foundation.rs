//! Phase 1: accept the research context and the opportunity selection.

use db::RESEARCH_CONTEXT_KEY;
use keystone_core::{OpportunityId, ResearchContext, ResearchOpportunity, ResearchPhase};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::{debug, info, warn};

use super::ResearchOrchestrator;
use crate::error::{OrchestratorError, Result};

/// Output of the classification step performed by the planner.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FoundationSelection {
    pub context: ResearchContext,
    /// Catalog ids judged to apply. Any unknown id rejects the whole selection.
    pub opportunity_ids: Vec<String>,
}

impl FoundationSelection {
    pub fn new(context: ResearchContext, ids: &[OpportunityId]) -> Self {
        Self {
            context,
            opportunity_ids: ids.iter().map(|id| id.as_str().to_string()).collect(),
        }
    }
}

/// Parses the selection into catalog order, without duplicates.
pub fn parse_selection(ids: &[String]) -> Result<Vec<OpportunityId>> {
    let mut parsed = ids
        .iter()
        .map(|id| {
            OpportunityId::from_str(id.trim())
                .map_err(|_| OrchestratorError::UnknownOpportunity(id.clone()))
        })
        .collect::<Result<Vec<_>>>()?;
    parsed.sort_by_key(|id| id.catalog_index());
    parsed.dedup();
    Ok(parsed)
}

impl ResearchOrchestrator {
    /// Creates the pending opportunity rows and checkpoints the context.
    ///
    /// Safe to call again after an interruption. Rows and a checkpoint left
    /// by the earlier attempt win over the incoming selection, so the later
    /// phases never see a context that disagrees with the stored opportunities.
    pub async fn foundation(&self, selection: FoundationSelection) -> Result<ResearchContext> {
        let ids = parse_selection(&selection.opportunity_ids)?;

        let existing = self.research.find_all_opportunities().await?;
        let context = if existing.is_empty() {
            let rows: Vec<ResearchOpportunity> =
                ids.iter().map(|id| ResearchOpportunity::new(*id)).collect();
            self.research.create_opportunities(&rows).await?;
            info!(
                selected = rows.len(),
                project_type = %selection.context.project_type,
                "Research opportunities selected"
            );
            selection.context
        } else {
            let mut stored: Vec<OpportunityId> = existing.iter().map(|o| o.id).collect();
            stored.sort_by_key(|id| id.catalog_index());
            if stored != ids {
                warn!(
                    stored = %join_ids(&stored),
                    incoming = %join_ids(&ids),
                    "Foundation re-entered with a different selection, keeping the stored one"
                );
            } else {
                debug!(existing = existing.len(), "Opportunities already created, keeping them");
            }

            match self.state.load_json(RESEARCH_CONTEXT_KEY).await? {
                Some(checkpointed) => checkpointed,
                None => selection.context,
            }
        };

        self.checkpoint_context(&context).await?;
        self.set_phase(ResearchPhase::Foundation).await?;
        Ok(context)
    }
}

fn join_ids(ids: &[OpportunityId]) -> String {
    ids.iter().map(|id| id.as_str()).collect::<Vec<_>>().join(",")
}
