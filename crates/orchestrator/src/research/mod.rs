//! Research Opportunity Orchestrator.
//!
//! Three phases: foundation (selection and context checkpoint), parallel
//! dispatch to research workers, and reconciliation into one committed
//! technology set. The `research_phase` process-state marker records how
//! far a run got so an interrupted run can resume.

pub mod dispatch;
pub mod foundation;
pub mod reconcile;
pub mod worker;

pub use dispatch::{DispatchOutcome, DispatchRequest};
pub use foundation::{parse_selection, FoundationSelection};
pub use reconcile::{
    reconcile, Candidate, Issue, IssueKind, ReconcileInput, Reconciliation, Resolution,
    TieBreakRule,
};
pub use worker::{ResearchRequest, ResearchWorker};

use chrono::Utc;
use db::{
    OpportunityOutcome, ProcessStateRepository, ResearchCommit, ResearchRepository, SqlitePool,
    TechnologyRepository, RESEARCH_CONTEXT_KEY,
};
use events::{Event, EventBus};
use futures::future::join_all;
use keystone_core::{
    OpportunityId, OpportunityStatus, Recommendation, ResearchContext, ResearchPhase, Technology,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{ResearchConfig, VerificationMode};
use crate::error::{OrchestratorError, Result};
use crate::services::{HttpSourceVerifier, MessageParser, SourceVerifier};
use crate::state_machine::OpportunityStateMachine;

const NO_RESPONSE_REASON: &str = "no usable research response";

/// Result of a research run.
#[derive(Debug, Clone, Default)]
pub struct ResearchOutcome {
    /// The committed decision set, ordered by category.
    pub technologies: Vec<Technology>,
    /// Issues found by the final reconciliation pass.
    pub issues: Vec<Issue>,
    pub skipped: Vec<(OpportunityId, String)>,
    /// False when the research phase had already been committed.
    pub newly_committed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResearchRecovery {
    pub abandoned_executions: u64,
    /// Opportunities put back to pending because no response survived.
    pub reset: Vec<OpportunityId>,
}

/// Everything reconciliation needs, loaded from the store.
struct Snapshot {
    selected: Vec<OpportunityId>,
    skipped: HashMap<OpportunityId, String>,
    budget: HashMap<OpportunityId, u32>,
    responses: HashMap<OpportunityId, Recommendation>,
    unresolved: Vec<OpportunityId>,
    candidates: Vec<Candidate>,
}

pub struct ResearchOrchestrator {
    research: ResearchRepository,
    technologies: TechnologyRepository,
    state: ProcessStateRepository,
    worker: Arc<dyn ResearchWorker>,
    verifier: Option<Arc<dyn SourceVerifier>>,
    config: ResearchConfig,
    event_bus: Option<EventBus>,
}

impl ResearchOrchestrator {
    pub fn new(pool: SqlitePool, worker: Arc<dyn ResearchWorker>) -> Self {
        Self {
            research: ResearchRepository::new(pool.clone()),
            technologies: TechnologyRepository::new(pool.clone()),
            state: ProcessStateRepository::new(pool),
            worker,
            verifier: None,
            config: ResearchConfig::default(),
            event_bus: None,
        }
    }

    pub fn with_config(mut self, config: ResearchConfig) -> Self {
        self.config = config;
        self
    }

    /// Overrides the HTTP verifier built from the configured mode.
    pub fn with_verifier(mut self, verifier: Arc<dyn SourceVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn config(&self) -> &ResearchConfig {
        &self.config
    }

    fn emit_event(&self, event: Event) {
        if let Some(ref bus) = self.event_bus {
            bus.publish(event);
        }
    }

    pub async fn phase(&self) -> Result<ResearchPhase> {
        Ok(self.state.research_phase().await?)
    }

    pub(crate) async fn set_phase(&self, to: ResearchPhase) -> Result<()> {
        let from = self.state.research_phase().await?;
        if from == to {
            return Ok(());
        }
        self.state.set_research_phase(to).await?;
        info!(from = from.as_str(), to = to.as_str(), "Research phase changed");
        self.emit_event(Event::ResearchPhaseChanged {
            from: from.as_str().to_string(),
            to: to.as_str().to_string(),
        });
        Ok(())
    }

    pub(crate) async fn checkpoint_context(&self, context: &ResearchContext) -> Result<()> {
        self.state.save_json(RESEARCH_CONTEXT_KEY, context).await?;
        Ok(())
    }

    /// Runs research from wherever the store says it stopped. The selection
    /// is only used when research has not started yet.
    pub async fn run(&self, selection: FoundationSelection) -> Result<ResearchOutcome> {
        match self.phase().await? {
            ResearchPhase::Completed => self.committed_outcome().await,
            ResearchPhase::NotStarted => {
                let context = self.foundation(selection).await?;
                self.continue_research(&context).await
            }
            _ => self.resume().await,
        }
    }

    /// Continues an interrupted run from the checkpointed context.
    pub async fn resume(&self) -> Result<ResearchOutcome> {
        match self.phase().await? {
            ResearchPhase::Completed => return self.committed_outcome().await,
            ResearchPhase::NotStarted => {
                return Err(OrchestratorError::ResearchNotReady(
                    "research has not started".to_string(),
                ))
            }
            _ => {}
        }

        let context: ResearchContext = self
            .state
            .load_json(RESEARCH_CONTEXT_KEY)
            .await?
            .ok_or_else(|| {
                OrchestratorError::ResearchNotReady("no research context checkpoint".to_string())
            })?;
        info!(project_type = %context.project_type, "Resuming research");
        self.continue_research(&context).await
    }

    async fn continue_research(&self, context: &ResearchContext) -> Result<ResearchOutcome> {
        let mut initial = Vec::new();
        for opportunity in self.research.find_all_opportunities().await? {
            let needs_dispatch = match opportunity.status {
                OpportunityStatus::Pending => true,
                OpportunityStatus::InProgress => self
                    .research
                    .latest_completed_execution(opportunity.id)
                    .await?
                    .is_none(),
                _ => false,
            };
            if needs_dispatch {
                initial.push(DispatchRequest::initial(opportunity.id));
            }
        }

        let phase = self.phase().await?;
        if !initial.is_empty() || phase == ResearchPhase::Foundation {
            self.set_phase(ResearchPhase::Dispatching).await?;
        }
        self.dispatch_round(context, initial).await?;

        self.set_phase(ResearchPhase::Reconciling).await?;
        self.reconcile_and_commit(context).await
    }

    /// Reconciles, re-dispatches escalated opportunities and repeats until
    /// the decision set is final, then commits it.
    async fn reconcile_and_commit(&self, context: &ResearchContext) -> Result<ResearchOutcome> {
        // Every pass that does not commit spends at least one re-dispatch round
        let max_passes = self.config.max_redispatch_rounds as usize * OpportunityId::ALL.len() + 1;

        let mut last_issues = Vec::new();
        for pass in 0..max_passes {
            let snapshot = self.load_snapshot(context).await?;
            let result = reconcile(ReconcileInput {
                context,
                candidates: snapshot.candidates.clone(),
                selected: &snapshot.selected,
                skipped: &snapshot.skipped,
                remaining_budget: &snapshot.budget,
                threshold: self.config.escalation_threshold,
            });

            debug!(
                pass,
                decisions = result.decisions.len(),
                issues = result.issues.len(),
                redispatch = result.redispatch.len(),
                "Reconciliation pass"
            );
            for issue in &result.issues {
                self.report_issue(issue);
            }

            if result.is_final() {
                return self.commit(snapshot, result).await;
            }

            let mut requests = Vec::with_capacity(result.redispatch.len());
            for request in &result.redispatch {
                let round = self.research.increment_redispatch(request.opportunity).await?;
                info!(
                    opportunity = %request.opportunity,
                    round,
                    "Escalating to targeted re-dispatch"
                );
                requests.push(DispatchRequest {
                    opportunity: request.opportunity,
                    round,
                    follow_up: Some(request.follow_up.clone()),
                });
            }
            last_issues = result.issues;
            self.dispatch_round(context, requests).await?;
        }

        Err(OrchestratorError::UnresolvedConflicts(
            last_issues.into_iter().map(|i| i.description).collect(),
        ))
    }

    fn report_issue(&self, issue: &Issue) {
        info!(
            kind = issue.kind.as_str(),
            severity = issue.severity.as_str(),
            category = %issue.category,
            resolution = %issue.resolution,
            "{}",
            issue.description
        );
        self.emit_event(Event::ReconciliationIssue {
            kind: issue.kind.as_str().to_string(),
            severity: issue.severity.as_str().to_string(),
            description: issue.description.clone(),
            resolution: issue.resolution.to_string(),
        });
    }

    async fn load_snapshot(&self, context: &ResearchContext) -> Result<Snapshot> {
        let opportunities = self.research.find_all_opportunities().await?;

        let mut snapshot = Snapshot {
            selected: opportunities.iter().map(|o| o.id).collect(),
            skipped: HashMap::new(),
            budget: HashMap::new(),
            responses: HashMap::new(),
            unresolved: Vec::new(),
            candidates: Vec::new(),
        };

        for opportunity in &opportunities {
            snapshot.budget.insert(
                opportunity.id,
                self.config
                    .max_redispatch_rounds
                    .saturating_sub(opportunity.redispatch_count),
            );

            if opportunity.status == OpportunityStatus::Skipped {
                snapshot.skipped.insert(
                    opportunity.id,
                    opportunity.skip_reason.clone().unwrap_or_default(),
                );
                continue;
            }

            let response = self
                .research
                .latest_completed_execution(opportunity.id)
                .await?
                .and_then(|e| e.raw_response);
            let recommendation = match response.as_deref().map(MessageParser::parse_recommendation)
            {
                Some(Ok(recommendation)) => recommendation,
                Some(Err(e)) => {
                    warn!(opportunity = %opportunity.id, error = %e, "Stored response no longer parses");
                    snapshot.unresolved.push(opportunity.id);
                    continue;
                }
                None => {
                    snapshot.unresolved.push(opportunity.id);
                    continue;
                }
            };

            snapshot.candidates.push(Candidate::researched(
                opportunity.id,
                recommendation.clone(),
            ));
            snapshot.responses.insert(opportunity.id, recommendation);
        }

        for requirement in &context.explicit_requirements {
            let linked = snapshot.selected.iter().copied().find(|o| {
                o.technology_category() == requirement.category && !snapshot.skipped.contains_key(o)
            });
            snapshot
                .candidates
                .push(Candidate::explicit(requirement, linked));
        }

        Ok(snapshot)
    }

    async fn commit(&self, snapshot: Snapshot, result: Reconciliation) -> Result<ResearchOutcome> {
        let hard_gaps: Vec<String> = result.hard_gaps().map(|i| i.description.clone()).collect();
        if !hard_gaps.is_empty() {
            if self.config.strict_gaps {
                return Err(OrchestratorError::UnresolvedGaps(hard_gaps));
            }
            warn!(gaps = hard_gaps.len(), "Committing with unresolved gaps");
        }

        let responded: HashSet<OpportunityId> = snapshot.responses.keys().copied().collect();
        let mut technologies: Vec<Technology> = result
            .decisions
            .iter()
            .map(|decision| decision_to_technology(decision, &responded))
            .collect();
        self.verify_sources(&mut technologies).await;

        let mut outcomes = Vec::new();
        let mut skipped: Vec<(OpportunityId, String)> = snapshot
            .skipped
            .iter()
            .map(|(id, reason)| (*id, reason.clone()))
            .collect();

        for id in &snapshot.selected {
            if let Some(recommendation) = snapshot.responses.get(id) {
                let summary = match result.decisions.iter().find(|d| d.opportunity == Some(*id)) {
                    Some(decision) => format!("Recommended {}", decision.label()),
                    None => match result
                        .dropped
                        .iter()
                        .find(|d| d.candidate.opportunity == Some(*id))
                    {
                        Some(dropped) => format!("Not adopted: {}", dropped.reason),
                        None => "Not adopted".to_string(),
                    },
                };
                outcomes.push(OpportunityOutcome::Completed {
                    id: *id,
                    summary,
                    confidence: Some(recommendation.confidence),
                });
            } else if snapshot.unresolved.contains(id) {
                OpportunityStateMachine::validate_transition(
                    &OpportunityStatus::InProgress,
                    &OpportunityStatus::Skipped,
                )?;
                outcomes.push(OpportunityOutcome::Skipped {
                    id: *id,
                    reason: NO_RESPONSE_REASON.to_string(),
                });
                skipped.push((*id, NO_RESPONSE_REASON.to_string()));
            }
        }
        skipped.sort_by_key(|(id, _)| id.catalog_index());

        let commit = ResearchCommit {
            technologies,
            outcomes,
        };
        let newly_committed = self
            .technologies
            .commit_research(&commit, Utc::now())
            .await?;

        if newly_committed {
            info!(
                technologies = commit.technologies.len(),
                skipped = skipped.len(),
                "Research phase completed"
            );
            self.emit_event(Event::ResearchPhaseChanged {
                from: ResearchPhase::Reconciling.as_str().to_string(),
                to: ResearchPhase::Completed.as_str().to_string(),
            });
            self.emit_event(Event::TechnologiesCommitted {
                count: commit.technologies.len(),
                skipped: skipped.len(),
            });
        } else {
            warn!("Research was already committed by another run");
            return self.committed_outcome().await;
        }

        Ok(ResearchOutcome {
            technologies: self.technologies.find_all().await?,
            issues: result.issues,
            skipped,
            newly_committed,
        })
    }

    async fn verify_sources(&self, technologies: &mut [Technology]) {
        let checked_at = Utc::now();

        if self.config.verification == VerificationMode::Off {
            for source in technologies.iter_mut().flat_map(|t| t.sources.iter_mut()) {
                source.verified = false;
                source.verification_note = Some("verification disabled".to_string());
                source.checked_at = Some(checked_at);
            }
            return;
        }

        let verifier: Arc<dyn SourceVerifier> = match &self.verifier {
            Some(verifier) => verifier.clone(),
            None => Arc::new(HttpSourceVerifier::new(
                self.config.verification,
                self.config.verification_timeout(),
            )),
        };

        let checks = technologies.iter().flat_map(|technology| {
            let verifier = verifier.clone();
            let version = technology.version.clone();
            technology.sources.iter().map(move |source| {
                let verifier = verifier.clone();
                let version = version.clone();
                let url = source.url.clone();
                async move { verifier.verify(&url, version.as_deref()).await }
            })
        });
        let results = join_all(checks).await;

        for (source, verification) in technologies
            .iter_mut()
            .flat_map(|t| t.sources.iter_mut())
            .zip(results)
        {
            debug!(url = %source.url, verified = verification.verified, "Source checked");
            source.verified = verification.verified;
            source.verification_note = verification.note;
            source.checked_at = Some(checked_at);
        }
    }

    /// Reads back the committed decision set.
    pub async fn committed_outcome(&self) -> Result<ResearchOutcome> {
        let skipped = self
            .research
            .find_all_opportunities()
            .await?
            .into_iter()
            .filter(|o| o.status == OpportunityStatus::Skipped)
            .map(|o| (o.id, o.skip_reason.unwrap_or_default()))
            .collect();

        Ok(ResearchOutcome {
            technologies: self.technologies.find_all().await?,
            issues: Vec::new(),
            skipped,
            newly_committed: false,
        })
    }

    /// Prepares the store for a restart: executions left `started` are
    /// failed as abandoned, and in-progress opportunities without a
    /// completed response go back to pending.
    pub async fn recover(&self) -> Result<ResearchRecovery> {
        let mut recovery = ResearchRecovery {
            abandoned_executions: self.research.abandon_started_executions(Utc::now()).await?,
            ..Default::default()
        };

        for opportunity in self.research.find_all_opportunities().await? {
            if opportunity.status != OpportunityStatus::InProgress {
                continue;
            }
            if self
                .research
                .latest_completed_execution(opportunity.id)
                .await?
                .is_some()
            {
                continue;
            }
            OpportunityStateMachine::validate_transition(
                &opportunity.status,
                &OpportunityStatus::Pending,
            )?;
            if self.research.reset_to_pending(opportunity.id).await? {
                recovery.reset.push(opportunity.id);
            }
        }

        if recovery.abandoned_executions > 0 || !recovery.reset.is_empty() {
            info!(
                abandoned = recovery.abandoned_executions,
                reset = recovery.reset.len(),
                "Recovered interrupted research"
            );
        }
        Ok(recovery)
    }
}

/// Builds the committed record for a reconciled candidate. The opportunity
/// link is kept only for opportunities that produced a response.
fn decision_to_technology(decision: &Candidate, responded: &HashSet<OpportunityId>) -> Technology {
    let opportunity = decision.opportunity.filter(|o| responded.contains(o));
    let mut technology = Technology::new(decision.name.clone(), decision.category, decision.provenance)
        .with_version(decision.version.clone())
        .with_confidence(decision.confidence)
        .with_opportunity(opportunity);

    technology.alternatives = decision.alternatives.clone();
    technology.rationale = decision.rationale.clone();
    technology.compatibility_notes = decision
        .compatibility_notes
        .iter()
        .map(|n| n.to_string())
        .chain(decision.resolution_notes.iter().cloned())
        .collect();
    if let Some(url) = &decision.source {
        technology.add_source(url.clone());
    }
    technology
}

#[cfg(test)]
mod tests {
    use super::*;
    use keystone_core::{CompatibilityNote, Confidence, TechCategory};

    fn recommendation(name: &str) -> Recommendation {
        Recommendation {
            recommendation: name.to_string(),
            version: "16".to_string(),
            source: "https://www.postgresql.org/docs/16/".to_string(),
            alternatives: vec!["MySQL".to_string()],
            rationale: "relational".to_string(),
            compatibility_notes: vec![CompatibilityNote::text("works with Prisma")],
            confidence: Confidence::High,
        }
    }

    #[test]
    fn test_decision_to_technology_keeps_responded_link() {
        let mut candidate =
            Candidate::researched(OpportunityId::StackDatabase, recommendation("PostgreSQL"));
        candidate
            .resolution_notes
            .push("Chosen over MySQL 8 (STACK_DATABASE) by higher confidence".to_string());

        let responded: HashSet<_> = [OpportunityId::StackDatabase].into_iter().collect();
        let technology = decision_to_technology(&candidate, &responded);

        assert_eq!(technology.name, "PostgreSQL");
        assert_eq!(technology.category, TechCategory::Database);
        assert_eq!(technology.version.as_deref(), Some("16"));
        assert_eq!(technology.opportunity_id, Some(OpportunityId::StackDatabase));
        assert_eq!(technology.sources.len(), 1);
        assert!(!technology.sources[0].verified);
        assert_eq!(technology.compatibility_notes.len(), 2);
        assert!(technology.compatibility_notes[1].contains("Chosen over MySQL"));
    }

    #[test]
    fn test_decision_to_technology_drops_unresponded_link() {
        let candidate =
            Candidate::researched(OpportunityId::StackDatabase, recommendation("PostgreSQL"));
        let technology = decision_to_technology(&candidate, &HashSet::new());
        assert_eq!(technology.opportunity_id, None);
    }
}
