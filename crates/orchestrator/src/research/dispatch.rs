//! Phase 2: parallel dispatch of opportunities to research workers.

use chrono::Utc;
use events::Event;
use futures::future::join_all;
use keystone_core::{
    ExecutionStatus, OpportunityId, OpportunityStatus, ResearchContext, ResearchExecution,
};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::worker::ResearchRequest;
use super::ResearchOrchestrator;
use crate::error::{OrchestratorError, Result};
use crate::prompts::ResearchPrompts;
use crate::services::MessageParser;
use crate::state_machine::OpportunityStateMachine;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchRequest {
    pub opportunity: OpportunityId,
    /// 0 for the initial fan-out, otherwise the re-dispatch round.
    pub round: u32,
    pub follow_up: Option<String>,
}

impl DispatchRequest {
    pub fn initial(opportunity: OpportunityId) -> Self {
        Self {
            opportunity,
            round: 0,
            follow_up: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Researched {
        opportunity: OpportunityId,
        execution_id: Uuid,
    },
    /// Every attempt of a targeted re-dispatch failed; the earlier response stands.
    Failed {
        opportunity: OpportunityId,
        error: String,
    },
    Skipped {
        opportunity: OpportunityId,
        reason: String,
    },
    /// The opportunity was already completed or skipped.
    AlreadySettled { opportunity: OpportunityId },
}

impl ResearchOrchestrator {
    /// Dispatches every request concurrently and returns once all of them
    /// have reached a terminal state.
    pub async fn dispatch_round(
        &self,
        context: &ResearchContext,
        requests: Vec<DispatchRequest>,
    ) -> Result<Vec<DispatchOutcome>> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }

        let semaphore = Semaphore::new(self.config.max_concurrent_workers.max(1));
        let semaphore = &semaphore;
        info!(
            opportunities = requests.len(),
            max_concurrent = self.config.max_concurrent_workers,
            "Dispatching research round"
        );

        let dispatches = requests.into_iter().map(|request| async move {
            let _permit = semaphore
                .acquire()
                .await
                .map_err(|e| OrchestratorError::Worker(e.to_string()))?;
            self.dispatch_one(context, request).await
        });

        join_all(dispatches).await.into_iter().collect()
    }

    async fn dispatch_one(
        &self,
        context: &ResearchContext,
        request: DispatchRequest,
    ) -> Result<DispatchOutcome> {
        let id = request.opportunity;
        let opportunity = self
            .research
            .find_opportunity(id)
            .await?
            .ok_or_else(|| OrchestratorError::UnknownOpportunity(id.to_string()))?;

        if opportunity.status.is_terminal() {
            debug!(opportunity = %id, status = %opportunity.status.as_str(), "Opportunity already settled");
            return Ok(DispatchOutcome::AlreadySettled { opportunity: id });
        }
        if opportunity.status == OpportunityStatus::Pending {
            OpportunityStateMachine::validate_transition(
                &opportunity.status,
                &OpportunityStatus::InProgress,
            )?;
        }
        if !self.research.mark_in_progress(id, Utc::now()).await? {
            return Ok(DispatchOutcome::AlreadySettled { opportunity: id });
        }

        let prompt = ResearchPrompts::opportunity(context, id, request.follow_up.as_deref());
        let worker_request = ResearchRequest {
            opportunity_id: id,
            research_question: id.research_question().to_string(),
            context: context.clone(),
            follow_up: request.follow_up.clone(),
            prompt: prompt.clone(),
        };

        let attempts = self.config.attempts_per_round();
        let mut last_error = String::new();

        for retry_count in 0..attempts {
            let execution = ResearchExecution::start(id, request.round, retry_count, prompt.clone());
            self.research.create_execution(&execution).await?;

            info!(
                opportunity = %id,
                execution_id = %execution.id,
                round = request.round,
                attempt = retry_count + 1,
                "Research dispatched"
            );
            self.emit_event(Event::OpportunityDispatched {
                opportunity_id: id.to_string(),
                execution_id: execution.id,
                round: request.round,
                retry_count,
            });

            let (raw_response, error) =
                match timeout(self.config.worker_timeout(), self.worker.research(&worker_request))
                    .await
                {
                    Ok(Ok(raw)) => match MessageParser::parse_recommendation(&raw) {
                        Ok(_) => (Some(raw), None),
                        Err(e) => (Some(raw), Some(e.to_string())),
                    },
                    Ok(Err(e)) => (None, Some(e.to_string())),
                    Err(_) => (
                        None,
                        Some(
                            OrchestratorError::WorkerTimeout {
                                secs: self.config.worker_timeout_secs,
                            }
                            .to_string(),
                        ),
                    ),
                };

            let Some(error) = error else {
                self.research
                    .finish_execution(
                        execution.id,
                        ExecutionStatus::Completed,
                        raw_response.as_deref(),
                        None,
                        Utc::now(),
                    )
                    .await?;
                self.emit_event(Event::ResearchExecutionFinished {
                    opportunity_id: id.to_string(),
                    execution_id: execution.id,
                    success: true,
                    error: None,
                });
                return Ok(DispatchOutcome::Researched {
                    opportunity: id,
                    execution_id: execution.id,
                });
            };

            let status = if retry_count + 1 < attempts {
                ExecutionStatus::Retrying
            } else {
                ExecutionStatus::Failed
            };
            self.research
                .finish_execution(
                    execution.id,
                    status,
                    raw_response.as_deref(),
                    Some(&error),
                    Utc::now(),
                )
                .await?;
            warn!(
                opportunity = %id,
                execution_id = %execution.id,
                attempt = retry_count + 1,
                error = %error,
                "Research attempt failed"
            );
            self.emit_event(Event::ResearchExecutionFinished {
                opportunity_id: id.to_string(),
                execution_id: execution.id,
                success: false,
                error: Some(error.clone()),
            });
            last_error = error;
        }

        if request.round > 0 {
            warn!(
                opportunity = %id,
                round = request.round,
                "Targeted re-dispatch failed, keeping the previous response"
            );
            return Ok(DispatchOutcome::Failed {
                opportunity: id,
                error: last_error,
            });
        }

        let reason = format!(
            "retry budget exhausted after {} attempt(s): {}",
            attempts, last_error
        );
        OpportunityStateMachine::validate_transition(
            &OpportunityStatus::InProgress,
            &OpportunityStatus::Skipped,
        )?;
        self.research.mark_skipped(id, &reason, Utc::now()).await?;
        warn!(opportunity = %id, reason = %reason, "Opportunity skipped");
        self.emit_event(Event::OpportunitySkipped {
            opportunity_id: id.to_string(),
            reason: reason.clone(),
        });

        Ok(DispatchOutcome::Skipped {
            opportunity: id,
            reason,
        })
    }
}
