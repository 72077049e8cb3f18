//! Driver loop tying research, planning and task execution together.
//!
//! Every step re-reads the store, so running the driver again after any
//! failure resumes where the previous run stopped.

use async_trait::async_trait;
use keystone_core::{PlanGraph, ResearchPhase, Technology};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::executor::{TaskAssignment, TaskExecutor, TaskOutcome};
use crate::research::{FoundationSelection, ResearchOrchestrator};
use crate::scheduler::{BlockedReason, NextAction, Scheduler};

/// Upstream planning collaborator.
#[async_trait]
pub trait Planner: Send + Sync {
    /// Classifies the requirements into a research context and the catalog
    /// opportunities that apply.
    async fn select_research(&self, requirements: &str) -> Result<FoundationSelection>;

    /// Produces the milestone/task graph once the technology set is committed.
    async fn plan(&self, requirements: &str, technologies: &[Technology]) -> Result<PlanGraph>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverOutcome {
    AllComplete {
        iterations: usize,
    },
    Blocked {
        milestone: Uuid,
        reason: BlockedReason,
        iterations: usize,
    },
    /// The iteration guard stopped the loop before the plan finished.
    IterationLimit {
        iterations: usize,
    },
}

pub struct Driver {
    scheduler: Scheduler,
    research: ResearchOrchestrator,
    planner: Arc<dyn Planner>,
    executor: Arc<dyn TaskExecutor>,
}

impl Driver {
    pub fn new(
        scheduler: Scheduler,
        research: ResearchOrchestrator,
        planner: Arc<dyn Planner>,
        executor: Arc<dyn TaskExecutor>,
    ) -> Self {
        Self {
            scheduler,
            research,
            planner,
            executor,
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn research(&self) -> &ResearchOrchestrator {
        &self.research
    }

    pub async fn run(&self, requirements: &str) -> Result<DriverOutcome> {
        self.research.recover().await?;
        self.scheduler.recover().await?;

        let technologies = self.ensure_research(requirements).await?;

        if !self.scheduler.has_plan().await? {
            let graph = self.planner.plan(requirements, &technologies).await?;
            let tasks = self.scheduler.import_plan(graph).await?;
            info!(tasks, "Plan imported");
        }

        self.execute_plan().await
    }

    async fn ensure_research(&self, requirements: &str) -> Result<Vec<Technology>> {
        let outcome = match self.research.phase().await? {
            ResearchPhase::NotStarted => {
                let selection = self.planner.select_research(requirements).await?;
                self.research.run(selection).await?
            }
            _ => self.research.resume().await?,
        };

        for (opportunity, reason) in &outcome.skipped {
            warn!(opportunity = %opportunity, reason = %reason, "Research opportunity skipped");
        }
        Ok(outcome.technologies)
    }

    async fn execute_plan(&self) -> Result<DriverOutcome> {
        let max_iterations = self.scheduler.config().max_iterations;

        for iteration in 1..=max_iterations {
            match self.scheduler.next_action().await? {
                NextAction::Dispatch(task) => {
                    let milestone = self.scheduler.milestone(task.milestone_id).await?;
                    let assignment = TaskAssignment::new(&task, &milestone);

                    match self.executor.execute(&assignment).await {
                        Ok(TaskOutcome::Completed) => {
                            self.scheduler.complete_task(task.id).await?;
                        }
                        Ok(TaskOutcome::Failed { reason }) => {
                            self.scheduler.release_task(task.id, &reason).await?;
                        }
                        Err(e) => {
                            error!(task_id = %task.id, error = %e, "Task executor failed");
                            self.scheduler.release_task(task.id, &e.to_string()).await?;
                        }
                    }
                }
                NextAction::MilestoneCompleted { completed, next } => {
                    info!(completed = %completed, next = %next, "Advanced to next milestone");
                }
                NextAction::AllComplete => {
                    info!(iterations = iteration, "All milestones complete");
                    return Ok(DriverOutcome::AllComplete {
                        iterations: iteration,
                    });
                }
                NextAction::Blocked { milestone, reason } => {
                    warn!(milestone = %milestone, reason = %reason.describe(), "Scheduler blocked");
                    return Ok(DriverOutcome::Blocked {
                        milestone,
                        reason,
                        iterations: iteration,
                    });
                }
            }
        }

        warn!(max_iterations, "Driver stopped at the iteration limit");
        Ok(DriverOutcome::IterationLimit {
            iterations: max_iterations,
        })
    }
}
