use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An event stamped by the bus that published it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: Uuid,
    /// Publish order on the bus, starting at 1.
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub event: Event,
}

impl EventEnvelope {
    pub fn new(sequence: u64, event: Event) -> Self {
        Self {
            id: Uuid::new_v4(),
            sequence,
            timestamp: Utc::now(),
            event,
        }
    }
}

/// All lifecycle events published by the scheduler and the research orchestrator.
///
/// Opportunity ids are catalog ids (`STACK_DATABASE`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    // Scheduler events
    #[serde(rename = "task.dispatched")]
    TaskDispatched {
        task_id: Uuid,
        milestone_id: Uuid,
        title: String,
        attempt: u32,
    },

    #[serde(rename = "task.completed")]
    TaskCompleted {
        task_id: Uuid,
        duration_secs: Option<i64>,
    },

    /// A dispatched task went back to pending
    #[serde(rename = "task.released")]
    TaskReleased { task_id: Uuid, reason: String },

    #[serde(rename = "milestone.completed")]
    MilestoneCompleted {
        milestone_id: Uuid,
        next_milestone_id: Option<Uuid>,
    },

    #[serde(rename = "scheduler.all_complete")]
    AllComplete,

    /// No task could be dispatched although pending tasks remain
    #[serde(rename = "scheduler.blocked")]
    SchedulerBlocked {
        milestone_id: Uuid,
        reason: String,
        task_ids: Vec<Uuid>,
    },

    // Research events
    #[serde(rename = "research.phase_changed")]
    ResearchPhaseChanged { from: String, to: String },

    #[serde(rename = "research.opportunity_dispatched")]
    OpportunityDispatched {
        opportunity_id: String,
        execution_id: Uuid,
        round: u32,
        retry_count: u32,
    },

    #[serde(rename = "research.execution_finished")]
    ResearchExecutionFinished {
        opportunity_id: String,
        execution_id: Uuid,
        success: bool,
        error: Option<String>,
    },

    #[serde(rename = "research.opportunity_skipped")]
    OpportunitySkipped {
        opportunity_id: String,
        reason: String,
    },

    /// A conflict, incoherence or gap found during reconciliation
    #[serde(rename = "research.issue")]
    ReconciliationIssue {
        kind: String,
        severity: String,
        description: String,
        /// What was done about it: tie-break, re-dispatch, default, reported
        resolution: String,
    },

    #[serde(rename = "research.committed")]
    TechnologiesCommitted { count: usize, skipped: usize },
}

impl Event {
    /// Get the task ID associated with this event, if any
    pub fn task_id(&self) -> Option<Uuid> {
        match self {
            Event::TaskDispatched { task_id, .. } => Some(*task_id),
            Event::TaskCompleted { task_id, .. } => Some(*task_id),
            Event::TaskReleased { task_id, .. } => Some(*task_id),
            _ => None,
        }
    }

    /// Get the research opportunity associated with this event, if any
    pub fn opportunity_id(&self) -> Option<&str> {
        match self {
            Event::OpportunityDispatched { opportunity_id, .. }
            | Event::ResearchExecutionFinished { opportunity_id, .. }
            | Event::OpportunitySkipped { opportunity_id, .. } => Some(opportunity_id),
            _ => None,
        }
    }
}
