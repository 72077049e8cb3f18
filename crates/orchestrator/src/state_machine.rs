use keystone_core::{OpportunityStatus, TaskStatus};

use crate::error::{OrchestratorError, Result};

pub struct TaskStateMachine;

impl TaskStateMachine {
    pub fn validate_transition(from: &TaskStatus, to: &TaskStatus) -> Result<()> {
        let allowed = Self::allowed_transitions(from);

        if allowed.contains(to) {
            Ok(())
        } else {
            Err(OrchestratorError::InvalidTransition {
                from: from.as_str().to_string(),
                to: to.as_str().to_string(),
            })
        }
    }

    fn allowed_transitions(from: &TaskStatus) -> Vec<TaskStatus> {
        match from {
            TaskStatus::Pending => vec![TaskStatus::InProgress],
            // Release puts the task back in the queue
            TaskStatus::InProgress => vec![TaskStatus::Completed, TaskStatus::Pending],
            TaskStatus::Completed => vec![],
        }
    }

    pub fn can_transition(from: &TaskStatus, to: &TaskStatus) -> bool {
        Self::validate_transition(from, to).is_ok()
    }
}

pub struct OpportunityStateMachine;

impl OpportunityStateMachine {
    pub fn validate_transition(from: &OpportunityStatus, to: &OpportunityStatus) -> Result<()> {
        if Self::allowed_transitions(from).contains(to) {
            Ok(())
        } else {
            Err(OrchestratorError::InvalidTransition {
                from: from.as_str().to_string(),
                to: to.as_str().to_string(),
            })
        }
    }

    fn allowed_transitions(from: &OpportunityStatus) -> Vec<OpportunityStatus> {
        match from {
            OpportunityStatus::Pending => {
                vec![OpportunityStatus::InProgress, OpportunityStatus::Skipped]
            }
            OpportunityStatus::InProgress => vec![
                OpportunityStatus::Completed,
                OpportunityStatus::Skipped,
                OpportunityStatus::Pending,
            ],
            OpportunityStatus::Completed | OpportunityStatus::Skipped => vec![],
        }
    }

    pub fn can_transition(from: &OpportunityStatus, to: &OpportunityStatus) -> bool {
        Self::validate_transition(from, to).is_ok()
    }
}
