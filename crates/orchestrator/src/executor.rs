//! Boundary to the agent that implements dispatched tasks.

use async_trait::async_trait;
use keystone_core::{Milestone, Task};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

/// What the executor receives for one dispatched task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskAssignment {
    pub task_id: Uuid,
    pub title: String,
    pub description: String,
    pub milestone_context: String,
    /// 1 on first dispatch, higher after releases.
    pub attempt: u32,
}

impl TaskAssignment {
    pub fn new(task: &Task, milestone: &Milestone) -> Self {
        Self {
            task_id: task.id,
            title: task.title.clone(),
            description: task.description.clone(),
            milestone_context: format!("Milestone {}: {}", milestone.ordering, milestone.name),
            attempt: task.attempts,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    /// The task could not be finished; it goes back to pending with this reason.
    Failed { reason: String },
}

/// Performs the implementation work for a task. The scheduler never looks at
/// how the work was done, only at the outcome.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, assignment: &TaskAssignment) -> Result<TaskOutcome>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assignment_carries_milestone_context() {
        let milestone = Milestone::new("Foundations", 1);
        let mut task = Task::new(milestone.id, "Create schema", "users and sessions", 1);
        task.attempts = 2;

        let assignment = TaskAssignment::new(&task, &milestone);
        assert_eq!(assignment.task_id, task.id);
        assert_eq!(assignment.milestone_context, "Milestone 1: Foundations");
        assert_eq!(assignment.attempt, 2);
    }
}
