//! Task Graph Scheduler.
//!
//! Every decision is re-derived from the store on each call. The conditional
//! status updates in the task repository are the serialization point, so a
//! task can only be dispatched once per claim.

use chrono::Utc;
use db::{
    MilestoneRepository, ProcessStateRepository, SqlitePool, TaskRepository,
    CURRENT_MILESTONE_KEY,
};
use events::{Event, EventBus};
use keystone_core::{Milestone, PlanGraph, Task, TaskStatus};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::error::{OrchestratorError, Result};
use crate::state_machine::TaskStateMachine;

const RECOVERED_REASON: &str = "recovered after interrupted run";

/// Bounded retries when another writer claims the task we selected.
const CLAIM_ATTEMPTS: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextAction {
    /// The task has been claimed and is now in progress.
    Dispatch(Task),
    MilestoneCompleted { completed: Uuid, next: Uuid },
    AllComplete,
    Blocked {
        milestone: Uuid,
        reason: BlockedReason,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlockedReason {
    /// Nothing is eligible until these in-progress tasks complete or are released.
    AwaitingInFlight { tasks: Vec<Uuid> },
    /// Pending tasks whose prerequisites can never complete.
    UnsatisfiableDependencies { tasks: Vec<Uuid> },
}

impl BlockedReason {
    pub fn tasks(&self) -> &[Uuid] {
        match self {
            Self::AwaitingInFlight { tasks } | Self::UnsatisfiableDependencies { tasks } => tasks,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::AwaitingInFlight { tasks } => {
                format!("waiting on {} in-progress task(s)", tasks.len())
            }
            Self::UnsatisfiableDependencies { tasks } => format!(
                "{} pending task(s) have prerequisites that cannot complete",
                tasks.len()
            ),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerRecovery {
    pub released: Vec<Uuid>,
}

pub struct Scheduler {
    milestones: MilestoneRepository,
    tasks: TaskRepository,
    state: ProcessStateRepository,
    config: SchedulerConfig,
    event_bus: Option<EventBus>,
}

impl Scheduler {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            milestones: MilestoneRepository::new(pool.clone()),
            tasks: TaskRepository::new(pool.clone()),
            state: ProcessStateRepository::new(pool),
            config: SchedulerConfig::default(),
            event_bus: None,
        }
    }

    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    fn emit_event(&self, event: Event) {
        if let Some(ref bus) = self.event_bus {
            bus.publish(event);
        }
    }

    /// Validates and stores a planner graph. Only one plan may be loaded per store.
    pub async fn import_plan(&self, graph: PlanGraph) -> Result<usize> {
        if self.milestones.count().await? > 0 {
            return Err(OrchestratorError::InvalidPlan(
                "a plan is already loaded".to_string(),
            ));
        }

        let records = graph.into_records()?;
        self.milestones.insert_plan(&records).await?;

        info!(
            milestones = records.milestones.len(),
            tasks = records.tasks.len(),
            dependencies = records.dependencies.len(),
            "Plan imported"
        );
        Ok(records.tasks.len())
    }

    pub async fn has_plan(&self) -> Result<bool> {
        Ok(self.milestones.count().await? > 0)
    }

    pub async fn next_action(&self) -> Result<NextAction> {
        let milestone = match self.current_milestone().await? {
            Some(milestone) => milestone,
            None => {
                let counts = self.tasks.counts().await?;
                if counts.incomplete() == 0 {
                    debug!("No pending milestone and no incomplete tasks");
                    self.emit_event(Event::AllComplete);
                    return Ok(NextAction::AllComplete);
                }
                return Err(OrchestratorError::InconsistentState(format!(
                    "no pending milestone while {} task(s) are incomplete",
                    counts.incomplete()
                )));
            }
        };

        if let Some(task) = self.claim_next(&milestone).await? {
            info!(
                task_id = %task.id,
                milestone_id = %milestone.id,
                attempt = task.attempts,
                title = %task.title,
                "Task dispatched"
            );
            self.emit_event(Event::TaskDispatched {
                task_id: task.id,
                milestone_id: milestone.id,
                title: task.title.clone(),
                attempt: task.attempts,
            });
            return Ok(NextAction::Dispatch(task));
        }

        let tasks = self.tasks.find_by_milestone(milestone.id).await?;
        let in_flight: Vec<Uuid> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::InProgress)
            .map(|t| t.id)
            .collect();
        let pending: Vec<Uuid> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .map(|t| t.id)
            .collect();

        if !in_flight.is_empty() || !pending.is_empty() {
            let reason = if in_flight.is_empty() {
                BlockedReason::UnsatisfiableDependencies { tasks: pending }
            } else {
                BlockedReason::AwaitingInFlight { tasks: in_flight }
            };
            warn!(
                milestone_id = %milestone.id,
                reason = %reason.describe(),
                "Scheduler blocked"
            );
            self.emit_event(Event::SchedulerBlocked {
                milestone_id: milestone.id,
                reason: reason.describe(),
                task_ids: reason.tasks().to_vec(),
            });
            return Ok(NextAction::Blocked {
                milestone: milestone.id,
                reason,
            });
        }

        self.advance(&milestone).await
    }

    /// Loads the current milestone, selecting the lowest-ordered pending one
    /// when no marker is set.
    async fn current_milestone(&self) -> Result<Option<Milestone>> {
        if let Some(id) = self.state.current_milestone().await? {
            return self.load_current(id).await.map(Some);
        }

        let Some(first) = self.milestones.first_pending().await? else {
            return Ok(None);
        };

        if self
            .state
            .set_if_absent(CURRENT_MILESTONE_KEY, &first.id.to_string())
            .await?
        {
            info!(milestone_id = %first.id, name = %first.name, "Milestone started");
            return Ok(Some(first));
        }

        // Another writer set the marker between our read and write
        match self.state.current_milestone().await? {
            Some(id) => self.load_current(id).await.map(Some),
            None => Ok(Some(first)),
        }
    }

    async fn load_current(&self, id: Uuid) -> Result<Milestone> {
        let milestone = self.milestones.find_by_id(id).await?.ok_or_else(|| {
            OrchestratorError::InconsistentState(format!("current milestone {} does not exist", id))
        })?;

        if milestone.is_completed() {
            return Err(OrchestratorError::InconsistentState(format!(
                "current milestone {} is already completed",
                id
            )));
        }
        Ok(milestone)
    }

    async fn claim_next(&self, milestone: &Milestone) -> Result<Option<Task>> {
        for _ in 0..CLAIM_ATTEMPTS {
            let Some(candidate) = self.tasks.next_eligible(milestone.id).await? else {
                return Ok(None);
            };

            if self.tasks.claim(candidate.id, Utc::now()).await? {
                return self
                    .tasks
                    .find_by_id(candidate.id)
                    .await?
                    .map(Some)
                    .ok_or(OrchestratorError::TaskNotFound(candidate.id));
            }
            debug!(task_id = %candidate.id, "Task claimed elsewhere, selecting again");
        }
        Ok(None)
    }

    async fn advance(&self, milestone: &Milestone) -> Result<NextAction> {
        let next = self.milestones.next_pending_after(milestone.id).await?;
        let next_id = next.as_ref().map(|m| m.id);

        if !self
            .milestones
            .complete_and_advance(milestone.id, next_id, Utc::now())
            .await?
        {
            return Err(OrchestratorError::InconsistentState(format!(
                "milestone {} could not be completed",
                milestone.id
            )));
        }

        info!(
            milestone_id = %milestone.id,
            name = %milestone.name,
            next_milestone_id = ?next_id,
            "Milestone completed"
        );
        self.emit_event(Event::MilestoneCompleted {
            milestone_id: milestone.id,
            next_milestone_id: next_id,
        });

        match next_id {
            Some(next) => Ok(NextAction::MilestoneCompleted {
                completed: milestone.id,
                next,
            }),
            None => {
                info!("All milestones completed");
                self.emit_event(Event::AllComplete);
                Ok(NextAction::AllComplete)
            }
        }
    }

    /// Marks a dispatched task completed. Completing a task that is not in
    /// progress is a protocol violation.
    pub async fn complete_task(&self, id: Uuid) -> Result<Task> {
        let task = self.find_task(id).await?;
        TaskStateMachine::validate_transition(&task.status, &TaskStatus::Completed)?;

        if !self.tasks.complete(id, Utc::now()).await? {
            let current = self.find_task(id).await?;
            return Err(OrchestratorError::InvalidTransition {
                from: current.status.as_str().to_string(),
                to: TaskStatus::Completed.as_str().to_string(),
            });
        }

        let task = self.find_task(id).await?;
        let duration_secs = task.duration().map(|d| d.num_seconds());
        info!(task_id = %id, duration_secs = ?duration_secs, "Task completed");
        self.emit_event(Event::TaskCompleted {
            task_id: id,
            duration_secs,
        });
        Ok(task)
    }

    /// Returns a dispatched task to pending so it can be dispatched again.
    /// Its ordering index is preserved.
    pub async fn release_task(&self, id: Uuid, reason: &str) -> Result<Task> {
        let task = self.find_task(id).await?;
        TaskStateMachine::validate_transition(&task.status, &TaskStatus::Pending)?;

        if !self.tasks.release(id, reason).await? {
            let current = self.find_task(id).await?;
            return Err(OrchestratorError::InvalidTransition {
                from: current.status.as_str().to_string(),
                to: TaskStatus::Pending.as_str().to_string(),
            });
        }

        warn!(task_id = %id, reason = %reason, "Task released");
        self.emit_event(Event::TaskReleased {
            task_id: id,
            reason: reason.to_string(),
        });
        self.find_task(id).await
    }

    /// Releases tasks an interrupted run left in progress, when configured to.
    pub async fn recover(&self) -> Result<SchedulerRecovery> {
        let mut recovery = SchedulerRecovery::default();
        if !self.config.release_stale_on_recover {
            return Ok(recovery);
        }

        for task in self.tasks.find_in_progress().await? {
            self.release_task(task.id, RECOVERED_REASON).await?;
            recovery.released.push(task.id);
        }

        if !recovery.released.is_empty() {
            info!(released = recovery.released.len(), "Recovered in-progress tasks");
        }
        Ok(recovery)
    }

    async fn find_task(&self, id: Uuid) -> Result<Task> {
        self.tasks
            .find_by_id(id)
            .await?
            .ok_or(OrchestratorError::TaskNotFound(id))
    }

    pub async fn milestone(&self, id: Uuid) -> Result<Milestone> {
        self.milestones
            .find_by_id(id)
            .await?
            .ok_or(OrchestratorError::Database(db::DbError::MilestoneNotFound(id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keystone_core::{PlannedMilestone, PlannedTask};

    fn planned(key: &str, depends_on: &[&str]) -> PlannedTask {
        PlannedTask {
            key: key.to_string(),
            title: format!("Task {}", key),
            description: String::new(),
            depends_on: depends_on.iter().map(|d| d.to_string()).collect(),
        }
    }

    async fn scheduler_with(graph: PlanGraph) -> Scheduler {
        let pool = db::connect("sqlite::memory:").await.unwrap();
        let scheduler = Scheduler::new(pool);
        scheduler.import_plan(graph).await.unwrap();
        scheduler
    }

    fn single_milestone(tasks: Vec<PlannedTask>) -> PlanGraph {
        PlanGraph {
            milestones: vec![PlannedMilestone {
                name: "M1".to_string(),
                tasks,
            }],
        }
    }

    fn dispatched(action: NextAction) -> Task {
        match action {
            NextAction::Dispatch(task) => task,
            other => panic!("expected dispatch, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_complete_pending_task_fails() {
        let scheduler = scheduler_with(single_milestone(vec![planned("a", &[])])).await;
        let task = dispatched(scheduler.next_action().await.unwrap());
        scheduler.release_task(task.id, "flaky").await.unwrap();

        let err = scheduler.complete_task(task.id).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_complete_twice_fails() {
        let scheduler = scheduler_with(single_milestone(vec![planned("a", &[])])).await;
        let task = dispatched(scheduler.next_action().await.unwrap());
        scheduler.complete_task(task.id).await.unwrap();

        assert!(scheduler.complete_task(task.id).await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_task() {
        let scheduler = scheduler_with(single_milestone(vec![planned("a", &[])])).await;
        let err = scheduler.complete_task(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::TaskNotFound(_)));
    }

    #[tokio::test]
    async fn test_blocked_while_prerequisite_in_flight() {
        let scheduler =
            scheduler_with(single_milestone(vec![planned("a", &[]), planned("b", &["a"])])).await;

        let first = dispatched(scheduler.next_action().await.unwrap());
        match scheduler.next_action().await.unwrap() {
            NextAction::Blocked { reason, .. } => {
                assert_eq!(reason, BlockedReason::AwaitingInFlight { tasks: vec![first.id] });
            }
            other => panic!("expected blocked, got {:?}", other),
        }

        scheduler.complete_task(first.id).await.unwrap();
        let second = dispatched(scheduler.next_action().await.unwrap());
        assert_eq!(second.title, "Task b");
    }

    #[tokio::test]
    async fn test_release_preserves_order_and_counts_attempts() {
        let scheduler =
            scheduler_with(single_milestone(vec![planned("a", &[]), planned("b", &[])])).await;

        let first = dispatched(scheduler.next_action().await.unwrap());
        assert_eq!(first.attempts, 1);
        let released = scheduler.release_task(first.id, "executor crashed").await.unwrap();
        assert_eq!(released.status, TaskStatus::Pending);
        assert_eq!(released.last_release_reason.as_deref(), Some("executor crashed"));

        let again = dispatched(scheduler.next_action().await.unwrap());
        assert_eq!(again.id, first.id);
        assert_eq!(again.attempts, 2);
    }

    #[tokio::test]
    async fn test_release_requires_in_progress() {
        let scheduler = scheduler_with(single_milestone(vec![planned("a", &[])])).await;
        let tasks = scheduler.tasks.find_in_progress().await.unwrap();
        assert!(tasks.is_empty());

        let task = dispatched(scheduler.next_action().await.unwrap());
        scheduler.complete_task(task.id).await.unwrap();
        assert!(scheduler.release_task(task.id, "late").await.is_err());
    }

    #[tokio::test]
    async fn test_recover_releases_in_flight_tasks() {
        let scheduler = scheduler_with(single_milestone(vec![planned("a", &[])])).await;
        let task = dispatched(scheduler.next_action().await.unwrap());

        let recovery = scheduler.recover().await.unwrap();
        assert_eq!(recovery.released, vec![task.id]);

        let task = scheduler.find_task(task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.last_release_reason.as_deref(), Some(RECOVERED_REASON));
    }

    #[tokio::test]
    async fn test_recover_can_be_disabled() {
        let pool = db::connect("sqlite::memory:").await.unwrap();
        let scheduler = Scheduler::new(pool).with_config(
            SchedulerConfig::default().with_release_stale_on_recover(false),
        );
        scheduler
            .import_plan(single_milestone(vec![planned("a", &[])]))
            .await
            .unwrap();
        dispatched(scheduler.next_action().await.unwrap());

        assert!(scheduler.recover().await.unwrap().released.is_empty());
    }

    #[tokio::test]
    async fn test_empty_store_is_all_complete() {
        let pool = db::connect("sqlite::memory:").await.unwrap();
        let scheduler = Scheduler::new(pool);
        assert_eq!(scheduler.next_action().await.unwrap(), NextAction::AllComplete);
    }

    #[tokio::test]
    async fn test_second_plan_rejected() {
        let scheduler = scheduler_with(single_milestone(vec![planned("a", &[])])).await;
        let err = scheduler
            .import_plan(single_milestone(vec![planned("b", &[])]))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidPlan(_)));
    }

    #[tokio::test]
    async fn test_events_published() {
        let pool = db::connect("sqlite::memory:").await.unwrap();
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let scheduler = Scheduler::new(pool).with_event_bus(bus);
        scheduler
            .import_plan(single_milestone(vec![planned("a", &[])]))
            .await
            .unwrap();

        let task = dispatched(scheduler.next_action().await.unwrap());
        scheduler.complete_task(task.id).await.unwrap();
        assert_eq!(scheduler.next_action().await.unwrap(), NextAction::AllComplete);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.event.task_id(), Some(task.id));
        assert!(matches!(first.event, Event::TaskDispatched { attempt: 1, .. }));
        assert!(matches!(rx.recv().await.unwrap().event, Event::TaskCompleted { .. }));
        assert!(matches!(
            rx.recv().await.unwrap().event,
            Event::MilestoneCompleted { next_milestone_id: None, .. }
        ));
        assert!(matches!(rx.recv().await.unwrap().event, Event::AllComplete));
    }
}
