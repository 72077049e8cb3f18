use keystone_core::{MilestoneStatus, PlanGraph, PlannedMilestone, PlannedTask, Task, TaskStatus};
use orchestrator::{NextAction, OrchestratorError, Scheduler};
use std::collections::HashSet;
use tempfile::TempDir;

fn planned(key: &str, depends_on: &[&str]) -> PlannedTask {
    PlannedTask {
        key: key.to_string(),
        title: key.to_string(),
        description: format!("implement {}", key),
        depends_on: depends_on.iter().map(|d| d.to_string()).collect(),
    }
}

fn milestone(name: &str, tasks: Vec<PlannedTask>) -> PlannedMilestone {
    PlannedMilestone {
        name: name.to_string(),
        tasks,
    }
}

/// M1: two independent tasks. M2: the second task depends on the first. M3: one task.
fn three_milestones() -> PlanGraph {
    PlanGraph {
        milestones: vec![
            milestone("M1", vec![planned("m1-a", &[]), planned("m1-b", &[])]),
            milestone("M2", vec![planned("m2-a", &[]), planned("m2-b", &["m2-a"])]),
            milestone("M3", vec![planned("m3-a", &[])]),
        ],
    }
}

async fn file_backed(graph: PlanGraph) -> (Scheduler, db::SqlitePool, TempDir) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let db_url = format!("sqlite:{}", temp_dir.path().join("keystone.db").display());
    let pool = db::connect(&db_url).await.expect("Failed to open store");

    let scheduler = Scheduler::new(pool.clone());
    scheduler.import_plan(graph).await.expect("Failed to import plan");
    (scheduler, pool, temp_dir)
}

fn dispatched(action: NextAction) -> Task {
    match action {
        NextAction::Dispatch(task) => task,
        other => panic!("expected dispatch, got {:?}", other),
    }
}

mod three_milestone_scenario {
    use super::*;

    #[tokio::test]
    async fn test_dispatch_order_follows_milestones_and_dependencies() {
        let (scheduler, _pool, _dir) = file_backed(three_milestones()).await;

        let a = dispatched(scheduler.next_action().await.unwrap());
        assert_eq!(a.title, "m1-a");
        let b = dispatched(scheduler.next_action().await.unwrap());
        assert_eq!(b.title, "m1-b");
        scheduler.complete_task(a.id).await.unwrap();
        scheduler.complete_task(b.id).await.unwrap();

        let m1_done = scheduler.next_action().await.unwrap();
        assert!(matches!(m1_done, NextAction::MilestoneCompleted { .. }));

        let m2_first = dispatched(scheduler.next_action().await.unwrap());
        assert_eq!(m2_first.title, "m2-a");

        // m2-b waits for m2-a
        assert!(matches!(
            scheduler.next_action().await.unwrap(),
            NextAction::Blocked { .. }
        ));
        scheduler.complete_task(m2_first.id).await.unwrap();

        let m2_second = dispatched(scheduler.next_action().await.unwrap());
        assert_eq!(m2_second.title, "m2-b");
        scheduler.complete_task(m2_second.id).await.unwrap();

        assert!(matches!(
            scheduler.next_action().await.unwrap(),
            NextAction::MilestoneCompleted { .. }
        ));

        let m3 = dispatched(scheduler.next_action().await.unwrap());
        assert_eq!(m3.title, "m3-a");
        scheduler.complete_task(m3.id).await.unwrap();

        assert_eq!(scheduler.next_action().await.unwrap(), NextAction::AllComplete);
        assert_eq!(scheduler.next_action().await.unwrap(), NextAction::AllComplete);
    }

    #[tokio::test]
    async fn test_each_task_dispatched_exactly_once_after_prerequisites() {
        let (scheduler, pool, _dir) = file_backed(three_milestones()).await;
        let tasks = db::TaskRepository::new(pool);

        let mut seen = HashSet::new();
        loop {
            match scheduler.next_action().await.unwrap() {
                NextAction::Dispatch(task) => {
                    for prerequisite in tasks.dependencies_of(task.id).await.unwrap() {
                        let prerequisite = tasks.find_by_id(prerequisite).await.unwrap().unwrap();
                        assert_eq!(prerequisite.status, TaskStatus::Completed);
                    }
                    assert!(seen.insert(task.id), "task {} dispatched twice", task.title);
                    scheduler.complete_task(task.id).await.unwrap();
                }
                NextAction::MilestoneCompleted { .. } => {}
                NextAction::AllComplete => break,
                NextAction::Blocked { reason, .. } => panic!("unexpected block: {:?}", reason),
            }
        }
        assert_eq!(seen.len(), 5);
    }
}

mod milestone_transitions {
    use super::*;

    #[tokio::test]
    async fn test_milestone_completed_reported_once() {
        let (scheduler, _pool, _dir) = file_backed(three_milestones()).await;

        for _ in 0..2 {
            let task = dispatched(scheduler.next_action().await.unwrap());
            scheduler.complete_task(task.id).await.unwrap();
        }

        let transition = scheduler.next_action().await.unwrap();
        let NextAction::MilestoneCompleted { completed, next } = transition else {
            panic!("expected milestone completion, got {:?}", transition);
        };
        assert_ne!(completed, next);

        // Subsequent polls move on instead of repeating the transition
        let task = dispatched(scheduler.next_action().await.unwrap());
        assert_eq!(task.milestone_id, next);
        assert!(!matches!(
            scheduler.next_action().await.unwrap(),
            NextAction::MilestoneCompleted { .. }
        ));
    }

    #[tokio::test]
    async fn test_completed_milestone_stays_completed() {
        let (scheduler, _pool, _dir) = file_backed(three_milestones()).await;

        let a = dispatched(scheduler.next_action().await.unwrap());
        let b = dispatched(scheduler.next_action().await.unwrap());
        scheduler.complete_task(a.id).await.unwrap();
        scheduler.complete_task(b.id).await.unwrap();
        scheduler.next_action().await.unwrap();

        // Completed tasks cannot be released back into a completed milestone
        let err = scheduler.release_task(a.id, "regression").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidTransition { .. }));

        let m1 = scheduler.milestone(a.milestone_id).await.unwrap();
        assert_eq!(m1.status, MilestoneStatus::Completed);
        assert!(m1.completed_at.is_some());
    }
}

mod contract_violations {
    use super::*;

    #[tokio::test]
    async fn test_complete_pending_task_always_fails() {
        let (scheduler, pool, _dir) = file_backed(three_milestones()).await;
        let tasks = db::TaskRepository::new(pool.clone());
        let milestones = db::MilestoneRepository::new(pool);

        for milestone in milestones.find_all().await.unwrap() {
            for task in tasks.find_by_milestone(milestone.id).await.unwrap() {
                assert_eq!(task.status, TaskStatus::Pending);
                let err = scheduler.complete_task(task.id).await.unwrap_err();
                assert!(matches!(err, OrchestratorError::InvalidTransition { .. }));
            }
        }
    }
}

mod restart {
    use super::*;

    #[tokio::test]
    async fn test_claim_survives_restart_and_is_released_on_recover() {
        let temp_dir = TempDir::new().unwrap();
        let db_url = format!("sqlite:{}", temp_dir.path().join("keystone.db").display());

        let first_run = Scheduler::new(db::connect(&db_url).await.unwrap());
        first_run.import_plan(three_milestones()).await.unwrap();
        let claimed = dispatched(first_run.next_action().await.unwrap());
        drop(first_run);

        let second_run = Scheduler::new(db::connect(&db_url).await.unwrap());
        let recovery = second_run.recover().await.unwrap();
        assert_eq!(recovery.released, vec![claimed.id]);

        let again = dispatched(second_run.next_action().await.unwrap());
        assert_eq!(again.id, claimed.id);
        assert_eq!(again.attempts, 2);
        assert_eq!(
            again.last_release_reason.as_deref(),
            Some("recovered after interrupted run")
        );
    }
}
