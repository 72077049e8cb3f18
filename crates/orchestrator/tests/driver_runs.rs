use async_trait::async_trait;
use keystone_core::{
    Confidence, OpportunityId, PlanGraph, PlannedMilestone, PlannedTask, Recommendation,
    ResearchContext, ResearchPhase, TechCategory, Technology,
};
use orchestrator::{
    Driver, DriverOutcome, FoundationSelection, OrchestratorError, Planner, ResearchConfig,
    ResearchOrchestrator, ResearchRequest, ResearchWorker, Scheduler, SchedulerConfig,
    TaskAssignment, TaskExecutor, TaskOutcome, VerificationMode,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

struct StaticWorker;

#[async_trait]
impl ResearchWorker for StaticWorker {
    async fn research(&self, request: &ResearchRequest) -> orchestrator::Result<String> {
        let name = match request.opportunity_id.technology_category() {
            TechCategory::Database => "PostgreSQL",
            TechCategory::BackendFramework => "Axum",
            _ => return Err(OrchestratorError::Worker("no opinion".to_string())),
        };
        let recommendation = Recommendation {
            recommendation: name.to_string(),
            version: "1".to_string(),
            source: "https://docs.example".to_string(),
            alternatives: vec![],
            rationale: "fits".to_string(),
            compatibility_notes: vec![],
            confidence: Confidence::High,
        };
        Ok(serde_json::to_string(&recommendation).unwrap())
    }
}

#[derive(Default)]
struct StackPlanner {
    plans: AtomicUsize,
    seen_technologies: Mutex<Vec<String>>,
}

#[async_trait]
impl Planner for StackPlanner {
    async fn select_research(&self, requirements: &str) -> orchestrator::Result<FoundationSelection> {
        Ok(FoundationSelection::new(
            ResearchContext::new(requirements),
            &[OpportunityId::StackBackendFramework, OpportunityId::StackDatabase],
        ))
    }

    async fn plan(
        &self,
        _requirements: &str,
        technologies: &[Technology],
    ) -> orchestrator::Result<PlanGraph> {
        self.plans.fetch_add(1, Ordering::SeqCst);
        *self.seen_technologies.lock().unwrap() =
            technologies.iter().map(|t| t.name.clone()).collect();

        let task = |key: &str, depends_on: &[&str]| PlannedTask {
            key: key.to_string(),
            title: key.to_string(),
            description: String::new(),
            depends_on: depends_on.iter().map(|d| d.to_string()).collect(),
        };
        Ok(PlanGraph {
            milestones: vec![
                PlannedMilestone {
                    name: "Foundations".to_string(),
                    tasks: vec![task("schema", &[]), task("server", &["schema"])],
                },
                PlannedMilestone {
                    name: "Features".to_string(),
                    tasks: vec![task("signup", &[])],
                },
            ],
        })
    }
}

/// Fails each listed task a set number of times before completing it.
#[derive(Default)]
struct FlakyExecutor {
    failures: Mutex<HashMap<String, usize>>,
    assignments: Mutex<Vec<TaskAssignment>>,
}

impl FlakyExecutor {
    fn failing(title: &str, times: usize) -> Self {
        let executor = Self::default();
        executor
            .failures
            .lock()
            .unwrap()
            .insert(title.to_string(), times);
        executor
    }
}

#[async_trait]
impl TaskExecutor for FlakyExecutor {
    async fn execute(&self, assignment: &TaskAssignment) -> orchestrator::Result<TaskOutcome> {
        self.assignments.lock().unwrap().push(assignment.clone());
        let mut failures = self.failures.lock().unwrap();
        match failures.get_mut(&assignment.title) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Ok(TaskOutcome::Failed {
                    reason: "tests failed".to_string(),
                })
            }
            _ => Ok(TaskOutcome::Completed),
        }
    }
}

fn driver(
    pool: &db::SqlitePool,
    planner: Arc<StackPlanner>,
    executor: Arc<FlakyExecutor>,
    scheduler_config: SchedulerConfig,
) -> Driver {
    let research = ResearchOrchestrator::new(pool.clone(), Arc::new(StaticWorker))
        .with_config(ResearchConfig::default().with_verification(VerificationMode::Off));
    let scheduler = Scheduler::new(pool.clone()).with_config(scheduler_config);
    Driver::new(scheduler, research, planner, executor)
}

#[tokio::test]
async fn test_driver_runs_research_plan_and_tasks() {
    let pool = db::connect("sqlite::memory:").await.unwrap();
    let planner = Arc::new(StackPlanner::default());
    let executor = Arc::new(FlakyExecutor::failing("server", 1));

    let outcome = driver(&pool, planner.clone(), executor.clone(), SchedulerConfig::default())
        .run("todo api")
        .await
        .unwrap();
    assert!(matches!(outcome, DriverOutcome::AllComplete { .. }));

    // The planner saw the committed stack before planning
    let mut seen = planner.seen_technologies.lock().unwrap().clone();
    seen.sort();
    assert_eq!(seen, vec!["Axum", "PostgreSQL"]);

    let titles: Vec<String> = executor
        .assignments
        .lock()
        .unwrap()
        .iter()
        .map(|a| format!("{}#{}", a.title, a.attempt))
        .collect();
    assert_eq!(titles, vec!["schema#1", "server#1", "server#2", "signup#1"]);

    let tasks = db::TaskRepository::new(pool.clone());
    let counts = tasks.counts().await.unwrap();
    assert_eq!(counts.completed, 3);
    assert_eq!(counts.incomplete(), 0);

    let state = db::ProcessStateRepository::new(pool.clone());
    assert_eq!(state.research_phase().await.unwrap(), ResearchPhase::Completed);
}

#[tokio::test]
async fn test_second_run_resumes_without_redoing_work() {
    let pool = db::connect("sqlite::memory:").await.unwrap();
    let planner = Arc::new(StackPlanner::default());
    let executor = Arc::new(FlakyExecutor::default());

    driver(&pool, planner.clone(), executor.clone(), SchedulerConfig::default())
        .run("todo api")
        .await
        .unwrap();
    let dispatched = executor.assignments.lock().unwrap().len();

    let outcome = driver(&pool, planner.clone(), executor.clone(), SchedulerConfig::default())
        .run("todo api")
        .await
        .unwrap();

    assert_eq!(outcome, DriverOutcome::AllComplete { iterations: 1 });
    assert_eq!(planner.plans.load(Ordering::SeqCst), 1);
    assert_eq!(executor.assignments.lock().unwrap().len(), dispatched);
}

#[tokio::test]
async fn test_iteration_guard_stops_failing_loop() {
    let pool = db::connect("sqlite::memory:").await.unwrap();
    let planner = Arc::new(StackPlanner::default());
    let executor = Arc::new(FlakyExecutor::failing("schema", usize::MAX));

    let outcome = driver(
        &pool,
        planner,
        executor.clone(),
        SchedulerConfig::default().with_max_iterations(5),
    )
    .run("todo api")
    .await
    .unwrap();

    assert_eq!(outcome, DriverOutcome::IterationLimit { iterations: 5 });

    // Every failure released the claim, so nothing is left in progress
    let tasks = db::TaskRepository::new(pool);
    assert!(tasks.find_in_progress().await.unwrap().is_empty());

    let attempts: Vec<u32> = executor
        .assignments
        .lock()
        .unwrap()
        .iter()
        .map(|a| a.attempt)
        .collect();
    assert_eq!(attempts, vec![1, 2, 3, 4, 5]);
}
