//! Read-only aggregate view of the store.

use db::{
    MilestoneRepository, OpportunityCounts, ProcessStateRepository, ResearchRepository,
    SqlitePool, TaskCounts, TaskRepository, TechnologyRepository,
};
use keystone_core::ResearchPhase;
use serde::Serialize;
use uuid::Uuid;

use crate::error::Result;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TaskProgress {
    pub total: i64,
    pub pending: i64,
    pub in_progress: i64,
    pub completed: i64,
}

impl From<TaskCounts> for TaskProgress {
    fn from(counts: TaskCounts) -> Self {
        Self {
            total: counts.total(),
            pending: counts.pending,
            in_progress: counts.in_progress,
            completed: counts.completed,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResearchProgress {
    pub phase: ResearchPhase,
    pub total: i64,
    pub pending: i64,
    pub in_progress: i64,
    pub completed: i64,
    pub skipped: i64,
    pub technologies: i64,
}

impl ResearchProgress {
    fn new(phase: ResearchPhase, counts: OpportunityCounts, technologies: i64) -> Self {
        Self {
            phase,
            total: counts.total(),
            pending: counts.pending,
            in_progress: counts.in_progress,
            completed: counts.completed,
            skipped: counts.skipped,
            technologies,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CurrentMilestone {
    pub id: Uuid,
    pub name: String,
    pub ordering: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProgressReport {
    pub milestones_total: i64,
    pub milestones_completed: i64,
    pub tasks: TaskProgress,
    /// Completed tasks over all tasks, 0 to 100.
    pub percent_complete: f64,
    pub current_milestone: Option<CurrentMilestone>,
    pub average_task_duration_secs: Option<f64>,
    pub research: ResearchProgress,
}

pub struct ProgressReporter {
    milestones: MilestoneRepository,
    tasks: TaskRepository,
    research: ResearchRepository,
    technologies: TechnologyRepository,
    state: ProcessStateRepository,
}

impl ProgressReporter {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            milestones: MilestoneRepository::new(pool.clone()),
            tasks: TaskRepository::new(pool.clone()),
            research: ResearchRepository::new(pool.clone()),
            technologies: TechnologyRepository::new(pool.clone()),
            state: ProcessStateRepository::new(pool),
        }
    }

    pub async fn report(&self) -> Result<ProgressReport> {
        let milestones = self.milestones.find_all().await?;
        let task_counts = self.tasks.counts().await?;

        let percent_complete = if task_counts.total() == 0 {
            0.0
        } else {
            task_counts.completed as f64 * 100.0 / task_counts.total() as f64
        };

        let current_milestone = match self.state.current_milestone().await? {
            Some(id) => milestones
                .iter()
                .find(|m| m.id == id)
                .map(|m| CurrentMilestone {
                    id: m.id,
                    name: m.name.clone(),
                    ordering: m.ordering,
                }),
            None => None,
        };

        let research = ResearchProgress::new(
            self.state.research_phase().await?,
            self.research.counts().await?,
            self.technologies.count().await?,
        );

        Ok(ProgressReport {
            milestones_total: milestones.len() as i64,
            milestones_completed: milestones.iter().filter(|m| m.is_completed()).count() as i64,
            tasks: task_counts.into(),
            percent_complete,
            current_milestone,
            average_task_duration_secs: self.tasks.average_duration_secs().await?,
            research,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{NextAction, Scheduler};
    use keystone_core::{OpportunityId, PlanGraph, PlannedMilestone, PlannedTask, ResearchOpportunity};

    fn task(key: &str) -> PlannedTask {
        PlannedTask {
            key: key.to_string(),
            title: key.to_string(),
            description: String::new(),
            depends_on: vec![],
        }
    }

    #[tokio::test]
    async fn test_empty_store_report() {
        let pool = db::connect("sqlite::memory:").await.unwrap();
        let report = ProgressReporter::new(pool).report().await.unwrap();

        assert_eq!(report.milestones_total, 0);
        assert_eq!(report.tasks.total, 0);
        assert_eq!(report.percent_complete, 0.0);
        assert!(report.current_milestone.is_none());
        assert_eq!(report.research.phase, ResearchPhase::NotStarted);
    }

    #[tokio::test]
    async fn test_report_tracks_scheduler_progress() {
        let pool = db::connect("sqlite::memory:").await.unwrap();
        let scheduler = Scheduler::new(pool.clone());
        scheduler
            .import_plan(PlanGraph {
                milestones: vec![
                    PlannedMilestone {
                        name: "Setup".to_string(),
                        tasks: vec![task("a"), task("b")],
                    },
                    PlannedMilestone {
                        name: "Ship".to_string(),
                        tasks: vec![task("c"), task("d")],
                    },
                ],
            })
            .await
            .unwrap();

        let NextAction::Dispatch(first) = scheduler.next_action().await.unwrap() else {
            panic!("expected a dispatch");
        };
        scheduler.complete_task(first.id).await.unwrap();

        let research = ResearchRepository::new(pool.clone());
        research
            .create_opportunities(&[ResearchOpportunity::new(OpportunityId::StackDatabase)])
            .await
            .unwrap();

        let report = ProgressReporter::new(pool).report().await.unwrap();
        assert_eq!(report.milestones_total, 2);
        assert_eq!(report.milestones_completed, 0);
        assert_eq!(report.tasks.total, 4);
        assert_eq!(report.tasks.completed, 1);
        assert_eq!(report.percent_complete, 25.0);
        assert_eq!(report.current_milestone.unwrap().name, "Setup");
        assert!(report.average_task_duration_secs.is_some());
        assert_eq!(report.research.total, 1);
        assert_eq!(report.research.pending, 1);
        assert_eq!(report.research.technologies, 0);
    }
}
