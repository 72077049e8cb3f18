//! Planner output: the milestone/task graph handed to the store in one piece.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

use super::{Milestone, Task, TaskDependency};
use crate::error::CoreError;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlanGraph {
    pub milestones: Vec<PlannedMilestone>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlannedMilestone {
    pub name: String,
    #[serde(default)]
    pub tasks: Vec<PlannedTask>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlannedTask {
    /// Planner-local key used to express dependencies.
    pub key: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// Rows derived from a validated [`PlanGraph`].
#[derive(Debug, Clone)]
pub struct PlanRecords {
    pub milestones: Vec<Milestone>,
    pub tasks: Vec<Task>,
    pub dependencies: Vec<TaskDependency>,
}

impl PlanGraph {
    /// Checks the graph invariants the scheduler relies on: unique task keys,
    /// known prerequisites that live in the same or an earlier milestone, and
    /// no dependency cycles.
    pub fn validate(&self) -> Result<(), CoreError> {
        let mut milestone_of: HashMap<&str, usize> = HashMap::new();
        for (index, milestone) in self.milestones.iter().enumerate() {
            if milestone.name.trim().is_empty() {
                return Err(CoreError::InvalidPlan(format!(
                    "milestone #{} has an empty name",
                    index + 1
                )));
            }
            for task in &milestone.tasks {
                if milestone_of.insert(task.key.as_str(), index).is_some() {
                    return Err(CoreError::InvalidPlan(format!(
                        "duplicate task key '{}'",
                        task.key
                    )));
                }
            }
        }

        for (index, milestone) in self.milestones.iter().enumerate() {
            for task in &milestone.tasks {
                for prerequisite in &task.depends_on {
                    if prerequisite == &task.key {
                        return Err(CoreError::InvalidPlan(format!(
                            "task '{}' depends on itself",
                            task.key
                        )));
                    }
                    let Some(&owner) = milestone_of.get(prerequisite.as_str()) else {
                        return Err(CoreError::InvalidPlan(format!(
                            "task '{}' depends on unknown task '{}'",
                            task.key, prerequisite
                        )));
                    };
                    if owner > index {
                        return Err(CoreError::InvalidPlan(format!(
                            "task '{}' depends on '{}' from a later milestone",
                            task.key, prerequisite
                        )));
                    }
                }
            }
        }

        self.check_acyclic()
    }

    fn check_acyclic(&self) -> Result<(), CoreError> {
        let tasks: Vec<&PlannedTask> = self.milestones.iter().flat_map(|m| &m.tasks).collect();
        let mut in_degree: HashMap<&str, usize> =
            tasks.iter().map(|t| (t.key.as_str(), 0)).collect();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

        for task in &tasks {
            let unique: HashSet<&str> = task.depends_on.iter().map(String::as_str).collect();
            for prerequisite in unique {
                *in_degree.entry(task.key.as_str()).or_default() += 1;
                dependents
                    .entry(prerequisite)
                    .or_default()
                    .push(task.key.as_str());
            }
        }

        let mut ready: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(key, _)| *key)
            .collect();
        let mut visited = 0usize;

        while let Some(key) = ready.pop_front() {
            visited += 1;
            for dependent in dependents.get(key).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push_back(*dependent);
                    }
                }
            }
        }

        if visited == tasks.len() {
            Ok(())
        } else {
            let mut cyclic: Vec<&str> = in_degree
                .into_iter()
                .filter(|(_, degree)| *degree > 0)
                .map(|(key, _)| key)
                .collect();
            cyclic.sort_unstable();
            Err(CoreError::InvalidPlan(format!(
                "dependency cycle among tasks: {}",
                cyclic.join(", ")
            )))
        }
    }

    /// Validates the graph and assigns ids and ordering indices (1-based,
    /// following declaration order).
    pub fn into_records(self) -> Result<PlanRecords, CoreError> {
        self.validate()?;

        let mut milestones = Vec::with_capacity(self.milestones.len());
        let mut tasks = Vec::new();
        let mut ids_by_key = HashMap::new();
        let mut pending_edges = Vec::new();

        for (m_index, planned) in self.milestones.into_iter().enumerate() {
            let milestone = Milestone::new(planned.name, m_index as i64 + 1);
            for (t_index, planned_task) in planned.tasks.into_iter().enumerate() {
                let task = Task::new(
                    milestone.id,
                    planned_task.title,
                    planned_task.description,
                    t_index as i64 + 1,
                );
                ids_by_key.insert(planned_task.key, task.id);
                pending_edges.push((task.id, planned_task.depends_on));
                tasks.push(task);
            }
            milestones.push(milestone);
        }

        let mut dependencies = Vec::new();
        for (task_id, prerequisites) in pending_edges {
            let unique: HashSet<String> = prerequisites.into_iter().collect();
            for key in unique {
                if let Some(depends_on) = ids_by_key.get(&key) {
                    dependencies.push(TaskDependency::new(task_id, *depends_on));
                }
            }
        }

        Ok(PlanRecords {
            milestones,
            tasks,
            dependencies,
        })
    }
}
