//! Task dependency graphs.

use std::collections::{HashMap, HashSet, VecDeque};

use super::stage::ProcessingStage;
use crate::queue::{TaskInfo, TaskPriority};
use crate::{Error, Result};

/// The tasks of one job with their dependency edges.
#[derive(Debug, Clone)]
pub struct TaskGraph {
    tasks: Vec<TaskInfo>,
}

impl TaskGraph {
    pub fn new(tasks: Vec<TaskInfo>) -> Self {
        Self { tasks }
    }

    /// One task per stage, each depending on the stage before it.
    pub fn linear(
        job_id: &str,
        stages: &[ProcessingStage],
        priority: TaskPriority,
        max_retries: u32,
        payload: serde_json::Value,
    ) -> Self {
        let mut tasks: Vec<TaskInfo> = Vec::with_capacity(stages.len());
        for stage in stages {
            let dependencies = tasks
                .last()
                .map(|prev| vec![prev.task_id.clone()])
                .unwrap_or_default();
            tasks.push(
                TaskInfo::new(job_id, stage.as_str(), priority, payload.clone())
                    .with_max_retries(max_retries)
                    .with_dependencies(dependencies),
            );
        }
        Self { tasks }
    }

    pub fn tasks(&self) -> &[TaskInfo] {
        &self.tasks
    }

    pub fn into_tasks(self) -> Vec<TaskInfo> {
        self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Check every dependency refers to a task in the graph and that the
    /// graph is acyclic. Returns the task ids in a valid execution order.
    pub fn validate(&self) -> Result<Vec<String>> {
        let ids: HashSet<&str> = self.tasks.iter().map(|t| t.task_id.as_str()).collect();
        if ids.len() != self.tasks.len() {
            return Err(Error::validation("task graph contains duplicate task ids"));
        }

        let mut in_degree: HashMap<&str, usize> = HashMap::with_capacity(self.tasks.len());
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for task in &self.tasks {
            in_degree.entry(task.task_id.as_str()).or_insert(0);
            for dep in &task.dependencies {
                if !ids.contains(dep.as_str()) {
                    return Err(Error::validation(format!(
                        "task {} depends on unknown task {}",
                        task.task_id, dep
                    )));
                }
                *in_degree.entry(task.task_id.as_str()).or_insert(0) += 1;
                dependents
                    .entry(dep.as_str())
                    .or_default()
                    .push(task.task_id.as_str());
            }
        }

        // Kahn's algorithm, seeded in declaration order.
        let mut ready: VecDeque<&str> = self
            .tasks
            .iter()
            .map(|t| t.task_id.as_str())
            .filter(|id| in_degree.get(id).copied() == Some(0))
            .collect();
        let mut order = Vec::with_capacity(self.tasks.len());
        while let Some(id) = ready.pop_front() {
            order.push(id.to_string());
            for next in dependents.get(id).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(next) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push_back(*next);
                    }
                }
            }
        }

        if order.len() != self.tasks.len() {
            return Err(Error::validation("task graph contains a dependency cycle"));
        }
        Ok(order)
    }
}
