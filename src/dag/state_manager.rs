// src/dag/state_manager.rs

//! Run-state transitions shared by the scheduler's step functions.

use std::collections::HashMap;

use tracing::{debug, info, warn};

use crate::dag::DagGraph;
use crate::dag::task_info::{RunState, ScheduledTask, TaskInfo};
use crate::types::TaskId;

/// Mutable view over an execution's tasks.
pub struct StateManager<'a> {
    graph: &'a DagGraph,
    tasks: &'a mut HashMap<TaskId, TaskInfo>,
    execution: &'a str,
}

impl<'a> StateManager<'a> {
    pub fn new(graph: &'a DagGraph, tasks: &'a mut HashMap<TaskId, TaskInfo>, execution: &'a str) -> Self {
        Self {
            graph,
            tasks,
            execution,
        }
    }

    /// Cancel every non-terminal transitive dependent of `root`.
    ///
    /// Returns the newly cancelled tasks, sorted.
    pub fn cancel_dependents(&mut self, root: &str) -> Vec<TaskId> {
        let mut cancelled = Vec::new();
        for name in self.graph.transitive_dependents(root) {
            if let Some(info) = self.tasks.get_mut(&name) {
                if !info.run_state.is_terminal() {
                    debug!(
                        execution = %self.execution,
                        task = %info.id,
                        upstream = %root,
                        "cancelling dependent of failed task"
                    );
                    info.run_state = RunState::Cancelled;
                    cancelled.push(name);
                }
            }
        }
        cancelled
    }

    /// Move `Pending` tasks whose dependencies are complete and whose inputs
    /// pass `inputs_ready` to `Ready`.
    pub fn promote_ready<F>(&mut self, inputs_ready: F)
    where
        F: Fn(&TaskInfo) -> bool,
    {
        let candidates: Vec<TaskId> = {
            let ro = ReadOnlyStateManager::new(self.tasks);
            self.tasks
                .values()
                .filter(|info| {
                    info.run_state == RunState::Pending
                        && ro.deps_satisfied_for_info(info)
                        && inputs_ready(info)
                })
                .map(|info| info.id.clone())
                .collect()
        };

        for name in candidates {
            if let Some(info) = self.tasks.get_mut(&name) {
                debug!(execution = %self.execution, task = %info.id, "dependencies satisfied; marking Ready");
                info.run_state = RunState::Ready;
            }
        }
    }

    /// Take `Ready` tasks up to the parallelism bound, mark them
    /// `Allocating`, and return them as [`ScheduledTask`]s.
    ///
    /// Tasks are taken in id order so runs are reproducible.
    pub fn dispatch_ready(&mut self, parallelism: usize) -> Vec<ScheduledTask> {
        let in_flight = self.tasks.values().filter(|i| i.run_state.is_in_flight()).count();
        let free = parallelism.saturating_sub(in_flight);
        if free == 0 {
            return Vec::new();
        }

        let mut ready: Vec<TaskId> = self
            .tasks
            .values()
            .filter(|i| i.run_state == RunState::Ready)
            .map(|i| i.id.clone())
            .collect();
        ready.sort();
        ready.truncate(free);

        let mut scheduled = Vec::with_capacity(ready.len());
        for name in ready {
            if let Some(info) = self.tasks.get_mut(&name) {
                if info.reallocating {
                    info.reallocating = false;
                } else {
                    info.attempts += 1;
                    info.allocation_failures = 0;
                }
                info.run_state = RunState::Allocating;

                if info.attempts > 1 {
                    info!(
                        execution = %self.execution,
                        task = %info.id,
                        attempt = info.attempts,
                        "scheduling task retry"
                    );
                } else {
                    info!(execution = %self.execution, task = %info.id, "scheduling task");
                }
                scheduled.push(ScheduledTask::from_task_info(info, self.execution));
            }
        }
        scheduled
    }

    pub fn all_tasks_terminal(&self) -> bool {
        self.tasks.values().all(|info| info.run_state.is_terminal())
    }
}

/// Read-only dependency checks.
pub struct ReadOnlyStateManager<'a> {
    tasks: &'a HashMap<TaskId, TaskInfo>,
}

impl<'a> ReadOnlyStateManager<'a> {
    pub fn new(tasks: &'a HashMap<TaskId, TaskInfo>) -> Self {
        Self { tasks }
    }

    /// Whether every dependency of `info` has completed.
    pub fn deps_satisfied_for_info(&self, info: &TaskInfo) -> bool {
        info.deps.iter().all(|dep_name| match self.tasks.get(dep_name) {
            Some(dep) => dep.run_state == RunState::Completed,
            None => {
                warn!(task = %info.id, dep = %dep_name, "dependency missing from tasks map");
                false
            }
        })
    }
}
