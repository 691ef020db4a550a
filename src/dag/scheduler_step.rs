// src/dag/scheduler_step.rs

//! Step-by-step result types for the scheduler.

use std::time::Duration;

use crate::dag::task_info::ScheduledTask;
use crate::types::TaskId;

/// A task to be moved back to pending once `delay` has elapsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryRequest {
    pub task: TaskId,
    pub delay: Duration,
}

/// Structured result of a single scheduler step.
///
/// Callers turn this into channel operations and IO commands; tests use it to
/// step an execution by hand and assert on what changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchedulerStep {
    /// Tasks that need a worker now.
    pub newly_scheduled: Vec<ScheduledTask>,
    pub newly_completed: Vec<TaskId>,
    /// Tasks that failed for good (retry budget exhausted).
    pub newly_failed: Vec<TaskId>,
    pub newly_cancelled: Vec<TaskId>,
    /// Running tasks that must be sent a stop signal, with their attempt.
    pub stopping: Vec<(TaskId, u32)>,
    /// Tasks that failed an attempt and will be retried.
    pub retries: Vec<RetryRequest>,
    /// Every task reached a terminal state in this step.
    pub execution_finished: bool,
}

impl SchedulerStep {
    pub fn merge(&mut self, other: SchedulerStep) {
        self.newly_scheduled.extend(other.newly_scheduled);
        self.newly_completed.extend(other.newly_completed);
        self.newly_failed.extend(other.newly_failed);
        self.newly_cancelled.extend(other.newly_cancelled);
        self.stopping.extend(other.stopping);
        self.retries.extend(other.retries);
        self.execution_finished |= other.execution_finished;
    }

    pub fn is_empty(&self) -> bool {
        *self == SchedulerStep::default()
    }
}
