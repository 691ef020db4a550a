// src/dag/task_info.rs

//! Task metadata and per-execution run state.

use serde::{Deserialize, Serialize};

use crate::dag::graph::TaskSpec;
use crate::types::{ExecutionId, TaskId};

/// Run state of a task (internal).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    /// Waiting on dependencies or inputs.
    Pending,
    /// Dependencies satisfied; waiting for a parallelism slot.
    Ready,
    /// Worker requested from the allocator.
    Allocating,
    /// Allocator asked us to back off; will be re-requested.
    AllocationBackoff,
    Running,
    /// Stop signal sent; waiting for acknowledgement or timeout.
    Stopping,
    /// Attempt failed; waiting out the retry backoff.
    RetryWaiting,
    Completed,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Completed | RunState::Failed | RunState::Cancelled)
    }

    /// Counts against the parallelism bound.
    pub fn is_in_flight(self) -> bool {
        matches!(self, RunState::Allocating | RunState::Running | RunState::Stopping)
    }
}

/// Public, read-only view of a task's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled)
    }
}

impl From<RunState> for TaskStatus {
    fn from(state: RunState) -> Self {
        match state {
            RunState::Pending => TaskStatus::Pending,
            RunState::Ready | RunState::Allocating | RunState::AllocationBackoff => TaskStatus::Ready,
            RunState::Running | RunState::Stopping => TaskStatus::Running,
            // A failed attempt reads as FAILED until its retry is due.
            RunState::RetryWaiting | RunState::Failed => TaskStatus::Failed,
            RunState::Completed => TaskStatus::Completed,
            RunState::Cancelled => TaskStatus::Cancelled,
        }
    }
}

/// Static task information plus run state.
#[derive(Debug, Clone)]
pub struct TaskInfo {
    pub id: TaskId,
    pub spec: TaskSpec,
    /// Direct dependencies (`after` plus input producers).
    pub deps: Vec<TaskId>,
    pub run_state: RunState,
    /// Dispatches so far. The current attempt number.
    pub attempts: u32,
    /// Failed attempts so far.
    pub failures: u32,
    /// Consecutive `ResourceUnavailable` answers for the current attempt.
    pub allocation_failures: u32,
    /// Next dispatch re-requests a worker for the current attempt.
    pub reallocating: bool,
    pub last_error: Option<String>,
}

impl TaskInfo {
    pub fn new(spec: TaskSpec, deps: Vec<TaskId>) -> Self {
        Self {
            id: spec.id.clone(),
            spec,
            deps,
            run_state: RunState::Pending,
            attempts: 0,
            failures: 0,
            allocation_failures: 0,
            reallocating: false,
            last_error: None,
        }
    }

    pub fn record(&self) -> TaskRecord {
        TaskRecord {
            id: self.id.clone(),
            run_state: self.run_state,
            attempts: self.attempts,
            failures: self.failures,
            allocation_failures: self.allocation_failures,
            last_error: self.last_error.clone(),
        }
    }

    pub fn apply_record(&mut self, record: &TaskRecord) {
        self.run_state = record.run_state;
        self.attempts = record.attempts;
        self.failures = record.failures;
        self.allocation_failures = record.allocation_failures;
        self.last_error = record.last_error.clone();
    }
}

/// Persisted run state of one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub run_state: RunState,
    pub attempts: u32,
    pub failures: u32,
    pub allocation_failures: u32,
    pub last_error: Option<String>,
}

/// A task the scheduler wants a worker for now.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledTask {
    pub execution: ExecutionId,
    pub task: TaskId,
    /// Attempt number, starting at 1. Events from older attempts are ignored.
    pub attempt: u32,
    pub spec: TaskSpec,
}

impl ScheduledTask {
    pub fn from_task_info(info: &TaskInfo, execution: &str) -> Self {
        Self {
            execution: execution.to_string(),
            task: info.id.clone(),
            attempt: info.attempts,
            spec: info.spec.clone(),
        }
    }
}
