// src/engine/mod.rs

//! Orchestration engine.
//!
//! This module ties together:
//! - one pure [`Scheduler`](crate::dag::Scheduler) per execution
//! - the channel wiring between producer and consumer slots
//! - the main runtime event loop that reacts to:
//!   - allocator answers
//!   - task completion events
//!   - retry and stop timers
//!   - requests from [`GraphScheduler`](crate::service::GraphScheduler)
//!
//! The pure core state machine lives in [`core`]; the async/IO shell is
//! implemented in [`runtime`].

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::dag::TaskStatus;
use crate::errors::AllocatorError;
use crate::exec::WorkerHandle;
use crate::policy::RetryPolicy;
use crate::types::{ExecutionId, TaskId};

pub use crate::exec::TaskOutcome;

/// Runtime options used by both the core and the async shell.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeOptions {
    /// Maximum tasks in flight per execution.
    pub parallelism: usize,
    pub retry: RetryPolicy,
    /// Budget for `ResourceUnavailable` answers from the allocator.
    pub allocation_retry: RetryPolicy,
    /// How long a stopped task may take to acknowledge before it is
    /// cancelled anyway.
    pub cancel_timeout: Duration,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            parallelism: 4,
            retry: RetryPolicy::default(),
            allocation_retry: RetryPolicy::new(3, Default::default()),
            cancel_timeout: Duration::from_secs(5),
        }
    }
}

/// Overall state of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        self != ExecutionStatus::Running
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TaskSnapshot {
    pub status: TaskStatus,
    /// Attempts dispatched so far.
    pub attempts: u32,
}

/// Per-task state of one execution, as returned by `status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionSnapshot {
    pub execution: ExecutionId,
    pub status: ExecutionStatus,
    /// Fatal error that aborted the execution, if any.
    pub error: Option<String>,
    pub tasks: BTreeMap<TaskId, TaskSnapshot>,
}

impl ExecutionSnapshot {
    pub fn task_status(&self, task: &str) -> Option<TaskStatus> {
        self.tasks.get(task).map(|t| t.status)
    }
}

/// Events flowing into the core from the allocator, workers and timers.
#[derive(Debug, Clone)]
pub enum RuntimeEvent {
    /// The allocator produced a worker for `attempt`.
    Allocated {
        execution: ExecutionId,
        task: TaskId,
        attempt: u32,
        worker: WorkerHandle,
    },
    AllocationFailed {
        execution: ExecutionId,
        task: TaskId,
        attempt: u32,
        error: AllocatorError,
    },
    /// A worker finished an attempt (including injected aborts).
    TaskFinished {
        execution: ExecutionId,
        task: TaskId,
        attempt: u32,
        outcome: TaskOutcome,
    },
    /// A retry or allocation backoff elapsed.
    RetryDue { execution: ExecutionId, task: TaskId },
    /// A stopped task did not acknowledge within the cancel timeout.
    StopTimedOut {
        execution: ExecutionId,
        task: TaskId,
        attempt: u32,
    },
    /// Graceful shutdown requested.
    ShutdownRequested,
}

pub mod core;
pub mod event_handlers;
pub mod fault;
pub mod runtime;

pub use core::{CoreRuntime, Wiring};
pub use event_handlers::{CoreCommand, CoreStep};
pub use fault::FaultInjector;
pub use runtime::{Inbound, Request, Runtime};
