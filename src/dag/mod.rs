// src/dag/mod.rs

//! Graph model and scheduling.
//!
//! - [`graph`] holds the submitted graph and its adjacency view.
//! - [`validate`] rejects malformed graphs before anything is registered.
//! - [`scheduler`] contains the per-execution state machine that decides
//!   which tasks are ready, retried, or cancelled.
//! - [`task_info`] provides task metadata, run states and scheduled task types.
//! - [`scheduler_step`] defines the result type for scheduler steps.
//! - [`state_manager`] manages per-execution state transitions.

pub mod graph;
pub mod scheduler;
pub mod scheduler_step;
pub mod state_manager;
pub mod task_info;
pub mod validate;

pub use graph::{DagGraph, ExecutionSpec, Graph, InputSlotSpec, OutputSlotSpec, SlotRef, TaskSpec};
pub use scheduler::{AllocationDecision, Scheduler};
pub use scheduler_step::{RetryRequest, SchedulerStep};
pub use task_info::{RunState, ScheduledTask, TaskInfo, TaskRecord, TaskStatus};
pub use validate::validate_graph;
