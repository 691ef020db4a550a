// src/exec/mod.rs

//! Worker execution layer.
//!
//! - [`backend`] defines the consumed `Allocator` / `Worker` contracts and
//!   the types that cross them.
//! - [`local`] provides `LocalAllocator`, a fixed pool of local workers.
//! - [`task_runner`] holds `ProcessWorker`, which runs a task's command as a
//!   shell process wired to its slots.

pub mod backend;
pub mod local;
pub mod task_runner;

pub use backend::{
    Allocator, BoxFuture, ProvisioningSpec, TaskOutcome, Worker, WorkerContext, WorkerHandle,
};
pub use local::LocalAllocator;
pub use task_runner::ProcessWorker;
