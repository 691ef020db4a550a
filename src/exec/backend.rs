// src/exec/backend.rs

//! Contracts the scheduler consumes from the outside world.
//!
//! - An [`Allocator`] turns a [`ProvisioningSpec`] into a live
//!   [`WorkerHandle`] and takes it back once the task is terminal.
//! - A [`Worker`] executes one task attempt, reading and writing its slots
//!   through the [`ChannelManager`] handed over in [`WorkerContext`].
//!
//! Both traits return boxed futures so they stay object safe; production
//! code uses [`crate::exec::LocalAllocator`], tests plug in scripted fakes.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::channel::ChannelManager;
use crate::errors::AllocatorError;
use crate::types::{ExecutionId, SlotId, Subject, TaskId};

/// Boxed future returned by the executor traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// How one task attempt ended, as reported by its worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Success,
    /// The task ran and reported failure (e.g. non-zero exit code).
    Failed(String),
    /// The worker died or could not run the task at all.
    Crashed(String),
    /// The worker honoured a stop signal.
    Stopped,
}

/// Resource and environment descriptor used to request a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningSpec {
    #[serde(default = "default_pool")]
    pub pool: String,
    #[serde(default = "default_cpu")]
    pub cpu: u32,
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_pool() -> String {
    "local".to_string()
}

fn default_cpu() -> u32 {
    1
}

fn default_memory_mb() -> u64 {
    256
}

impl Default for ProvisioningSpec {
    fn default() -> Self {
        Self {
            pool: default_pool(),
            cpu: default_cpu(),
            memory_mb: default_memory_mb(),
            env: BTreeMap::new(),
        }
    }
}

/// Everything a worker needs to run one attempt.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub execution: ExecutionId,
    pub task: TaskId,
    pub attempt: u32,
    pub cmd: String,
    pub env: BTreeMap<String, String>,
    /// Input slot ids, in declaration order.
    pub inputs: Vec<SlotId>,
    /// Output slot ids, in declaration order.
    pub outputs: Vec<SlotId>,
    pub channels: ChannelManager,
    /// Subject the worker acts as on the data plane.
    pub subject: Subject,
}

/// Executes task attempts.
pub trait Worker: Send + Sync {
    /// Run one attempt to completion.
    ///
    /// When `stop` fires the worker should abandon the attempt and return
    /// [`TaskOutcome::Stopped`].
    fn execute(&self, ctx: WorkerContext, stop: oneshot::Receiver<()>) -> BoxFuture<'_, TaskOutcome>;
}

/// A live worker obtained from an [`Allocator`].
#[derive(Clone)]
pub struct WorkerHandle {
    pub id: String,
    pub worker: Arc<dyn Worker>,
}

impl WorkerHandle {
    pub fn new(id: impl Into<String>, worker: Arc<dyn Worker>) -> Self {
        Self {
            id: id.into(),
            worker,
        }
    }
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle").field("id", &self.id).finish_non_exhaustive()
    }
}

/// Provisions workers.
pub trait Allocator: Send + Sync {
    /// Obtain a worker for `spec`.
    ///
    /// - `ResourceUnavailable` is transient; the scheduler backs off.
    /// - `InvalidConfiguration` is fatal for the execution.
    fn allocate(&self, spec: ProvisioningSpec) -> BoxFuture<'_, Result<WorkerHandle, AllocatorError>>;

    /// Return a worker to the pool once its task attempt is terminal.
    fn release(&self, handle: WorkerHandle) -> BoxFuture<'_, ()>;
}
