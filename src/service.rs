// src/service.rs

//! Public handle to a running scheduler.
//!
//! [`GraphScheduler`] owns the sending half of the runtime loop and a clone
//! of the channel registry. Every call checks [`AccessControl`] first, then
//! either talks to the runtime (executions) or to the [`ChannelManager`]
//! directly (slot and channel inspection).

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::channel::{ChannelManager, ChannelState, Endpoint, SlotStatus};
use crate::dag::{Graph, validate_graph};
use crate::engine::{
    CoreRuntime, ExecutionSnapshot, FaultInjector, Inbound, Request, Runtime, RuntimeEvent,
    RuntimeOptions,
};
use crate::errors::{ChannelError, Result, SchedulerError};
use crate::exec::{Allocator, LocalAllocator};
use crate::storage::{MemoryStorage, Storage};
use crate::store::{MemoryStateStore, StateStore};
use crate::types::{AccessControl, ChannelId, ClosePolicy, ExecutionId, Permission, Subject, TaskId};

const REQUEST_BUFFER: usize = 256;

/// Builder for [`GraphScheduler`]. Every collaborator has an in-process
/// default.
#[derive(Default)]
pub struct GraphSchedulerBuilder {
    allocator: Option<Arc<dyn Allocator>>,
    storage: Option<Arc<dyn Storage>>,
    store: Option<Arc<dyn StateStore>>,
    access: AccessControl,
    options: RuntimeOptions,
    close_policy: ClosePolicy,
}

impl GraphSchedulerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocator(mut self, allocator: Arc<dyn Allocator>) -> Self {
        self.allocator = Some(allocator);
        self
    }

    /// Backing store for snapshot channels.
    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Where execution records are persisted and recovered from.
    pub fn state_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// The capability check must also admit [`Subject::system`], which the
    /// scheduler uses for its own channel operations.
    pub fn access(mut self, access: AccessControl) -> Self {
        self.access = access;
        self
    }

    pub fn options(mut self, options: RuntimeOptions) -> Self {
        self.options = options;
        self
    }

    pub fn close_policy(mut self, policy: ClosePolicy) -> Self {
        self.close_policy = policy;
        self
    }

    /// Recover persisted executions and spawn the runtime loop.
    ///
    /// Must be called from within a Tokio runtime.
    pub async fn start(self) -> Result<GraphScheduler> {
        let allocator = self
            .allocator
            .unwrap_or_else(|| Arc::new(LocalAllocator::new(4, ["local".to_string()])));
        let storage = self.storage.unwrap_or_else(|| Arc::new(MemoryStorage::new()));
        let store = self.store.unwrap_or_else(|| Arc::new(MemoryStateStore::new()));

        let channels = ChannelManager::new(storage, self.access.clone(), self.close_policy);
        let core = CoreRuntime::new(channels.clone(), self.options);

        let (tx, rx) = mpsc::channel::<Inbound>(REQUEST_BUFFER);
        let faults = FaultInjector::new();
        let mut runtime = Runtime::new(core, rx, tx.clone(), allocator, store, faults.clone());
        runtime.recover().await?;
        let handle = tokio::spawn(runtime.run());

        info!(
            parallelism = self.options.parallelism,
            close_policy = ?self.close_policy,
            "graph scheduler started"
        );

        Ok(GraphScheduler {
            tx,
            channels,
            access: self.access,
            faults,
            handle,
        })
    }
}

/// Handle to a running scheduler.
#[derive(Debug)]
pub struct GraphScheduler {
    tx: mpsc::Sender<Inbound>,
    channels: ChannelManager,
    access: AccessControl,
    faults: FaultInjector,
    handle: JoinHandle<Result<()>>,
}

impl GraphScheduler {
    pub fn builder() -> GraphSchedulerBuilder {
        GraphSchedulerBuilder::new()
    }

    fn authorize(
        &self,
        subject: &Subject,
        resource: &str,
        permission: Permission,
    ) -> std::result::Result<(), SchedulerError> {
        if self.access.is_allowed(subject, resource, permission) {
            Ok(())
        } else {
            warn!(subject = %subject, resource, ?permission, "permission denied");
            Err(SchedulerError::permission_denied(&subject.id, resource))
        }
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Request,
    ) -> std::result::Result<T, SchedulerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Inbound::Request(make(reply)))
            .await
            .map_err(|_| SchedulerError::shutdown())?;
        rx.await.map_err(|_| SchedulerError::shutdown())
    }

    /// Validate `graph` and start executing it. A rejected graph leaves no
    /// trace behind.
    pub async fn submit(
        &self,
        subject: &Subject,
        graph: Graph,
    ) -> std::result::Result<ExecutionId, SchedulerError> {
        self.authorize(subject, &graph.name, Permission::SubmitGraph)?;
        validate_graph(&graph)?;

        let execution = format!("exec-{}", Uuid::new_v4());
        self.call(|reply| Request::Submit {
            execution,
            graph,
            reply,
        })
        .await?
    }

    pub async fn status(
        &self,
        subject: &Subject,
        execution: &str,
    ) -> std::result::Result<ExecutionSnapshot, SchedulerError> {
        self.authorize(subject, execution, Permission::ReadExecution)?;
        let execution = execution.to_string();
        self.call(|reply| Request::Status { execution, reply }).await?
    }

    /// Snapshots of every execution `subject` may read.
    pub async fn executions(&self, subject: &Subject) -> std::result::Result<Vec<ExecutionSnapshot>, SchedulerError> {
        let all = self.call(|reply| Request::List { reply }).await?;
        Ok(all
            .into_iter()
            .filter(|s| self.access.is_allowed(subject, &s.execution, Permission::ReadExecution))
            .collect())
    }

    pub async fn cancel(&self, subject: &Subject, execution: &str) -> std::result::Result<(), SchedulerError> {
        self.authorize(subject, execution, Permission::CancelExecution)?;
        let execution = execution.to_string();
        self.call(|reply| Request::Cancel { execution, reply }).await?
    }

    /// Resolve with the final snapshot once `execution` is terminal.
    pub async fn wait(
        &self,
        subject: &Subject,
        execution: &str,
    ) -> std::result::Result<ExecutionSnapshot, SchedulerError> {
        self.authorize(subject, execution, Permission::ReadExecution)?;
        let execution = execution.to_string();
        self.call(|reply| Request::Wait { execution, reply }).await?
    }

    /// Abort the attempt of `task` that is currently in flight. It finishes
    /// as a crash and goes through the regular retry/teardown path.
    pub async fn inject_fault(
        &self,
        subject: &Subject,
        execution: &str,
        task: &str,
    ) -> std::result::Result<(), SchedulerError> {
        self.authorize(subject, execution, Permission::InjectFault)?;
        let (execution, task): (ExecutionId, TaskId) = (execution.to_string(), task.to_string());
        self.call(|reply| Request::InjectFault {
            execution,
            task,
            reply,
        })
        .await?
    }

    /// Abort the next attempt of `task` that `execution` dispatches.
    /// An attempt already in flight is left alone; see [`inject_fault`](Self::inject_fault).
    pub fn arm_fault(&self, subject: &Subject, execution: &str, task: &str) -> std::result::Result<(), SchedulerError> {
        self.authorize(subject, execution, Permission::InjectFault)?;
        self.faults.arm(execution, task);
        Ok(())
    }

    /// Armed and delivered faults. Read-only; arm through [`arm_fault`](Self::arm_fault).
    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    /// Drop a terminal execution from memory and release its channels.
    /// The persisted record is kept.
    pub async fn reclaim(&self, subject: &Subject, execution: &str) -> std::result::Result<(), SchedulerError> {
        self.authorize(subject, execution, Permission::CancelExecution)?;
        let execution = execution.to_string();
        self.call(|reply| Request::Reclaim { execution, reply }).await?
    }

    pub fn slot_status(&self, subject: &Subject, slot: &str) -> std::result::Result<SlotStatus, ChannelError> {
        self.channels.slot_status(subject, slot)
    }

    pub fn list_bound_endpoints(
        &self,
        subject: &Subject,
        channel: &str,
    ) -> std::result::Result<Vec<Endpoint>, ChannelError> {
        self.channels.bound_endpoints(subject, channel)
    }

    pub fn channel_states(
        &self,
        subject: &Subject,
        execution: &str,
    ) -> std::result::Result<BTreeMap<ChannelId, ChannelState>, ChannelError> {
        self.channels.channel_states(subject, execution)
    }

    /// The channel registry shared with the runtime.
    pub fn channels(&self) -> &ChannelManager {
        &self.channels
    }

    /// Stop the runtime loop. In-flight workers are aborted; persisted
    /// records stay as they are and can be recovered later.
    pub async fn shutdown(self) -> Result<()> {
        if self.tx.send(Inbound::Event(RuntimeEvent::ShutdownRequested)).await.is_err() {
            warn!("runtime already stopped");
        }
        match self.handle.await {
            Ok(result) => result,
            Err(err) => Err(anyhow::Error::new(err).context("runtime task panicked").into()),
        }
    }
}
