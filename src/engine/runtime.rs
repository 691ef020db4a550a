// src/engine/runtime.rs

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::dag::Graph;
use crate::engine::fault::{FaultInjector, INJECTED_FAULT};
use crate::engine::{ExecutionSnapshot, RuntimeEvent, TaskOutcome};
use crate::errors::{Result, SchedulerError, SchedulerErrorKind};
use crate::exec::{Allocator, ProvisioningSpec, WorkerContext, WorkerHandle};
use crate::store::StateStore;
use crate::types::{ExecutionId, TaskId};

use super::core::CoreRuntime;
use super::CoreCommand;

type Reply<T> = oneshot::Sender<std::result::Result<T, SchedulerError>>;

/// Calls from [`GraphScheduler`](crate::service::GraphScheduler) into the
/// runtime loop, each with its own reply channel.
#[derive(Debug)]
pub enum Request {
    Submit {
        execution: ExecutionId,
        graph: Graph,
        reply: Reply<ExecutionId>,
    },
    Status {
        execution: ExecutionId,
        reply: Reply<ExecutionSnapshot>,
    },
    Cancel {
        execution: ExecutionId,
        reply: Reply<()>,
    },
    /// Resolve once the execution is terminal.
    Wait {
        execution: ExecutionId,
        reply: Reply<ExecutionSnapshot>,
    },
    /// Abort the in-flight attempt of `task`.
    InjectFault {
        execution: ExecutionId,
        task: TaskId,
        reply: Reply<()>,
    },
    Reclaim {
        execution: ExecutionId,
        reply: Reply<()>,
    },
    List {
        reply: oneshot::Sender<Vec<ExecutionSnapshot>>,
    },
}

/// Everything the runtime loop receives.
#[derive(Debug)]
pub enum Inbound {
    Event(RuntimeEvent),
    Request(Request),
}

/// Internal handle for a dispatched attempt.
///
/// - `stop` asks the worker to stop cooperatively (cancellation).
/// - `abort` drops the worker future and reports a crash (fault injection,
///   stop timeout).
/// - `handle` is the Tokio task driving the worker.
struct ActiveTask {
    attempt: u32,
    stop: Option<oneshot::Sender<()>>,
    abort: Option<oneshot::Sender<String>>,
    handle: JoinHandle<()>,
}

/// Drives the [`CoreRuntime`] in response to events and requests, and
/// performs the IO its commands ask for.
pub struct Runtime {
    core: CoreRuntime,
    rx: mpsc::Receiver<Inbound>,
    tx: mpsc::Sender<Inbound>,
    allocator: Arc<dyn Allocator>,
    store: Arc<dyn StateStore>,
    faults: FaultInjector,
    active: HashMap<(ExecutionId, TaskId), ActiveTask>,
    waiters: HashMap<ExecutionId, Vec<Reply<ExecutionSnapshot>>>,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("core", &self.core)
            .field("active", &self.active.len())
            .finish_non_exhaustive()
    }
}

impl Runtime {
    pub fn new(
        core: CoreRuntime,
        rx: mpsc::Receiver<Inbound>,
        tx: mpsc::Sender<Inbound>,
        allocator: Arc<dyn Allocator>,
        store: Arc<dyn StateStore>,
        faults: FaultInjector,
    ) -> Self {
        Self {
            core,
            rx,
            tx,
            allocator,
            store,
            faults,
            active: HashMap::new(),
            waiters: HashMap::new(),
        }
    }

    /// Resume every persisted execution. Returns how many were loaded.
    pub async fn recover(&mut self) -> Result<usize> {
        let records = self.store.load_all()?;
        let count = records.len();
        for record in records {
            let step = self.core.recover(record);
            for command in step.commands {
                self.execute_command(command);
            }
        }
        if count > 0 {
            info!(executions = count, "recovered persisted executions");
        }
        Ok(count)
    }

    /// Main event loop.
    ///
    /// - Consumes events and requests from `rx`.
    /// - Feeds them into the core runtime.
    /// - Executes commands returned by the core (allocate, dispatch, timers, persist).
    pub async fn run(mut self) -> Result<()> {
        info!("dagwire runtime started");

        while let Some(inbound) = self.rx.recv().await {
            match inbound {
                Inbound::Event(event) => {
                    debug!(?event, "runtime received event");
                    if let RuntimeEvent::TaskFinished {
                        execution,
                        task,
                        attempt,
                        ..
                    } = &event
                    {
                        let key = (execution.clone(), task.clone());
                        if self.active.get(&key).is_some_and(|a| a.attempt == *attempt) {
                            self.active.remove(&key);
                        }
                    }

                    let step = self.core.step(event);
                    for command in step.commands {
                        self.execute_command(command);
                    }
                    if !step.keep_running {
                        info!("core requested exit; stopping runtime");
                        break;
                    }
                }
                Inbound::Request(request) => self.handle_request(request),
            }
        }

        for (_, task) in self.active.drain() {
            task.handle.abort();
        }
        info!("runtime exiting");
        Ok(())
    }

    fn handle_request(&mut self, request: Request) {
        match request {
            Request::Submit {
                execution,
                graph,
                reply,
            } => {
                let result = self.core.submit(execution.clone(), graph).map(|step| {
                    for command in step.commands {
                        self.execute_command(command);
                    }
                    execution
                });
                let _ = reply.send(result);
            }
            Request::Status { execution, reply } => {
                let _ = reply.send(self.core.snapshot(&execution));
            }
            Request::Cancel { execution, reply } => {
                let result = self.core.cancel(&execution).map(|step| {
                    for command in step.commands {
                        self.execute_command(command);
                    }
                });
                let _ = reply.send(result);
            }
            Request::Wait { execution, reply } => match self.core.snapshot(&execution) {
                Ok(snapshot) if snapshot.status.is_terminal() => {
                    let _ = reply.send(Ok(snapshot));
                }
                Ok(_) => self.waiters.entry(execution).or_default().push(reply),
                Err(err) => {
                    let _ = reply.send(Err(err));
                }
            },
            Request::InjectFault {
                execution,
                task,
                reply,
            } => {
                let _ = reply.send(self.inject_fault(&execution, &task));
            }
            Request::Reclaim { execution, reply } => {
                let result = self.core.reclaim(&execution);
                if result.is_ok() {
                    self.faults.forget(&execution);
                }
                let _ = reply.send(result);
            }
            Request::List { reply } => {
                let _ = reply.send(self.core.snapshots());
            }
        }
    }

    fn inject_fault(&mut self, execution: &str, task: &str) -> std::result::Result<(), SchedulerError> {
        let key = (execution.to_string(), task.to_string());
        let Some(active) = self.active.get_mut(&key) else {
            return Err(SchedulerError::new(
                SchedulerErrorKind::NotFound,
                format!("task '{task}' of '{execution}' is not in flight"),
            ));
        };
        let delivered = active
            .abort
            .take()
            .is_some_and(|abort| abort.send(INJECTED_FAULT.to_string()).is_ok());
        match delivered {
            true => {
                self.faults.record(execution, task, active.attempt);
                Ok(())
            }
            false => Err(SchedulerError::new(
                SchedulerErrorKind::NotFound,
                format!("task '{task}' of '{execution}' is already finishing"),
            )),
        }
    }

    /// Execute a single command from the core.
    fn execute_command(&mut self, command: CoreCommand) {
        match command {
            CoreCommand::Allocate {
                execution,
                task,
                attempt,
                spec,
            } => self.spawn_allocation(execution, task, attempt, spec),
            CoreCommand::Dispatch { worker, ctx } => self.spawn_worker(worker, ctx),
            CoreCommand::Release(worker) => {
                let allocator = Arc::clone(&self.allocator);
                tokio::spawn(async move { allocator.release(worker).await });
            }
            CoreCommand::ScheduleRetry {
                execution,
                task,
                delay,
            } => {
                debug!(execution = %execution, task = %task, ?delay, "retry scheduled");
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx
                        .send(Inbound::Event(RuntimeEvent::RetryDue { execution, task }))
                        .await;
                });
            }
            CoreCommand::StopTask {
                execution,
                task,
                attempt,
                timeout,
            } => {
                let key = (execution.clone(), task.clone());
                if let Some(active) = self.active.get_mut(&key).filter(|a| a.attempt == attempt) {
                    if let Some(stop) = active.stop.take() {
                        let _ = stop.send(());
                    }
                }
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(timeout).await;
                    let _ = tx
                        .send(Inbound::Event(RuntimeEvent::StopTimedOut {
                            execution,
                            task,
                            attempt,
                        }))
                        .await;
                });
            }
            CoreCommand::AbortTask {
                execution,
                task,
                attempt,
                reason,
            } => {
                let key = (execution, task);
                if let Some(active) = self.active.get_mut(&key).filter(|a| a.attempt == attempt) {
                    if let Some(abort) = active.abort.take() {
                        warn!(execution = %key.0, task = %key.1, attempt, %reason, "aborting attempt");
                        let _ = abort.send(reason);
                    }
                }
            }
            CoreCommand::Persist(record) => {
                if let Err(err) = self.store.save(&record) {
                    error!(execution = %record.execution, error = %format!("{err:#}"), "failed to persist execution record");
                }
            }
            CoreCommand::Finished(snapshot) => {
                for waiter in self.waiters.remove(&snapshot.execution).unwrap_or_default() {
                    let _ = waiter.send(Ok(snapshot.clone()));
                }
            }
        }
    }

    fn spawn_allocation(&self, execution: ExecutionId, task: TaskId, attempt: u32, spec: ProvisioningSpec) {
        let allocator = Arc::clone(&self.allocator);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let event = match allocator.allocate(spec).await {
                Ok(worker) => RuntimeEvent::Allocated {
                    execution,
                    task,
                    attempt,
                    worker,
                },
                Err(error) => RuntimeEvent::AllocationFailed {
                    execution,
                    task,
                    attempt,
                    error,
                },
            };
            if let Err(mpsc::error::SendError(Inbound::Event(RuntimeEvent::Allocated { worker, .. }))) =
                tx.send(Inbound::Event(event)).await
            {
                allocator.release(worker).await;
            }
        });
    }

    fn spawn_worker(&mut self, worker: WorkerHandle, ctx: WorkerContext) {
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let (abort_tx, abort_rx) = oneshot::channel::<String>();
        let execution = ctx.execution.clone();
        let task = ctx.task.clone();
        let attempt = ctx.attempt;

        let allocator = Arc::clone(&self.allocator);
        let tx = self.tx.clone();
        let (exec_id, task_id) = (execution.clone(), task.clone());
        let handle = tokio::spawn(async move {
            let outcome = tokio::select! {
                outcome = worker.worker.execute(ctx, stop_rx) => outcome,
                Ok(reason) = abort_rx => TaskOutcome::Crashed(reason),
            };
            debug!(execution = %exec_id, task = %task_id, attempt, ?outcome, "worker finished");
            allocator.release(worker).await;
            let _ = tx
                .send(Inbound::Event(RuntimeEvent::TaskFinished {
                    execution: exec_id,
                    task: task_id,
                    attempt,
                    outcome,
                }))
                .await;
        });

        let mut abort = Some(abort_tx);
        if self.faults.take_armed(&execution, &task) {
            if let Some(abort) = abort.take() {
                let _ = abort.send(INJECTED_FAULT.to_string());
                self.faults.record(&execution, &task, attempt);
            }
        }

        self.active.insert(
            (execution, task),
            ActiveTask {
                attempt,
                stop: Some(stop_tx),
                abort,
                handle,
            },
        );
    }
}
