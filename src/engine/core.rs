// src/engine/core.rs

//! Pure core runtime state machine.
//!
//! This module contains a synchronous, deterministic "core runtime" that
//! consumes [`RuntimeEvent`]s and requests and produces:
//! - updated scheduler and channel state
//! - a list of commands describing what the IO shell should do next
//!
//! The async/IO-heavy shell (`engine::runtime::Runtime`) is responsible for:
//! - talking to the allocator and the workers
//! - timers for retries and stop timeouts
//! - persisting records and answering waiters
//!
//! Channel operations are synchronous and go straight to the
//! [`ChannelManager`], so the core can be unit tested without Tokio,
//! processes or a real allocator.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::channel::{ChannelManager, ChannelRequest, ChannelSpec, Slot, SlotDirection};
use crate::dag::{Graph, Scheduler, TaskStatus, validate_graph};
use crate::engine::event_handlers::{
    CoreCommand, CoreContext, CoreStep, apply_step, finish_step, handle_allocated,
    handle_allocation_failed, handle_retry_due, handle_stop_timeout, handle_task_finished,
};
use crate::engine::{ExecutionSnapshot, ExecutionStatus, RuntimeEvent, RuntimeOptions, TaskSnapshot};
use crate::errors::{SchedulerError, SchedulerErrorKind};
use crate::store::ExecutionRecord;
use crate::types::{ChannelId, ExecutionId, SlotId, Subject, slot_uri, snapshot_uri};

/// Channel feeding out of one output slot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputWiring {
    pub channel: ChannelId,
    /// Input slots reading from this output.
    pub consumers: Vec<SlotId>,
}

/// Which channel each slot of an execution belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wiring {
    pub outputs: BTreeMap<SlotId, OutputWiring>,
    pub inputs: BTreeMap<SlotId, ChannelId>,
}

/// Everything the core tracks for one execution.
#[derive(Debug)]
pub struct ExecutionState {
    pub id: ExecutionId,
    pub graph: Graph,
    pub scheduler: Scheduler,
    pub wiring: Wiring,
    pub status: ExecutionStatus,
    pub error: Option<String>,
    pub cancel_requested: bool,
}

impl ExecutionState {
    /// Output slot ids of `task`, in declaration order.
    pub fn output_slots(&self, task: &str) -> Vec<SlotId> {
        self.graph
            .task(task)
            .map(|t| t.outputs.iter().map(|o| slot_uri(&self.id, task, &o.name)).collect())
            .unwrap_or_default()
    }

    /// Input slot ids of `task`, in declaration order.
    pub fn input_slots(&self, task: &str) -> Vec<SlotId> {
        self.graph
            .task(task)
            .map(|t| t.inputs.iter().map(|i| slot_uri(&self.id, task, &i.name)).collect())
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> ExecutionSnapshot {
        ExecutionSnapshot {
            execution: self.id.clone(),
            status: self.status,
            error: self.error.clone(),
            tasks: self
                .scheduler
                .statuses()
                .into_iter()
                .map(|(task, (status, attempts))| (task, TaskSnapshot { status, attempts }))
                .collect(),
        }
    }

    pub fn record(&self, channels: &ChannelManager) -> ExecutionRecord {
        ExecutionRecord {
            execution: self.id.clone(),
            graph: self.graph.clone(),
            parallelism: self.scheduler.parallelism(),
            tasks: self.scheduler.records(),
            channels: channels.export_execution(&self.id),
            wiring: self.wiring.clone(),
            status: self.status,
            error: self.error.clone(),
            cancel_requested: self.cancel_requested,
        }
    }

    /// Final status once every task is terminal.
    ///
    /// A fatal error wins, then an explicit cancel, then any task that did
    /// not complete.
    pub fn final_status(&self) -> ExecutionStatus {
        if self.error.is_some() {
            return ExecutionStatus::Failed;
        }
        if self.cancel_requested {
            return ExecutionStatus::Cancelled;
        }
        let all_completed = self
            .scheduler
            .statuses()
            .values()
            .all(|(status, _)| *status == TaskStatus::Completed);
        if all_completed {
            ExecutionStatus::Completed
        } else {
            ExecutionStatus::Failed
        }
    }
}

/// Pure core runtime state.
///
/// This owns:
/// - every live execution and its scheduler
/// - a handle to the channel registry
/// - runtime options
///
/// It has **no** Tokio types and performs no IO besides channel-manager
/// calls, which are synchronous and in-memory (snapshot commits excepted).
#[derive(Debug)]
pub struct CoreRuntime {
    channels: ChannelManager,
    executions: BTreeMap<ExecutionId, ExecutionState>,
    options: RuntimeOptions,
    subject: Subject,
}

impl CoreRuntime {
    pub fn new(channels: ChannelManager, options: RuntimeOptions) -> Self {
        Self {
            channels,
            executions: BTreeMap::new(),
            options,
            subject: Subject::system(),
        }
    }

    pub fn channels(&self) -> &ChannelManager {
        &self.channels
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.options
    }

    pub fn execution(&self, id: &str) -> Option<&ExecutionState> {
        self.executions.get(id)
    }

    pub fn snapshot(&self, id: &str) -> Result<ExecutionSnapshot, SchedulerError> {
        self.executions
            .get(id)
            .map(ExecutionState::snapshot)
            .ok_or_else(|| SchedulerError::not_found(id))
    }

    /// Snapshots of every known execution, sorted by id.
    pub fn snapshots(&self) -> Vec<ExecutionSnapshot> {
        self.executions.values().map(ExecutionState::snapshot).collect()
    }

    /// Register a graph under `id`: slots, channels and the initial ready set.
    ///
    /// On error nothing of the graph stays registered.
    pub fn submit(&mut self, id: ExecutionId, graph: Graph) -> Result<CoreStep, SchedulerError> {
        if self.executions.contains_key(&id) {
            return Err(SchedulerError::new(
                SchedulerErrorKind::Validation,
                format!("execution '{id}' already exists"),
            ));
        }
        validate_graph(&graph)?;

        let wiring = match self.register(&id, &graph) {
            Ok(wiring) => wiring,
            Err(err) => {
                self.channels.release_execution(&id);
                return Err(err);
            }
        };

        let scheduler = Scheduler::new(
            id.clone(),
            &graph,
            self.options.parallelism,
            self.options.retry,
            self.options.allocation_retry,
        );
        info!(execution = %id, graph = %graph.name, tasks = graph.tasks.len(), "execution submitted");

        let mut state = ExecutionState {
            id: id.clone(),
            graph,
            scheduler,
            wiring,
            status: ExecutionStatus::Running,
            error: None,
            cancel_requested: false,
        };

        let mut commands = Vec::new();
        apply_step(&mut state, self.context(), Default::default(), &mut commands);
        finish_step(&mut state, &self.channels, &mut commands);
        self.executions.insert(id, state);

        Ok(CoreStep {
            commands,
            keep_running: true,
        })
    }

    fn context(&self) -> CoreContext<'_> {
        CoreContext {
            channels: &self.channels,
            subject: &self.subject,
            options: &self.options,
        }
    }

    /// Register every slot and one channel per output slot.
    fn register(&self, id: &str, graph: &Graph) -> Result<Wiring, SchedulerError> {
        let mut wiring = Wiring::default();

        for task in &graph.tasks {
            for input in &task.inputs {
                let slot = Slot::new(
                    slot_uri(id, &task.id, &input.name),
                    input.name.clone(),
                    id,
                    task.id.clone(),
                    SlotDirection::Input,
                    input.schema.clone(),
                );
                self.channels.register_slot(&self.subject, slot)?;
            }
            for output in &task.outputs {
                let slot = Slot::new(
                    slot_uri(id, &task.id, &output.name),
                    output.name.clone(),
                    id,
                    task.id.clone(),
                    SlotDirection::Output,
                    output.schema.clone(),
                );
                self.channels.register_slot(&self.subject, slot)?;
            }
        }

        for task in &graph.tasks {
            for output in &task.outputs {
                let producer = slot_uri(id, &task.id, &output.name);
                let consumers: Vec<SlotId> = graph
                    .tasks
                    .iter()
                    .flat_map(|t| {
                        t.inputs
                            .iter()
                            .filter(|i| i.from.task == task.id && i.from.slot == output.name)
                            .map(move |i| slot_uri(id, &t.id, &i.name))
                    })
                    .collect();

                let spec = if output.snapshot {
                    ChannelSpec::snapshot(output.schema.clone(), snapshot_uri(id, &task.id, &output.name))
                } else {
                    ChannelSpec::direct(output.schema.clone())
                };
                let request = consumers
                    .iter()
                    .fold(ChannelRequest::new(id, spec).producer(producer.clone()), |req, c| {
                        req.consumer(c.clone())
                    });
                let channel = self.channels.create_channel(&self.subject, request)?;

                for consumer in &consumers {
                    wiring.inputs.insert(consumer.clone(), channel.clone());
                }
                wiring.outputs.insert(producer, OutputWiring { channel, consumers });
            }
        }

        Ok(wiring)
    }

    /// Cancel every non-terminal task of an execution.
    pub fn cancel(&mut self, id: &str) -> Result<CoreStep, SchedulerError> {
        let cx = CoreContext {
            channels: &self.channels,
            subject: &self.subject,
            options: &self.options,
        };
        let state = self
            .executions
            .get_mut(id)
            .ok_or_else(|| SchedulerError::not_found(id))?;

        let mut commands = Vec::new();
        if !state.status.is_terminal() && !state.cancel_requested {
            state.cancel_requested = true;
            let step = state.scheduler.cancel_all();
            apply_step(state, cx, step, &mut commands);
            finish_step(state, cx.channels, &mut commands);
        }
        Ok(CoreStep {
            commands,
            keep_running: true,
        })
    }

    /// Rebuild an execution from its persisted record and resume it.
    ///
    /// Completed tasks are never re-run and closed channels stay closed;
    /// tasks that were in flight are handled as crashed.
    pub fn recover(&mut self, record: ExecutionRecord) -> CoreStep {
        let id = record.execution.clone();
        self.channels.restore(record.channels);

        let mut scheduler = Scheduler::new(
            id.clone(),
            &record.graph,
            record.parallelism,
            self.options.retry,
            self.options.allocation_retry,
        );
        scheduler.apply_records(&record.tasks);

        let mut state = ExecutionState {
            id: id.clone(),
            graph: record.graph,
            scheduler,
            wiring: record.wiring,
            status: record.status,
            error: record.error,
            cancel_requested: record.cancel_requested,
        };

        let mut commands = Vec::new();
        if !state.status.is_terminal() {
            info!(execution = %id, "recovering execution");
            let step = state.scheduler.recover();
            apply_step(&mut state, self.context(), step, &mut commands);
            finish_step(&mut state, &self.channels, &mut commands);
        }
        self.executions.insert(id, state);

        CoreStep {
            commands,
            keep_running: true,
        }
    }

    /// Drop a terminal execution and its channel tombstones.
    pub fn reclaim(&mut self, id: &str) -> Result<(), SchedulerError> {
        let state = self.executions.get(id).ok_or_else(|| SchedulerError::not_found(id))?;
        if !state.status.is_terminal() {
            return Err(SchedulerError::new(
                SchedulerErrorKind::ChannelState,
                format!("execution '{id}' is still running"),
            ));
        }
        self.executions.remove(id);
        self.channels.release_execution(id);
        info!(execution = %id, "execution reclaimed");
        Ok(())
    }

    /// Handle a single runtime event, updating core state and returning the
    /// resulting commands for the IO shell.
    pub fn step(&mut self, event: RuntimeEvent) -> CoreStep {
        let mut commands = Vec::new();

        let execution = match &event {
            RuntimeEvent::ShutdownRequested => {
                return CoreStep {
                    commands,
                    keep_running: false,
                };
            }
            RuntimeEvent::Allocated { execution, .. }
            | RuntimeEvent::AllocationFailed { execution, .. }
            | RuntimeEvent::TaskFinished { execution, .. }
            | RuntimeEvent::RetryDue { execution, .. }
            | RuntimeEvent::StopTimedOut { execution, .. } => execution.clone(),
        };

        let Some(state) = self.executions.get_mut(&execution) else {
            error!(execution = %execution, ?event, "event for unknown execution; ignoring");
            if let RuntimeEvent::Allocated { worker, .. } = event {
                commands.push(CoreCommand::Release(worker));
            }
            return CoreStep {
                commands,
                keep_running: true,
            };
        };

        let cx = CoreContext {
            channels: &self.channels,
            subject: &self.subject,
            options: &self.options,
        };
        match event {
            RuntimeEvent::Allocated {
                task, attempt, worker, ..
            } => handle_allocated(state, cx, &task, attempt, worker, &mut commands),
            RuntimeEvent::AllocationFailed {
                task, attempt, error, ..
            } => handle_allocation_failed(state, cx, &task, attempt, &error, &mut commands),
            RuntimeEvent::TaskFinished {
                task, attempt, outcome, ..
            } => handle_task_finished(state, cx, &task, attempt, outcome, &mut commands),
            RuntimeEvent::RetryDue { task, .. } => handle_retry_due(state, cx, &task, &mut commands),
            RuntimeEvent::StopTimedOut { task, attempt, .. } => {
                handle_stop_timeout(state, cx, &task, attempt, &mut commands)
            }
            RuntimeEvent::ShutdownRequested => {}
        }
        finish_step(state, cx.channels, &mut commands);

        CoreStep {
            commands,
            keep_running: true,
        }
    }
}
