// src/engine/event_handlers.rs

//! Event handling logic for the core runtime.
//!
//! Every handler follows the same shape: ask the execution's scheduler for
//! a [`SchedulerStep`], then [`apply_step`] turns it into channel operations
//! and [`CoreCommand`]s for the IO shell.

use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::channel::{ChannelManager, Role, SlotState};
use crate::dag::{AllocationDecision, RunState, ScheduledTask, SchedulerStep, TaskInfo};
use crate::engine::core::ExecutionState;
use crate::engine::{ExecutionSnapshot, RuntimeOptions, TaskOutcome};
use crate::errors::{AllocatorError, ChannelError};
use crate::exec::{ProvisioningSpec, WorkerContext, WorkerHandle};
use crate::store::ExecutionRecord;
use crate::types::{ExecutionId, Subject, TaskId, slot_uri};

/// Command produced by the pure core, to be executed by the outer IO shell.
#[derive(Debug, Clone)]
pub enum CoreCommand {
    /// Ask the allocator for a worker.
    Allocate {
        execution: ExecutionId,
        task: TaskId,
        attempt: u32,
        spec: ProvisioningSpec,
    },
    /// Run an attempt on an allocated worker.
    Dispatch { worker: WorkerHandle, ctx: WorkerContext },
    /// Return a worker that will not be used.
    Release(WorkerHandle),
    /// Emit `RetryDue` after `delay`.
    ScheduleRetry {
        execution: ExecutionId,
        task: TaskId,
        delay: Duration,
    },
    /// Signal a running attempt to stop; emit `StopTimedOut` after `timeout`.
    StopTask {
        execution: ExecutionId,
        task: TaskId,
        attempt: u32,
        timeout: Duration,
    },
    /// Abandon an attempt whose worker ignored the stop signal.
    AbortTask {
        execution: ExecutionId,
        task: TaskId,
        attempt: u32,
        reason: String,
    },
    Persist(Box<ExecutionRecord>),
    /// The execution reached a terminal state.
    Finished(ExecutionSnapshot),
}

/// Decision returned by the core after handling a single event.
#[derive(Debug, Clone)]
pub struct CoreStep {
    /// Commands the IO shell should execute, in order.
    pub commands: Vec<CoreCommand>,
    /// Whether the outer runtime loop should keep running.
    pub keep_running: bool,
}

/// Shared, read-only collaborators of the handlers.
#[derive(Debug, Clone, Copy)]
pub struct CoreContext<'a> {
    pub channels: &'a ChannelManager,
    pub subject: &'a Subject,
    pub options: &'a RuntimeOptions,
}

/// Whether every input slot of `info` is open, or suspended waiting for a
/// retried attempt to resume it.
fn inputs_open(cx: CoreContext<'_>, execution: &str, info: &TaskInfo) -> bool {
    info.spec.inputs.iter().all(|input| {
        let slot = slot_uri(execution, &info.id, &input.name);
        cx.channels
            .slot_status(cx.subject, &slot)
            .is_ok_and(|s| matches!(s.state, SlotState::Open | SlotState::Suspended))
    })
}

/// Turn a scheduler step into channel operations and commands, then fill
/// free parallelism slots.
pub fn apply_step(state: &mut ExecutionState, cx: CoreContext<'_>, step: SchedulerStep, commands: &mut Vec<CoreCommand>) {
    let mut pending = step;

    // Completions and teardowns can cascade (a wiring failure aborts the
    // execution, which cancels more tasks), so drain until quiet.
    loop {
        for task in std::mem::take(&mut pending.newly_completed) {
            if let Err(err) = wire_completed(state, cx, &task) {
                error!(execution = %state.id, task = %task, error = %err, "channel wiring failed; aborting execution");
                pending.merge(abort(state, format!("channel wiring for '{task}' failed: {err}")));
            }
        }

        for task in std::mem::take(&mut pending.newly_failed)
            .into_iter()
            .chain(std::mem::take(&mut pending.newly_cancelled))
        {
            tear_down(state, cx, &task);
        }

        for retry in std::mem::take(&mut pending.retries) {
            suspend_for_retry(state, cx, &retry.task);
            commands.push(CoreCommand::ScheduleRetry {
                execution: state.id.clone(),
                task: retry.task,
                delay: retry.delay,
            });
        }

        for (task, attempt) in std::mem::take(&mut pending.stopping) {
            info!(execution = %state.id, task = %task, attempt, "stopping running task");
            commands.push(CoreCommand::StopTask {
                execution: state.id.clone(),
                task,
                attempt,
                timeout: cx.options.cancel_timeout,
            });
        }

        for scheduled in std::mem::take(&mut pending.newly_scheduled) {
            commands.push(allocate(scheduled));
        }

        if state.error.is_none() && !state.cancel_requested {
            let execution = state.id.clone();
            let ready = state.scheduler.step_ready(|info| inputs_open(cx, &execution, info));
            pending.merge(ready);
        }

        if pending.newly_completed.is_empty()
            && pending.newly_failed.is_empty()
            && pending.newly_cancelled.is_empty()
            && pending.retries.is_empty()
            && pending.stopping.is_empty()
            && pending.newly_scheduled.is_empty()
        {
            break;
        }
    }
}

fn allocate(scheduled: ScheduledTask) -> CoreCommand {
    CoreCommand::Allocate {
        execution: scheduled.execution,
        task: scheduled.task,
        attempt: scheduled.attempt,
        spec: scheduled.spec.exec.provisioning,
    }
}

/// Record the final status (once) and persist.
pub fn finish_step(state: &mut ExecutionState, channels: &ChannelManager, commands: &mut Vec<CoreCommand>) {
    let finished = !state.status.is_terminal() && state.scheduler.is_finished();
    if finished {
        state.status = state.final_status();
        info!(execution = %state.id, status = ?state.status, error = ?state.error, "execution finished");
    }
    commands.push(CoreCommand::Persist(Box::new(state.record(channels))));
    if finished {
        commands.push(CoreCommand::Finished(state.snapshot()));
    }
}

/// Abort the whole execution with a fatal error. Idempotent.
fn abort(state: &mut ExecutionState, reason: String) -> SchedulerStep {
    if state.error.is_some() {
        return SchedulerStep::default();
    }
    error!(execution = %state.id, error = %reason, "aborting execution");
    state.error = Some(reason);
    state.scheduler.cancel_all()
}

/// A producer finished: open every downstream consumer, then release the
/// producer and the task's own inputs.
fn wire_completed(state: &ExecutionState, cx: CoreContext<'_>, task: &str) -> Result<(), ChannelError> {
    for slot in state.output_slots(task) {
        let Some(wiring) = state.wiring.outputs.get(&slot) else {
            continue;
        };
        for consumer in &wiring.consumers {
            // Consumers cancelled by another failed producer were withdrawn.
            if cx.channels.slot_status(cx.subject, consumer)?.state == SlotState::Closed {
                continue;
            }
            let outcome = cx.channels.bind(cx.subject, &wiring.channel, consumer, Role::Consumer)?;
            debug!(execution = %state.id, channel = %wiring.channel, slot = %consumer, ?outcome, "consumer bound");
        }
        cx.channels.unbind(cx.subject, &wiring.channel, &slot)?;
    }

    for slot in state.input_slots(task) {
        if let Some(channel) = state.wiring.inputs.get(&slot) {
            cx.channels.unbind(cx.subject, channel, &slot)?;
        }
    }
    Ok(())
}

/// A task failed for good or was cancelled: force-close its output channels
/// and withdraw its inputs. Errors are logged; teardown is best effort.
fn tear_down(state: &ExecutionState, cx: CoreContext<'_>, task: &str) {
    for slot in state.output_slots(task) {
        if let Some(wiring) = state.wiring.outputs.get(&slot) {
            if let Err(err) = cx.channels.close(cx.subject, &wiring.channel) {
                warn!(execution = %state.id, task, channel = %wiring.channel, error = %err, "failed to close output channel");
            }
        }
    }

    for slot in state.input_slots(task) {
        if let Some(channel) = state.wiring.inputs.get(&slot) {
            if let Err(err) = cx.channels.unbind(cx.subject, channel, &slot) {
                warn!(execution = %state.id, task, slot = %slot, error = %err, "failed to release input slot");
            }
        }
    }
    debug!(execution = %state.id, task, "task channels torn down");
}

/// Park the task's open slots while it waits for its next attempt and drop
/// whatever the failed attempt produced.
fn suspend_for_retry(state: &ExecutionState, cx: CoreContext<'_>, task: &str) {
    let outputs = state.output_slots(task);
    for slot in state.input_slots(task).iter().chain(&outputs) {
        let open = cx
            .channels
            .slot_status(cx.subject, slot)
            .is_ok_and(|s| s.state == SlotState::Open);
        if open {
            if let Err(err) = cx.channels.suspend(cx.subject, slot) {
                warn!(execution = %state.id, task, slot = %slot, error = %err, "failed to suspend slot");
            }
        }
    }
    for slot in &outputs {
        if let Err(err) = cx.channels.reset_producer(cx.subject, slot) {
            warn!(execution = %state.id, task, slot = %slot, error = %err, "failed to reset producer output");
        }
    }
}

/// Bind or resume the task's slots for a fresh attempt.
fn prepare_slots(state: &ExecutionState, cx: CoreContext<'_>, task: &str) -> Result<(), ChannelError> {
    for slot in state.output_slots(task) {
        let Some(wiring) = state.wiring.outputs.get(&slot) else {
            continue;
        };
        match cx.channels.slot_status(cx.subject, &slot)?.state {
            SlotState::Suspended => cx.channels.resume(cx.subject, &slot)?,
            _ => {
                cx.channels.bind(cx.subject, &wiring.channel, &slot, Role::Producer)?;
            }
        }
        cx.channels.reset_producer(cx.subject, &slot)?;
    }

    for slot in state.input_slots(task) {
        if cx.channels.slot_status(cx.subject, &slot)?.state == SlotState::Suspended {
            cx.channels.resume(cx.subject, &slot)?;
        }
    }
    Ok(())
}

/// The allocator produced a worker.
pub fn handle_allocated(
    state: &mut ExecutionState,
    cx: CoreContext<'_>,
    task: &str,
    attempt: u32,
    worker: WorkerHandle,
    commands: &mut Vec<CoreCommand>,
) {
    if state.scheduler.run_state_of(task) != Some(RunState::Allocating) || !state.scheduler.is_current(task, attempt) {
        debug!(execution = %state.id, task, attempt, worker = %worker.id, "allocation no longer needed; releasing worker");
        commands.push(CoreCommand::Release(worker));
        return;
    }

    if let Err(err) = prepare_slots(state, cx, task) {
        warn!(execution = %state.id, task, attempt, error = %err, "could not prepare slots; failing attempt");
        commands.push(CoreCommand::Release(worker));
        state.scheduler.mark_running(task, attempt);
        let step = state
            .scheduler
            .step_completion(task, attempt, TaskOutcome::Crashed(err.to_string()));
        apply_step(state, cx, step, commands);
        return;
    }

    if !state.scheduler.mark_running(task, attempt) {
        commands.push(CoreCommand::Release(worker));
        return;
    }

    let Some(spec) = state.graph.task(task) else {
        commands.push(CoreCommand::Release(worker));
        return;
    };
    let ctx = WorkerContext {
        execution: state.id.clone(),
        task: task.to_string(),
        attempt,
        cmd: spec.exec.cmd.clone(),
        env: spec.exec.provisioning.env.clone(),
        inputs: state.input_slots(task),
        outputs: state.output_slots(task),
        channels: cx.channels.clone(),
        subject: cx.subject.clone(),
    };
    info!(execution = %state.id, task, attempt, worker = %worker.id, "dispatching task");
    commands.push(CoreCommand::Dispatch { worker, ctx });
}

/// The allocator refused.
pub fn handle_allocation_failed(
    state: &mut ExecutionState,
    cx: CoreContext<'_>,
    task: &str,
    attempt: u32,
    error: &AllocatorError,
    commands: &mut Vec<CoreCommand>,
) {
    match state.scheduler.allocation_failed(task, attempt, error) {
        AllocationDecision::Ignored => {
            debug!(execution = %state.id, task, attempt, "ignoring stale allocation failure");
        }
        AllocationDecision::Retry(delay) => {
            commands.push(CoreCommand::ScheduleRetry {
                execution: state.id.clone(),
                task: task.to_string(),
                delay,
            });
        }
        AllocationDecision::Failed(step) => apply_step(state, cx, step, commands),
        AllocationDecision::Fatal(reason) => {
            let step = abort(state, format!("fatal configuration error for task '{task}': {reason}"));
            apply_step(state, cx, step, commands);
        }
    }
}

/// A worker reported the end of an attempt.
pub fn handle_task_finished(
    state: &mut ExecutionState,
    cx: CoreContext<'_>,
    task: &str,
    attempt: u32,
    outcome: TaskOutcome,
    commands: &mut Vec<CoreCommand>,
) {
    let step = state.scheduler.step_completion(task, attempt, outcome);
    apply_step(state, cx, step, commands);
}

pub fn handle_retry_due(state: &mut ExecutionState, cx: CoreContext<'_>, task: &str, commands: &mut Vec<CoreCommand>) {
    if state.scheduler.retry_due(task) {
        apply_step(state, cx, SchedulerStep::default(), commands);
    }
}

pub fn handle_stop_timeout(
    state: &mut ExecutionState,
    cx: CoreContext<'_>,
    task: &str,
    attempt: u32,
    commands: &mut Vec<CoreCommand>,
) {
    let step = state.scheduler.stop_timed_out(task, attempt);
    if step.newly_cancelled.iter().any(|t| t == task) {
        commands.push(CoreCommand::AbortTask {
            execution: state.id.clone(),
            task: task.to_string(),
            attempt,
            reason: "stop not acknowledged in time".to_string(),
        });
    }
    apply_step(state, cx, step, commands);
}
