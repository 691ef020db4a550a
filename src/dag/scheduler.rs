// src/dag/scheduler.rs

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::dag::graph::{DagGraph, Graph};
use crate::dag::scheduler_step::{RetryRequest, SchedulerStep};
use crate::dag::state_manager::{ReadOnlyStateManager, StateManager};
use crate::dag::task_info::{RunState, TaskInfo, TaskRecord, TaskStatus};
use crate::engine::TaskOutcome;
use crate::errors::AllocatorError;
use crate::policy::RetryPolicy;
use crate::types::{ExecutionId, TaskId};

/// What the scheduler decided about a failed allocation.
#[derive(Debug, Clone, PartialEq)]
pub enum AllocationDecision {
    /// Stale answer for an attempt we no longer care about.
    Ignored,
    /// Back off and ask again.
    Retry(Duration),
    /// Allocation budget exhausted; the task failed.
    Failed(SchedulerStep),
    /// The allocator rejected the provisioning spec. Not retried.
    Fatal(String),
}

/// Per-execution scheduling state machine.
///
/// Pure: it performs no IO and knows nothing about channels. Callers pass
/// an input-readiness predicate and turn the returned [`SchedulerStep`]s
/// into channel operations and commands.
///
/// Responsibilities:
/// - tracking each task's run state and attempt count
/// - deciding which tasks are ready (dependencies COMPLETED, inputs open)
/// - bounding the number of tasks in flight
/// - applying the retry policy to failed attempts
/// - cancelling dependents of tasks that failed for good
#[derive(Debug)]
pub struct Scheduler {
    execution: ExecutionId,
    graph: DagGraph,
    tasks: HashMap<TaskId, TaskInfo>,
    parallelism: usize,
    retry: RetryPolicy,
    allocation_retry: RetryPolicy,
}

impl Scheduler {
    /// Construct a scheduler for a validated [`Graph`].
    pub fn new(
        execution: impl Into<ExecutionId>,
        graph: &Graph,
        parallelism: usize,
        retry: RetryPolicy,
        allocation_retry: RetryPolicy,
    ) -> Self {
        let dag = DagGraph::from_graph(graph);
        let tasks = graph
            .tasks
            .iter()
            .map(|spec| {
                let deps = dag.dependencies_of(&spec.id).to_vec();
                (spec.id.clone(), TaskInfo::new(spec.clone(), deps))
            })
            .collect();

        Self {
            execution: execution.into(),
            graph: dag,
            tasks,
            parallelism: parallelism.max(1),
            retry,
            allocation_retry,
        }
    }

    pub fn execution(&self) -> &str {
        &self.execution
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    pub fn graph(&self) -> &DagGraph {
        &self.graph
    }

    pub fn task(&self, task: &str) -> Option<&TaskInfo> {
        self.tasks.get(task)
    }

    pub fn run_state_of(&self, task: &str) -> Option<RunState> {
        self.tasks.get(task).map(|i| i.run_state)
    }

    pub fn status_of(&self, task: &str) -> Option<TaskStatus> {
        self.run_state_of(task).map(TaskStatus::from)
    }

    /// Whether every dependency of `task` has completed. `None` if unknown.
    pub fn deps_satisfied(&self, task: &str) -> Option<bool> {
        let info = self.tasks.get(task)?;
        Some(ReadOnlyStateManager::new(&self.tasks).deps_satisfied_for_info(info))
    }

    pub fn is_finished(&self) -> bool {
        self.tasks.values().all(|i| i.run_state.is_terminal())
    }

    /// Public status of every task, keyed by id.
    pub fn statuses(&self) -> BTreeMap<TaskId, (TaskStatus, u32)> {
        self.tasks
            .values()
            .map(|i| (i.id.clone(), (i.run_state.into(), i.attempts)))
            .collect()
    }

    pub fn records(&self) -> Vec<TaskRecord> {
        let mut records: Vec<_> = self.tasks.values().map(TaskInfo::record).collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    /// Overwrite run state from persisted records. Unknown ids are ignored.
    pub fn apply_records(&mut self, records: &[TaskRecord]) {
        for record in records {
            match self.tasks.get_mut(&record.id) {
                Some(info) => info.apply_record(record),
                None => warn!(execution = %self.execution, task = %record.id, "record for unknown task; ignoring"),
            }
        }
    }

    /// Recompute readiness and dispatch up to the parallelism bound.
    pub fn step_ready<F>(&mut self, inputs_ready: F) -> SchedulerStep
    where
        F: Fn(&TaskInfo) -> bool,
    {
        let mut manager = StateManager::new(&self.graph, &mut self.tasks, &self.execution);
        manager.promote_ready(inputs_ready);
        let newly_scheduled = manager.dispatch_ready(self.parallelism);

        SchedulerStep {
            newly_scheduled,
            execution_finished: manager.all_tasks_terminal(),
            ..SchedulerStep::default()
        }
    }

    /// A worker was allocated for `attempt`; the task is now running.
    ///
    /// Returns `false` for stale or unexpected allocations.
    pub fn mark_running(&mut self, task: &str, attempt: u32) -> bool {
        match self.tasks.get_mut(task) {
            Some(info) if info.run_state == RunState::Allocating && info.attempts == attempt => {
                info.run_state = RunState::Running;
                debug!(execution = %self.execution, task, attempt, "task running");
                true
            }
            _ => {
                debug!(execution = %self.execution, task, attempt, "ignoring stale allocation");
                false
            }
        }
    }

    /// Whether `attempt` is the one currently allocating or running.
    pub fn is_current(&self, task: &str, attempt: u32) -> bool {
        self.tasks
            .get(task)
            .is_some_and(|i| i.attempts == attempt && i.run_state.is_in_flight())
    }

    /// Handle a finished attempt.
    pub fn step_completion(&mut self, task: &str, attempt: u32, outcome: TaskOutcome) -> SchedulerStep {
        let mut step = SchedulerStep::default();

        let Some(info) = self.tasks.get_mut(task) else {
            warn!(execution = %self.execution, task, "completion for unknown task; ignoring");
            return step;
        };
        if info.attempts != attempt || !matches!(info.run_state, RunState::Running | RunState::Stopping) {
            warn!(
                execution = %self.execution,
                task,
                attempt,
                current = info.attempts,
                state = ?info.run_state,
                "ignoring completion from stale attempt"
            );
            return step;
        }

        if info.run_state == RunState::Stopping {
            // Any completion after a stop request acknowledges it.
            info.run_state = RunState::Cancelled;
            info!(execution = %self.execution, task, attempt, "task stopped and cancelled");
            step.newly_cancelled.push(task.to_string());
            step.execution_finished = self.is_finished();
            return step;
        }

        match outcome {
            TaskOutcome::Success => {
                info.run_state = RunState::Completed;
                info!(execution = %self.execution, task, attempt, "task completed");
                step.newly_completed.push(task.to_string());
            }
            TaskOutcome::Failed(reason) | TaskOutcome::Crashed(reason) => {
                self.fail_attempt(task, reason, &mut step);
            }
            TaskOutcome::Stopped => {
                self.fail_attempt(task, "worker stopped unexpectedly".to_string(), &mut step);
            }
        }

        step.execution_finished = self.is_finished();
        step
    }

    fn fail_attempt(&mut self, task: &str, reason: String, step: &mut SchedulerStep) {
        let Some(info) = self.tasks.get_mut(task) else {
            return;
        };
        info.failures += 1;
        info.last_error = Some(reason.clone());

        match self.retry.next_delay(info.failures) {
            Some(delay) => {
                info.run_state = RunState::RetryWaiting;
                warn!(
                    execution = %self.execution,
                    task,
                    attempt = info.attempts,
                    failures = info.failures,
                    ?delay,
                    error = %reason,
                    "task attempt failed; will retry"
                );
                step.retries.push(RetryRequest {
                    task: task.to_string(),
                    delay,
                });
            }
            None => {
                info.run_state = RunState::Failed;
                warn!(
                    execution = %self.execution,
                    task,
                    attempt = info.attempts,
                    error = %reason,
                    "task failed; retry budget exhausted, cancelling dependents"
                );
                step.newly_failed.push(task.to_string());
                let mut manager = StateManager::new(&self.graph, &mut self.tasks, &self.execution);
                step.newly_cancelled.extend(manager.cancel_dependents(task));
            }
        }
    }

    /// The allocator could not provide a worker for `attempt`.
    pub fn allocation_failed(&mut self, task: &str, attempt: u32, error: &AllocatorError) -> AllocationDecision {
        let Some(info) = self.tasks.get_mut(task) else {
            return AllocationDecision::Ignored;
        };
        if info.attempts != attempt || info.run_state != RunState::Allocating {
            return AllocationDecision::Ignored;
        }

        match error {
            AllocatorError::InvalidConfiguration(msg) => {
                info.last_error = Some(error.to_string());
                AllocationDecision::Fatal(msg.clone())
            }
            AllocatorError::ResourceUnavailable(msg) => {
                info.allocation_failures += 1;
                match self.allocation_retry.next_delay(info.allocation_failures) {
                    Some(delay) => {
                        info.run_state = RunState::AllocationBackoff;
                        warn!(
                            execution = %self.execution,
                            task,
                            attempt,
                            failures = info.allocation_failures,
                            ?delay,
                            error = %msg,
                            "no worker available; backing off"
                        );
                        AllocationDecision::Retry(delay)
                    }
                    None => {
                        // Not a task failure with its own retry budget: the
                        // resource budget is the limit.
                        info.run_state = RunState::Failed;
                        info.last_error = Some(error.to_string());
                        warn!(execution = %self.execution, task, error = %msg, "allocation retries exhausted; task failed");
                        let mut step = SchedulerStep {
                            newly_failed: vec![task.to_string()],
                            ..SchedulerStep::default()
                        };
                        let mut manager = StateManager::new(&self.graph, &mut self.tasks, &self.execution);
                        step.newly_cancelled.extend(manager.cancel_dependents(task));
                        step.execution_finished = manager.all_tasks_terminal();
                        AllocationDecision::Failed(step)
                    }
                }
            }
        }
    }

    /// A retry or allocation backoff elapsed.
    pub fn retry_due(&mut self, task: &str) -> bool {
        let Some(info) = self.tasks.get_mut(task) else {
            return false;
        };
        match info.run_state {
            RunState::RetryWaiting => {
                info.run_state = RunState::Pending;
                true
            }
            RunState::AllocationBackoff => {
                info.reallocating = true;
                info.run_state = RunState::Ready;
                debug!(execution = %self.execution, task, failures = info.allocation_failures, "allocation backoff elapsed");
                true
            }
            _ => false,
        }
    }

    /// Cancel every non-terminal task. Running tasks move to `Stopping` and
    /// are reported in [`SchedulerStep::stopping`].
    pub fn cancel_all(&mut self) -> SchedulerStep {
        let mut step = SchedulerStep::default();
        let mut ids: Vec<TaskId> = self.tasks.keys().cloned().collect();
        ids.sort();

        for id in ids {
            let Some(info) = self.tasks.get_mut(&id) else {
                continue;
            };
            match info.run_state {
                RunState::Running => {
                    info.run_state = RunState::Stopping;
                    step.stopping.push((id, info.attempts));
                }
                RunState::Stopping => {}
                state if state.is_terminal() => {}
                _ => {
                    info.run_state = RunState::Cancelled;
                    step.newly_cancelled.push(id);
                }
            }
        }

        info!(
            execution = %self.execution,
            cancelled = step.newly_cancelled.len(),
            stopping = step.stopping.len(),
            "execution cancellation requested"
        );
        step.execution_finished = self.is_finished();
        step
    }

    /// The stop timeout for `attempt` elapsed without an acknowledgement.
    pub fn stop_timed_out(&mut self, task: &str, attempt: u32) -> SchedulerStep {
        let mut step = SchedulerStep::default();
        if let Some(info) = self.tasks.get_mut(task) {
            if info.run_state == RunState::Stopping && info.attempts == attempt {
                warn!(execution = %self.execution, task, attempt, "stop not acknowledged in time; cancelling");
                info.run_state = RunState::Cancelled;
                step.newly_cancelled.push(task.to_string());
            }
        }
        step.execution_finished = self.is_finished();
        step
    }

    /// Reconcile state loaded from a record before resuming.
    ///
    /// - Allocation in flight: asked again for the same attempt.
    /// - Running: the worker was lost with the process, handled as a crash.
    /// - Stopping: cancelled.
    /// - Waiting on a backoff: due immediately.
    pub fn recover(&mut self) -> SchedulerStep {
        let mut step = SchedulerStep::default();
        let mut ids: Vec<TaskId> = self.tasks.keys().cloned().collect();
        ids.sort();

        for id in ids {
            let Some(state) = self.run_state_of(&id) else {
                continue;
            };
            match state {
                RunState::Allocating => {
                    if let Some(info) = self.tasks.get_mut(&id) {
                        info.reallocating = true;
                        info.run_state = RunState::Ready;
                    }
                }
                RunState::Running => {
                    info!(execution = %self.execution, task = %id, "task was running at shutdown; treating as crashed");
                    self.fail_attempt(&id, "worker lost on restart".to_string(), &mut step);
                }
                RunState::Stopping => {
                    if let Some(info) = self.tasks.get_mut(&id) {
                        info.run_state = RunState::Cancelled;
                    }
                    step.newly_cancelled.push(id);
                }
                RunState::RetryWaiting | RunState::AllocationBackoff => {
                    step.retries.push(RetryRequest {
                        task: id,
                        delay: Duration::ZERO,
                    });
                }
                _ => {}
            }
        }

        step.execution_finished = self.is_finished();
        step
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::graph::TaskSpec;

    fn diamond() -> Graph {
        let mut b = TaskSpec::new("B", "b");
        b.after.push("A".into());
        let mut c = TaskSpec::new("C", "c");
        c.after.push("A".into());
        let mut d = TaskSpec::new("D", "d");
        d.after.extend(["B".to_string(), "C".to_string()]);
        Graph::new("diamond")
            .with_task(TaskSpec::new("A", "a"))
            .with_task(b)
            .with_task(c)
            .with_task(d)
    }

    fn scheduler(retries: u32) -> Scheduler {
        Scheduler::new(
            "e1",
            &diamond(),
            2,
            RetryPolicy::new(retries, crate::policy::BackoffPolicy::fixed(Duration::from_millis(10))),
            RetryPolicy::new(1, crate::policy::BackoffPolicy::fixed(Duration::from_millis(10))),
        )
    }

    fn names(step: &SchedulerStep) -> Vec<&str> {
        step.newly_scheduled.iter().map(|t| t.task.as_str()).collect()
    }

    fn run(s: &mut Scheduler, task: &str, attempt: u32, outcome: TaskOutcome) -> SchedulerStep {
        assert!(s.mark_running(task, attempt));
        let mut step = s.step_completion(task, attempt, outcome);
        step.merge(s.step_ready(|_| true));
        step
    }

    #[test]
    fn diamond_respects_dependencies_and_parallelism() {
        let mut s = scheduler(0);
        assert_eq!(names(&s.step_ready(|_| true)), vec!["A"]);

        let step = run(&mut s, "A", 1, TaskOutcome::Success);
        assert_eq!(names(&step), vec!["B", "C"]);

        let step = run(&mut s, "B", 1, TaskOutcome::Success);
        assert!(names(&step).is_empty(), "D must wait for C");
        assert_eq!(s.status_of("D"), Some(TaskStatus::Pending));

        let step = run(&mut s, "C", 1, TaskOutcome::Success);
        assert_eq!(names(&step), vec!["D"]);

        let step = run(&mut s, "D", 1, TaskOutcome::Success);
        assert!(step.execution_finished);
        assert!(s.statuses().values().all(|(st, _)| *st == TaskStatus::Completed));
    }

    #[test]
    fn parallelism_bound_holds_back_ready_tasks() {
        let mut s = Scheduler::new("e1", &diamond(), 1, RetryPolicy::none(), RetryPolicy::none());
        s.step_ready(|_| true);
        let step = run(&mut s, "A", 1, TaskOutcome::Success);
        assert_eq!(names(&step), vec!["B"]);
        assert_eq!(s.status_of("C"), Some(TaskStatus::Ready));
    }

    #[test]
    fn failed_attempt_is_retried_then_succeeds() {
        let mut s = scheduler(1);
        s.step_ready(|_| true);
        let step = run(&mut s, "A", 1, TaskOutcome::Failed("exit 1".into()));
        assert_eq!(step.retries.len(), 1);
        assert_eq!(s.status_of("A"), Some(TaskStatus::Failed));

        assert!(s.retry_due("A"));
        let step = s.step_ready(|_| true);
        assert_eq!(step.newly_scheduled[0].attempt, 2);

        let step = run(&mut s, "A", 2, TaskOutcome::Success);
        assert_eq!(names(&step), vec!["B", "C"]);
    }

    #[test]
    fn exhausted_retries_cancel_dependents() {
        let mut s = scheduler(0);
        s.step_ready(|_| true);
        let step = run(&mut s, "A", 1, TaskOutcome::Crashed("boom".into()));
        assert_eq!(step.newly_failed, vec!["A"]);
        assert_eq!(step.newly_cancelled, vec!["B", "C", "D"]);
        assert!(step.execution_finished);
    }

    #[test]
    fn stale_completions_are_ignored() {
        let mut s = scheduler(1);
        s.step_ready(|_| true);
        s.mark_running("A", 1);
        assert!(s.step_completion("A", 7, TaskOutcome::Success).is_empty());
        assert_eq!(s.status_of("A"), Some(TaskStatus::Running));
    }

    #[test]
    fn cancel_stops_running_and_cancels_the_rest() {
        let mut s = scheduler(0);
        s.step_ready(|_| true);
        s.mark_running("A", 1);
        let step = s.cancel_all();
        assert_eq!(step.stopping, vec![("A".to_string(), 1)]);
        assert_eq!(step.newly_cancelled, vec!["B", "C", "D"]);
        assert!(!step.execution_finished);

        let step = s.step_completion("A", 1, TaskOutcome::Stopped);
        assert_eq!(step.newly_cancelled, vec!["A"]);
        assert!(step.execution_finished);
    }

    #[test]
    fn allocation_backoff_then_exhaustion() {
        let mut s = scheduler(0);
        s.step_ready(|_| true);
        let unavailable = AllocatorError::ResourceUnavailable("full".into());

        assert!(matches!(s.allocation_failed("A", 1, &unavailable), AllocationDecision::Retry(_)));
        assert_eq!(s.status_of("A"), Some(TaskStatus::Ready));
        assert!(s.retry_due("A"));
        let step = s.step_ready(|_| true);
        assert_eq!(step.newly_scheduled[0].attempt, 1, "backoff keeps the attempt");

        match s.allocation_failed("A", 1, &unavailable) {
            AllocationDecision::Failed(step) => {
                assert_eq!(step.newly_failed, vec!["A"]);
                assert!(step.execution_finished);
            }
            other => panic!("unexpected decision {other:?}"),
        }
    }

    #[test]
    fn recovery_treats_running_as_crashed() {
        let mut s = scheduler(1);
        s.step_ready(|_| true);
        s.mark_running("A", 1);
        let records = s.records();

        let mut restored = scheduler(1);
        restored.apply_records(&records);
        let step = restored.recover();
        assert_eq!(step.retries.len(), 1);
        assert_eq!(restored.task("A").map(|i| i.failures), Some(1));
    }
}
