// tests/fault_injection.rs

mod common;
use crate::common::*;

use std::collections::BTreeMap;
use std::time::Duration;

use dagwire::GraphScheduler;
use dagwire::dag::TaskStatus;
use dagwire::engine::{ExecutionSnapshot, ExecutionStatus};
use dagwire::errors::SchedulerErrorKind;
use dagwire::policy::RetryPolicy;
use dagwire_test_utils::{Script, ScriptedAllocator, ScriptedWorker, diamond};

/// Final task statuses and channel states, independent of ids.
fn final_shape(scheduler: &GraphScheduler, snapshot: &ExecutionSnapshot) -> (BTreeMap<String, TaskStatus>, Vec<String>) {
    let tasks = snapshot
        .tasks
        .iter()
        .map(|(id, t)| (id.clone(), t.status))
        .collect();
    let mut channels: Vec<String> = scheduler
        .channel_states(&user(), &snapshot.execution)
        .expect("channel states")
        .into_values()
        .map(|state| format!("{state:?}"))
        .collect();
    channels.sort();
    (tasks, channels)
}

#[tokio::test]
async fn injected_abort_is_retried_like_a_crash() -> TestResult {
    init_tracing();
    let worker = ScriptedWorker::new();
    worker.script("B", [Script::Hang, Script::Succeed]);
    let allocator = ScriptedAllocator::new(worker);
    let scheduler = start(&allocator, fast_options(2)).await;

    let execution = scheduler.submit(&user(), diamond()).await?;
    with_timeout(until_started(&allocator, "B")).await;
    scheduler.inject_fault(&user(), &execution, "B").await?;

    let snapshot = with_timeout(scheduler.wait(&user(), &execution)).await?;
    assert_eq!(snapshot.status, ExecutionStatus::Completed);
    assert_eq!(snapshot.tasks["B"].attempts, 2);
    assert_eq!(allocator.worker().inputs_of("D").as_deref(), Some(&b"B\nC\n"[..]));

    let fired = scheduler.faults().fired();
    assert_eq!(fired.len(), 1);
    assert_eq!(fired[0].task, "B");
    assert_eq!(fired[0].attempt, 1);
    assert_eq!(allocator.released(), allocator.allocated());

    scheduler.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn injected_abort_matches_a_genuine_crash() -> TestResult {
    init_tracing();
    let mut options = fast_options(2);
    options.retry = RetryPolicy::none();

    // Genuine crash.
    let crashing = ScriptedWorker::new();
    crashing.script("B", [Script::Crash("worker died".into())]);
    let crash_alloc = ScriptedAllocator::new(crashing);
    let crash_sched = start(&crash_alloc, options).await;
    let crash_exec = crash_sched.submit(&user(), diamond()).await?;
    let crashed = with_timeout(crash_sched.wait(&user(), &crash_exec)).await?;

    // Injected abort of an otherwise healthy task.
    let hanging = ScriptedWorker::new();
    hanging.script("B", [Script::Hang]);
    let fault_alloc = ScriptedAllocator::new(hanging);
    let fault_sched = start(&fault_alloc, options).await;
    let fault_exec = fault_sched.submit(&user(), diamond()).await?;
    with_timeout(until_started(&fault_alloc, "B")).await;
    fault_sched.inject_fault(&user(), &fault_exec, "B").await?;
    let injected = with_timeout(fault_sched.wait(&user(), &fault_exec)).await?;

    assert_eq!(crashed.status, ExecutionStatus::Failed);
    assert_eq!(injected.status, crashed.status);
    assert_eq!(final_shape(&fault_sched, &injected), final_shape(&crash_sched, &crashed));
    assert_eq!(injected.task_status("D"), Some(TaskStatus::Cancelled));
    assert!(all_channels_closed(&fault_sched, &fault_exec));

    crash_sched.shutdown().await?;
    fault_sched.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn armed_fault_fires_on_next_dispatch() -> TestResult {
    init_tracing();
    // A is slow enough that C is armed before it is dispatched.
    let allocator = ScriptedAllocator::new(ScriptedWorker::new().with_delay(Duration::from_millis(50)));
    let scheduler = start(&allocator, fast_options(2)).await;

    let execution = scheduler.submit(&user(), diamond()).await?;
    scheduler.arm_fault(&user(), &execution, "C")?;
    assert!(scheduler.faults().is_armed(&execution, "C"));

    let snapshot = with_timeout(scheduler.wait(&user(), &execution)).await?;

    assert_eq!(snapshot.status, ExecutionStatus::Completed);
    assert_eq!(snapshot.tasks["C"].attempts, 2);
    assert!(!scheduler.faults().is_armed(&execution, "C"));
    let fired = scheduler.faults().fired();
    assert_eq!(fired.len(), 1);
    assert_eq!(fired[0].execution, execution);

    scheduler.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn armed_fault_stays_inside_its_execution() -> TestResult {
    init_tracing();
    let allocator = ScriptedAllocator::new(ScriptedWorker::new().with_delay(Duration::from_millis(50)));
    let scheduler = start(&allocator, fast_options(4)).await;

    let target = scheduler.submit(&user(), diamond()).await?;
    let bystander = scheduler.submit(&user(), diamond()).await?;
    scheduler.arm_fault(&user(), &target, "C")?;

    let hit = with_timeout(scheduler.wait(&user(), &target)).await?;
    let missed = with_timeout(scheduler.wait(&user(), &bystander)).await?;

    assert_eq!(hit.tasks["C"].attempts, 2);
    assert_eq!(missed.status, ExecutionStatus::Completed);
    assert_eq!(missed.tasks["C"].attempts, 1);
    let fired = scheduler.faults().fired();
    assert_eq!(fired.len(), 1);
    assert_eq!(fired[0].execution, target);

    scheduler.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn fault_on_idle_task_is_not_found() -> TestResult {
    init_tracing();
    let worker = ScriptedWorker::new();
    worker.script("A", [Script::Hang]);
    let allocator = ScriptedAllocator::new(worker);
    let scheduler = start(&allocator, fast_options(2)).await;

    let execution = scheduler.submit(&user(), diamond()).await?;
    with_timeout(until_started(&allocator, "A")).await;

    let err = scheduler.inject_fault(&user(), &execution, "D").await.unwrap_err();
    assert_eq!(err.kind, SchedulerErrorKind::NotFound);
    assert!(scheduler.faults().fired().is_empty());

    scheduler.cancel(&user(), &execution).await?;
    with_timeout(scheduler.wait(&user(), &execution)).await?;
    scheduler.shutdown().await?;
    Ok(())
}
