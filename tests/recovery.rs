// tests/recovery.rs

mod common;
use crate::common::*;

use std::sync::Arc;
use std::time::Duration;

use dagwire::channel::ChannelState;
use dagwire::dag::TaskStatus;
use dagwire::engine::ExecutionStatus;
use dagwire::store::{FileStateStore, StateStore};
use dagwire_test_utils::{Script, ScriptedAllocator, ScriptedWorker, diamond};

async fn until_completed(scheduler: &dagwire::GraphScheduler, execution: &str, tasks: &[&str]) {
    loop {
        let snapshot = scheduler.status(&user(), execution).await.expect("status");
        if tasks.iter().all(|t| snapshot.task_status(t) == Some(TaskStatus::Completed)) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn restart_resumes_without_rerunning_completed_tasks() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let store: Arc<dyn StateStore> = Arc::new(FileStateStore::new(dir.path()));

    // First process: D never finishes before the "crash".
    let first = ScriptedWorker::new();
    first.script("D", [Script::Hang]);
    let first_alloc = ScriptedAllocator::new(first);
    let scheduler = start_with_store(&first_alloc, fast_options(2), Arc::clone(&store)).await;
    let execution = scheduler.submit(&user(), diamond()).await?;
    with_timeout(until_completed(&scheduler, &execution, &["A", "B", "C"])).await;
    with_timeout(until_started(&first_alloc, "D")).await;
    scheduler.shutdown().await?;

    let record = store.load(&execution)?.expect("record persisted");
    assert_eq!(record.status, ExecutionStatus::Running);

    // Second process over the same state directory.
    let second_alloc = ScriptedAllocator::new(ScriptedWorker::new());
    let restarted = start_with_store(&second_alloc, fast_options(2), Arc::clone(&store)).await;
    let snapshot = with_timeout(restarted.wait(&user(), &execution)).await?;

    assert_eq!(snapshot.status, ExecutionStatus::Completed);
    for task in ["A", "B", "C"] {
        assert_eq!(second_alloc.worker().attempts(task), 0, "{task} was re-run");
        assert_eq!(snapshot.tasks[task].attempts, 1);
    }
    // The interrupted attempt counts as crashed.
    assert_eq!(snapshot.tasks["D"].attempts, 2);
    assert_eq!(second_alloc.worker().inputs_of("D").as_deref(), Some(&b"B\nC\n"[..]));
    assert!(all_channels_closed(&restarted, &execution));

    restarted.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn finished_executions_are_recovered_as_is() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let store: Arc<dyn StateStore> = Arc::new(FileStateStore::new(dir.path()));

    let first_alloc = ScriptedAllocator::new(ScriptedWorker::new());
    let scheduler = start_with_store(&first_alloc, fast_options(2), Arc::clone(&store)).await;
    let execution = scheduler.submit(&user(), diamond()).await?;
    with_timeout(scheduler.wait(&user(), &execution)).await?;
    scheduler.shutdown().await?;

    let second_alloc = ScriptedAllocator::new(ScriptedWorker::new());
    let restarted = start_with_store(&second_alloc, fast_options(2), Arc::clone(&store)).await;
    let snapshot = restarted.status(&user(), &execution).await?;

    assert_eq!(snapshot.status, ExecutionStatus::Completed);
    assert_eq!(second_alloc.requests().len(), 0);
    let states = restarted.channel_states(&user(), &execution)?;
    assert!(!states.is_empty());
    assert!(states.values().all(|s| *s == ChannelState::Closed));

    restarted.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn reclaim_releases_channels_but_keeps_the_record() -> TestResult {
    init_tracing();
    let store: Arc<dyn StateStore> = Arc::new(dagwire::store::MemoryStateStore::new());
    let allocator = ScriptedAllocator::new(ScriptedWorker::new());
    let scheduler = start_with_store(&allocator, fast_options(2), Arc::clone(&store)).await;

    let execution = scheduler.submit(&user(), diamond()).await?;
    with_timeout(scheduler.wait(&user(), &execution)).await?;
    scheduler.reclaim(&user(), &execution).await?;

    assert!(scheduler.channel_states(&user(), &execution)?.is_empty());
    let err = scheduler.status(&user(), &execution).await.unwrap_err();
    assert_eq!(err.kind, dagwire::errors::SchedulerErrorKind::NotFound);
    assert!(store.load(&execution)?.is_some());

    scheduler.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn running_execution_cannot_be_reclaimed() -> TestResult {
    init_tracing();
    let worker = ScriptedWorker::new();
    worker.script("A", [Script::Hang]);
    let allocator = ScriptedAllocator::new(worker);
    let scheduler = start(&allocator, fast_options(2)).await;

    let execution = scheduler.submit(&user(), diamond()).await?;
    assert!(scheduler.reclaim(&user(), &execution).await.is_err());

    scheduler.cancel(&user(), &execution).await?;
    with_timeout(scheduler.wait(&user(), &execution)).await?;
    scheduler.shutdown().await?;
    Ok(())
}
