// src/lib.rs

pub mod channel;
pub mod cli;
pub mod config;
pub mod dag;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod logging;
pub mod policy;
pub mod service;
pub mod storage;
pub mod store;
pub mod types;

use std::sync::Arc;

use anyhow::{Result, bail};
use tracing::{debug, info, warn};

use crate::cli::CliArgs;
use crate::config::ConfigFile;
use crate::config::loader::load_and_validate;
use crate::dag::validate_graph;
use crate::engine::{ExecutionSnapshot, ExecutionStatus};
use crate::exec::LocalAllocator;
use crate::storage::{FsStorage, MemoryStorage, Storage};
use crate::store::{FileStateStore, MemoryStateStore, StateStore};
use crate::types::Subject;

pub use crate::service::{GraphScheduler, GraphSchedulerBuilder};

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - config loading
/// - the scheduler with a local worker pool, storage and state store
/// - submission (or recovery with `--resume`)
/// - Ctrl-C handling (cancels the running executions)
pub async fn run(args: CliArgs) -> Result<()> {
    let mut cfg = load_and_validate(&args.config)?;
    if let Some(parallelism) = args.parallelism {
        if parallelism == 0 {
            bail!("--parallelism must be >= 1");
        }
        cfg.options.parallelism = parallelism;
    }

    if args.dry_run {
        print_dry_run(&cfg)?;
        return Ok(());
    }
    if args.resume && cfg.state_dir.is_none() {
        bail!("--resume needs [scheduler].state_dir in {}", args.config);
    }

    let scheduler = start_scheduler(&cfg).await?;
    let subject = Subject::new("cli");

    let executions = if args.resume {
        let pending: Vec<String> = scheduler
            .executions(&subject)
            .await?
            .into_iter()
            .filter(|s| !s.status.is_terminal())
            .map(|s| s.execution)
            .collect();
        if pending.is_empty() {
            info!("nothing to resume");
        }
        pending
    } else {
        vec![scheduler.submit(&subject, cfg.graph.clone()).await?]
    };

    let mut unsuccessful = 0usize;
    for execution in &executions {
        let snapshot = wait_or_cancel(&scheduler, &subject, execution).await?;
        print_snapshot(&snapshot);
        if snapshot.status != ExecutionStatus::Completed {
            unsuccessful += 1;
        }
    }

    scheduler.shutdown().await?;

    if unsuccessful > 0 {
        bail!("{unsuccessful} execution(s) did not complete");
    }
    Ok(())
}

async fn start_scheduler(cfg: &ConfigFile) -> Result<GraphScheduler> {
    let storage: Arc<dyn Storage> = match &cfg.storage_dir {
        Some(dir) => Arc::new(FsStorage::new(dir)),
        None => Arc::new(MemoryStorage::new()),
    };
    let store: Arc<dyn StateStore> = match &cfg.state_dir {
        Some(dir) => Arc::new(FileStateStore::new(dir)),
        None => Arc::new(MemoryStateStore::new()),
    };

    let scheduler = GraphScheduler::builder()
        .allocator(Arc::new(LocalAllocator::new(cfg.workers, cfg.pools.clone())))
        .storage(storage)
        .state_store(store)
        .options(cfg.options)
        .close_policy(cfg.close_policy)
        .start()
        .await?;
    Ok(scheduler)
}

/// Wait for `execution`; on Ctrl-C cancel it and wait for the teardown.
async fn wait_or_cancel(
    scheduler: &GraphScheduler,
    subject: &Subject,
    execution: &str,
) -> Result<ExecutionSnapshot> {
    tokio::select! {
        result = scheduler.wait(subject, execution) => Ok(result?),
        Ok(()) = tokio::signal::ctrl_c() => {
            warn!(execution, "interrupted; cancelling execution");
            scheduler.cancel(subject, execution).await?;
            Ok(scheduler.wait(subject, execution).await?)
        }
    }
}

fn print_snapshot(snapshot: &ExecutionSnapshot) {
    println!("execution {} {:?}", snapshot.execution, snapshot.status);
    if let Some(ref error) = snapshot.error {
        println!("  error: {error}");
    }
    for (task, state) in &snapshot.tasks {
        println!("  {task:<20} {:?} (attempts: {})", state.status, state.attempts);
    }
}

/// Print tasks in dispatch order with their slots and commands.
fn print_dry_run(cfg: &ConfigFile) -> Result<()> {
    let order = validate_graph(&cfg.graph)?;

    println!("dagwire dry-run: {}", cfg.graph.name);
    println!("  parallelism = {}", cfg.options.parallelism);
    println!("  retries = {}", cfg.options.retry.max_retries);
    println!("  close_policy = {:?}", cfg.close_policy);
    println!();

    println!("tasks ({}):", order.len());
    for id in &order {
        let Some(task) = cfg.graph.task(id) else {
            continue;
        };
        println!("  - {id}");
        println!("      cmd: {}", task.exec.cmd);
        println!("      pool: {}", task.exec.provisioning.pool);
        if !task.after.is_empty() {
            println!("      after: {:?}", task.after);
        }
        for input in &task.inputs {
            println!("      input {} <- {} ({})", input.name, input.from, input.schema);
        }
        for output in &task.outputs {
            let kind = if output.snapshot { "snapshot" } else { "direct" };
            println!("      output {} ({}, {kind})", output.name, output.schema);
        }
    }

    debug!("dry-run complete (no execution)");
    Ok(())
}
