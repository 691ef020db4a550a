// src/exec/task_runner.rs

//! Shell worker: runs a task's command as a local process.
//!
//! Inputs are concatenated and fed on stdin; stdout is copied unchanged to
//! each output slot. Stderr is logged at debug level.

use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::exec::backend::{BoxFuture, TaskOutcome, Worker, WorkerContext};

const STDOUT_CHUNK: usize = 8 * 1024;

/// Worker that executes `sh -c <cmd>`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessWorker;

impl Worker for ProcessWorker {
    fn execute(&self, ctx: WorkerContext, stop: oneshot::Receiver<()>) -> BoxFuture<'_, TaskOutcome> {
        Box::pin(async move {
            let task = ctx.task.clone();
            let attempt = ctx.attempt;
            match run_process(ctx, stop).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!(task = %task, attempt, error = %format!("{err:#}"), "task process error");
                    TaskOutcome::Crashed(format!("{err:#}"))
                }
            }
        })
    }
}

async fn run_process(ctx: WorkerContext, mut stop: oneshot::Receiver<()>) -> Result<TaskOutcome> {
    info!(
        execution = %ctx.execution,
        task = %ctx.task,
        attempt = ctx.attempt,
        cmd = %ctx.cmd,
        "starting task process"
    );

    let mut input = Vec::new();
    for slot in &ctx.inputs {
        let bytes = ctx
            .channels
            .read_to_end(&ctx.subject, slot)
            .with_context(|| format!("reading input slot '{slot}'"))?;
        input.extend(bytes);
    }

    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(&ctx.cmd)
        .envs(&ctx.env)
        .env("DAGWIRE_EXECUTION", &ctx.execution)
        .env("DAGWIRE_TASK", &ctx.task)
        .env("DAGWIRE_ATTEMPT", ctx.attempt.to_string())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawning process for task '{}'", ctx.task))?;

    if let Some(mut stdin) = child.stdin.take() {
        let task = ctx.task.clone();
        tokio::spawn(async move {
            if let Err(e) = stdin.write_all(&input).await {
                debug!(task = %task, error = %e, "stdin closed before all input was written");
            }
        });
    }

    if let Some(stderr) = child.stderr.take() {
        let task = ctx.task.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(task = %task, "stderr: {}", line);
            }
        });
    }

    let mut stdout = child.stdout.take().context("child stdout was not captured")?;
    let mut buf = vec![0u8; STDOUT_CHUNK];

    // Stream stdout into the outputs byte for byte until EOF, then wait for
    // exit. A stop request at any point kills the process; a dropped stop
    // sender does not.
    let mut stop_live = true;
    loop {
        tokio::select! {
            read = stdout.read(&mut buf) => {
                let n = read.context("reading task stdout")?;
                if n == 0 {
                    break;
                }
                for slot in &ctx.outputs {
                    ctx.channels
                        .write(&ctx.subject, slot, &buf[..n])
                        .with_context(|| format!("writing output slot '{slot}'"))?;
                }
            }
            signal = &mut stop, if stop_live => {
                if signal.is_ok() {
                    return kill(&mut child, &ctx.task).await;
                }
                stop_live = false;
            }
        }
    }

    tokio::select! {
        status = child.wait() => {
            let status = status.with_context(|| format!("waiting for process of task '{}'", ctx.task))?;
            let code = status.code().unwrap_or(-1);
            info!(task = %ctx.task, attempt = ctx.attempt, exit_code = code, success = status.success(), "task process exited");
            if status.success() {
                Ok(TaskOutcome::Success)
            } else {
                Ok(TaskOutcome::Failed(format!("exit code {code}")))
            }
        }
        Ok(()) = &mut stop, if stop_live => kill(&mut child, &ctx.task).await,
    }
}

async fn kill(child: &mut tokio::process::Child, task: &str) -> Result<TaskOutcome> {
    info!(task, "stop requested; killing task process");
    if let Err(e) = child.kill().await {
        warn!(task, error = %e, "failed to kill task process");
    }
    Ok(TaskOutcome::Stopped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelManager, ChannelRequest, ChannelSpec, DataSchema, Role, Slot, SlotDirection};
    use crate::types::{Subject, slot_uri};

    fn context(cmd: &str, channels: ChannelManager, outputs: Vec<String>) -> WorkerContext {
        WorkerContext {
            execution: "e".into(),
            task: "A".into(),
            attempt: 1,
            cmd: cmd.into(),
            env: Default::default(),
            inputs: Vec::new(),
            outputs,
            channels,
            subject: Subject::system(),
        }
    }

    /// A channel manager with one bound output slot `A.out`.
    fn bound_output() -> (ChannelManager, String) {
        let mgr = ChannelManager::in_memory();
        let sys = Subject::system();
        let out = slot_uri("e", "A", "out");
        mgr.register_slot(
            &sys,
            Slot::new(out.clone(), "out", "e", "A", SlotDirection::Output, DataSchema::default()),
        )
        .unwrap();
        let ch = mgr
            .create_channel(&sys, ChannelRequest::new("e", ChannelSpec::direct(DataSchema::default())))
            .unwrap();
        mgr.bind(&sys, &ch, &out, Role::Producer).unwrap();
        (mgr, out)
    }

    #[tokio::test]
    async fn stdout_reaches_the_output_slot() {
        let (mgr, out) = bound_output();
        let (_stop_tx, stop_rx) = oneshot::channel();
        let outcome = ProcessWorker
            .execute(context("echo one; echo two", mgr.clone(), vec![out.clone()]), stop_rx)
            .await;
        assert_eq!(outcome, TaskOutcome::Success);
        assert_eq!(mgr.slot_status(&Subject::system(), &out).unwrap().pointer, 8);
    }

    #[tokio::test]
    async fn binary_output_without_trailing_newline_is_copied_verbatim() {
        let (mgr, out) = bound_output();
        let (_stop_tx, stop_rx) = oneshot::channel();
        let outcome = ProcessWorker
            .execute(context(r"printf '\377\376abc'", mgr.clone(), vec![out.clone()]), stop_rx)
            .await;
        assert_eq!(outcome, TaskOutcome::Success);
        assert_eq!(mgr.slot_status(&Subject::system(), &out).unwrap().pointer, 5);
    }

    #[tokio::test]
    async fn non_zero_exit_is_a_failure() {
        let (_stop_tx, stop_rx) = oneshot::channel();
        let outcome = ProcessWorker
            .execute(context("exit 3", ChannelManager::in_memory(), Vec::new()), stop_rx)
            .await;
        assert_eq!(outcome, TaskOutcome::Failed("exit code 3".into()));
    }

    #[tokio::test]
    async fn stop_kills_the_process() {
        let (stop_tx, stop_rx) = oneshot::channel();
        let run = tokio::spawn(async move {
            ProcessWorker
                .execute(context("sleep 30", ChannelManager::in_memory(), Vec::new()), stop_rx)
                .await
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        stop_tx.send(()).unwrap();
        assert_eq!(run.await.unwrap(), TaskOutcome::Stopped);
    }
}
