use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::oneshot;

use dagwire::errors::AllocatorError;
use dagwire::exec::{Allocator, BoxFuture, ProvisioningSpec, TaskOutcome, Worker, WorkerContext, WorkerHandle};

/// What one attempt of a task does.
#[derive(Debug, Clone, PartialEq)]
pub enum Script {
    Succeed,
    Fail(String),
    Crash(String),
    /// Run until stopped, then report `Stopped`.
    Hang,
    /// Run forever and ignore stop requests.
    IgnoreStop,
}

/// Observable worker activity, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    Started { task: String, attempt: u32 },
    Finished { task: String, attempt: u32 },
}

#[derive(Debug, Default)]
struct WorkerState {
    scripts: HashMap<String, VecDeque<Script>>,
    log: Vec<WorkerEvent>,
    running: usize,
    max_running: usize,
    inputs: HashMap<String, Vec<u8>>,
}

/// Worker whose attempts follow per-task scripts.
///
/// Every attempt:
/// 1. reads all input slots to the end and records the bytes,
/// 2. writes `"<task>\n"` to every output slot,
/// 3. waits `delay` (or until stopped) and finishes as scripted.
///
/// A task without a script succeeds. Scripts are consumed one per attempt;
/// the last one repeats.
#[derive(Debug, Clone)]
pub struct ScriptedWorker {
    state: Arc<Mutex<WorkerState>>,
    delay: Duration,
}

impl Default for ScriptedWorker {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedWorker {
    pub fn new() -> Self {
        Self {
            state: Arc::default(),
            delay: Duration::from_millis(20),
        }
    }

    /// How long a non-hanging attempt runs.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Append scripts for the next attempts of `task`.
    pub fn script(&self, task: &str, scripts: impl IntoIterator<Item = Script>) -> &Self {
        self.lock()
            .scripts
            .entry(task.to_string())
            .or_default()
            .extend(scripts);
        self
    }

    fn lock(&self) -> MutexGuard<'_, WorkerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn log(&self) -> Vec<WorkerEvent> {
        self.lock().log.clone()
    }

    /// Tasks in the order their first attempt started.
    pub fn start_order(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        self.lock()
            .log
            .iter()
            .filter_map(|e| match e {
                WorkerEvent::Started { task, .. } if seen.insert(task.clone()) => Some(task.clone()),
                _ => None,
            })
            .collect()
    }

    /// Number of attempts started for `task`.
    pub fn attempts(&self, task: &str) -> usize {
        self.lock()
            .log
            .iter()
            .filter(|e| matches!(e, WorkerEvent::Started { task: t, .. } if t == task))
            .count()
    }

    pub fn max_running(&self) -> usize {
        self.lock().max_running
    }

    pub fn running(&self) -> usize {
        self.lock().running
    }

    /// Bytes the last attempt of `task` read from its inputs.
    pub fn inputs_of(&self, task: &str) -> Option<Vec<u8>> {
        self.lock().inputs.get(task).cloned()
    }

    fn next_script(&self, task: &str) -> Script {
        let mut state = self.lock();
        match state.scripts.get_mut(task) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or(Script::Succeed),
            Some(queue) => queue.front().cloned().unwrap_or(Script::Succeed),
            None => Script::Succeed,
        }
    }

    fn start(&self, task: &str, attempt: u32) -> RunningGuard {
        let mut state = self.lock();
        state.log.push(WorkerEvent::Started {
            task: task.to_string(),
            attempt,
        });
        state.running += 1;
        state.max_running = state.max_running.max(state.running);
        RunningGuard {
            state: Arc::clone(&self.state),
            task: task.to_string(),
            attempt,
        }
    }

    /// Wrap the worker in a handle, e.g. for [`ScriptedAllocator`].
    pub fn handle(&self, id: impl Into<String>) -> WorkerHandle {
        WorkerHandle::new(id, Arc::new(self.clone()))
    }
}

/// Marks the attempt finished even when the worker future is dropped.
struct RunningGuard {
    state: Arc<Mutex<WorkerState>>,
    task: String,
    attempt: u32,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.running = state.running.saturating_sub(1);
        state.log.push(WorkerEvent::Finished {
            task: std::mem::take(&mut self.task),
            attempt: self.attempt,
        });
    }
}

impl Worker for ScriptedWorker {
    fn execute(&self, ctx: WorkerContext, mut stop: oneshot::Receiver<()>) -> BoxFuture<'_, TaskOutcome> {
        Box::pin(async move {
            let script = self.next_script(&ctx.task);
            let _guard = self.start(&ctx.task, ctx.attempt);

            let mut input = Vec::new();
            for slot in &ctx.inputs {
                match ctx.channels.read_to_end(&ctx.subject, slot) {
                    Ok(bytes) => input.extend(bytes),
                    Err(err) => return TaskOutcome::Crashed(err.to_string()),
                }
            }
            self.lock().inputs.insert(ctx.task.clone(), input);

            let line = format!("{}\n", ctx.task);
            for slot in &ctx.outputs {
                if let Err(err) = ctx.channels.write(&ctx.subject, slot, line.as_bytes()) {
                    return TaskOutcome::Crashed(err.to_string());
                }
            }

            match script {
                Script::Hang => {
                    let _ = stop.await;
                    TaskOutcome::Stopped
                }
                Script::IgnoreStop => std::future::pending().await,
                finishing => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.delay) => {}
                        Ok(()) = &mut stop => return TaskOutcome::Stopped,
                    }
                    match finishing {
                        Script::Fail(msg) => TaskOutcome::Failed(msg),
                        Script::Crash(msg) => TaskOutcome::Crashed(msg),
                        _ => TaskOutcome::Success,
                    }
                }
            }
        })
    }
}

#[derive(Debug, Default)]
struct AllocatorState {
    in_use: usize,
    allocated: usize,
    released: usize,
    unavailable: usize,
    specs: Vec<ProvisioningSpec>,
}

/// Allocator handing out [`ScriptedWorker`]s with scriptable failures.
#[derive(Debug, Clone)]
pub struct ScriptedAllocator {
    worker: ScriptedWorker,
    capacity: usize,
    invalid_pools: BTreeSet<String>,
    state: Arc<Mutex<AllocatorState>>,
}

impl ScriptedAllocator {
    pub fn new(worker: ScriptedWorker) -> Self {
        Self {
            worker,
            capacity: usize::MAX,
            invalid_pools: BTreeSet::new(),
            state: Arc::default(),
        }
    }

    /// Answer `ResourceUnavailable` once `capacity` workers are out.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Answer `InvalidConfiguration` for specs asking for `pool`.
    pub fn reject_pool(mut self, pool: &str) -> Self {
        self.invalid_pools.insert(pool.to_string());
        self
    }

    /// Answer `ResourceUnavailable` to the next `n` requests.
    pub fn unavailable_for(&self, n: usize) {
        self.lock().unavailable = n;
    }

    fn lock(&self) -> MutexGuard<'_, AllocatorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn worker(&self) -> &ScriptedWorker {
        &self.worker
    }

    pub fn in_use(&self) -> usize {
        self.lock().in_use
    }

    pub fn allocated(&self) -> usize {
        self.lock().allocated
    }

    pub fn released(&self) -> usize {
        self.lock().released
    }

    /// Every spec the allocator was asked for, including refused ones.
    pub fn requests(&self) -> Vec<ProvisioningSpec> {
        self.lock().specs.clone()
    }
}

impl Allocator for ScriptedAllocator {
    fn allocate(&self, spec: ProvisioningSpec) -> BoxFuture<'_, Result<WorkerHandle, AllocatorError>> {
        Box::pin(async move {
            let mut state = self.lock();
            state.specs.push(spec.clone());

            if self.invalid_pools.contains(&spec.pool) {
                return Err(AllocatorError::InvalidConfiguration(format!("pool '{}' is not provisioned", spec.pool)));
            }
            if state.unavailable > 0 {
                state.unavailable -= 1;
                return Err(AllocatorError::ResourceUnavailable("scripted shortage".to_string()));
            }
            if state.in_use >= self.capacity {
                return Err(AllocatorError::ResourceUnavailable("all workers busy".to_string()));
            }

            state.in_use += 1;
            state.allocated += 1;
            Ok(self.worker.handle(format!("scripted-{}", state.allocated)))
        })
    }

    fn release(&self, _handle: WorkerHandle) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.lock();
            state.in_use = state.in_use.saturating_sub(1);
            state.released += 1;
        })
    }
}
