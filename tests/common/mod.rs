#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use dagwire::GraphScheduler;
use dagwire::channel::{ChannelState, SlotState};
use dagwire::engine::RuntimeOptions;
use dagwire::policy::{BackoffPolicy, RetryPolicy};
use dagwire::store::StateStore;
use dagwire::types::{Subject, slot_uri};
use dagwire_test_utils::ScriptedAllocator;

pub use dagwire_test_utils::{init_tracing, with_timeout};

pub type TestResult = Result<(), Box<dyn std::error::Error>>;

/// Short timers so failure paths finish quickly.
pub fn fast_options(parallelism: usize) -> RuntimeOptions {
    RuntimeOptions {
        parallelism,
        retry: RetryPolicy::new(2, BackoffPolicy::fixed(Duration::from_millis(10))),
        allocation_retry: RetryPolicy::new(3, BackoffPolicy::fixed(Duration::from_millis(10))),
        cancel_timeout: Duration::from_millis(200),
    }
}

pub fn user() -> Subject {
    Subject::new("alice")
}

pub async fn start(allocator: &ScriptedAllocator, options: RuntimeOptions) -> GraphScheduler {
    GraphScheduler::builder()
        .allocator(Arc::new(allocator.clone()))
        .options(options)
        .start()
        .await
        .expect("scheduler starts")
}

pub async fn start_with_store(
    allocator: &ScriptedAllocator,
    options: RuntimeOptions,
    store: Arc<dyn StateStore>,
) -> GraphScheduler {
    GraphScheduler::builder()
        .allocator(Arc::new(allocator.clone()))
        .state_store(store)
        .options(options)
        .start()
        .await
        .expect("scheduler starts")
}

/// Every channel of `execution` is closed.
pub fn all_channels_closed(scheduler: &GraphScheduler, execution: &str) -> bool {
    scheduler
        .channel_states(&user(), execution)
        .expect("channel states")
        .values()
        .all(|s| *s == ChannelState::Closed)
}

pub fn slot_state(scheduler: &GraphScheduler, execution: &str, task: &str, slot: &str) -> SlotState {
    scheduler
        .slot_status(&user(), &slot_uri(execution, task, slot))
        .expect("slot status")
        .state
}

/// Poll until `task` is running in the worker.
pub async fn until_started(allocator: &ScriptedAllocator, task: &str) {
    while allocator.worker().attempts(task) == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
