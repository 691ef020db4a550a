// src/exec/local.rs

//! Local worker pool: a fixed budget of shell workers on this machine.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, warn};

use crate::errors::AllocatorError;
use crate::exec::backend::{Allocator, BoxFuture, ProvisioningSpec, Worker, WorkerHandle};
use crate::exec::task_runner::ProcessWorker;

/// Hands out up to `capacity` [`ProcessWorker`]s at a time.
pub struct LocalAllocator {
    capacity: usize,
    pools: BTreeSet<String>,
    in_use: Mutex<usize>,
    next_id: AtomicU64,
    worker: Arc<dyn Worker>,
}

impl LocalAllocator {
    pub fn new(capacity: usize, pools: impl IntoIterator<Item = String>) -> Self {
        Self {
            capacity: capacity.max(1),
            pools: pools.into_iter().collect(),
            in_use: Mutex::new(0),
            next_id: AtomicU64::new(1),
            worker: Arc::new(ProcessWorker),
        }
    }

    /// Workers currently handed out.
    pub fn in_use(&self) -> usize {
        *self.in_use.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_spec(&self, spec: &ProvisioningSpec) -> Result<(), AllocatorError> {
        if !self.pools.contains(&spec.pool) {
            return Err(AllocatorError::InvalidConfiguration(format!(
                "unknown pool '{}' (available: {:?})",
                spec.pool, self.pools
            )));
        }
        if spec.cpu == 0 {
            return Err(AllocatorError::InvalidConfiguration("cpu must be at least 1".to_string()));
        }
        Ok(())
    }
}

impl Allocator for LocalAllocator {
    fn allocate(&self, spec: ProvisioningSpec) -> BoxFuture<'_, Result<WorkerHandle, AllocatorError>> {
        Box::pin(async move {
            self.check_spec(&spec)?;

            let mut in_use = self.in_use.lock().unwrap_or_else(PoisonError::into_inner);
            if *in_use >= self.capacity {
                debug!(pool = %spec.pool, capacity = self.capacity, "local pool exhausted");
                return Err(AllocatorError::ResourceUnavailable(format!(
                    "all {} local workers busy",
                    self.capacity
                )));
            }
            *in_use += 1;

            let id = format!("local-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
            debug!(worker = %id, pool = %spec.pool, in_use = *in_use, "worker allocated");
            Ok(WorkerHandle::new(id, Arc::clone(&self.worker)))
        })
    }

    fn release(&self, handle: WorkerHandle) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let mut in_use = self.in_use.lock().unwrap_or_else(PoisonError::into_inner);
            match in_use.checked_sub(1) {
                Some(n) => *in_use = n,
                None => warn!(worker = %handle.id, "release without matching allocation"),
            }
            debug!(worker = %handle.id, in_use = *in_use, "worker released");
        })
    }
}
