// src/engine/fault.rs

//! Fault injection for recovery testing.
//!
//! An injected fault aborts an attempt through the dispatch path: the worker
//! future is dropped and the attempt reports
//! [`TaskOutcome::Crashed`](crate::engine::TaskOutcome::Crashed), exactly
//! like a worker that died.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::info;

use crate::types::{ExecutionId, TaskId};

/// Reason carried by the crash outcome of an injected abort.
pub const INJECTED_FAULT: &str = "injected fault";

/// An abort that was actually delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectedFault {
    pub execution: ExecutionId,
    pub task: TaskId,
    pub attempt: u32,
}

#[derive(Debug, Default)]
struct Faults {
    armed: BTreeSet<(ExecutionId, TaskId)>,
    fired: Vec<InjectedFault>,
}

/// Shared record of armed and delivered faults. Cheap to clone.
///
/// Arming goes through [`GraphScheduler::arm_fault`](crate::GraphScheduler::arm_fault),
/// which checks the caller's permission first.
#[derive(Debug, Clone, Default)]
pub struct FaultInjector {
    inner: Arc<Mutex<Faults>>,
}

impl FaultInjector {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Faults> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Abort the next dispatched attempt of `task` within `execution`.
    pub(crate) fn arm(&self, execution: &str, task: &str) {
        info!(execution, task, "fault armed");
        self.lock().armed.insert((execution.to_string(), task.to_string()));
    }

    pub fn is_armed(&self, execution: &str, task: &str) -> bool {
        self.lock()
            .armed
            .contains(&(execution.to_string(), task.to_string()))
    }

    /// Every abort delivered so far, oldest first.
    pub fn fired(&self) -> Vec<InjectedFault> {
        self.lock().fired.clone()
    }

    /// Consume the armed fault for `task` of `execution`, if any.
    pub(crate) fn take_armed(&self, execution: &str, task: &str) -> bool {
        self.lock()
            .armed
            .remove(&(execution.to_string(), task.to_string()))
    }

    /// Drop whatever is still armed for `execution`.
    pub(crate) fn forget(&self, execution: &str) {
        self.lock().armed.retain(|(e, _)| e != execution);
    }

    pub(crate) fn record(&self, execution: &str, task: &str, attempt: u32) {
        info!(execution, task, attempt, "fault injected");
        self.lock().fired.push(InjectedFault {
            execution: execution.to_string(),
            task: task.to_string(),
            attempt,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn armed_faults_fire_once() {
        let faults = FaultInjector::new();
        faults.arm("e1", "B");
        assert!(faults.is_armed("e1", "B"));
        assert!(faults.take_armed("e1", "B"));
        assert!(!faults.take_armed("e1", "B"));

        faults.record("e1", "B", 1);
        assert_eq!(
            faults.fired(),
            vec![InjectedFault {
                execution: "e1".into(),
                task: "B".into(),
                attempt: 1
            }]
        );
    }

    #[test]
    fn arming_is_scoped_to_one_execution() {
        let faults = FaultInjector::new();
        faults.arm("e1", "B");
        faults.arm("e1", "C");
        assert!(!faults.is_armed("e2", "B"));
        assert!(!faults.take_armed("e2", "B"));
        assert!(faults.is_armed("e1", "B"));

        faults.forget("e1");
        assert!(!faults.is_armed("e1", "B"));
        assert!(!faults.is_armed("e1", "C"));
        assert!(faults.fired().is_empty());
    }
}
