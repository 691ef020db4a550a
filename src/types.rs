use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Identifier of one graph execution (a submitted [`crate::dag::Graph`]).
pub type ExecutionId = String;

/// Task identifier, unique within a graph.
pub type TaskId = String;

/// Slot identifier, unique across executions (`slot://<execution>/<task>/<name>`).
pub type SlotId = String;

/// Channel identifier, unique across executions.
pub type ChannelId = String;

/// Build the canonical slot id for a task's slot within an execution.
pub fn slot_uri(execution: &str, task: &str, slot: &str) -> SlotId {
    format!("slot://{execution}/{task}/{slot}")
}

/// Build the storage URI a snapshot channel commits its producer's output to.
pub fn snapshot_uri(execution: &str, task: &str, slot: &str) -> String {
    format!("snapshot://{execution}/{task}/{slot}")
}

/// Close policy for channels with more than one consumer.
///
/// - `AwaitConsumers`: the channel closes once its producer has unbound and
///   every *declared* consumer has unbound or signalled end-of-data
///   (default behaviour).
/// - `ProducerOnly`: the channel closes once its producer has unbound and
///   every *currently bound* consumer has finished. Consumers that bind
///   after that point are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClosePolicy {
    #[default]
    AwaitConsumers,
    ProducerOnly,
}

impl FromStr for ClosePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "await_consumers" => Ok(ClosePolicy::AwaitConsumers),
            "producer_only" => Ok(ClosePolicy::ProducerOnly),
            other => Err(format!(
                "invalid close_policy: {other} (expected \"await_consumers\" or \"producer_only\")"
            )),
        }
    }
}

/// Permissions checked by [`AccessControl`] before any state mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    SubmitGraph,
    ReadExecution,
    CancelExecution,
    InjectFault,
    ManageChannel,
    ReadChannel,
}

/// The caller on whose behalf an operation is performed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subject {
    pub id: String,
}

impl Subject {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    /// Subject used by the scheduler for its own channel operations.
    pub fn system() -> Self {
        Self::new("dagwire-scheduler")
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// Capability check: `(subject, resource id, permission) -> allowed`.
pub type PermissionCheck = dyn Fn(&Subject, &str, Permission) -> bool + Send + Sync;

/// Injected capability-check function shared by the scheduler and the
/// channel manager.
#[derive(Clone)]
pub struct AccessControl {
    check: Arc<PermissionCheck>,
}

impl AccessControl {
    pub fn new<F>(check: F) -> Self
    where
        F: Fn(&Subject, &str, Permission) -> bool + Send + Sync + 'static,
    {
        Self {
            check: Arc::new(check),
        }
    }

    pub fn allow_all() -> Self {
        Self::new(|_, _, _| true)
    }

    pub fn is_allowed(&self, subject: &Subject, resource: &str, permission: Permission) -> bool {
        (self.check)(subject, resource, permission)
    }
}

impl Default for AccessControl {
    fn default() -> Self {
        Self::allow_all()
    }
}

impl fmt::Debug for AccessControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessControl").finish_non_exhaustive()
    }
}

/// Parse a duration string such as `"250ms"`, `"5s"`, `"2m"` or `"1h"`.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration string".to_string());
    }

    let idx = s
        .chars()
        .position(|c| !c.is_ascii_digit())
        .ok_or_else(|| "duration missing unit suffix".to_string())?;

    let (num_part, unit_part) = s.split_at(idx);
    let value: u64 = num_part
        .parse()
        .map_err(|e| format!("invalid duration number '{}': {}", num_part, e))?;
    let unit = unit_part.trim().to_lowercase();

    match unit.as_str() {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 60 * 60)),
        _ => Err(format!(
            "unsupported duration unit '{}'; expected ms, s, m, or h",
            unit
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_policy_parses_both_spellings() {
        assert_eq!(
            "await_consumers".parse::<ClosePolicy>(),
            Ok(ClosePolicy::AwaitConsumers)
        );
        assert_eq!(
            " Producer_Only ".parse::<ClosePolicy>(),
            Ok(ClosePolicy::ProducerOnly)
        );
        assert!("sometimes".parse::<ClosePolicy>().is_err());
    }

    #[test]
    fn durations_parse_with_units() {
        assert_eq!(parse_duration("250ms"), Ok(Duration::from_millis(250)));
        assert_eq!(parse_duration("5s"), Ok(Duration::from_secs(5)));
        assert_eq!(parse_duration("2m"), Ok(Duration::from_secs(120)));
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("3d").is_err());
    }

    #[test]
    fn access_control_delegates_to_closure() {
        let acl = AccessControl::new(|subject, _, perm| {
            subject.id == "admin" || perm == Permission::ReadExecution
        });
        assert!(acl.is_allowed(&Subject::new("admin"), "x", Permission::SubmitGraph));
        assert!(!acl.is_allowed(&Subject::new("bob"), "x", Permission::SubmitGraph));
        assert!(acl.is_allowed(&Subject::new("bob"), "x", Permission::ReadExecution));
    }
}
