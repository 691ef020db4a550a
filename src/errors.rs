// src/errors.rs

//! Crate-wide error types.
//!
//! Each component reports one error type tagged with a kind, optionally
//! wrapping the underlying cause:
//! - [`ValidationError`] for graph submission.
//! - [`ChannelError`] for the channel manager.
//! - [`SchedulerError`] for the graph scheduler.
//! - [`AllocatorError`] for the consumed allocator contract.

use std::error::Error as StdError;

use thiserror::Error;

use crate::types::{ChannelId, TaskId};

/// Boxed underlying cause carried by component errors.
pub type Cause = Box<dyn StdError + Send + Sync + 'static>;

#[derive(Error, Debug)]
pub enum DagwireError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("Invalid graph: {0}")]
    Validation(#[from] ValidationError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, DagwireError>;

/// Graph rejected at submission. Nothing of a rejected graph is applied.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("graph must contain at least one task")]
    EmptyGraph,

    #[error("invalid name '{0}': expected [A-Za-z0-9_-]+")]
    InvalidName(String),

    #[error("duplicate task '{0}'")]
    DuplicateTask(TaskId),

    #[error("task '{task}' declares slot '{slot}' twice")]
    DuplicateSlot { task: TaskId, slot: String },

    #[error("task '{task}' has unknown dependency '{dep}'")]
    UnknownDependency { task: TaskId, dep: TaskId },

    #[error("task '{0}' cannot depend on itself")]
    SelfDependency(TaskId),

    #[error("task '{task}' reads from unknown slot '{producer}.{slot}'")]
    UnknownSlot {
        task: TaskId,
        producer: TaskId,
        slot: String,
    },

    #[error(
        "schema mismatch on '{consumer}': producer '{producer}' emits '{found}', consumer expects '{expected}'"
    )]
    SchemaMismatch {
        consumer: String,
        producer: String,
        expected: String,
        found: String,
    },

    #[error("cycle detected in task graph involving task '{0}'")]
    Cycle(TaskId),
}

/// Kind tag for [`ChannelError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelErrorKind {
    /// Unknown channel or slot.
    NotFound,
    /// Role already bound, slot owned by another channel, or direction/role mismatch.
    Conflict,
    /// Channel is already CLOSED.
    Closed,
    /// Slot schema does not match the channel spec.
    IncompatibleSchema,
    /// Slot state machine refused the transition, or data-plane call in the wrong state.
    InvalidTransition,
    PermissionDenied,
    /// Snapshot storage failed.
    Storage,
}

/// Error reported by the channel manager.
#[derive(Error, Debug)]
#[error("{kind:?} on channel '{channel}': {message}")]
pub struct ChannelError {
    pub kind: ChannelErrorKind,
    pub channel: ChannelId,
    pub message: String,
    #[source]
    pub cause: Option<Cause>,
}

impl ChannelError {
    pub fn new(kind: ChannelErrorKind, channel: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            channel: channel.into(),
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_cause(mut self, cause: impl Into<Cause>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    pub fn not_found(channel: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ChannelErrorKind::NotFound, channel, message)
    }

    pub fn conflict(channel: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ChannelErrorKind::Conflict, channel, message)
    }

    pub fn closed(channel: impl Into<String>) -> Self {
        Self::new(ChannelErrorKind::Closed, channel, "channel is closed")
    }

    /// Bind/unbind against a closed or role-conflicting channel.
    pub fn is_state_error(&self) -> bool {
        matches!(
            self.kind,
            ChannelErrorKind::Conflict | ChannelErrorKind::Closed | ChannelErrorKind::InvalidTransition
        )
    }
}

/// Kind tag for [`SchedulerError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerErrorKind {
    Validation,
    Resource,
    ChannelState,
    FatalConfiguration,
    NotFound,
    PermissionDenied,
    Persistence,
    Shutdown,
}

/// Error reported by the graph scheduler.
#[derive(Error, Debug)]
#[error("{kind:?}: {message}")]
pub struct SchedulerError {
    pub kind: SchedulerErrorKind,
    pub message: String,
    #[source]
    pub cause: Option<Cause>,
}

impl SchedulerError {
    pub fn new(kind: SchedulerErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_cause(mut self, cause: impl Into<Cause>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    pub fn not_found(execution: &str) -> Self {
        Self::new(
            SchedulerErrorKind::NotFound,
            format!("execution '{execution}' not found"),
        )
    }

    pub fn permission_denied(subject: &str, resource: &str) -> Self {
        Self::new(
            SchedulerErrorKind::PermissionDenied,
            format!("'{subject}' may not access '{resource}'"),
        )
    }

    pub fn shutdown() -> Self {
        Self::new(SchedulerErrorKind::Shutdown, "scheduler runtime has stopped")
    }
}

impl From<ValidationError> for SchedulerError {
    fn from(err: ValidationError) -> Self {
        SchedulerError::new(SchedulerErrorKind::Validation, err.to_string()).with_cause(err)
    }
}

impl From<ChannelError> for SchedulerError {
    fn from(err: ChannelError) -> Self {
        let kind = match err.kind {
            ChannelErrorKind::PermissionDenied => SchedulerErrorKind::PermissionDenied,
            ChannelErrorKind::NotFound => SchedulerErrorKind::NotFound,
            _ => SchedulerErrorKind::ChannelState,
        };
        SchedulerError::new(kind, err.to_string()).with_cause(err)
    }
}

/// Errors of the consumed allocator contract.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocatorError {
    /// Transient; the scheduler backs off and retries.
    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),

    /// Fatal; surfaced to the submitter without retry.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
}
