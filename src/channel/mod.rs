// src/channel/mod.rs

//! Data plane: slots, channels and the registry that owns them.
//!
//! - [`slot`] holds slot descriptors and the slot lifecycle state machine.
//! - [`spec`] describes what a channel carries (direct or snapshot).
//! - [`channel`] is the channel record plus its close policy.
//! - [`manager`] is the concurrency-safe registry exposing bind/unbind/close
//!   and the read/write data path.

#[allow(clippy::module_inception)]
pub mod channel;
pub mod manager;
pub mod slot;
pub mod spec;

pub use channel::{Channel, ChannelState, Endpoint, EndpointStatus};
pub use manager::{BindOutcome, ChannelManager, ChannelRecords, ChannelRequest, ReadOutcome};
pub use slot::{Slot, SlotDirection, SlotState, SlotStatus};
pub use spec::{ChannelSpec, DataSchema, Role};
