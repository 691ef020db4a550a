// src/channel/channel.rs

//! Channel record plus the controller logic deciding when a bound pair is
//! complete and when the channel may close.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::channel::spec::{ChannelSpec, Role};
use crate::types::{ChannelId, ClosePolicy, ExecutionId, SlotId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelState {
    Alive,
    Closed,
}

/// Status of one bound endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndpointStatus {
    /// Bound, waiting for the other side of the pair.
    Pending,
    /// Pair complete; slot is OPEN.
    Connected,
    /// Consumer signalled end-of-data but is still bound.
    Finished,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub slot: SlotId,
    pub role: Role,
    pub status: EndpointStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ConsumerEndpoint {
    pub(crate) status: EndpointStatus,
    /// Read position into the channel's data.
    pub(crate) cursor: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub id: ChannelId,
    pub execution: ExecutionId,
    pub spec: ChannelSpec,
    pub policy: ClosePolicy,
    pub(crate) state: ChannelState,
    pub(crate) producer: Option<(SlotId, EndpointStatus)>,
    /// Producer slot named at creation, bound or not.
    pub(crate) declared_producer: Option<SlotId>,
    /// Producer slot that wrote the data, kept after it unbinds.
    pub(crate) origin: Option<SlotId>,
    /// Producer has unbound after finishing its output.
    pub(crate) producer_released: bool,
    pub(crate) consumers: BTreeMap<SlotId, ConsumerEndpoint>,
    pub(crate) expected_consumers: BTreeSet<SlotId>,
    pub(crate) finished_consumers: BTreeSet<SlotId>,
    /// Data written by the producer and not yet discarded.
    pub(crate) buffer: Vec<u8>,
    /// Producer signalled end-of-data.
    pub(crate) sealed: bool,
    /// Snapshot object exists in storage.
    pub(crate) committed: bool,
    pub(crate) digest: Option<String>,
}

impl Channel {
    pub fn new(
        id: ChannelId,
        execution: impl Into<ExecutionId>,
        spec: ChannelSpec,
        policy: ClosePolicy,
        expected_consumers: impl IntoIterator<Item = SlotId>,
    ) -> Self {
        Self {
            id,
            execution: execution.into(),
            spec,
            policy,
            state: ChannelState::Alive,
            producer: None,
            declared_producer: None,
            origin: None,
            producer_released: false,
            consumers: BTreeMap::new(),
            expected_consumers: expected_consumers.into_iter().collect(),
            finished_consumers: BTreeSet::new(),
            buffer: Vec::new(),
            sealed: false,
            committed: false,
            digest: None,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == ChannelState::Closed
    }

    pub fn is_snapshot(&self) -> bool {
        self.spec.snapshot_uri().is_some()
    }

    pub fn producer_slot(&self) -> Option<&SlotId> {
        self.producer.as_ref().map(|(slot, _)| slot)
    }

    pub fn has_bound(&self, slot: &str) -> bool {
        self.producer_slot().is_some_and(|p| p == slot) || self.consumers.contains_key(slot)
    }

    /// Whether `slot` ever took part in this channel.
    pub(crate) fn knows(&self, slot: &str) -> bool {
        self.has_bound(slot)
            || self.declared_producer.as_deref() == Some(slot)
            || self.origin.as_deref() == Some(slot)
            || self.expected_consumers.contains(slot)
            || self.finished_consumers.contains(slot)
    }

    /// Producer first, then consumers in slot order.
    pub fn endpoints(&self) -> Vec<Endpoint> {
        let mut out = Vec::with_capacity(self.consumers.len() + 1);
        if let Some((slot, status)) = &self.producer {
            out.push(Endpoint {
                slot: slot.clone(),
                role: Role::Producer,
                status: *status,
            });
        }
        out.extend(self.consumers.iter().map(|(slot, c)| Endpoint {
            slot: slot.clone(),
            role: Role::Consumer,
            status: c.status,
        }));
        out
    }

    /// Whether a consumer binding now would complete its pair.
    pub(crate) fn consumer_can_connect(&self) -> bool {
        if self.is_snapshot() {
            self.committed
        } else {
            self.producer.is_some() || (self.producer_released && self.sealed)
        }
    }

    /// Whether a producer binding now would be connected immediately.
    ///
    /// Snapshot producers write into storage, so their peer always exists.
    pub(crate) fn producer_can_connect(&self) -> bool {
        self.is_snapshot()
            || self
                .consumers
                .values()
                .any(|c| c.status == EndpointStatus::Pending)
    }

    /// Close decision per the channel's [`ClosePolicy`].
    pub(crate) fn ready_to_close(&self) -> bool {
        if !self.producer_released {
            return false;
        }

        let bound_done = self
            .consumers
            .values()
            .all(|c| c.status == EndpointStatus::Finished);

        match self.policy {
            ClosePolicy::ProducerOnly => bound_done,
            ClosePolicy::AwaitConsumers => {
                bound_done
                    && self
                        .expected_consumers
                        .iter()
                        .all(|s| self.finished_consumers.contains(s))
            }
        }
    }

    /// Data available to a consumer at `cursor`, if any.
    pub(crate) fn available_from(&self, cursor: u64) -> &[u8] {
        let start = usize::try_from(cursor)
            .unwrap_or(usize::MAX)
            .min(self.buffer.len());
        &self.buffer[start..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::spec::DataSchema;

    fn direct(policy: ClosePolicy) -> Channel {
        Channel::new(
            "c1".into(),
            "e1",
            ChannelSpec::direct(DataSchema::new("text")),
            policy,
            ["in-b".to_string(), "in-c".to_string()],
        )
    }

    fn bind_consumer(ch: &mut Channel, slot: &str, status: EndpointStatus) {
        ch.consumers
            .insert(slot.to_string(), ConsumerEndpoint { status, cursor: 0 });
    }

    #[test]
    fn await_consumers_waits_for_every_declared_consumer() {
        let mut ch = direct(ClosePolicy::AwaitConsumers);
        ch.producer_released = true;
        bind_consumer(&mut ch, "in-b", EndpointStatus::Finished);
        assert!(!ch.ready_to_close(), "in-b finished but not unbound, in-c never bound");

        ch.consumers.remove("in-b");
        ch.finished_consumers.insert("in-b".into());
        assert!(!ch.ready_to_close());

        ch.finished_consumers.insert("in-c".into());
        assert!(ch.ready_to_close());
    }

    #[test]
    fn producer_only_ignores_unbound_consumers() {
        let mut ch = direct(ClosePolicy::ProducerOnly);
        bind_consumer(&mut ch, "in-b", EndpointStatus::Connected);
        assert!(!ch.ready_to_close(), "producer still bound");

        ch.producer_released = true;
        assert!(!ch.ready_to_close(), "bound consumer still reading");

        ch.consumers.get_mut("in-b").unwrap().status = EndpointStatus::Finished;
        assert!(ch.ready_to_close());
    }

    #[test]
    fn snapshot_consumers_connect_only_after_commit() {
        let mut ch = Channel::new(
            "c2".into(),
            "e1",
            ChannelSpec::snapshot(DataSchema::new("text"), "snapshot://e1/A/out"),
            ClosePolicy::AwaitConsumers,
            Vec::new(),
        );
        assert!(ch.producer_can_connect());
        assert!(!ch.consumer_can_connect());
        ch.committed = true;
        assert!(ch.consumer_can_connect());
    }

    #[test]
    fn available_data_respects_cursor() {
        let mut ch = direct(ClosePolicy::AwaitConsumers);
        ch.buffer.extend_from_slice(b"hello");
        assert_eq!(ch.available_from(0), b"hello");
        assert_eq!(ch.available_from(3), b"lo");
        assert_eq!(ch.available_from(99), b"");
    }
}
