// src/channel/manager.rs

//! Concurrency-safe registry of channels and slots.
//!
//! All slot and channel mutation goes through [`ChannelManager`]. Operations
//! on one channel are serialized by that channel's mutex; the slot table has
//! its own lock, always taken *after* a channel lock.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channel::channel::{Channel, ChannelState, ConsumerEndpoint, Endpoint, EndpointStatus};
use crate::channel::slot::{Slot, SlotDirection, SlotState, SlotStatus};
use crate::channel::spec::{ChannelSpec, Role};
use crate::errors::{ChannelError, ChannelErrorKind};
use crate::storage::{MemoryStorage, Storage};
use crate::types::{AccessControl, ChannelId, ClosePolicy, ExecutionId, Permission, SlotId, Subject};

type ChannelResult<T> = std::result::Result<T, ChannelError>;

/// Result of a successful `bind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindOutcome {
    /// Bound; waiting for the other side of the pair.
    Pending,
    /// The binding slot is OPEN.
    Opened,
}

/// Result of a consumer `read`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    Data(Vec<u8>),
    /// Nothing to read yet; the producer has not finished.
    Pending,
    EndOfData,
}

/// Everything needed to create a channel.
#[derive(Debug, Clone)]
pub struct ChannelRequest {
    pub execution: ExecutionId,
    pub spec: ChannelSpec,
    pub policy: Option<ClosePolicy>,
    /// Producer slot expected to bind. Closed along with the channel.
    pub producer: Option<SlotId>,
    /// Consumer slots the close policy waits for.
    pub consumers: Vec<SlotId>,
}

impl ChannelRequest {
    pub fn new(execution: impl Into<ExecutionId>, spec: ChannelSpec) -> Self {
        Self {
            execution: execution.into(),
            spec,
            policy: None,
            producer: None,
            consumers: Vec::new(),
        }
    }

    pub fn policy(mut self, policy: ClosePolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn producer(mut self, slot: impl Into<SlotId>) -> Self {
        self.producer = Some(slot.into());
        self
    }

    pub fn consumer(mut self, slot: impl Into<SlotId>) -> Self {
        self.consumers.push(slot.into());
        self
    }
}

/// Persisted channel and slot state of one execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelRecords {
    pub channels: Vec<Channel>,
    pub slots: Vec<Slot>,
}

#[derive(Debug)]
struct Inner {
    channels: RwLock<HashMap<ChannelId, Arc<Mutex<Channel>>>>,
    slots: Mutex<HashMap<SlotId, Slot>>,
    storage: Arc<dyn Storage>,
    access: AccessControl,
    default_policy: ClosePolicy,
}

/// Shared handle to the channel registry. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ChannelManager {
    inner: Arc<Inner>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Apply a slot transition, mapping refusal to `InvalidTransition`.
fn transition(slot: &mut Slot, channel: &str, next: SlotState) -> ChannelResult<()> {
    slot.transition(next).map_err(|(from, to)| {
        ChannelError::new(
            ChannelErrorKind::InvalidTransition,
            channel,
            format!("slot '{}' cannot move from {from:?} to {to:?}", slot.id),
        )
    })?;
    debug!(slot = %slot.id, channel, state = ?next, "slot transition");
    Ok(())
}

fn force_close(slot: &mut Slot, channel: &str) {
    if !slot.state().is_terminal() {
        // Every non-terminal state may move to CLOSED.
        let _ = transition(slot, channel, SlotState::Closed);
    }
}

impl ChannelManager {
    pub fn new(storage: Arc<dyn Storage>, access: AccessControl, default_policy: ClosePolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                channels: RwLock::new(HashMap::new()),
                slots: Mutex::new(HashMap::new()),
                storage,
                access,
                default_policy,
            }),
        }
    }

    /// Manager over in-memory storage with every permission granted.
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemoryStorage::new()),
            AccessControl::allow_all(),
            ClosePolicy::default(),
        )
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.inner.storage
    }

    fn authorize(&self, subject: &Subject, resource: &str, permission: Permission) -> ChannelResult<()> {
        if self.inner.access.is_allowed(subject, resource, permission) {
            Ok(())
        } else {
            warn!(subject = %subject, resource, ?permission, "channel operation denied");
            Err(ChannelError::new(
                ChannelErrorKind::PermissionDenied,
                resource,
                format!("'{subject}' lacks {permission:?}"),
            ))
        }
    }

    fn channel(&self, id: &str) -> ChannelResult<Arc<Mutex<Channel>>> {
        let channels = self
            .inner
            .channels
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        channels
            .get(id)
            .cloned()
            .ok_or_else(|| ChannelError::not_found(id, "unknown channel"))
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<SlotId, Slot>> {
        lock(&self.inner.slots)
    }

    /// Channel currently owning `slot`, if any.
    fn owner_of(&self, slot: &str) -> ChannelResult<Option<ChannelId>> {
        let slots = self.slots();
        let s = slots
            .get(slot)
            .ok_or_else(|| ChannelError::not_found(slot, format!("unknown slot '{slot}'")))?;
        Ok(s.channel.clone())
    }

    /// Register a slot descriptor. Slots start in PREPARING.
    pub fn register_slot(&self, subject: &Subject, slot: Slot) -> ChannelResult<()> {
        self.authorize(subject, &slot.id, Permission::ManageChannel)?;
        let mut slots = self.slots();
        if slots.contains_key(&slot.id) {
            return Err(ChannelError::conflict(
                slot.id.clone(),
                format!("slot '{}' already registered", slot.id),
            ));
        }
        debug!(slot = %slot.id, task = %slot.task, direction = ?slot.direction, "slot registered");
        slots.insert(slot.id.clone(), slot);
        Ok(())
    }

    pub fn create_channel(&self, subject: &Subject, request: ChannelRequest) -> ChannelResult<ChannelId> {
        self.authorize(subject, &request.execution, Permission::ManageChannel)?;

        let id = format!("ch-{}", Uuid::new_v4());
        let mut channel = Channel::new(
            id.clone(),
            request.execution,
            request.spec,
            request.policy.unwrap_or(self.inner.default_policy),
            request.consumers,
        );
        channel.declared_producer = request.producer;

        debug!(
            channel = %id,
            execution = %channel.execution,
            snapshot = channel.is_snapshot(),
            policy = ?channel.policy,
            "channel created"
        );

        self.inner
            .channels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), Arc::new(Mutex::new(channel)));
        Ok(id)
    }

    /// Bind `slot` to `channel` in `role`.
    ///
    /// All checks run before anything is mutated, so a refused bind leaves
    /// both the channel and the slot untouched. A slot still in PREPARING is
    /// promoted to UNBOUND first.
    pub fn bind(&self, subject: &Subject, channel_id: &str, slot_id: &str, role: Role) -> ChannelResult<BindOutcome> {
        self.authorize(subject, channel_id, Permission::ManageChannel)?;
        let handle = self.channel(channel_id)?;
        let mut ch = lock(&handle);
        if ch.is_closed() {
            return Err(ChannelError::closed(channel_id));
        }

        let mut slots = self.slots();
        let slot = slots
            .get(slot_id)
            .ok_or_else(|| ChannelError::not_found(channel_id, format!("unknown slot '{slot_id}'")))?;

        let expected_direction = match role {
            Role::Producer => SlotDirection::Output,
            Role::Consumer => SlotDirection::Input,
        };
        if slot.direction != expected_direction {
            return Err(ChannelError::conflict(
                channel_id,
                format!("{:?} slot '{slot_id}' cannot bind as {role:?}", slot.direction),
            ));
        }

        if slot.schema != *ch.spec.schema() {
            return Err(ChannelError::new(
                ChannelErrorKind::IncompatibleSchema,
                channel_id,
                format!(
                    "slot '{slot_id}' has schema '{}', channel carries '{}'",
                    slot.schema,
                    ch.spec.schema()
                ),
            ));
        }

        if ch.has_bound(slot_id) {
            let outcome = match slot.state() {
                SlotState::Open | SlotState::Suspended => BindOutcome::Opened,
                _ => BindOutcome::Pending,
            };
            return Ok(outcome);
        }

        match role {
            Role::Producer => {
                if let Some(current) = ch.producer_slot() {
                    return Err(ChannelError::conflict(
                        channel_id,
                        format!("producer role already bound to '{current}'"),
                    ));
                }
                if ch.producer_released {
                    return Err(ChannelError::conflict(channel_id, "producer already finished"));
                }
            }
            Role::Consumer => {
                if ch.finished_consumers.contains(slot_id) {
                    return Err(ChannelError::conflict(
                        channel_id,
                        format!("consumer '{slot_id}' already finished"),
                    ));
                }
            }
        }

        if let Some(owner) = slot.channel.as_deref().filter(|owner| *owner != channel_id) {
            return Err(ChannelError::conflict(
                channel_id,
                format!("slot '{slot_id}' is owned by channel '{owner}'"),
            ));
        }

        if !matches!(slot.state(), SlotState::Preparing | SlotState::Unbound) {
            return Err(ChannelError::new(
                ChannelErrorKind::InvalidTransition,
                channel_id,
                format!("slot '{slot_id}' is {:?}, expected UNBOUND", slot.state()),
            ));
        }

        // Checks passed; mutate.
        let mut opened = Vec::new();
        {
            let slot = slots
                .get_mut(slot_id)
                .ok_or_else(|| ChannelError::not_found(channel_id, format!("unknown slot '{slot_id}'")))?;
            if slot.state() == SlotState::Preparing {
                transition(slot, channel_id, SlotState::Unbound)?;
            }
            slot.channel = Some(ch.id.clone());
        }

        let outcome = match role {
            Role::Producer => {
                ch.origin = Some(slot_id.to_string());
                if ch.producer_can_connect() {
                    ch.producer = Some((slot_id.to_string(), EndpointStatus::Connected));
                    opened.push(slot_id.to_string());
                    opened.extend(connect_pending_consumers(&mut ch));
                    BindOutcome::Opened
                } else {
                    ch.producer = Some((slot_id.to_string(), EndpointStatus::Pending));
                    BindOutcome::Pending
                }
            }
            Role::Consumer => {
                if ch.consumer_can_connect() {
                    ch.consumers.insert(
                        slot_id.to_string(),
                        ConsumerEndpoint {
                            status: EndpointStatus::Connected,
                            cursor: 0,
                        },
                    );
                    opened.push(slot_id.to_string());
                    if let Some((producer, status)) = ch.producer.as_mut() {
                        if *status == EndpointStatus::Pending {
                            *status = EndpointStatus::Connected;
                            opened.push(producer.clone());
                        }
                    }
                    BindOutcome::Opened
                } else {
                    ch.consumers.insert(
                        slot_id.to_string(),
                        ConsumerEndpoint {
                            status: EndpointStatus::Pending,
                            cursor: 0,
                        },
                    );
                    BindOutcome::Pending
                }
            }
        };

        open_slots(&ch, &mut slots, &opened)?;

        debug!(channel = %channel_id, slot = %slot_id, ?role, ?outcome, "slot bound");
        Ok(outcome)
    }

    /// Release `slot` from `channel`. Idempotent.
    ///
    /// - A producer unbind seals the channel's data. For snapshot channels the
    ///   data is committed to storage and waiting consumers are opened.
    /// - A consumer unbind counts as that consumer having finished.
    /// - Unbinding a declared consumer that never bound withdraws it.
    ///
    /// Closes the channel when the close policy is satisfied.
    pub fn unbind(&self, subject: &Subject, channel_id: &str, slot_id: &str) -> ChannelResult<()> {
        self.authorize(subject, channel_id, Permission::ManageChannel)?;
        let handle = self.channel(channel_id)?;
        let mut ch = lock(&handle);

        if ch.is_closed() {
            return if ch.knows(slot_id) {
                Ok(())
            } else {
                Err(ChannelError::closed(channel_id))
            };
        }

        let mut slots = self.slots();

        if ch.producer_slot().map(String::as_str) == Some(slot_id) {
            if let Some(uri) = ch.spec.snapshot_uri().map(str::to_string) {
                self.inner.storage.put(&uri, &ch.buffer).map_err(|err| {
                    ChannelError::new(
                        ChannelErrorKind::Storage,
                        channel_id,
                        format!("committing snapshot '{uri}'"),
                    )
                    .with_cause(err)
                })?;
                let digest = blake3::hash(&ch.buffer).to_hex().to_string();
                info!(channel = %channel_id, uri = %uri, bytes = ch.buffer.len(), digest = %digest, "snapshot committed");
                ch.digest = Some(digest);
                ch.committed = true;
                ch.buffer.clear();
            }

            ch.sealed = true;
            ch.producer = None;
            ch.producer_released = true;
            if let Some(slot) = slots.get_mut(slot_id) {
                force_close(slot, channel_id);
            }

            let opened = connect_pending_consumers(&mut ch);
            open_slots(&ch, &mut slots, &opened)?;
            debug!(channel = %channel_id, slot = %slot_id, "producer unbound");
        } else if ch.consumers.remove(slot_id).is_some() {
            ch.finished_consumers.insert(slot_id.to_string());
            if let Some(slot) = slots.get_mut(slot_id) {
                force_close(slot, channel_id);
            }
            debug!(channel = %channel_id, slot = %slot_id, "consumer unbound");
        } else if ch.expected_consumers.contains(slot_id) && !ch.finished_consumers.contains(slot_id) {
            ch.finished_consumers.insert(slot_id.to_string());
            if let Some(slot) = slots.get_mut(slot_id) {
                if slot.channel.as_deref().is_none_or(|owner| owner == channel_id) {
                    force_close(slot, channel_id);
                }
            }
            debug!(channel = %channel_id, slot = %slot_id, "declared consumer withdrawn");
        }

        if ch.ready_to_close() {
            self.close_locked(&mut ch, &mut slots);
        }
        Ok(())
    }

    /// Force every slot of the channel to CLOSED and release the channel.
    ///
    /// The channel itself is kept as a tombstone so later binds fail with
    /// `Closed` rather than `NotFound`.
    pub fn close(&self, subject: &Subject, channel_id: &str) -> ChannelResult<()> {
        self.authorize(subject, channel_id, Permission::ManageChannel)?;
        let handle = self.channel(channel_id)?;
        let mut ch = lock(&handle);
        if ch.is_closed() {
            return Ok(());
        }
        let mut slots = self.slots();
        self.close_locked(&mut ch, &mut slots);
        Ok(())
    }

    fn close_locked(&self, ch: &mut Channel, slots: &mut HashMap<SlotId, Slot>) {
        let mut members: Vec<SlotId> = ch.endpoints().into_iter().map(|e| e.slot).collect();
        members.extend(ch.declared_producer.iter().cloned());
        members.extend(ch.expected_consumers.iter().cloned());

        for id in members {
            if let Some(slot) = slots.get_mut(&id) {
                if slot.channel.as_deref().is_none_or(|owner| owner == ch.id) {
                    force_close(slot, &ch.id);
                }
            }
        }

        if let Some(uri) = ch.spec.snapshot_uri() {
            if !ch.committed {
                if let Err(err) = self.inner.storage.remove(uri) {
                    warn!(channel = %ch.id, uri, error = %err, "failed to abort snapshot entry");
                }
            }
        }

        ch.producer = None;
        ch.consumers.clear();
        ch.buffer.clear();
        ch.state = ChannelState::Closed;
        info!(channel = %ch.id, execution = %ch.execution, "channel closed");
    }

    /// Consumer finished reading without unbinding.
    pub fn signal_end_of_data(&self, subject: &Subject, channel_id: &str, slot_id: &str) -> ChannelResult<()> {
        self.authorize(subject, channel_id, Permission::ManageChannel)?;
        let handle = self.channel(channel_id)?;
        let mut ch = lock(&handle);
        if ch.is_closed() {
            return Err(ChannelError::closed(channel_id));
        }

        let endpoint = ch.consumers.get_mut(slot_id).ok_or_else(|| {
            ChannelError::conflict(channel_id, format!("'{slot_id}' is not a bound consumer"))
        })?;
        endpoint.status = EndpointStatus::Finished;
        ch.finished_consumers.insert(slot_id.to_string());
        debug!(channel = %channel_id, slot = %slot_id, "consumer signalled end of data");

        if ch.ready_to_close() {
            let mut slots = self.slots();
            self.close_locked(&mut ch, &mut slots);
        }
        Ok(())
    }

    /// Append `chunk` to the channel the producer slot is bound to.
    pub fn write(&self, subject: &Subject, slot_id: &str, chunk: &[u8]) -> ChannelResult<u64> {
        self.authorize(subject, slot_id, Permission::ManageChannel)?;
        let channel_id = self
            .owner_of(slot_id)?
            .ok_or_else(|| ChannelError::conflict(slot_id, "slot is not bound"))?;
        let handle = self.channel(&channel_id)?;
        let mut ch = lock(&handle);

        if ch.is_closed() {
            return Err(ChannelError::closed(&channel_id));
        }
        if ch.producer_slot().map(String::as_str) != Some(slot_id) {
            return Err(ChannelError::conflict(
                &channel_id,
                format!("'{slot_id}' is not the bound producer"),
            ));
        }
        if ch.sealed {
            return Err(ChannelError::new(
                ChannelErrorKind::InvalidTransition,
                &channel_id,
                "channel data already sealed",
            ));
        }

        let mut slots = self.slots();
        let slot = slots
            .get_mut(slot_id)
            .ok_or_else(|| ChannelError::not_found(&channel_id, format!("unknown slot '{slot_id}'")))?;
        if !matches!(slot.state(), SlotState::Unbound | SlotState::Open) {
            return Err(ChannelError::new(
                ChannelErrorKind::InvalidTransition,
                &channel_id,
                format!("cannot write through {:?} slot '{slot_id}'", slot.state()),
            ));
        }

        ch.buffer.extend_from_slice(chunk);
        Ok(slot.advance_pointer(chunk.len() as u64))
    }

    /// Read the next available data through an OPEN consumer slot.
    pub fn read(&self, subject: &Subject, slot_id: &str) -> ChannelResult<ReadOutcome> {
        self.authorize(subject, slot_id, Permission::ReadChannel)?;
        let channel_id = self
            .owner_of(slot_id)?
            .ok_or_else(|| ChannelError::conflict(slot_id, "slot is not bound"))?;
        let handle = self.channel(&channel_id)?;
        let mut ch = lock(&handle);
        if ch.is_closed() {
            return Err(ChannelError::closed(&channel_id));
        }

        let cursor = ch
            .consumers
            .get(slot_id)
            .map(|c| c.cursor)
            .ok_or_else(|| ChannelError::conflict(&channel_id, format!("'{slot_id}' is not a bound consumer")))?;

        let mut slots = self.slots();
        let slot = slots
            .get_mut(slot_id)
            .ok_or_else(|| ChannelError::not_found(&channel_id, format!("unknown slot '{slot_id}'")))?;
        if slot.state() != SlotState::Open {
            return Err(ChannelError::new(
                ChannelErrorKind::InvalidTransition,
                &channel_id,
                format!("cannot read through {:?} slot '{slot_id}'", slot.state()),
            ));
        }

        let data = match ch.spec.snapshot_uri() {
            Some(uri) => {
                let object = self
                    .inner
                    .storage
                    .get(uri)
                    .map_err(|err| {
                        ChannelError::new(ChannelErrorKind::Storage, &channel_id, format!("reading '{uri}'"))
                            .with_cause(err)
                    })?
                    .ok_or_else(|| {
                        ChannelError::new(
                            ChannelErrorKind::Storage,
                            &channel_id,
                            format!("snapshot object '{uri}' is missing"),
                        )
                    })?;
                let start = usize::try_from(cursor).unwrap_or(usize::MAX).min(object.len());
                object[start..].to_vec()
            }
            None => ch.available_from(cursor).to_vec(),
        };

        if data.is_empty() {
            return Ok(if ch.sealed {
                ReadOutcome::EndOfData
            } else {
                ReadOutcome::Pending
            });
        }

        let moved = data.len() as u64;
        if let Some(endpoint) = ch.consumers.get_mut(slot_id) {
            endpoint.cursor += moved;
        }
        slot.advance_pointer(moved);
        Ok(ReadOutcome::Data(data))
    }

    /// Everything currently readable through `slot`, stopping at end of data
    /// or when the producer has nothing more buffered.
    pub fn read_to_end(&self, subject: &Subject, slot_id: &str) -> ChannelResult<Vec<u8>> {
        let mut out = Vec::new();
        while let ReadOutcome::Data(chunk) = self.read(subject, slot_id)? {
            out.extend(chunk);
        }
        Ok(out)
    }

    /// OPEN -> SUSPENDED.
    pub fn suspend(&self, subject: &Subject, slot_id: &str) -> ChannelResult<()> {
        self.authorize(subject, slot_id, Permission::ManageChannel)?;
        let owner = self
            .owner_of(slot_id)?
            .ok_or_else(|| ChannelError::conflict(slot_id, "slot is not bound"))?;
        let handle = self.channel(&owner)?;
        let _ch = lock(&handle);

        let mut slots = self.slots();
        let slot = slots
            .get_mut(slot_id)
            .ok_or_else(|| ChannelError::not_found(&owner, format!("unknown slot '{slot_id}'")))?;
        transition(slot, &owner, SlotState::Suspended)
    }

    /// SUSPENDED -> OPEN. A resumed consumer reads again from the start.
    pub fn resume(&self, subject: &Subject, slot_id: &str) -> ChannelResult<()> {
        self.authorize(subject, slot_id, Permission::ManageChannel)?;
        let owner = self
            .owner_of(slot_id)?
            .ok_or_else(|| ChannelError::conflict(slot_id, "slot is not bound"))?;
        let handle = self.channel(&owner)?;
        let mut ch = lock(&handle);

        let mut slots = self.slots();
        let slot = slots
            .get_mut(slot_id)
            .ok_or_else(|| ChannelError::not_found(&owner, format!("unknown slot '{slot_id}'")))?;
        transition(slot, &owner, SlotState::Open)?;

        if let Some(endpoint) = ch.consumers.get_mut(slot_id) {
            endpoint.cursor = 0;
        }
        Ok(())
    }

    /// Discard data written by a failed producer attempt.
    pub fn reset_producer(&self, subject: &Subject, slot_id: &str) -> ChannelResult<()> {
        self.authorize(subject, slot_id, Permission::ManageChannel)?;
        let Some(owner) = self.owner_of(slot_id)? else {
            return Ok(());
        };
        let handle = self.channel(&owner)?;
        let mut ch = lock(&handle);
        if ch.producer_slot().map(String::as_str) != Some(slot_id) {
            return Ok(());
        }
        if ch.sealed {
            return Err(ChannelError::new(
                ChannelErrorKind::InvalidTransition,
                &owner,
                "producer output already sealed",
            ));
        }
        debug!(channel = %owner, slot = %slot_id, discarded = ch.buffer.len(), "producer output reset");
        ch.buffer.clear();
        Ok(())
    }

    /// Force a slot to CLOSED. Used for slots torn down before ever binding.
    pub fn close_slot(&self, subject: &Subject, slot_id: &str) -> ChannelResult<()> {
        self.authorize(subject, slot_id, Permission::ManageChannel)?;
        let mut slots = self.slots();
        let slot = slots
            .get_mut(slot_id)
            .ok_or_else(|| ChannelError::not_found(slot_id, format!("unknown slot '{slot_id}'")))?;
        let owner = slot.channel.clone().unwrap_or_default();
        force_close(slot, &owner);
        Ok(())
    }

    pub fn slot_status(&self, subject: &Subject, slot_id: &str) -> ChannelResult<SlotStatus> {
        self.authorize(subject, slot_id, Permission::ReadChannel)?;
        self.slots()
            .get(slot_id)
            .map(Slot::status)
            .ok_or_else(|| ChannelError::not_found(slot_id, format!("unknown slot '{slot_id}'")))
    }

    pub fn slot_history(&self, subject: &Subject, slot_id: &str) -> ChannelResult<Vec<SlotState>> {
        self.authorize(subject, slot_id, Permission::ReadChannel)?;
        self.slots()
            .get(slot_id)
            .map(|s| s.history().to_vec())
            .ok_or_else(|| ChannelError::not_found(slot_id, format!("unknown slot '{slot_id}'")))
    }

    /// Whether `slot` is currently bound to a live channel.
    pub fn has_bound(&self, subject: &Subject, slot_id: &str) -> ChannelResult<bool> {
        self.authorize(subject, slot_id, Permission::ReadChannel)?;
        let Some(owner) = self.owner_of(slot_id)? else {
            return Ok(false);
        };
        let handle = self.channel(&owner)?;
        let ch = lock(&handle);
        Ok(!ch.is_closed() && ch.has_bound(slot_id))
    }

    pub fn bound_endpoints(&self, subject: &Subject, channel_id: &str) -> ChannelResult<Vec<Endpoint>> {
        self.authorize(subject, channel_id, Permission::ReadChannel)?;
        let handle = self.channel(channel_id)?;
        let ch = lock(&handle);
        Ok(ch.endpoints())
    }

    pub fn channel_state(&self, subject: &Subject, channel_id: &str) -> ChannelResult<ChannelState> {
        self.authorize(subject, channel_id, Permission::ReadChannel)?;
        let handle = self.channel(channel_id)?;
        let ch = lock(&handle);
        Ok(ch.state())
    }

    /// Content digest of a committed snapshot.
    pub fn snapshot_digest(&self, subject: &Subject, channel_id: &str) -> ChannelResult<Option<String>> {
        self.authorize(subject, channel_id, Permission::ReadChannel)?;
        let handle = self.channel(channel_id)?;
        let ch = lock(&handle);
        Ok(ch.digest.clone())
    }

    /// State of every channel of an execution.
    pub fn channel_states(&self, subject: &Subject, execution: &str) -> ChannelResult<BTreeMap<ChannelId, ChannelState>> {
        self.authorize(subject, execution, Permission::ReadChannel)?;
        Ok(self
            .execution_channels(execution)
            .into_iter()
            .map(|handle| {
                let ch = lock(&handle);
                (ch.id.clone(), ch.state())
            })
            .collect())
    }

    fn execution_channels(&self, execution: &str) -> Vec<Arc<Mutex<Channel>>> {
        let channels = self
            .inner
            .channels
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        channels
            .values()
            .filter(|handle| lock(handle).execution == execution)
            .cloned()
            .collect()
    }

    /// Copy of every channel and slot of `execution`, for persistence.
    pub fn export_execution(&self, execution: &str) -> ChannelRecords {
        let mut channels: Vec<Channel> = self
            .execution_channels(execution)
            .into_iter()
            .map(|handle| lock(&handle).clone())
            .collect();
        channels.sort_by(|a, b| a.id.cmp(&b.id));

        let mut slots: Vec<Slot> = self
            .slots()
            .values()
            .filter(|s| s.execution == execution)
            .cloned()
            .collect();
        slots.sort_by(|a, b| a.id.cmp(&b.id));

        ChannelRecords { channels, slots }
    }

    /// Re-install persisted channels and slots, replacing any with the same id.
    pub fn restore(&self, records: ChannelRecords) {
        {
            let mut channels = self
                .inner
                .channels
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            for ch in records.channels {
                channels.insert(ch.id.clone(), Arc::new(Mutex::new(ch)));
            }
        }
        let mut slots = self.slots();
        for slot in records.slots {
            slots.insert(slot.id.clone(), slot);
        }
    }

    /// Drop every channel and slot of a finished execution.
    pub fn release_execution(&self, execution: &str) {
        let removed = {
            let mut channels = self
                .inner
                .channels
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let before = channels.len();
            channels.retain(|_, handle| lock(handle).execution != execution);
            before - channels.len()
        };
        self.slots().retain(|_, s| s.execution != execution);
        debug!(execution, channels = removed, "execution channels released");
    }
}

/// Connect every pending consumer whose pair is now complete.
fn connect_pending_consumers(ch: &mut Channel) -> Vec<SlotId> {
    if !ch.consumer_can_connect() {
        return Vec::new();
    }
    let mut opened = Vec::new();
    for (slot, endpoint) in ch.consumers.iter_mut() {
        if endpoint.status == EndpointStatus::Pending {
            endpoint.status = EndpointStatus::Connected;
            opened.push(slot.clone());
        }
    }
    opened
}

/// Move freshly connected slots to OPEN and record their peer.
fn open_slots(ch: &Channel, slots: &mut HashMap<SlotId, Slot>, opened: &[SlotId]) -> ChannelResult<()> {
    let first_consumer = ch.consumers.keys().next().cloned();
    for id in opened {
        let Some(slot) = slots.get_mut(id) else {
            continue;
        };
        let peer = match (ch.spec.snapshot_uri(), slot.direction) {
            (Some(uri), _) => Some(uri.to_string()),
            (None, SlotDirection::Input) => ch.origin.clone(),
            (None, SlotDirection::Output) => first_consumer.clone(),
        };
        slot.connected_uri = peer;
        if slot.state() == SlotState::Unbound {
            transition(slot, &ch.id, SlotState::Open)?;
        }
    }
    if !opened.is_empty() {
        info!(channel = %ch.id, slots = ?opened, "channel endpoints opened");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::spec::DataSchema;
    use crate::types::slot_uri;

    fn text() -> DataSchema {
        DataSchema::new("text")
    }

    fn setup(snapshot: bool) -> (ChannelManager, ChannelId) {
        let mgr = ChannelManager::in_memory();
        let sys = Subject::system();
        for (task, name, dir) in [
            ("A", "out", SlotDirection::Output),
            ("B", "in", SlotDirection::Input),
        ] {
            mgr.register_slot(&sys, Slot::new(slot_uri("e", task, name), name, "e", task, dir, text()))
                .unwrap();
        }
        let spec = if snapshot {
            ChannelSpec::snapshot(text(), "snapshot://e/A/out")
        } else {
            ChannelSpec::direct(text())
        };
        let request = ChannelRequest::new("e", spec)
            .producer(slot_uri("e", "A", "out"))
            .consumer(slot_uri("e", "B", "in"));
        let id = mgr.create_channel(&sys, request).unwrap();
        (mgr, id)
    }

    #[test]
    fn second_binder_opens_the_pair() {
        let (mgr, ch) = setup(false);
        let sys = Subject::system();
        let out = slot_uri("e", "A", "out");
        let inp = slot_uri("e", "B", "in");

        assert_eq!(mgr.bind(&sys, &ch, &out, Role::Producer).unwrap(), BindOutcome::Pending);
        assert_eq!(mgr.slot_status(&sys, &out).unwrap().state, SlotState::Unbound);
        assert_eq!(mgr.bind(&sys, &ch, &inp, Role::Consumer).unwrap(), BindOutcome::Opened);

        assert_eq!(mgr.slot_status(&sys, &out).unwrap().state, SlotState::Open);
        let status = mgr.slot_status(&sys, &inp).unwrap();
        assert_eq!(status.state, SlotState::Open);
        assert_eq!(status.connected_uri.as_deref(), Some(out.as_str()));
    }

    #[test]
    fn suspend_needs_a_bound_slot() {
        let (mgr, _) = setup(false);
        let sys = Subject::system();
        let out = slot_uri("e", "A", "out");

        let err = mgr.suspend(&sys, &out).unwrap_err();
        assert_eq!(err.kind, ChannelErrorKind::Conflict);
        assert_eq!(mgr.slot_status(&sys, &out).unwrap().state, SlotState::Preparing);
    }

    #[test]
    fn suspend_and_resume_race_with_close_without_reopening() {
        for _ in 0..20 {
            let (mgr, ch) = setup(false);
            let sys = Subject::system();
            let out = slot_uri("e", "A", "out");
            let inp = slot_uri("e", "B", "in");
            mgr.bind(&sys, &ch, &out, Role::Producer).unwrap();
            mgr.bind(&sys, &ch, &inp, Role::Consumer).unwrap();

            let flapper = {
                let (mgr, inp) = (mgr.clone(), inp.clone());
                std::thread::spawn(move || {
                    let sys = Subject::system();
                    for _ in 0..100 {
                        if mgr.suspend(&sys, &inp).is_err() || mgr.resume(&sys, &inp).is_err() {
                            break;
                        }
                    }
                })
            };
            mgr.close(&sys, &ch).unwrap();
            flapper.join().unwrap();

            let history = mgr.slot_history(&sys, &inp).unwrap();
            assert_eq!(history.last(), Some(&SlotState::Closed), "{history:?}");
            assert_eq!(history.iter().filter(|s| **s == SlotState::Closed).count(), 1);
        }
    }

    #[test]
    fn data_flows_and_channel_closes_after_both_unbind() {
        let (mgr, ch) = setup(false);
        let sys = Subject::system();
        let out = slot_uri("e", "A", "out");
        let inp = slot_uri("e", "B", "in");

        mgr.bind(&sys, &ch, &out, Role::Producer).unwrap();
        mgr.write(&sys, &out, b"hello ").unwrap();
        mgr.bind(&sys, &ch, &inp, Role::Consumer).unwrap();
        mgr.write(&sys, &out, b"world").unwrap();
        assert_eq!(mgr.read_to_end(&sys, &inp).unwrap(), b"hello world");
        assert_eq!(mgr.read(&sys, &inp).unwrap(), ReadOutcome::Pending);

        mgr.unbind(&sys, &ch, &out).unwrap();
        assert_eq!(mgr.read(&sys, &inp).unwrap(), ReadOutcome::EndOfData);
        assert_eq!(mgr.channel_state(&sys, &ch).unwrap(), ChannelState::Alive);

        mgr.unbind(&sys, &ch, &inp).unwrap();
        assert_eq!(mgr.channel_state(&sys, &ch).unwrap(), ChannelState::Closed);
        assert_eq!(mgr.slot_status(&sys, &inp).unwrap().pointer, 11);
        assert_eq!(mgr.slot_status(&sys, &out).unwrap().pointer, 11);

        // Idempotent on the closed channel.
        mgr.unbind(&sys, &ch, &inp).unwrap();
    }

    #[test]
    fn snapshot_commits_on_producer_unbind() {
        let (mgr, ch) = setup(true);
        let sys = Subject::system();
        let out = slot_uri("e", "A", "out");
        let inp = slot_uri("e", "B", "in");

        assert_eq!(mgr.bind(&sys, &ch, &out, Role::Producer).unwrap(), BindOutcome::Opened);
        mgr.write(&sys, &out, b"rows").unwrap();
        assert_eq!(mgr.bind(&sys, &ch, &inp, Role::Consumer).unwrap(), BindOutcome::Pending);
        assert!(!mgr.storage().contains("snapshot://e/A/out"));

        mgr.unbind(&sys, &ch, &out).unwrap();
        assert!(mgr.storage().contains("snapshot://e/A/out"));
        let status = mgr.slot_status(&sys, &inp).unwrap();
        assert_eq!(status.state, SlotState::Open);
        assert_eq!(status.connected_uri.as_deref(), Some("snapshot://e/A/out"));
        assert_eq!(mgr.read_to_end(&sys, &inp).unwrap(), b"rows");
        assert_eq!(
            mgr.snapshot_digest(&sys, &ch).unwrap(),
            Some(blake3::hash(b"rows").to_hex().to_string())
        );
    }

    #[test]
    fn closing_uncommitted_snapshot_aborts_the_entry() {
        let (mgr, ch) = setup(true);
        let sys = Subject::system();
        mgr.storage().put("snapshot://e/A/out", b"stale").unwrap();
        mgr.bind(&sys, &ch, &slot_uri("e", "A", "out"), Role::Producer).unwrap();
        mgr.close(&sys, &ch).unwrap();
        assert!(!mgr.storage().contains("snapshot://e/A/out"));
        assert_eq!(
            mgr.slot_status(&sys, &slot_uri("e", "B", "in")).unwrap().state,
            SlotState::Closed
        );
    }

    #[test]
    fn suspend_and_resume_rewinds_consumer() {
        let (mgr, ch) = setup(false);
        let sys = Subject::system();
        let out = slot_uri("e", "A", "out");
        let inp = slot_uri("e", "B", "in");
        mgr.bind(&sys, &ch, &out, Role::Producer).unwrap();
        mgr.write(&sys, &out, b"abc").unwrap();
        mgr.bind(&sys, &ch, &inp, Role::Consumer).unwrap();
        mgr.unbind(&sys, &ch, &out).unwrap();
        assert_eq!(mgr.read_to_end(&sys, &inp).unwrap(), b"abc");

        mgr.suspend(&sys, &inp).unwrap();
        assert!(mgr.read(&sys, &inp).is_err());
        mgr.resume(&sys, &inp).unwrap();
        assert_eq!(mgr.read_to_end(&sys, &inp).unwrap(), b"abc");
        assert_eq!(mgr.slot_status(&sys, &inp).unwrap().pointer, 6);
    }

    #[test]
    fn export_and_restore_round_trip_state() {
        let (mgr, ch) = setup(false);
        let sys = Subject::system();
        mgr.bind(&sys, &ch, &slot_uri("e", "A", "out"), Role::Producer).unwrap();
        let records = mgr.export_execution("e");
        assert_eq!(records.channels.len(), 1);
        assert_eq!(records.slots.len(), 2);

        let fresh = ChannelManager::in_memory();
        fresh.restore(records.clone());
        assert_eq!(fresh.export_execution("e"), records);

        fresh.release_execution("e");
        assert!(fresh.export_execution("e").channels.is_empty());
    }
}
