// src/channel/slot.rs

//! Slot descriptors and their lifecycle state machine.
//!
//! ```text
//! PREPARING -> UNBOUND -> OPEN -> CLOSED
//!                          ^  |
//!                          |  v
//!                       SUSPENDED
//! ```
//!
//! Any non-terminal state may be forced to `CLOSED`. `CLOSED` is terminal.

use serde::{Deserialize, Serialize};

use crate::channel::spec::DataSchema;
use crate::types::{ChannelId, ExecutionId, SlotId, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SlotDirection {
    Input,
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SlotState {
    Preparing,
    Unbound,
    Open,
    Suspended,
    Closed,
}

impl SlotState {
    pub fn is_terminal(self) -> bool {
        self == SlotState::Closed
    }

    pub fn can_transition_to(self, next: SlotState) -> bool {
        use SlotState::*;
        matches!(
            (self, next),
            (Preparing, Unbound)
                | (Unbound, Open)
                | (Open, Suspended)
                | (Suspended, Open)
                | (Preparing | Unbound | Open | Suspended, Closed)
        )
    }
}

/// A named data endpoint of a task.
///
/// Slots are referenced by id everywhere else; the channel manager owns the
/// only mutable copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Slot {
    pub id: SlotId,
    pub name: String,
    pub execution: ExecutionId,
    pub task: TaskId,
    pub direction: SlotDirection,
    pub schema: DataSchema,
    state: SlotState,
    /// Channel currently owning this slot.
    pub channel: Option<ChannelId>,
    /// URI of the peer (producer slot, or storage object for snapshots).
    pub connected_uri: Option<String>,
    /// Bytes moved through this slot. Never decreases.
    pointer: u64,
    history: Vec<SlotState>,
}

impl Slot {
    pub fn new(
        id: SlotId,
        name: impl Into<String>,
        execution: impl Into<ExecutionId>,
        task: impl Into<TaskId>,
        direction: SlotDirection,
        schema: DataSchema,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            execution: execution.into(),
            task: task.into(),
            direction,
            schema,
            state: SlotState::Preparing,
            channel: None,
            connected_uri: None,
            pointer: 0,
            history: vec![SlotState::Preparing],
        }
    }

    pub fn state(&self) -> SlotState {
        self.state
    }

    pub fn pointer(&self) -> u64 {
        self.pointer
    }

    /// Every state this slot has been in, oldest first.
    pub fn history(&self) -> &[SlotState] {
        &self.history
    }

    /// Apply a lifecycle transition. Returns the refused pair on error.
    pub fn transition(&mut self, next: SlotState) -> Result<(), (SlotState, SlotState)> {
        if !self.state.can_transition_to(next) {
            return Err((self.state, next));
        }
        self.state = next;
        self.history.push(next);
        Ok(())
    }

    pub fn advance_pointer(&mut self, bytes: u64) -> u64 {
        self.pointer = self.pointer.saturating_add(bytes);
        self.pointer
    }

    pub fn status(&self) -> SlotStatus {
        SlotStatus {
            slot: self.id.clone(),
            channel_id: self.channel.clone(),
            connected_uri: self.connected_uri.clone(),
            pointer: self.pointer,
            state: self.state,
        }
    }
}

/// Read-only view returned by `get_slot_status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotStatus {
    pub slot: SlotId,
    pub channel_id: Option<ChannelId>,
    pub connected_uri: Option<String>,
    pub pointer: u64,
    pub state: SlotState,
}

#[cfg(test)]
mod tests {
    use super::*;
    use SlotState::*;

    fn slot() -> Slot {
        Slot::new(
            "slot://e/A/out".into(),
            "out",
            "e",
            "A",
            SlotDirection::Output,
            DataSchema::new("text"),
        )
    }

    #[test]
    fn happy_path_with_suspension() {
        let mut s = slot();
        for next in [Unbound, Open, Suspended, Open, Closed] {
            s.transition(next).unwrap();
        }
        assert_eq!(s.history(), &[Preparing, Unbound, Open, Suspended, Open, Closed]);
    }

    #[test]
    fn closed_is_terminal() {
        let mut s = slot();
        s.transition(Closed).unwrap();
        for next in [Preparing, Unbound, Open, Suspended, Closed] {
            assert_eq!(s.transition(next), Err((Closed, next)));
        }
        assert_eq!(s.history(), &[Preparing, Closed]);
    }

    #[test]
    fn no_skipping_or_going_back() {
        let mut s = slot();
        assert!(s.transition(Open).is_err());
        s.transition(Unbound).unwrap();
        assert!(s.transition(Preparing).is_err());
        assert!(s.transition(Suspended).is_err());
    }

    /// Valid histories read PREPARING, UNBOUND, OPEN, (SUSPENDED, OPEN)*, CLOSED
    /// with any suffix cut off before CLOSED.
    fn is_valid_history(history: &[SlotState]) -> bool {
        let mut expected = Preparing;
        for (i, state) in history.iter().enumerate() {
            if i > 0 && history[i - 1] == Closed {
                return false;
            }
            if *state == Closed && i > 0 {
                continue;
            }
            if *state != expected {
                return false;
            }
            expected = match state {
                Preparing => Unbound,
                Unbound | Suspended => Open,
                Open => Suspended,
                Closed => Closed,
            };
        }
        true
    }

    proptest::proptest! {
        #[test]
        fn any_transition_sequence_keeps_a_valid_history(
            attempts in proptest::collection::vec(0usize..5, 0..40)
        ) {
            let states = [Preparing, Unbound, Open, Suspended, Closed];
            let mut s = slot();
            for i in attempts {
                let _ = s.transition(states[i]);
            }
            proptest::prop_assert!(is_valid_history(s.history()), "{:?}", s.history());
        }
    }

    #[test]
    fn pointer_only_grows() {
        let mut s = slot();
        assert_eq!(s.advance_pointer(5), 5);
        assert_eq!(s.advance_pointer(0), 5);
        assert_eq!(s.advance_pointer(3), 8);
    }
}
