use std::collections::HashSet;
use std::fmt;

use thiserror::Error;

use super::message::Message;
use super::role::Role;

/// Identifies one user submission and every model/tool round trip it causes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct TurnId(pub u64);

impl TurnId {
    pub fn next(self) -> TurnId {
        TurnId(self.0 + 1)
    }
}

impl fmt::Display for TurnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "turn-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingSlot {
    turn: TurnId,
    index: usize,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConversationError {
    #[error("A placeholder for {0} is already open")]
    PendingSlotOccupied(TurnId),

    #[error("No placeholder is open")]
    NoPendingSlot,

    #[error("The open placeholder belongs to {open}, not {requested}")]
    TurnMismatch { open: TurnId, requested: TurnId },
}

/// The ordered transcript shared with the model.
///
/// Messages are only ever appended, with one exception: the assistant placeholder
/// opened for a turn is replaced in place once the model answers.
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    messages: Vec<Message>,
    pending: Option<PendingSlot>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every message, including an open placeholder
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub(crate) fn last_mut(&mut self) -> Option<&mut Message> {
        self.messages.last_mut()
    }

    /// A copy of the transcript suitable for a model call, without the placeholder
    pub fn snapshot(&self) -> Vec<Message> {
        match self.pending {
            Some(slot) => self
                .messages
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != slot.index)
                .map(|(_, m)| m.clone())
                .collect(),
            None => self.messages.clone(),
        }
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Remove the last message if it is a user message and no placeholder is open.
    pub fn withdraw_last_user(&mut self) -> Option<Message> {
        if self.pending.is_some() {
            return None;
        }
        match self.messages.last() {
            Some(message) if message.role == Role::User => self.messages.pop(),
            _ => None,
        }
    }

    pub fn open_pending(&mut self, turn: TurnId) -> Result<(), ConversationError> {
        if let Some(slot) = self.pending {
            return Err(ConversationError::PendingSlotOccupied(slot.turn));
        }
        self.pending = Some(PendingSlot {
            turn,
            index: self.messages.len(),
        });
        self.messages.push(Message::pending());
        Ok(())
    }

    /// Replace the placeholder of `turn` with the real reply.
    pub fn fill_pending(&mut self, turn: TurnId, message: Message) -> Result<(), ConversationError> {
        let slot = self.take_slot(turn)?;
        self.messages[slot.index] = message;
        Ok(())
    }

    /// Drop the placeholder of `turn` without a reply.
    pub fn discard_pending(&mut self, turn: TurnId) -> Result<(), ConversationError> {
        let slot = self.take_slot(turn)?;
        self.messages.remove(slot.index);
        Ok(())
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn pending_turn(&self) -> Option<TurnId> {
        self.pending.map(|slot| slot.turn)
    }

    /// Ids of tool requests that have no matching tool response anywhere after them
    pub fn unanswered_tool_uses(&self) -> Vec<String> {
        let answered: HashSet<&str> = self
            .messages
            .iter()
            .flat_map(|m| m.tool_responses())
            .map(|r| r.id.as_str())
            .collect();
        self.messages
            .iter()
            .flat_map(|m| m.tool_requests())
            .filter(|r| !answered.contains(r.id.as_str()))
            .map(|r| r.id.clone())
            .collect()
    }

    fn take_slot(&mut self, turn: TurnId) -> Result<PendingSlot, ConversationError> {
        match self.pending {
            None => Err(ConversationError::NoPendingSlot),
            Some(slot) if slot.turn != turn => Err(ConversationError::TurnMismatch {
                open: slot.turn,
                requested: turn,
            }),
            Some(slot) => {
                self.pending = None;
                Ok(slot)
            }
        }
    }
}
