use crate::types::{Feedback, Role, Turn};
use std::ops::Deref;
use std::sync::Arc;

/// Local cache of a conversation's turns.
///
/// Immutable: every change produces a new value, and reconciliation swaps the
/// whole thing for the server's copy. Clones share the same allocation, so a
/// snapshot handed to a view never observes a half-applied update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transcript {
    turns: Arc<[Turn]>,
}

impl Transcript {
    pub fn new(turns: Vec<Turn>) -> Self {
        Self {
            turns: turns.into(),
        }
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn with_appended(&self, turn: Turn) -> Self {
        let mut turns = self.turns.to_vec();
        turns.push(turn);
        Self::new(turns)
    }

    /// Drops the final turn if it is an assistant reply.
    pub fn without_trailing_assistant(&self) -> Self {
        match self.turns.last() {
            Some(last) if last.role == Role::Assistant => {
                Self::new(self.turns[..self.turns.len() - 1].to_vec())
            }
            _ => self.clone(),
        }
    }

    /// First `len` turns; the whole transcript when it is shorter.
    pub fn truncated(&self, len: usize) -> Self {
        if len >= self.turns.len() {
            return self.clone();
        }
        Self::new(self.turns[..len].to_vec())
    }

    /// Returns a copy with `feedback` set on the turn with `message_id`, or
    /// `None` when no such turn is cached.
    pub fn with_feedback(&self, message_id: &str, feedback: Feedback) -> Option<Self> {
        let index = self.turns.iter().position(|t| t.id == message_id)?;
        let mut turns = self.turns.to_vec();
        turns[index].feedback = Some(feedback);
        Some(Self::new(turns))
    }

    pub fn assistant_count(&self) -> usize {
        self.turns
            .iter()
            .filter(|t| t.role == Role::Assistant)
            .count()
    }

    pub fn last_user_turn(&self) -> Option<&Turn> {
        self.turns.iter().rev().find(|t| t.role == Role::User)
    }

    pub fn last_assistant_turn(&self) -> Option<&Turn> {
        self.turns.iter().rev().find(|t| t.role == Role::Assistant)
    }
}

impl Default for Transcript {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl Deref for Transcript {
    type Target = [Turn];

    fn deref(&self) -> &[Turn] {
        &self.turns
    }
}

impl From<Vec<Turn>> for Transcript {
    fn from(turns: Vec<Turn>) -> Self {
        Self::new(turns)
    }
}

/// Provisional id for a turn the server has not acknowledged yet.
pub fn local_turn_id() -> String {
    format!("local-{}", uuid::Uuid::new_v4().simple())
}

pub fn is_local_turn_id(id: &str) -> bool {
    id.starts_with("local-")
}
