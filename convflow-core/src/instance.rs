//! Conversation instance state.

use crate::definition::StateId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a conversation: one user in one chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceKey {
    pub chat_id: i64,
    pub user_id: i64,
}

impl InstanceKey {
    pub fn new(chat_id: i64, user_id: i64) -> Self {
        Self { chat_id, user_id }
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.chat_id, self.user_id)
    }
}

/// Where an instance currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "status", content = "state")]
pub enum CurrentState {
    /// Waiting for an answer in the given state.
    Active(StateId),
    /// Completed or cancelled. Absorbing.
    Ended,
}

/// A conversation in progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationInstance {
    /// Conversation identity.
    pub key: InstanceKey,

    /// Current position in the flow.
    pub current: CurrentState,

    /// Number of accepted transitions.
    pub steps: u64,

    /// Creation timestamp (Unix millis).
    pub created_at: i64,

    /// Last update timestamp (Unix millis).
    pub updated_at: i64,
}

impl ConversationInstance {
    /// Creates an instance waiting in `entry_state`.
    pub fn new(key: InstanceKey, entry_state: StateId) -> Self {
        let now = now_millis();
        Self {
            key,
            current: CurrentState::Active(entry_state),
            steps: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Moves to `next`. Has no effect once ended.
    pub fn advance(&mut self, next: StateId) {
        if self.is_ended() {
            return;
        }
        self.current = CurrentState::Active(next);
        self.steps += 1;
        self.touch();
    }

    /// Ends the instance.
    pub fn end(&mut self) {
        if self.is_ended() {
            return;
        }
        self.current = CurrentState::Ended;
        self.touch();
    }

    /// Records activity without changing state.
    pub fn touch(&mut self) {
        self.updated_at = now_millis();
    }

    /// Returns the state the instance is waiting in, if any.
    pub fn state(&self) -> Option<StateId> {
        match self.current {
            CurrentState::Active(state) => Some(state),
            CurrentState::Ended => None,
        }
    }

    pub fn is_ended(&self) -> bool {
        self.current == CurrentState::Ended
    }

    /// Milliseconds since the last recorded activity.
    pub fn idle_millis(&self) -> i64 {
        (now_millis() - self.updated_at).max(0)
    }
}

pub(crate) fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
