//! JSON-lines message types exchanged with chat transports.

use convflow_core::{DispatchResult, InstanceKey, PromptAction};
use serde::{Deserialize, Serialize};

/// An incoming chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingMessage {
    pub chat_id: i64,
    pub user_id: i64,
    pub text: String,
}

impl IncomingMessage {
    pub fn new(chat_id: i64, user_id: i64, text: impl Into<String>) -> Self {
        Self {
            chat_id,
            user_id,
            text: text.into(),
        }
    }

    pub fn key(&self) -> InstanceKey {
        InstanceKey::new(self.chat_id, self.user_id)
    }
}

/// A reply directive for the transport to deliver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingReply {
    pub chat_id: i64,
    pub user_id: i64,
    pub text: String,

    /// Keyboard rows to present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyboard: Option<Vec<Vec<String>>>,

    /// Keyboards are hidden after the first selection.
    #[serde(default)]
    pub one_time_keyboard: bool,

    /// Remove any keyboard shown earlier.
    #[serde(default)]
    pub remove_keyboard: bool,

    /// Dispatch outcome that produced this reply.
    pub result: String,
}

impl OutgoingReply {
    /// Renders a prompt for the conversation `key`.
    pub fn render(key: InstanceKey, action: PromptAction, result: DispatchResult) -> Self {
        let keyboard = if action.clear_keyboard {
            None
        } else {
            action.options.filter(|rows| !rows.is_empty())
        };
        Self {
            chat_id: key.chat_id,
            user_id: key.user_id,
            text: action.text,
            one_time_keyboard: keyboard.is_some(),
            keyboard,
            remove_keyboard: action.clear_keyboard,
            result: result.as_str().to_string(),
        }
    }
}

/// Error line sent for requests that cannot be processed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorLine {
    pub error: String,
    pub code: String,
}
