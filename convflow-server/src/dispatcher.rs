//! Message dispatch - routes transport input to the conversation runtime.

use crate::error::ServerError;
use crate::message::{IncomingMessage, OutgoingReply};
use convflow_core::{ConversationRuntime, DispatchResult};
use std::sync::Arc;

/// Routes incoming messages: the entry command starts a conversation,
/// everything else is dispatched to the live instance.
pub struct Dispatcher {
    runtime: Arc<ConversationRuntime>,
}

impl Dispatcher {
    pub fn new(runtime: Arc<ConversationRuntime>) -> Self {
        Self { runtime }
    }

    /// Returns the runtime this dispatcher drives.
    pub fn runtime(&self) -> &Arc<ConversationRuntime> {
        &self.runtime
    }

    /// Dispatches one message and renders the reply, if any.
    pub fn dispatch(&self, msg: &IncomingMessage) -> (DispatchResult, Option<OutgoingReply>) {
        let key = msg.key();
        let definition = self.runtime.definition();

        let dispatch = if definition.entry_command.matches(&msg.text) {
            self.runtime.on_entry_trigger(key)
        } else {
            self.runtime.on_message(key, &msg.text)
        };

        match dispatch.result {
            DispatchResult::Ignored | DispatchResult::NoMatch => {
                tracing::debug!("[{}] {} for {:?}", key, dispatch.result.as_str(), msg.text)
            }
            result => tracing::debug!("[{}] {}", key, result.as_str()),
        }

        let reply = dispatch
            .reply
            .map(|action| OutgoingReply::render(key, action, dispatch.result));
        (dispatch.result, reply)
    }

    /// Parses a JSON line and dispatches it.
    pub fn dispatch_line(&self, line: &str) -> Result<Option<OutgoingReply>, ServerError> {
        let msg: IncomingMessage = serde_json::from_str(line)?;
        let (_, reply) = self.dispatch(&msg);
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convflow_core::{FlowBuilder, InstanceKey, PromptAction};

    fn dispatcher() -> Dispatcher {
        let def = FlowBuilder::named("survey")
            .start(PromptAction::new("gender?").with_options([["Boy", "Girl", "Other"]]))
            .attach_reply("age?", r"^(Boy|Girl|Other)$")
            .unwrap()
            .stop_with("thanks", r"^\d+$")
            .unwrap()
            .chain_conversation("cancelled")
            .unwrap();
        Dispatcher::new(Arc::new(ConversationRuntime::new(Arc::new(def))))
    }

    #[test]
    fn test_routes_entry_command() {
        let d = dispatcher();
        let (result, reply) = d.dispatch(&IncomingMessage::new(1, 1, "/start"));
        assert_eq!(result, DispatchResult::Started);
        let reply = reply.unwrap();
        assert_eq!(reply.text, "gender?");
        assert!(reply.one_time_keyboard);
    }

    #[test]
    fn test_full_exchange() {
        let d = dispatcher();
        d.dispatch(&IncomingMessage::new(1, 2, "/start"));

        let (result, reply) = d.dispatch(&IncomingMessage::new(1, 2, "Boy"));
        assert!(matches!(result, DispatchResult::Advanced { .. }));
        assert_eq!(reply.unwrap().text, "age?");

        let (result, reply) = d.dispatch(&IncomingMessage::new(1, 2, "9"));
        assert_eq!(result, DispatchResult::Completed);
        let reply = reply.unwrap();
        assert_eq!(reply.text, "thanks");
        assert!(reply.remove_keyboard);

        let (result, reply) = d.dispatch(&IncomingMessage::new(1, 2, "hello?"));
        assert_eq!(result, DispatchResult::Ignored);
        assert!(reply.is_none());
    }

    #[test]
    fn test_users_in_same_chat_are_separate() {
        let d = dispatcher();
        d.dispatch(&IncomingMessage::new(1, 1, "/start"));
        let (result, _) = d.dispatch(&IncomingMessage::new(1, 2, "Boy"));
        assert_eq!(result, DispatchResult::Ignored);
    }

    #[test]
    fn test_dispatch_line() {
        let d = dispatcher();
        let reply = d
            .dispatch_line(r#"{"chat_id": 3, "user_id": 4, "text": "/start"}"#)
            .unwrap();
        assert_eq!(reply.unwrap().chat_id, 3);

        let reply = d
            .dispatch_line(r#"{"chat_id": 3, "user_id": 4, "text": "Purple"}"#)
            .unwrap();
        assert!(reply.is_none());

        let reply = d
            .dispatch_line(r#"{"chat_id": 3, "user_id": 4, "text": "/cancel"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(reply.text, "cancelled");
        assert_eq!(reply.result, "cancelled");
    }

    #[test]
    fn test_dispatch_line_rejects_bad_input() {
        let d = dispatcher();
        assert!(matches!(d.dispatch_line("not json"), Err(ServerError::Json(_))));
        assert!(matches!(
            d.dispatch_line(r#"{"chat_id": 1, "user_id": 1}"#),
            Err(ServerError::Json(_))
        ));
    }

    #[test]
    fn test_blank_text_reaches_permissive_guard() {
        let def = FlowBuilder::new()
            .start("anything to add?")
            .stop_with("noted", r"\s*")
            .unwrap()
            .chain_conversation("cancelled")
            .unwrap();
        let d = Dispatcher::new(Arc::new(ConversationRuntime::new(Arc::new(def))));

        d.dispatch_line(r#"{"chat_id": 1, "user_id": 1, "text": "/start"}"#)
            .unwrap();
        let reply = d
            .dispatch_line(r#"{"chat_id": 1, "user_id": 1, "text": "   "}"#)
            .unwrap()
            .unwrap();
        assert_eq!(reply.text, "noted");
        assert_eq!(reply.result, "completed");
    }

    #[test]
    fn test_blank_text_is_no_match_for_strict_guard() {
        let d = dispatcher();
        d.dispatch_line(r#"{"chat_id": 1, "user_id": 1, "text": "/start"}"#)
            .unwrap();
        let reply = d
            .dispatch_line(r#"{"chat_id": 1, "user_id": 1, "text": ""}"#)
            .unwrap();
        assert!(reply.is_none());
        assert!(d.runtime().get_instance(&InstanceKey::new(1, 1)).is_some());
    }
}
