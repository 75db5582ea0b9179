//! Fluent construction of conversation definitions.
//!
//! ```
//! use convflow_core::{FlowBuilder, PromptAction};
//!
//! let definition = FlowBuilder::named("survey")
//!     .start(PromptAction::new("Select your gender?").with_options([["Boy", "Girl", "Other"]]))
//!     .attach_reply("Tell me your Age.", r"^(Boy|Girl|Other)$")?
//!     .stop_with("Thanks for the replies.", r"^\d+$")?
//!     .chain_conversation("Sorry something wrong.")?;
//!
//! assert_eq!(definition.longest_path_len(), 3);
//! # Ok::<(), convflow_core::CoreError>(())
//! ```
//!
//! Every step returns a new [`FlowHandle`] that owns its own copy of the
//! definition under construction. Extending an earlier handle again starts a
//! separate chain and leaves the chains built from other handles untouched.

use crate::definition::{ConversationDefinition, PromptAction, StateId, Target, TransitionRule};
use crate::error::CoreError;
use crate::guard::{Command, GuardPattern};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Default command that starts a conversation.
pub const DEFAULT_ENTRY_COMMAND: &str = "start";

/// Default command that cancels a conversation.
pub const DEFAULT_CANCEL_COMMAND: &str = "cancel";

/// Entry point of the fluent API.
#[derive(Debug, Clone)]
pub struct FlowBuilder {
    name: String,
    entry_command: Command,
    cancel_command: Command,
}

impl Default for FlowBuilder {
    fn default() -> Self {
        Self {
            name: "conversation".to_string(),
            entry_command: Command::new(DEFAULT_ENTRY_COMMAND),
            cancel_command: Command::new(DEFAULT_CANCEL_COMMAND),
        }
    }
}

impl FlowBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a builder for a named flow.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Sets the command that creates an instance (default `/start`).
    pub fn with_entry_command(mut self, command: impl Into<String>) -> Self {
        self.entry_command = Command::new(command);
        self
    }

    /// Sets the command that cancels an instance (default `/cancel`).
    pub fn with_cancel_command(mut self, command: impl Into<String>) -> Self {
        self.cancel_command = Command::new(command);
        self
    }

    /// Creates the entry state and records the prompt sent on entry.
    pub fn start(self, prompt: impl Into<PromptAction>) -> FlowHandle {
        let entry_state = StateId::mint();
        let mut states = HashMap::new();
        states.insert(entry_state, Vec::new());

        let draft = Draft {
            name: self.name,
            entry_state,
            entry_action: prompt.into(),
            states,
            entry_command: self.entry_command,
            cancel_command: self.cancel_command,
        };

        FlowHandle::at(draft, Target::State(entry_state))
    }
}

/// Definition under construction.
#[derive(Debug, Clone)]
struct Draft {
    name: String,
    entry_state: StateId,
    entry_action: PromptAction,
    states: HashMap<StateId, Vec<TransitionRule>>,
    entry_command: Command,
    cancel_command: Command,
}

/// A step in a chain, bound to the most recently created state.
#[derive(Debug, Clone)]
pub struct FlowHandle {
    draft: Draft,
    current: Target,
    finalized: Arc<AtomicBool>,
}

impl FlowHandle {
    fn at(draft: Draft, current: Target) -> Self {
        Self {
            draft,
            current,
            finalized: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Returns the state this handle is bound to.
    pub fn current(&self) -> Target {
        self.current
    }

    /// Returns the entry state of the chain.
    pub fn entry_state(&self) -> StateId {
        self.draft.entry_state
    }

    /// Returns true once `chain_conversation` has been called on this handle.
    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::Acquire)
    }

    /// Adds a step: when the previous answer fully matches `guard`, send
    /// `prompt` and wait in a newly minted state.
    pub fn attach_reply(
        &self,
        prompt: impl Into<PromptAction>,
        guard: &str,
    ) -> Result<FlowHandle, CoreError> {
        let next = StateId::mint();
        let mut draft = self.append(prompt.into(), guard, Target::State(next))?;
        draft.states.insert(next, Vec::new());
        Ok(FlowHandle::at(draft, Target::State(next)))
    }

    /// Adds the final step: when the previous answer fully matches `guard`,
    /// send `prompt`, clear the keyboard, and end the conversation.
    pub fn stop_with(
        &self,
        prompt: impl Into<PromptAction>,
        guard: &str,
    ) -> Result<FlowHandle, CoreError> {
        let draft = self.append(prompt.into().clearing(), guard, Target::Terminal)?;
        Ok(FlowHandle::at(draft, Target::Terminal))
    }

    /// Returns a handle on this chain positioned at the state `earlier` is
    /// bound to.
    ///
    /// Extending the returned handle adds further rules to that state, after
    /// the ones already attached. `earlier` must be bound to a state of this
    /// chain.
    pub fn branch_at(&self, earlier: &FlowHandle) -> Result<FlowHandle, CoreError> {
        if self.is_finalized() {
            return Err(CoreError::InvalidBuilderState {
                reason: "cannot branch a finalized chain".to_string(),
            });
        }

        let Target::State(state) = earlier.current else {
            return Err(CoreError::InvalidBuilderState {
                reason: "cannot branch at TERMINAL".to_string(),
            });
        };

        if !self.draft.states.contains_key(&state) {
            return Err(CoreError::InvalidBuilderState {
                reason: format!("state {} is not part of this chain", state),
            });
        }

        Ok(FlowHandle::at(self.draft.clone(), Target::State(state)))
    }

    /// Finalizes the chain with the prompt sent on cancellation.
    pub fn chain_conversation(
        &self,
        cancel_prompt: impl Into<PromptAction>,
    ) -> Result<ConversationDefinition, CoreError> {
        if self.finalized.swap(true, Ordering::AcqRel) {
            return Err(CoreError::InvalidBuilderState {
                reason: "chain already finalized".to_string(),
            });
        }

        let draft = self.draft.clone();
        let definition = ConversationDefinition::from_parts(
            draft.name,
            draft.entry_state,
            draft.entry_action,
            draft.states,
            cancel_prompt.into().clearing(),
            draft.entry_command,
            draft.cancel_command,
        );

        tracing::debug!(
            "Built flow '{}': {} states, checksum {}",
            definition.name,
            definition.state_count(),
            definition.checksum
        );

        Ok(definition)
    }

    fn append(
        &self,
        action: PromptAction,
        guard: &str,
        target: Target,
    ) -> Result<Draft, CoreError> {
        if self.is_finalized() {
            return Err(CoreError::InvalidBuilderState {
                reason: "cannot extend a finalized chain".to_string(),
            });
        }

        let Target::State(owner) = self.current else {
            return Err(CoreError::InvalidBuilderState {
                reason: "cannot attach a transition to TERMINAL".to_string(),
            });
        };

        let guard = GuardPattern::new(guard)?;

        let mut draft = self.draft.clone();
        draft.states.entry(owner).or_default().push(TransitionRule {
            guard,
            action,
            target,
        });
        Ok(draft)
    }
}
