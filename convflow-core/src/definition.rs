//! Conversation definition types.
//!
//! A definition is the immutable product of [`crate::builder::FlowBuilder`]:
//!
//! ```text
//! entry --(guard₁)--> s₁ --(guard₂)--> s₂ ... --(guardₙ)--> TERMINAL
//! ```
//!
//! Every state owns an ordered list of [`TransitionRule`]s. A rule's action is
//! the prompt sent when the rule fires; its target is the state the instance
//! moves to afterwards.

use crate::guard::{Command, GuardPattern};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use uuid::Uuid;

/// Opaque, globally unique state identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateId(Uuid);

impl StateId {
    /// Mints a fresh identifier.
    pub fn mint() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message to send to the user.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PromptAction {
    /// Text of the reply.
    pub text: String,

    /// Quick-reply keyboard, row by row. `None` means free-text input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<Vec<String>>>,

    /// Instructs the transport to remove any keyboard shown earlier.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub clear_keyboard: bool,
}

impl PromptAction {
    /// Creates a free-text prompt.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            options: None,
            clear_keyboard: false,
        }
    }

    /// Attaches a keyboard of quick-reply options.
    pub fn with_options<R, S>(mut self, rows: R) -> Self
    where
        R: IntoIterator,
        R::Item: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let rows: Vec<Vec<String>> = rows
            .into_iter()
            .map(|row| row.into_iter().map(Into::into).collect())
            .collect();
        self.options = Some(rows);
        self
    }

    /// Marks the prompt as one that clears the keyboard.
    ///
    /// A clearing prompt never shows options of its own.
    pub fn clearing(mut self) -> Self {
        self.clear_keyboard = true;
        self.options = None;
        self
    }

    /// Returns true if this prompt presents a keyboard.
    pub fn has_keyboard(&self) -> bool {
        self.options.as_ref().is_some_and(|rows| !rows.is_empty())
    }
}

impl From<&str> for PromptAction {
    fn from(text: &str) -> Self {
        Self::new(text)
    }
}

impl From<String> for PromptAction {
    fn from(text: String) -> Self {
        Self::new(text)
    }
}

/// Where an instance goes after a rule fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    State(StateId),
    Terminal,
}

impl Target {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Target::Terminal)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::State(id) => write!(f, "{}", id),
            Target::Terminal => f.write_str("TERMINAL"),
        }
    }
}

/// A guarded transition out of a state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionRule {
    /// Must fully match the incoming text.
    pub guard: GuardPattern,
    /// Prompt sent when the rule fires.
    pub action: PromptAction,
    /// State entered after the prompt is sent.
    pub target: Target,
}

impl TransitionRule {
    pub fn matches(&self, text: &str) -> bool {
        self.guard.matches(text)
    }
}

/// Validated, immutable conversation definition.
#[derive(Debug, Clone)]
pub struct ConversationDefinition {
    /// Flow name (used in logs).
    pub name: String,

    /// State new instances start in.
    pub entry_state: StateId,

    /// Prompt sent when an instance is created.
    pub entry_action: PromptAction,

    /// Prompt sent when an instance is cancelled.
    pub cancel_action: PromptAction,

    /// Command that creates an instance.
    pub entry_command: Command,

    /// Command that cancels an instance from any state.
    pub cancel_command: Command,

    /// Rules indexed by owning state, in attachment order.
    states: HashMap<StateId, Vec<TransitionRule>>,

    /// Hash of the definition content for integrity checks.
    pub checksum: String,
}

impl ConversationDefinition {
    pub(crate) fn from_parts(
        name: String,
        entry_state: StateId,
        entry_action: PromptAction,
        states: HashMap<StateId, Vec<TransitionRule>>,
        cancel_action: PromptAction,
        entry_command: Command,
        cancel_command: Command,
    ) -> Self {
        let mut definition = Self {
            name,
            entry_state,
            entry_action,
            cancel_action,
            entry_command,
            cancel_command,
            states,
            checksum: String::new(),
        };
        definition.checksum = definition.compute_checksum();
        definition
    }

    /// Returns the rules owned by `state`, in attachment order.
    pub fn rules(&self, state: &StateId) -> &[TransitionRule] {
        self.states.get(state).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Returns the first rule of `state` whose guard matches `text`.
    pub fn find_rule(&self, state: &StateId, text: &str) -> Option<&TransitionRule> {
        self.rules(state).iter().find(|rule| rule.matches(text))
    }

    /// Returns true if the state belongs to this definition.
    pub fn has_state(&self, state: &StateId) -> bool {
        self.states.contains_key(state)
    }

    /// Returns the number of registered (non-terminal) states.
    pub fn state_count(&self) -> usize {
        self.states.len()
    }

    /// Returns all registered states.
    pub fn states(&self) -> impl Iterator<Item = &StateId> {
        self.states.keys()
    }

    /// Returns true if every rule targets TERMINAL or a registered state.
    pub fn targets_resolve(&self) -> bool {
        self.states
            .values()
            .flatten()
            .all(|rule| match rule.target {
                Target::State(id) => self.states.contains_key(&id),
                Target::Terminal => true,
            })
    }

    /// Returns true if no state can be reached from itself.
    pub fn is_acyclic(&self) -> bool {
        fn visit(
            def: &ConversationDefinition,
            state: StateId,
            on_path: &mut HashSet<StateId>,
            done: &mut HashSet<StateId>,
        ) -> bool {
            if done.contains(&state) {
                return true;
            }
            if !on_path.insert(state) {
                return false;
            }
            for rule in def.rules(&state) {
                if let Target::State(next) = rule.target {
                    if !visit(def, next, on_path, done) {
                        return false;
                    }
                }
            }
            on_path.remove(&state);
            done.insert(state);
            true
        }

        let mut on_path = HashSet::new();
        let mut done = HashSet::new();
        self.states
            .keys()
            .all(|state| visit(self, *state, &mut on_path, &mut done))
    }

    /// Number of nodes on the longest path from the entry state, counting
    /// TERMINAL as a node when the path reaches it.
    pub fn longest_path_len(&self) -> usize {
        fn depth(
            def: &ConversationDefinition,
            state: StateId,
            memo: &mut HashMap<StateId, usize>,
        ) -> usize {
            if let Some(d) = memo.get(&state) {
                return *d;
            }
            let tail = def
                .rules(&state)
                .iter()
                .map(|rule| match rule.target {
                    Target::State(next) => depth(def, next, memo),
                    Target::Terminal => 1,
                })
                .max()
                .unwrap_or(0);
            memo.insert(state, tail + 1);
            tail + 1
        }

        depth(self, self.entry_state, &mut HashMap::new())
    }

    /// Walks the states reachable from the entry state, depth first, rules in
    /// attachment order.
    pub fn walk(&self) -> Vec<StateId> {
        let mut order = Vec::with_capacity(self.states.len());
        let mut seen = HashSet::new();
        let mut stack = vec![self.entry_state];
        while let Some(state) = stack.pop() {
            if !seen.insert(state) {
                continue;
            }
            order.push(state);
            for rule in self.rules(&state).iter().rev() {
                if let Target::State(next) = rule.target {
                    stack.push(next);
                }
            }
        }
        order
    }

    fn compute_checksum(&self) -> String {
        // State ids are random, so the hash covers content in walk order.
        let mut content = serde_json::Map::new();
        content.insert("entry".to_string(), action_value(&self.entry_action));
        content.insert("cancel".to_string(), action_value(&self.cancel_action));
        content.insert(
            "commands".to_string(),
            serde_json::json!([self.entry_command.name(), self.cancel_command.name()]),
        );

        let order = self.walk();
        let index: HashMap<StateId, usize> =
            order.iter().enumerate().map(|(i, s)| (*s, i)).collect();

        let states: Vec<serde_json::Value> = order
            .iter()
            .map(|state| {
                let rules: Vec<serde_json::Value> = self
                    .rules(state)
                    .iter()
                    .map(|rule| {
                        let target = match rule.target {
                            Target::State(next) => serde_json::json!(index.get(&next)),
                            Target::Terminal => serde_json::Value::Null,
                        };
                        serde_json::json!({
                            "guard": rule.guard.as_str(),
                            "action": action_value(&rule.action),
                            "target": target,
                        })
                    })
                    .collect();
                serde_json::Value::Array(rules)
            })
            .collect();
        content.insert("states".to_string(), serde_json::Value::Array(states));

        let bytes = serde_json::to_vec(&serde_json::Value::Object(content)).unwrap_or_default();
        format!("{:08x}", crc32c::crc32c(&bytes))
    }
}

fn action_value(action: &PromptAction) -> serde_json::Value {
    serde_json::to_value(action).unwrap_or(serde_json::Value::Null)
}
