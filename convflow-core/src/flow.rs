//! Declarative flow files.
//!
//! Flows can be written in YAML or JSON and are compiled through
//! [`FlowBuilder`], so a file-defined flow has exactly the same shape as one
//! built in code:
//!
//! ```yaml
//! name: survey
//! start:
//!   text: "This is starting. Select your gender?"
//!   options: [[Boy, Girl, Other]]
//! steps:
//!   - expect: '^(Boy|Girl|Other)$'
//!     reply: { text: "Tell me your Age." }
//!   - expect: '^\d+$'
//!     stop: { text: "Thanks for the replies." }
//! cancel: { text: "Sorry something wrong." }
//! ```

use crate::builder::{FlowBuilder, DEFAULT_CANCEL_COMMAND, DEFAULT_ENTRY_COMMAND};
use crate::definition::{ConversationDefinition, PromptAction};
use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A prompt as written in a flow file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptSpec {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<Vec<String>>>,
}

impl From<PromptSpec> for PromptAction {
    fn from(spec: PromptSpec) -> Self {
        PromptAction {
            text: spec.text,
            options: spec.options,
            clear_keyboard: false,
        }
    }
}

/// One step of a flow file: a guard plus either a reply or a stop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    /// Pattern the previous answer must fully match.
    pub expect: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply: Option<PromptSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<PromptSpec>,
}

/// Raw flow file contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowFile {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_entry_command")]
    pub entry_command: String,
    #[serde(default = "default_cancel_command")]
    pub cancel_command: String,
    pub start: PromptSpec,
    #[serde(default)]
    pub steps: Vec<StepSpec>,
    pub cancel: PromptSpec,
}

fn default_name() -> String {
    "conversation".to_string()
}

fn default_entry_command() -> String {
    DEFAULT_ENTRY_COMMAND.to_string()
}

fn default_cancel_command() -> String {
    DEFAULT_CANCEL_COMMAND.to_string()
}

impl FlowFile {
    /// Parses a flow from YAML.
    pub fn from_yaml_str(s: &str) -> Result<Self, CoreError> {
        Ok(serde_yaml::from_str(s)?)
    }

    /// Parses a flow from a JSON value.
    pub fn from_json(json: &serde_json::Value) -> Result<Self, CoreError> {
        Ok(serde_json::from_value(json.clone())?)
    }

    /// Reads a flow file. `.json` files are parsed as JSON, anything else
    /// as YAML.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));
        if is_json {
            Ok(serde_json::from_str(&content)?)
        } else {
            Self::from_yaml_str(&content)
        }
    }

    /// Compiles the flow into a definition.
    pub fn build(&self) -> Result<ConversationDefinition, CoreError> {
        let mut handle = FlowBuilder::named(self.name.clone())
            .with_entry_command(self.entry_command.clone())
            .with_cancel_command(self.cancel_command.clone())
            .start(self.start.clone());

        let last = self.steps.len().saturating_sub(1);
        for (i, step) in self.steps.iter().enumerate() {
            handle = match (&step.reply, &step.stop) {
                (Some(reply), None) => handle.attach_reply(reply.clone(), &step.expect)?,
                (None, Some(stop)) if i == last => handle.stop_with(stop.clone(), &step.expect)?,
                (None, Some(_)) => {
                    return Err(CoreError::InvalidFlow {
                        reason: format!("step {} stops the flow but is not the last step", i + 1),
                    })
                }
                _ => {
                    return Err(CoreError::InvalidFlow {
                        reason: format!("step {} must have exactly one of 'reply' or 'stop'", i + 1),
                    })
                }
            };
        }

        handle.chain_conversation(self.cancel.clone())
    }
}

impl std::str::FromStr for FlowFile {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_yaml_str(s)
    }
}
