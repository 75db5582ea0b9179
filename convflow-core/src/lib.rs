//! # convflow-core
//!
//! Conversation flow engine for convflow.
//!
//! This crate provides:
//! - A fluent builder for linear, regex-gated conversation flows
//! - Immutable conversation definitions
//! - Full-match guard patterns and slash-command triggers
//! - YAML/JSON flow files
//! - A concurrent per-conversation instance runtime

pub mod builder;
pub mod definition;
pub mod error;
pub mod flow;
pub mod guard;
pub mod instance;
pub mod runtime;

pub use builder::{FlowBuilder, FlowHandle};
pub use definition::{ConversationDefinition, PromptAction, StateId, Target, TransitionRule};
pub use error::CoreError;
pub use flow::FlowFile;
pub use guard::{Command, GuardPattern};
pub use instance::{ConversationInstance, CurrentState, InstanceKey};
pub use runtime::{ConversationRuntime, Dispatch, DispatchResult, RuntimeStats};
