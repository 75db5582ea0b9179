//! # convflow-server
//!
//! Line-oriented TCP transport for convflow.
//!
//! This crate provides:
//! - YAML/environment configuration
//! - JSON-lines message types
//! - Entry/cancel command routing into the conversation runtime
//! - A concurrent TCP server with idle timeouts and graceful shutdown
//! - Background eviction of idle conversations

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod evictor;
pub mod message;
pub mod server;

pub use config::{Config, ConfigError, EvictionConfig, FlowConfig, NetworkConfig};
pub use dispatcher::Dispatcher;
pub use error::ServerError;
pub use evictor::IdleEvictor;
pub use message::{ErrorLine, IncomingMessage, OutgoingReply};
pub use server::{Server, ServerConfig};
