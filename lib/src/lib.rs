//! Ruby Agent Library
//!
//! A streaming chat core: sessions with message history, a WebSocket
//! streaming plane that forwards provider output as it is produced, and an
//! out-of-band confirmation round-trip that gates side-effecting tool calls.
//! The same crate carries the matching client.

pub mod api;
pub mod client;
pub mod config;
pub mod confirmation;
pub mod connection;
pub mod dispatcher;
pub mod echo_provider;
pub mod error;
pub mod openai;
pub mod prompt;
pub mod protocol;
pub mod provider;
pub mod scripted_provider;
pub mod server;
pub mod session;
pub mod tools;

pub use api::{HealthStatus, SessionApi, SessionInfo};
pub use client::{ChatStream, RubyClient, StreamChunk};
pub use config::{AgentConfig, ClientConfig, UnattendedPolicy};
pub use confirmation::{ConfirmationBroker, Decision};
pub use dispatcher::{StreamDispatcher, StreamOutcome};
pub use error::{AgentError, Result};
pub use protocol::{ClientFrame, ServerFrame};
pub use provider::{Provider, ProviderFactory};
pub use server::{AppState, RubyServer};
pub use session::{Message, MessageRole, SessionId, SessionStore};
pub use tools::{Tool, ToolDefinition, ToolRegistry};
