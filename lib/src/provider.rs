//! Provider seam
//!
//! A provider is driven with the conversation so far and the tools on offer,
//! and answers with an ordered stream of [`ProviderEvent`]s: content
//! fragments, tool calls that wait for a result, and a final `Finish` marker.
//! Concrete providers push events through a [`ProviderEmitter`] from their own
//! task, so the consumer of the stream controls the pace.

use async_trait::async_trait;
use futures::Stream;
use serde_json::Value;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;

use crate::config::{ProviderConfig, ProviderKind};
use crate::error::{AgentError, Result};
use crate::session::Message;
use crate::tools::ToolDefinition;

/// Events buffered between a provider task and its consumer
const EVENT_BUFFER: usize = 64;

/// Everything a provider needs to produce the next assistant turn
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub messages: Vec<Message>,
    pub system_prompt: Option<String>,
    pub tools: Vec<ToolDefinition>,
}

/// One step of provider output
#[derive(Debug)]
pub enum ProviderEvent {
    Content(String),
    ToolCall(PendingToolCall),
    Finish,
}

/// A tool invocation the provider is blocked on
///
/// The provider resumes once [`PendingToolCall::respond`] hands it the tool
/// output (or a cancellation payload).
#[derive(Debug)]
pub struct PendingToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
    reply: oneshot::Sender<Value>,
}

impl PendingToolCall {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: Value,
    ) -> (Self, oneshot::Receiver<Value>) {
        let (reply, receiver) = oneshot::channel();
        let call = Self {
            id: id.into(),
            name: name.into(),
            arguments,
            reply,
        };
        (call, receiver)
    }

    /// Returns false when the provider has already gone away
    pub fn respond(self, output: Value) -> bool {
        self.reply.send(output).is_ok()
    }
}

pub type ProviderStream = Pin<Box<dyn Stream<Item = Result<ProviderEvent>> + Send>>;

/// Text and tool-call generation backend
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    async fn stream(&self, request: GenerationRequest) -> Result<ProviderStream>;
}

/// Builds the provider binding for each new session
pub trait ProviderFactory: Send + Sync {
    fn create(&self) -> Result<Arc<dyn Provider>>;
}

/// Factory driven by [`ProviderConfig`]
pub struct ConfiguredProviderFactory {
    config: ProviderConfig,
}

impl ConfiguredProviderFactory {
    pub fn new(config: ProviderConfig) -> Self {
        Self { config }
    }
}

impl ProviderFactory for ConfiguredProviderFactory {
    fn create(&self) -> Result<Arc<dyn Provider>> {
        match self.config.kind {
            ProviderKind::Echo => Ok(Arc::new(crate::echo_provider::EchoProvider::new())),
            ProviderKind::OpenAi => {
                let provider = crate::openai::OpenAiProvider::from_config(
                    &self.config,
                    std::env::var("OPENAI_API_KEY").ok(),
                )?;
                Ok(Arc::new(provider))
            }
            kind @ (ProviderKind::Anthropic | ProviderKind::Bedrock) => Err(AgentError::Config(
                format!("unsupported provider: {}", kind.name()),
            )),
        }
    }
}

/// Hands the same provider instance to every session
pub struct SharedProviderFactory(pub Arc<dyn Provider>);

impl ProviderFactory for SharedProviderFactory {
    fn create(&self) -> Result<Arc<dyn Provider>> {
        Ok(Arc::clone(&self.0))
    }
}

/// Producer half of a provider event stream
#[derive(Clone)]
pub struct ProviderEmitter {
    tx: mpsc::Sender<Result<ProviderEvent>>,
}

/// Create a provider event channel
pub fn event_channel() -> (ProviderEmitter, ProviderStream) {
    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    (ProviderEmitter { tx }, Box::pin(ReceiverStream::new(rx)))
}

impl ProviderEmitter {
    /// Returns false once the consumer has dropped the stream
    pub async fn content(&self, text: impl Into<String>) -> bool {
        self.tx
            .send(Ok(ProviderEvent::Content(text.into())))
            .await
            .is_ok()
    }

    /// Emit a tool call and wait for its result
    ///
    /// `None` means the consumer stopped listening before answering.
    pub async fn call_tool(
        &self,
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: Value,
    ) -> Option<Value> {
        let (call, receiver) = PendingToolCall::new(id, name, arguments);
        self.tx
            .send(Ok(ProviderEvent::ToolCall(call)))
            .await
            .ok()?;
        receiver.await.ok()
    }

    pub async fn finish(&self) {
        let _ = self.tx.send(Ok(ProviderEvent::Finish)).await;
    }

    pub async fn fail(&self, error: AgentError) {
        let _ = self.tx.send(Err(error)).await;
    }

    /// Resolves when the consumer drops the stream
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}
