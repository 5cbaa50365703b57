//! Deterministic provider driven by a fixed script
//!
//! Used by the test suites and for demos that must not depend on a network
//! model. Each call to [`Provider::stream`] plays one turn of the script.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{AgentError, Result};
use crate::provider::{event_channel, GenerationRequest, Provider, ProviderEmitter, ProviderStream};

/// One scripted action
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptStep {
    /// Emit a content fragment
    Text(String),
    /// Call a tool and wait for its output
    ToolCall { name: String, arguments: Value },
    /// End the turn with a provider error
    Fail(String),
    /// Pause before the next step
    Delay(Duration),
    /// Never finish; wait until the consumer goes away
    Stall,
}

impl ScriptStep {
    pub fn text(content: impl Into<String>) -> Self {
        Self::Text(content.into())
    }

    pub fn tool(name: impl Into<String>, arguments: Value) -> Self {
        Self::ToolCall {
            name: name.into(),
            arguments,
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self::Fail(message.into())
    }
}

#[derive(Default)]
struct Recorded {
    requests: Vec<GenerationRequest>,
    tool_outputs: Vec<Value>,
}

/// Plays scripted turns; the last turn repeats once the others are used up
pub struct ScriptedProvider {
    turns: Mutex<VecDeque<Vec<ScriptStep>>>,
    recorded: Arc<Mutex<Recorded>>,
}

impl ScriptedProvider {
    /// Same script for every turn
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self::with_turns(vec![steps])
    }

    pub fn with_turns(turns: Vec<Vec<ScriptStep>>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
            recorded: Default::default(),
        }
    }

    fn next_turn(&self) -> Vec<ScriptStep> {
        let mut turns = self.turns.lock().unwrap_or_else(|p| p.into_inner());
        if turns.len() > 1 {
            turns.pop_front().unwrap_or_default()
        } else {
            turns.front().cloned().unwrap_or_default()
        }
    }

    /// Requests seen so far, oldest first
    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.recorded
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .requests
            .clone()
    }

    /// Tool outputs handed back by the consumer, oldest first
    pub fn tool_outputs(&self) -> Vec<Value> {
        self.recorded
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .tool_outputs
            .clone()
    }
}

async fn play(steps: Vec<ScriptStep>, emitter: ProviderEmitter, recorded: Arc<Mutex<Recorded>>) {
    for (index, step) in steps.into_iter().enumerate() {
        match step {
            ScriptStep::Text(content) => {
                if !emitter.content(content).await {
                    return;
                }
            }
            ScriptStep::ToolCall { name, arguments } => {
                let call_id = format!("call_{}", index);
                match emitter.call_tool(call_id, name, arguments).await {
                    Some(output) => recorded
                        .lock()
                        .unwrap_or_else(|p| p.into_inner())
                        .tool_outputs
                        .push(output),
                    None => return,
                }
            }
            ScriptStep::Fail(message) => {
                emitter.fail(AgentError::Provider(message)).await;
                return;
            }
            ScriptStep::Delay(duration) => tokio::time::sleep(duration).await,
            ScriptStep::Stall => {
                emitter.closed().await;
                return;
            }
        }
    }
    emitter.finish().await;
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn stream(&self, request: GenerationRequest) -> Result<ProviderStream> {
        let steps = self.next_turn();
        tracing::debug!(steps = steps.len(), "Playing scripted turn");
        self.recorded
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .requests
            .push(request);

        let (emitter, stream) = event_channel();
        tokio::spawn(play(steps, emitter, Arc::clone(&self.recorded)));
        Ok(stream)
    }
}
