//! OpenAI-compatible chat completions provider
//!
//! Streams `/chat/completions` over server-sent events. Tool calls arrive as
//! argument deltas spread over many events; they are assembled per turn and
//! executed through the consumer before the next request goes out, for at most
//! `max_steps` requests per assistant reply.

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use std::collections::BTreeMap;

use crate::config::ProviderConfig;
use crate::error::{AgentError, Result};
use crate::provider::{event_channel, GenerationRequest, Provider, ProviderEmitter, ProviderStream};
use crate::session::MessageRole;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Clone)]
pub struct OpenAiProvider {
    http: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    max_steps: u32,
}

impl std::fmt::Debug for OpenAiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiProvider")
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("max_steps", &self.max_steps)
            .finish()
    }
}

impl OpenAiProvider {
    /// Build from config; `env_key` is used when the config carries no key
    pub fn from_config(config: &ProviderConfig, env_key: Option<String>) -> Result<Self> {
        let present = |key: &String| !key.trim().is_empty();
        let api_key = config
            .api_key
            .clone()
            .filter(present)
            .or(env_key.filter(present))
            .ok_or_else(|| {
                AgentError::Provider(
                    "OpenAI API key not configured; set provider.api_key or OPENAI_API_KEY"
                        .to_string(),
                )
            })?;

        Ok(Self {
            http: reqwest::Client::new(),
            api_key,
            model: config.model.clone(),
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            max_steps: config.max_steps.max(1),
        })
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    async fn send(&self, messages: &[Value], tools: &[Value]) -> Result<reqwest::Response> {
        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
        });
        if !tools.is_empty() {
            body["tools"] = json!(tools);
        }

        let response = self
            .http
            .post(self.completions_url())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| AgentError::Provider(format!("Failed to reach OpenAI API: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(AgentError::Provider(format!(
                "OpenAI API error ({}): {}",
                status, error_text
            )));
        }
        Ok(response)
    }

    /// Drive one assistant reply, including any tool round-trips
    async fn run(self, request: GenerationRequest, emitter: ProviderEmitter) -> Result<()> {
        let mut messages = wire_messages(&request);
        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.parameters,
                    }
                })
            })
            .collect();

        for step in 0..self.max_steps {
            tracing::debug!(step, model = %self.model, "Requesting completion");
            let response = self.send(&messages, &tools).await?;

            let mut decoder = SseDecoder::default();
            let mut turn = TurnAccumulator::default();
            let mut bytes = response.bytes_stream();

            'read: while let Some(chunk) = bytes.next().await {
                let chunk = chunk.map_err(|e| {
                    AgentError::Provider(format!("Failed to read stream chunk: {}", e))
                })?;
                for data in decoder.push(&chunk) {
                    if data.trim() == "[DONE]" {
                        break 'read;
                    }
                    let event: Value = serde_json::from_str(&data).map_err(|e| {
                        AgentError::Provider(format!("Failed to parse stream event: {}", e))
                    })?;
                    if let Some(text) = turn.apply(&event) {
                        if !emitter.content(text).await {
                            return Ok(());
                        }
                    }
                }
            }

            let calls = turn.tool_calls();
            if calls.is_empty() {
                break;
            }

            let content = if turn.text.is_empty() {
                Value::Null
            } else {
                json!(turn.text)
            };
            let wire_calls: Vec<Value> = calls
                .iter()
                .map(|call| {
                    json!({
                        "id": call.id,
                        "type": "function",
                        "function": { "name": call.name, "arguments": call.arguments },
                    })
                })
                .collect();
            messages.push(json!({
                "role": "assistant",
                "content": content,
                "tool_calls": wire_calls,
            }));

            for call in calls {
                let arguments = serde_json::from_str(&call.arguments).unwrap_or_else(|_| json!({}));
                let Some(output) = emitter.call_tool(call.id.clone(), call.name, arguments).await
                else {
                    return Ok(());
                };
                messages.push(json!({
                    "role": "tool",
                    "tool_call_id": call.id,
                    "content": output.to_string(),
                }));
            }
        }

        emitter.finish().await;
        Ok(())
    }
}

fn wire_messages(request: &GenerationRequest) -> Vec<Value> {
    let mut messages = Vec::with_capacity(request.messages.len() + 1);
    if let Some(prompt) = &request.system_prompt {
        messages.push(json!({ "role": "system", "content": prompt }));
    }
    for message in &request.messages {
        let role = match message.role {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
        };
        messages.push(json!({ "role": role, "content": message.content }));
    }
    messages
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn stream(&self, request: GenerationRequest) -> Result<ProviderStream> {
        let (emitter, stream) = event_channel();
        let provider = self.clone();
        tokio::spawn(async move {
            if let Err(e) = provider.run(request, emitter.clone()).await {
                tracing::error!("OpenAI stream failed: {}", e);
                emitter.fail(e).await;
            }
        });
        Ok(stream)
    }
}

/// Incremental server-sent events decoder yielding `data:` payloads
#[derive(Debug, Default)]
pub(crate) struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub(crate) fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut payloads = Vec::new();
        while let Some(frame) = self.next_frame() {
            if let Some(data) = frame_data(&String::from_utf8_lossy(&frame)) {
                payloads.push(data);
            }
        }
        payloads
    }

    fn next_frame(&mut self) -> Option<Vec<u8>> {
        let (position, delimiter) = match self.buffer.windows(4).position(|w| w == b"\r\n\r\n") {
            Some(position) => (position, 4),
            None => (self.buffer.windows(2).position(|w| w == b"\n\n")?, 2),
        };
        let frame = self.buffer.drain(..position).collect();
        self.buffer.drain(..delimiter);
        Some(frame)
    }
}

fn frame_data(frame: &str) -> Option<String> {
    let parts: Vec<&str> = frame
        .lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.starts_with(':'))
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|rest| rest.strip_prefix(' ').unwrap_or(rest))
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n"))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct AssembledToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// Collects text and tool-call deltas of one completion
#[derive(Debug, Default)]
pub(crate) struct TurnAccumulator {
    text: String,
    calls: BTreeMap<u64, AssembledToolCall>,
}

impl TurnAccumulator {
    /// Fold one stream event in, returning any new text
    pub(crate) fn apply(&mut self, event: &Value) -> Option<String> {
        let delta = event.get("choices")?.get(0)?.get("delta")?;

        if let Some(deltas) = delta.get("tool_calls").and_then(Value::as_array) {
            for (position, call_delta) in deltas.iter().enumerate() {
                let index = call_delta
                    .get("index")
                    .and_then(Value::as_u64)
                    .unwrap_or(position as u64);
                let call = self.calls.entry(index).or_default();
                if let Some(id) = call_delta.get("id").and_then(Value::as_str) {
                    call.id = id.to_string();
                }
                if let Some(function) = call_delta.get("function") {
                    if let Some(name) = function.get("name").and_then(Value::as_str) {
                        call.name.push_str(name);
                    }
                    if let Some(arguments) = function.get("arguments").and_then(Value::as_str) {
                        call.arguments.push_str(arguments);
                    }
                }
            }
        }

        let text = delta.get("content").and_then(Value::as_str)?;
        if text.is_empty() {
            return None;
        }
        self.text.push_str(text);
        Some(text.to_string())
    }

    /// Completed calls in index order; calls without a name are dropped
    pub(crate) fn tool_calls(&self) -> Vec<AssembledToolCall> {
        self.calls
            .iter()
            .filter(|(_, call)| !call.name.is_empty())
            .map(|(index, call)| {
                let mut call = call.clone();
                if call.id.is_empty() {
                    call.id = format!("call_{}", index);
                }
                call
            })
            .collect()
    }
}
