//! Client for the Ruby agent server
//!
//! [`RubyClient`] covers the HTTP control plane and opens streaming
//! connections. A [`ChatStream`] is a single-pass sequence of content chunks;
//! tool confirmation requests arriving on the same connection are answered on
//! a side task and never reach the consumer.

use futures::{SinkExt, Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::api::{HealthStatus, SessionInfo};
use crate::config::{ClientConfig, UnattendedPolicy};
use crate::error::{AgentError, Result};
use crate::prompt::{ConfirmationHandler, ToolConfirmationPrompt};
use crate::protocol::{ClientFrame, ServerFrame};
use crate::session::{Message, MessageRole, SessionId};

/// One piece of streamed assistant output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamChunk {
    pub content: String,
    /// Set on the final marker chunk, whose content is empty
    pub done: bool,
}

pub struct RubyClient {
    http: reqwest::Client,
    config: ClientConfig,
    confirmation_handler: Option<Arc<dyn ConfirmationHandler>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatedSession {
    session_id: SessionId,
}

#[derive(Deserialize)]
struct MessageList {
    messages: Vec<Message>,
}

#[derive(Deserialize)]
struct SuccessFlag {
    success: bool,
}

impl RubyClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
            confirmation_handler: None,
        }
    }

    /// Route tool confirmations to `handler` instead of the unattended policy
    pub fn with_confirmation_handler(mut self, handler: Arc<dyn ConfirmationHandler>) -> Self {
        self.confirmation_handler = Some(handler);
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.server_url.trim_end_matches('/'), path)
    }

    pub async fn create_session(&self, system_prompt: Option<&str>) -> Result<SessionId> {
        let mut body = json!({});
        if let Some(prompt) = system_prompt {
            body["systemPrompt"] = json!(prompt);
        }
        let response = self.http.post(self.url("/api/sessions")).json(&body).send().await?;
        let created: CreatedSession = check(response).await?.json().await?;
        tracing::debug!(session_id = %created.session_id, "Created session");
        Ok(created.session_id)
    }

    pub async fn get_session(&self, session_id: &str) -> Result<SessionInfo> {
        let response = self
            .http
            .get(self.url(&format!("/api/sessions/{}", session_id)))
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    pub async fn get_messages(&self, session_id: &str) -> Result<Vec<Message>> {
        let response = self
            .http
            .get(self.url(&format!("/api/sessions/{}/messages", session_id)))
            .send()
            .await?;
        let list: MessageList = check(response).await?.json().await?;
        Ok(list.messages)
    }

    pub async fn add_message(&self, session_id: &str, role: MessageRole, content: &str) -> Result<()> {
        let response = self
            .http
            .post(self.url(&format!("/api/sessions/{}/messages", session_id)))
            .json(&json!({ "role": role, "content": content }))
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    /// `false` when the server did not know the session
    pub async fn delete_session(&self, session_id: &str) -> Result<bool> {
        let response = self
            .http
            .delete(self.url(&format!("/api/sessions/{}", session_id)))
            .send()
            .await?;
        let flag: SuccessFlag = check(response).await?.json().await?;
        Ok(flag.success)
    }

    pub async fn health(&self) -> Result<HealthStatus> {
        let response = self.http.get(self.url("/health")).send().await?;
        Ok(check(response).await?.json().await?)
    }

    /// Open a connection and stream the reply to `user_message`
    ///
    /// Connecting is not bounded by a timeout; a server that accepts the TCP
    /// connection but never completes the handshake leaves this pending.
    pub async fn chat_stream(&self, session_id: &str, user_message: &str) -> Result<ChatStream> {
        let url = self.config.resolved_ws_url();
        tracing::debug!(%url, session_id, "Opening stream connection");
        let (socket, _) = connect_async(url.as_str()).await?;
        let (mut sink, mut source) = socket.split();

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ClientFrame>();
        let (frames_tx, frames_rx) = mpsc::channel::<Result<ServerFrame>>(self.config.frame_buffer.max(1));

        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let text = match frame.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::error!("Failed to encode client frame: {}", e);
                        continue;
                    }
                };
                if let Err(e) = sink.send(WsMessage::Text(text)).await {
                    tracing::debug!("Stream connection write failed: {}", e);
                    break;
                }
            }
            // Every sender is gone: the stream is over
            let _ = sink.close().await;
        });

        let _ = outbound_tx.send(ClientFrame::ChatStream {
            session_id: session_id.to_string(),
            user_message: user_message.to_string(),
        });

        let confirmations = Confirmations {
            handler: self.confirmation_handler.clone(),
            unattended: self.config.unattended,
            outbound: outbound_tx,
        };

        let reader = tokio::spawn(async move {
            while let Some(message) = source.next().await {
                let frame = match message {
                    Ok(WsMessage::Text(text)) => ServerFrame::parse(&text),
                    Ok(WsMessage::Binary(_)) => Err(AgentError::Protocol(
                        "unexpected binary frame".to_string(),
                    )),
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => Err(AgentError::from(e)),
                };

                match frame {
                    Ok(ServerFrame::ToolConfirmationRequest {
                        confirmation_id,
                        tool_name,
                        args,
                        message,
                    }) => confirmations.answer(ToolConfirmationPrompt {
                        confirmation_id,
                        tool_name,
                        args,
                        message,
                    }),
                    Ok(ServerFrame::ToolConfirmationReceived { confirmation_id }) => {
                        tracing::debug!(%confirmation_id, "Confirmation acknowledged");
                    }
                    Ok(frame) => {
                        // Any `error` frame ends the stream, including ones
                        // about a late or unknown confirmation answer while
                        // the server side keeps generating
                        let terminal = frame.is_terminal();
                        if frames_tx.send(Ok(frame)).await.is_err() || terminal {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = frames_tx.send(Err(e)).await;
                        break;
                    }
                }
            }
        });

        Ok(ChatStream {
            frames: frames_rx,
            inactivity_timeout: self.config.inactivity_timeout(),
            reader,
            finished: false,
        })
    }
}

/// Turn a non-success response into [`AgentError::Http`]
async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Value>(&text)
        .ok()
        .and_then(|body| body.get("error").and_then(Value::as_str).map(str::to_string))
        .unwrap_or(text);
    Err(AgentError::Http {
        status: status.as_u16(),
        message,
    })
}

/// Answers confirmation requests for one connection
struct Confirmations {
    handler: Option<Arc<dyn ConfirmationHandler>>,
    unattended: UnattendedPolicy,
    outbound: mpsc::UnboundedSender<ClientFrame>,
}

impl Confirmations {
    fn answer(&self, prompt: ToolConfirmationPrompt) {
        let handler = self.handler.clone();
        let unattended = self.unattended;
        let outbound = self.outbound.clone();

        // A slow human must not stall the content flowing behind the request
        tokio::spawn(async move {
            let (confirmed, reason) = match handler {
                Some(handler) => match handler.confirm(&prompt).await {
                    Ok(confirmed) => (confirmed, None),
                    Err(e) => {
                        tracing::warn!(tool = %prompt.tool_name, "Confirmation prompt failed: {}", e);
                        (false, Some(format!("prompt failed: {}", e)))
                    }
                },
                None => (unattended.approves(), Some("no handler".to_string())),
            };
            tracing::debug!(
                confirmation_id = %prompt.confirmation_id,
                tool = %prompt.tool_name,
                confirmed,
                "Answering tool confirmation"
            );
            let _ = outbound.send(ClientFrame::ToolConfirmation {
                confirmation_id: prompt.confirmation_id,
                confirmed,
                reason,
            });
        });
    }
}

/// A streamed reply, consumed one chunk at a time
///
/// Dropping it closes the connection.
pub struct ChatStream {
    frames: mpsc::Receiver<Result<ServerFrame>>,
    inactivity_timeout: Duration,
    reader: JoinHandle<()>,
    finished: bool,
}

impl ChatStream {
    /// Next chunk, `None` once the stream has ended
    ///
    /// Each call waits at most the inactivity timeout. The final item is a
    /// `done` chunk or an error.
    pub async fn next_chunk(&mut self) -> Option<Result<StreamChunk>> {
        loop {
            if self.finished {
                return None;
            }

            let received = tokio::time::timeout(self.inactivity_timeout, self.frames.recv()).await;
            let frame = match received {
                Err(_) => {
                    self.finish();
                    return Some(Err(AgentError::Timeout(format!(
                        "no frame received within {:?}",
                        self.inactivity_timeout
                    ))));
                }
                Ok(None) => {
                    self.finish();
                    return Some(Err(AgentError::Stream(
                        "connection closed before stream_end".to_string(),
                    )));
                }
                Ok(Some(Err(e))) => {
                    self.finish();
                    return Some(Err(e));
                }
                Ok(Some(Ok(frame))) => frame,
            };

            match frame {
                ServerFrame::StreamChunk { content } => {
                    return Some(Ok(StreamChunk {
                        content,
                        done: false,
                    }))
                }
                ServerFrame::StreamEnd => {
                    self.finish();
                    return Some(Ok(StreamChunk {
                        content: String::new(),
                        done: true,
                    }));
                }
                ServerFrame::Error { error } => {
                    self.finish();
                    return Some(Err(AgentError::Stream(error)));
                }
                ServerFrame::StreamStart => tracing::trace!("Stream started"),
                other => tracing::debug!(kind = other.kind(), "Ignoring frame"),
            }
        }
    }

    /// Read to the end and return the concatenated content
    pub async fn collect_text(mut self) -> Result<String> {
        let mut text = String::new();
        while let Some(chunk) = self.next_chunk().await {
            let chunk = chunk?;
            text.push_str(&chunk.content);
        }
        Ok(text)
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<StreamChunk>> + Send {
        futures::stream::unfold(self, |mut stream| async move {
            let item = stream.next_chunk().await?;
            Some((item, stream))
        })
    }

    /// Stop reading; the writer then closes the connection
    fn finish(&mut self) {
        self.finished = true;
        self.reader.abort();
        self.frames.close();
    }
}

impl Drop for ChatStream {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
