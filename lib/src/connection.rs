//! WebSocket connection handling
//!
//! One reader loop per connection parses client frames, one writer task
//! drains the connection's outbound frame queue, and at most one dispatcher
//! task streams at a time. Closing the connection aborts the running stream
//! and cancels the confirmations it was waiting on.

use axum::extract::ws::{Message as WsMessage, WebSocket};
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use ulid::Ulid;

use crate::confirmation::Decision;
use crate::dispatcher::{FrameSender, StreamOutcome};
use crate::error::AgentError;
use crate::protocol::{ClientFrame, ServerFrame};
use crate::server::AppState;
use crate::session::{ConnectionId, SessionId};

/// Connection manager for tracking live streaming connections
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, ConnectionInfo>>,
}

/// Information about a live connection
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub streams_started: u64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register(&self, id: ConnectionId) {
        let now = Utc::now();
        self.connections.write().await.insert(
            id,
            ConnectionInfo {
                id,
                connected_at: now,
                last_activity: now,
                streams_started: 0,
            },
        );
        tracing::info!(connection_id = %id, "Registered connection");
    }

    /// Update activity timestamp for a connection
    pub async fn touch(&self, id: ConnectionId) {
        if let Some(info) = self.connections.write().await.get_mut(&id) {
            info.last_activity = Utc::now();
        }
    }

    async fn record_stream(&self, id: ConnectionId) {
        if let Some(info) = self.connections.write().await.get_mut(&id) {
            info.streams_started += 1;
        }
    }

    pub async fn remove(&self, id: ConnectionId) -> Option<ConnectionInfo> {
        let removed = self.connections.write().await.remove(&id);
        if removed.is_some() {
            tracing::debug!(connection_id = %id, "Removed connection");
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The stream task currently owned by a connection
struct RunningStream {
    session_id: SessionId,
    handle: JoinHandle<StreamOutcome>,
}

impl RunningStream {
    fn is_live(&self) -> bool {
        !self.handle.is_finished()
    }
}

/// Per-connection reader state
struct Connection {
    id: ConnectionId,
    state: AppState,
    frames: FrameSender,
    stream: Option<RunningStream>,
}

impl Connection {
    fn reply(&self, frame: ServerFrame) {
        if self.frames.send(frame).is_err() {
            tracing::debug!(connection_id = %self.id, "Reply dropped, writer is gone");
        }
    }

    async fn handle_text(&mut self, text: &str) {
        let frame = match ClientFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(connection_id = %self.id, "Rejected client frame: {}", e);
                self.reply(ServerFrame::error(e.client_message()));
                return;
            }
        };

        match frame {
            ClientFrame::ChatStream {
                session_id,
                user_message,
            } => self.start_stream(session_id, user_message).await,
            ClientFrame::ToolConfirmation {
                confirmation_id,
                confirmed,
                reason,
            } => self.settle_confirmation(confirmation_id, Decision { confirmed, reason }),
        }
    }

    async fn start_stream(&mut self, session_id: SessionId, user_message: String) {
        if let Some(running) = self.stream.as_ref().filter(|s| s.is_live()) {
            tracing::warn!(
                connection_id = %self.id,
                session_id = %running.session_id,
                requested = %session_id,
                "Stream requested while another is running on this connection"
            );
            let error = AgentError::Protocol("a stream is already running on this connection".to_string());
            self.reply(ServerFrame::error(error.client_message()));
            return;
        }

        // The lease is taken here so that a rejected request never leaves
        // this connection holding someone else's session
        let lease = match self.state.sessions.begin_stream(&session_id, self.id) {
            Ok(lease) => lease,
            Err(e) => {
                tracing::info!(connection_id = %self.id, %session_id, "Stream rejected: {}", e);
                self.reply(ServerFrame::error(e.client_message()));
                return;
            }
        };

        tracing::info!(connection_id = %self.id, %session_id, "Starting stream");
        self.state.connections.record_stream(self.id).await;

        let dispatcher = Arc::clone(&self.state.dispatcher);
        let frames = self.frames.clone();
        let handle = tokio::spawn(async move { dispatcher.run(lease, user_message, frames).await });

        self.stream = Some(RunningStream { session_id, handle });
    }

    fn settle_confirmation(&self, confirmation_id: String, decision: Decision) {
        // Only the stream holding the session lease may answer its confirmations
        let owned = self.stream.as_ref().and_then(|running| {
            self.state
                .sessions
                .with_stream_owner(&running.session_id, self.id, || {
                    self.state
                        .broker
                        .settle(&confirmation_id, &running.session_id, decision)
                })
                .ok()
                .flatten()
        });
        let result = owned.unwrap_or_else(|| Err(AgentError::ConfirmationNotFound(confirmation_id.clone())));

        match result {
            Ok(()) => self.reply(ServerFrame::ToolConfirmationReceived { confirmation_id }),
            Err(e) => {
                tracing::warn!(connection_id = %self.id, %confirmation_id, "Confirmation rejected: {}", e);
                self.reply(ServerFrame::error(e.client_message()));
            }
        }
    }

    async fn close(mut self) {
        if let Some(running) = self.stream.take() {
            let cancelled = self
                .state
                .sessions
                .with_stream_owner(&running.session_id, self.id, || {
                    self.state.broker.cancel_session(&running.session_id)
                })
                .ok()
                .flatten();
            if let Some(cancelled) = cancelled {
                tracing::info!(
                    connection_id = %self.id,
                    session_id = %running.session_id,
                    cancelled,
                    "Connection closed mid-stream, aborting"
                );
            }
            running.handle.abort();
            // Awaiting the aborted task guarantees its lease has been dropped
            let _ = running.handle.await;
        }

        if let Some(info) = self.state.connections.remove(self.id).await {
            tracing::info!(
                connection_id = %self.id,
                streams = info.streams_started,
                active_secs = (info.last_activity - info.connected_at).num_seconds(),
                "Connection closed"
            );
        }
    }
}

/// Serve one upgraded WebSocket until the client goes away
pub async fn handle_socket(socket: WebSocket, state: AppState) {
    let connection_id = Ulid::new();
    state.connections.register(connection_id).await;

    let (mut sink, mut source) = socket.split();
    let (frames_tx, mut frames_rx) = mpsc::unbounded_channel::<ServerFrame>();

    let writer = tokio::spawn(async move {
        while let Some(frame) = frames_rx.recv().await {
            let text = match frame.to_json() {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!(%connection_id, "Failed to encode frame: {}", e);
                    continue;
                }
            };
            if sink.send(WsMessage::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut connection = Connection {
        id: connection_id,
        state: state.clone(),
        frames: frames_tx,
        stream: None,
    };

    while let Some(message) = source.next().await {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(%connection_id, "WebSocket receive failed: {}", e);
                break;
            }
        };
        state.connections.touch(connection_id).await;

        match message {
            WsMessage::Text(text) => connection.handle_text(text.as_str()).await,
            WsMessage::Binary(_) => {
                let error = AgentError::Protocol("binary frames are not supported".to_string());
                connection.reply(ServerFrame::error(error.client_message()));
            }
            WsMessage::Close(_) => break,
            WsMessage::Ping(_) | WsMessage::Pong(_) => {}
        }
    }

    // Drops the last frame sender, so the writer flushes and finishes
    connection.close().await;
    let _ = writer.await;
    tracing::debug!(%connection_id, "Connection handler finished");
}
