//! Session registry
//!
//! Sessions live in memory for the lifetime of the process. The outer map lock
//! is only held to look up, insert or remove entries; each session sits behind
//! its own mutex so work on different sessions never serializes on one lock.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use ulid::Ulid;

use crate::error::{AgentError, Result};
use crate::provider::Provider;
use crate::tools::ToolDefinition;

/// Opaque session identifier
pub type SessionId = String;

/// Identifies one streaming connection
pub type ConnectionId = Ulid;

/// Short, collision resistant session id
pub fn generate_session_id() -> SessionId {
    Ulid::new().to_string().to_lowercase()
}

/// Role of a message sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

/// A message within a session's conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }
}

/// Marker for the stream currently running on a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveStream {
    pub connection_id: ConnectionId,
    pub started_at: DateTime<Utc>,
}

/// A conversation with its provider binding
pub struct Session {
    pub id: SessionId,
    pub messages: Vec<Message>,
    pub system_prompt: Option<String>,
    pub tools: Vec<ToolDefinition>,
    pub provider: Arc<dyn Provider>,
    pub created_at: DateTime<Utc>,
    active_stream: Option<ActiveStream>,
}

impl Session {
    pub fn new(
        id: SessionId,
        system_prompt: Option<String>,
        tools: Vec<ToolDefinition>,
        provider: Arc<dyn Provider>,
    ) -> Self {
        Self {
            id,
            messages: Vec::new(),
            system_prompt,
            tools,
            provider,
            created_at: Utc::now(),
            active_stream: None,
        }
    }

    pub fn active_stream(&self) -> Option<&ActiveStream> {
        self.active_stream.as_ref()
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.clone(),
            messages: self.messages.clone(),
            system_prompt: self.system_prompt.clone(),
            tools: self.tools.clone(),
            provider: Arc::clone(&self.provider),
            created_at: self.created_at,
            active_stream: self.active_stream.clone(),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("messages", &self.messages.len())
            .field("system_prompt", &self.system_prompt)
            .field("provider", &self.provider.name())
            .field("active_stream", &self.active_stream)
            .finish()
    }
}

/// Point-in-time copy of a session
#[derive(Clone)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub messages: Vec<Message>,
    pub system_prompt: Option<String>,
    pub tools: Vec<ToolDefinition>,
    pub provider: Arc<dyn Provider>,
    pub created_at: DateTime<Utc>,
    pub active_stream: Option<ActiveStream>,
}

impl SessionSnapshot {
    pub fn is_streaming(&self) -> bool {
        self.active_stream.is_some()
    }
}

impl fmt::Debug for SessionSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionSnapshot")
            .field("id", &self.id)
            .field("messages", &self.messages)
            .field("provider", &self.provider.name())
            .field("active_stream", &self.active_stream)
            .finish()
    }
}

type SessionEntry = Arc<Mutex<Session>>;

fn lock_entry(entry: &Mutex<Session>) -> MutexGuard<'_, Session> {
    // Session mutations are plain field updates; recover rather than fail
    entry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Thread-safe, in-memory session registry
#[derive(Default)]
pub struct SessionStore {
    sessions: RwLock<HashMap<SessionId, SessionEntry>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session with a fresh id
    pub fn create(
        &self,
        system_prompt: Option<String>,
        tools: Vec<ToolDefinition>,
        provider: Arc<dyn Provider>,
    ) -> Result<SessionId> {
        self.insert(Session::new(
            generate_session_id(),
            system_prompt,
            tools,
            provider,
        ))
    }

    /// Register a session; an id that is already taken is a registry failure
    pub fn insert(&self, session: Session) -> Result<SessionId> {
        let id = session.id.clone();
        let mut sessions = self
            .sessions
            .write()
            .map_err(|_| AgentError::Session("Failed to acquire write lock".to_string()))?;

        if sessions.contains_key(&id) {
            tracing::error!(session_id = %id, "Duplicate session id generated");
            return Err(AgentError::Session(format!("duplicate session id: {}", id)));
        }

        sessions.insert(id.clone(), Arc::new(Mutex::new(session)));
        tracing::debug!(session_id = %id, "Created session");
        Ok(id)
    }

    fn entry(&self, session_id: &str) -> Result<SessionEntry> {
        let sessions = self
            .sessions
            .read()
            .map_err(|_| AgentError::Session("Failed to acquire read lock".to_string()))?;

        sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| AgentError::SessionNotFound(session_id.to_string()))
    }

    /// Run `f` against a single session while holding only that session's lock
    pub fn with_session<F, R>(&self, session_id: &str, f: F) -> Result<R>
    where
        F: FnOnce(&mut Session) -> R,
    {
        let entry = self.entry(session_id)?;
        let mut session = lock_entry(&entry);
        Ok(f(&mut session))
    }

    pub fn get(&self, session_id: &str) -> Result<SessionSnapshot> {
        self.with_session(session_id, |session| session.snapshot())
    }

    pub fn append_message(
        &self,
        session_id: &str,
        role: MessageRole,
        content: impl Into<String>,
    ) -> Result<()> {
        let message = Message::new(role, content);
        self.with_session(session_id, |session| session.messages.push(message))?;
        tracing::debug!(session_id, ?role, "Appended message");
        Ok(())
    }

    pub fn list_messages(&self, session_id: &str) -> Result<Vec<Message>> {
        self.with_session(session_id, |session| session.messages.clone())
    }

    /// Remove a session; `false` when it did not exist
    pub fn delete(&self, session_id: &str) -> bool {
        let mut sessions = match self.sessions.write() {
            Ok(sessions) => sessions,
            Err(poisoned) => poisoned.into_inner(),
        };
        let removed = sessions.remove(session_id).is_some();
        if removed {
            tracing::debug!(session_id, "Removed session");
        }
        removed
    }

    pub fn len(&self) -> usize {
        match self.sessions.read() {
            Ok(sessions) => sessions.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_streaming(&self, session_id: &str) -> Result<bool> {
        self.with_session(session_id, |session| session.active_stream.is_some())
    }

    /// Run `f` only while `connection_id` holds the session's stream lease
    ///
    /// The session lock is held across `f`, so the lease cannot be released
    /// or change hands while it runs. `None` when the connection is not the
    /// holder.
    pub fn with_stream_owner<F, R>(
        &self,
        session_id: &str,
        connection_id: ConnectionId,
        f: F,
    ) -> Result<Option<R>>
    where
        F: FnOnce() -> R,
    {
        self.with_session(session_id, |session| {
            let owned = session
                .active_stream()
                .is_some_and(|active| active.connection_id == connection_id);
            owned.then(f)
        })
    }

    /// Mark the session as streaming for `connection_id`
    ///
    /// A session that already has a live stream is rejected, never taken over.
    /// The returned lease clears the marker when dropped.
    pub fn begin_stream(&self, session_id: &str, connection_id: ConnectionId) -> Result<StreamLease> {
        let entry = self.entry(session_id)?;
        {
            let mut session = lock_entry(&entry);
            if let Some(active) = &session.active_stream {
                tracing::warn!(
                    session_id,
                    holder = %active.connection_id,
                    requester = %connection_id,
                    "Rejected stream request on a session that is already streaming"
                );
                return Err(AgentError::Protocol(format!(
                    "session {} is already streaming",
                    session_id
                )));
            }
            session.active_stream = Some(ActiveStream {
                connection_id,
                started_at: Utc::now(),
            });
        }

        tracing::trace!(session_id, %connection_id, "Stream lease acquired");
        Ok(StreamLease {
            entry,
            session_id: session_id.to_string(),
            connection_id,
        })
    }
}

/// Exclusive right to stream on a session, released on drop
pub struct StreamLease {
    entry: SessionEntry,
    session_id: SessionId,
    connection_id: ConnectionId,
}

impl StreamLease {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }
}

impl Drop for StreamLease {
    fn drop(&mut self) {
        let mut session = lock_entry(&self.entry);
        let held_by_us = session
            .active_stream
            .as_ref()
            .is_some_and(|active| active.connection_id == self.connection_id);
        if held_by_us {
            session.active_stream = None;
            tracing::trace!(session_id = %self.session_id, "Stream lease released");
        }
    }
}

impl fmt::Debug for StreamLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamLease")
            .field("session_id", &self.session_id)
            .field("connection_id", &self.connection_id)
            .finish()
    }
}
