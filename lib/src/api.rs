//! Session control API
//!
//! Transport-neutral operations behind the HTTP routes: create, inspect,
//! append to and delete sessions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{AgentError, Result};
use crate::provider::ProviderFactory;
use crate::session::{Message, MessageRole, SessionId, SessionStore};
use crate::tools::{ToolDefinition, ToolRegistry};

/// Public view of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: SessionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    pub tools: Vec<ToolDefinition>,
    pub message_count: usize,
    pub streaming: bool,
    pub created_at: DateTime<Utc>,
}

/// Liveness report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub sessions: usize,
    #[serde(default)]
    pub connections: usize,
}

pub struct SessionApi {
    sessions: Arc<SessionStore>,
    providers: Arc<dyn ProviderFactory>,
    tools: Arc<ToolRegistry>,
}

impl SessionApi {
    pub fn new(
        sessions: Arc<SessionStore>,
        providers: Arc<dyn ProviderFactory>,
        tools: Arc<ToolRegistry>,
    ) -> Self {
        Self {
            sessions,
            providers,
            tools,
        }
    }

    /// Create a session bound to a fresh provider and every registered tool
    pub fn create_session(&self, system_prompt: Option<String>) -> Result<SessionId> {
        let provider = self.providers.create().map_err(|e| match e {
            AgentError::Provider(message) => AgentError::Provider(message),
            other => AgentError::Provider(other.to_string()),
        })?;
        let provider_name = provider.name().to_string();

        let session_id = self
            .sessions
            .create(system_prompt, self.tools.definitions(), provider)?;
        tracing::info!(%session_id, provider = %provider_name, "Session created");
        Ok(session_id)
    }

    pub fn get_session(&self, session_id: &str) -> Result<SessionInfo> {
        let snapshot = self.sessions.get(session_id)?;
        let streaming = snapshot.is_streaming();
        Ok(SessionInfo {
            id: snapshot.id,
            system_prompt: snapshot.system_prompt,
            tools: snapshot.tools,
            message_count: snapshot.messages.len(),
            streaming,
            created_at: snapshot.created_at,
        })
    }

    pub fn list_messages(&self, session_id: &str) -> Result<Vec<Message>> {
        self.sessions.list_messages(session_id)
    }

    /// Append a message without generating a reply
    pub fn append_message(&self, session_id: &str, role: MessageRole, content: String) -> Result<()> {
        self.sessions.append_message(session_id, role, content)
    }

    /// `false` when the session did not exist
    pub fn delete_session(&self, session_id: &str) -> bool {
        let removed = self.sessions.delete(session_id);
        if removed {
            tracing::info!(session_id, "Session deleted");
        }
        removed
    }

    pub fn health(&self, connections: usize) -> HealthStatus {
        HealthStatus {
            status: "ok".to_string(),
            sessions: self.sessions.len(),
            connections,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ToolsConfig;
    use crate::echo_provider::EchoProvider;
    use crate::provider::{Provider, SharedProviderFactory};

    struct FailingFactory;

    impl ProviderFactory for FailingFactory {
        fn create(&self) -> Result<Arc<dyn Provider>> {
            Err(AgentError::Config("no credentials".to_string()))
        }
    }

    fn api() -> SessionApi {
        SessionApi::new(
            Arc::new(SessionStore::new()),
            Arc::new(SharedProviderFactory(Arc::new(EchoProvider::immediate()))),
            Arc::new(ToolRegistry::with_builtins(&ToolsConfig::default())),
        )
    }

    #[test]
    fn test_create_and_inspect_session() {
        let api = api();
        let id = api.create_session(Some("be brief".to_string())).unwrap();
        api.append_message(&id, MessageRole::User, "hi".to_string())
            .unwrap();

        let info = api.get_session(&id).unwrap();
        assert_eq!(info.id, id);
        assert_eq!(info.system_prompt.as_deref(), Some("be brief"));
        let tool_names: Vec<&str> = info.tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(tool_names, vec!["calculate", "get_weather"]);
        assert_eq!(info.message_count, 1);
        assert!(!info.streaming);

        let value = serde_json::to_value(&info).unwrap();
        assert!(value.get("messageCount").is_some());
        assert!(value.get("createdAt").is_some());
    }

    #[test]
    fn test_factory_failure_is_provider_error() {
        let api = SessionApi::new(
            Arc::new(SessionStore::new()),
            Arc::new(FailingFactory),
            Arc::new(ToolRegistry::new()),
        );
        let result = api.create_session(None);
        assert!(matches!(result, Err(AgentError::Provider(_))));
        assert_eq!(api.health(0).sessions, 0);
    }

    #[test]
    fn test_delete_and_health() {
        let api = api();
        let id = api.create_session(None).unwrap();
        assert_eq!(api.health(2), HealthStatus {
            status: "ok".to_string(),
            sessions: 1,
            connections: 2,
        });

        assert!(api.delete_session(&id));
        assert!(!api.delete_session(&id));
        assert!(matches!(
            api.get_session(&id),
            Err(AgentError::SessionNotFound(_))
        ));
    }
}
