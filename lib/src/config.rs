//! Configuration types for the Ruby agent server and client

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{AgentError, Result};

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    3001
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_max_steps() -> u32 {
    3
}

fn default_confirmation_timeout() -> u64 {
    30
}

fn default_server_url() -> String {
    "http://localhost:3001".to_string()
}

fn default_inactivity_timeout() -> u64 {
    30
}

fn default_frame_buffer() -> usize {
    256
}

/// Main configuration structure for the Ruby agent
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub confirmation: ConfirmationConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
}

/// Server configuration options
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
        }
    }
}

/// Which provider backs newly created sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Offline provider that echoes the user's message back
    #[default]
    Echo,
    /// Any OpenAI-compatible chat completions endpoint
    #[serde(rename = "openai")]
    OpenAi,
    /// Accepted in config files but not implemented
    Anthropic,
    /// Accepted in config files but not implemented
    Bedrock,
}

impl ProviderKind {
    pub fn name(self) -> &'static str {
        match self {
            ProviderKind::Echo => "echo",
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Bedrock => "bedrock",
        }
    }

    pub fn is_supported(self) -> bool {
        matches!(self, ProviderKind::Echo | ProviderKind::OpenAi)
    }
}

/// Configuration for the AI provider binding
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub kind: ProviderKind,
    #[serde(default = "default_model")]
    pub model: String,
    /// Falls back to `OPENAI_API_KEY` when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Maximum generation steps per stream when tools are involved
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: ProviderKind::default(),
            model: default_model(),
            api_key: None,
            base_url: None,
            max_steps: default_max_steps(),
        }
    }
}

/// Decision applied when a confirmation cannot be routed to a person
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnattendedPolicy {
    /// Fail open: approve the tool call
    #[default]
    AutoApprove,
    /// Fail closed: deny the tool call
    AutoDeny,
}

impl UnattendedPolicy {
    pub fn approves(self) -> bool {
        matches!(self, UnattendedPolicy::AutoApprove)
    }
}

/// Server side tool confirmation settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConfirmationConfig {
    #[serde(default = "default_confirmation_timeout")]
    pub timeout_secs: u64,
    /// Used when no client connection can carry the request
    #[serde(default)]
    pub unattended: UnattendedPolicy,
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_confirmation_timeout(),
            unattended: UnattendedPolicy::default(),
        }
    }
}

impl ConfirmationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Client side connection settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    #[serde(default = "default_server_url")]
    pub server_url: String,
    /// Derived from `server_url` when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ws_url: Option<String>,
    #[serde(default = "default_inactivity_timeout")]
    pub inactivity_timeout_secs: u64,
    /// Frames buffered between the connection reader and the consumer
    #[serde(default = "default_frame_buffer")]
    pub frame_buffer: usize,
    /// Used when no confirmation handler is registered
    #[serde(default)]
    pub unattended: UnattendedPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            ws_url: None,
            inactivity_timeout_secs: default_inactivity_timeout(),
            frame_buffer: default_frame_buffer(),
            unattended: UnattendedPolicy::default(),
        }
    }
}

impl ClientConfig {
    pub fn for_server(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            ..Self::default()
        }
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_secs)
    }

    /// WebSocket endpoint, `http(s)://` rewritten to `ws(s)://` when not configured
    pub fn resolved_ws_url(&self) -> String {
        match &self.ws_url {
            Some(url) => url.clone(),
            None => self.server_url.replacen("http", "ws", 1),
        }
    }
}

/// Built-in tool behaviour
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ToolsConfig {
    /// Artificial delay before a tool returns, for demos
    #[serde(default)]
    pub simulated_latency_ms: u64,
}

impl AgentConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if !["error", "warn", "info", "debug", "trace"].contains(&self.server.log_level.as_str()) {
            return Err(AgentError::Config(format!(
                "Invalid log level: {}",
                self.server.log_level
            )));
        }

        if self.server.host.is_empty() {
            return Err(AgentError::Config("Server host cannot be empty".to_string()));
        }

        if !self.provider.kind.is_supported() {
            return Err(AgentError::Config(format!(
                "unsupported provider: {}",
                self.provider.kind.name()
            )));
        }

        if self.provider.model.is_empty() {
            return Err(AgentError::Config("Provider model cannot be empty".to_string()));
        }

        if self.provider.max_steps == 0 {
            return Err(AgentError::Config(
                "Provider max_steps must be at least 1".to_string(),
            ));
        }

        if self.confirmation.timeout_secs == 0 {
            return Err(AgentError::Config(
                "Confirmation timeout must be at least one second".to_string(),
            ));
        }

        if self.client.frame_buffer == 0 {
            return Err(AgentError::Config(
                "Client frame_buffer must be at least 1".to_string(),
            ));
        }

        url::Url::parse(&self.client.server_url).map_err(|e| {
            AgentError::Config(format!(
                "Invalid client server_url '{}': {}",
                self.client.server_url, e
            ))
        })?;

        Ok(())
    }

    /// Apply `RUBY_SERVER_HOST` / `RUBY_SERVER_PORT` overrides
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    fn apply_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("RUBY_SERVER_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("RUBY_SERVER_PORT") {
            self.server.port = port
                .parse()
                .map_err(|_| AgentError::Config(format!("Invalid RUBY_SERVER_PORT: {}", port)))?;
        }
        Ok(())
    }

    /// Load configuration from JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        let config: AgentConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to JSON string
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
