//! Streaming-plane frames
//!
//! Every WebSocket text message carries exactly one JSON object whose `type`
//! field selects the frame kind. Client and server frames are separate closed
//! unions; a frame with an unknown `type` is a protocol error.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AgentError, Result};

/// Frames sent by the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Start streaming a reply to `user_message` within a session
    #[serde(rename_all = "camelCase")]
    ChatStream {
        session_id: String,
        user_message: String,
    },
    /// Answer to a `tool_confirmation_request`
    #[serde(rename_all = "camelCase")]
    ToolConfirmation {
        confirmation_id: String,
        confirmed: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

/// Frames sent by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    StreamStart,
    StreamChunk {
        content: String,
    },
    #[serde(rename_all = "camelCase")]
    ToolConfirmationRequest {
        confirmation_id: String,
        tool_name: String,
        args: Value,
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    ToolConfirmationReceived {
        confirmation_id: String,
    },
    StreamEnd,
    Error {
        error: String,
    },
}

impl ClientFrame {
    pub fn parse(text: &str) -> Result<Self> {
        parse_frame(text)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl ServerFrame {
    pub fn parse(text: &str) -> Result<Self> {
        parse_frame(text)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerFrame::Error {
            error: message.into(),
        }
    }

    pub fn chunk(content: impl Into<String>) -> Self {
        ServerFrame::StreamChunk {
            content: content.into(),
        }
    }

    /// `stream_end` and `error` close a stream
    pub fn is_terminal(&self) -> bool {
        matches!(self, ServerFrame::StreamEnd | ServerFrame::Error { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ServerFrame::StreamStart => "stream_start",
            ServerFrame::StreamChunk { .. } => "stream_chunk",
            ServerFrame::ToolConfirmationRequest { .. } => "tool_confirmation_request",
            ServerFrame::ToolConfirmationReceived { .. } => "tool_confirmation_received",
            ServerFrame::StreamEnd => "stream_end",
            ServerFrame::Error { .. } => "error",
        }
    }
}

/// Decode a frame, reporting every failure as [`AgentError::Protocol`]
///
/// The `type` tag is checked first so an unknown kind and a malformed known
/// kind produce distinct messages.
fn parse_frame<T>(text: &str) -> Result<T>
where
    T: for<'de> Deserialize<'de>,
{
    let value: Value = serde_json::from_str(text)
        .map_err(|e| AgentError::Protocol(format!("invalid frame JSON: {}", e)))?;

    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| AgentError::Protocol("frame is missing a string `type` field".to_string()))?
        .to_string();

    serde_json::from_value(value).map_err(|e| {
        if e.to_string().starts_with("unknown variant") {
            AgentError::Protocol(format!("unknown frame type: {}", kind))
        } else {
            AgentError::Protocol(format!("malformed {} frame: {}", kind, e))
        }
    })
}
