//! Offline provider that echoes the latest user message
//!
//! Gives the server a working default without credentials. Weather questions
//! go through `get_weather` first so the confirmation round-trip can be tried
//! from a terminal.

use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;

use crate::error::Result;
use crate::provider::{event_channel, GenerationRequest, Provider, ProviderStream};
use crate::session::MessageRole;

/// Pause between echoed words so the reply visibly streams
const WORD_DELAY: Duration = Duration::from_millis(20);

#[derive(Debug, Default)]
pub struct EchoProvider {
    word_delay: Duration,
}

impl EchoProvider {
    pub fn new() -> Self {
        Self {
            word_delay: WORD_DELAY,
        }
    }

    /// Echo without pauses between words
    pub fn immediate() -> Self {
        Self::default()
    }
}

/// Location named after the last " in ", if any
fn weather_location(text: &str) -> Option<String> {
    let lower = text.to_ascii_lowercase();
    if !lower.contains("weather") {
        return None;
    }
    let location = match lower.rfind(" in ") {
        Some(index) => text[index + 4..]
            .trim()
            .trim_end_matches(|c: char| c.is_ascii_punctuation())
            .to_string(),
        None => String::new(),
    };
    if location.is_empty() {
        Some("San Francisco".to_string())
    } else {
        Some(location)
    }
}

#[async_trait]
impl Provider for EchoProvider {
    fn name(&self) -> &str {
        "echo"
    }

    async fn stream(&self, request: GenerationRequest) -> Result<ProviderStream> {
        let prompt = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::User)
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let offers_weather = request.tools.iter().any(|t| t.name == "get_weather");
        let word_delay = self.word_delay;

        let (emitter, stream) = event_channel();
        tokio::spawn(async move {
            if offers_weather {
                if let Some(location) = weather_location(&prompt) {
                    let output = emitter
                        .call_tool("echo_weather", "get_weather", json!({ "location": location }))
                        .await;
                    let Some(output) = output else { return };
                    let summary = match output.get("error") {
                        Some(_) => "I could not check the weather. ".to_string(),
                        None => format!(
                            "It is {} and {} in {}. ",
                            output["temperature"].as_str().unwrap_or("?"),
                            output["conditions"].as_str().unwrap_or("unknown"),
                            location
                        ),
                    };
                    if !emitter.content(summary).await {
                        return;
                    }
                }
            }

            let mut words = prompt.split_whitespace().peekable();
            if words.peek().is_some() && !emitter.content("You said: ").await {
                return;
            }
            while let Some(word) = words.next() {
                let fragment = if words.peek().is_some() {
                    format!("{} ", word)
                } else {
                    word.to_string()
                };
                if !emitter.content(fragment).await {
                    return;
                }
                if !word_delay.is_zero() {
                    tokio::time::sleep(word_delay).await;
                }
            }
            emitter.finish().await;
        });

        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ToolsConfig;
    use crate::provider::ProviderEvent;
    use crate::session::Message;
    use crate::tools::ToolRegistry;
    use futures::StreamExt;

    #[test]
    fn test_weather_location() {
        assert_eq!(weather_location("weather in Paris?"), Some("Paris".to_string()));
        assert_eq!(
            weather_location("What's the weather like in New York"),
            Some("New York".to_string())
        );
        assert_eq!(weather_location("weather please"), Some("San Francisco".to_string()));
        assert_eq!(weather_location("hello there"), None);
    }

    #[tokio::test]
    async fn test_echoes_last_user_message() {
        let provider = EchoProvider::immediate();
        let request = GenerationRequest {
            messages: vec![Message::user("first"), Message::assistant("ok"), Message::user("hi there")],
            system_prompt: None,
            tools: Vec::new(),
        };

        let mut stream = provider.stream(request).await.unwrap();
        let mut text = String::new();
        while let Some(event) = stream.next().await {
            match event.unwrap() {
                ProviderEvent::Content(fragment) => text.push_str(&fragment),
                ProviderEvent::Finish => break,
                ProviderEvent::ToolCall(_) => panic!("unexpected tool call"),
            }
        }
        assert_eq!(text, "You said: hi there");
    }

    #[tokio::test]
    async fn test_weather_question_calls_tool_first() {
        let provider = EchoProvider::immediate();
        let request = GenerationRequest {
            messages: vec![Message::user("weather in Oslo")],
            system_prompt: None,
            tools: ToolRegistry::with_builtins(&ToolsConfig::default()).definitions(),
        };

        let mut stream = provider.stream(request).await.unwrap();
        match stream.next().await {
            Some(Ok(ProviderEvent::ToolCall(call))) => {
                assert_eq!(call.name, "get_weather");
                assert_eq!(call.arguments, json!({"location": "Oslo"}));
                call.respond(json!({"error": "weather request cancelled by user"}));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        match stream.next().await {
            Some(Ok(ProviderEvent::Content(text))) => {
                assert_eq!(text, "I could not check the weather. ")
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
