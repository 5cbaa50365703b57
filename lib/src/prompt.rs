//! User prompt handling for tool confirmations
//!
//! The stream consumer hands each `tool_confirmation_request` to a
//! [`ConfirmationHandler`]; its answer is sent back as a `tool_confirmation`
//! frame.

use async_trait::async_trait;
use serde_json::Value;
use std::io::Write;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Result type for user prompt operations
pub type PromptResult<T> = Result<T, PromptError>;

/// Errors that can occur during user prompting
#[derive(Debug, thiserror::Error)]
pub enum PromptError {
    /// IO error occurred while reading user input
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// User provided invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Input ended before an answer was given
    #[error("No answer given")]
    NoAnswer,
}

/// A confirmation request as presented to the user
#[derive(Debug, Clone, PartialEq)]
pub struct ToolConfirmationPrompt {
    pub confirmation_id: String,
    pub tool_name: String,
    pub args: Value,
    pub message: String,
}

/// Decides whether a gated tool call may run
#[async_trait]
pub trait ConfirmationHandler: Send + Sync {
    async fn confirm(&self, prompt: &ToolConfirmationPrompt) -> PromptResult<bool>;
}

/// Reads a y/n answer from stdin
pub struct ConsoleConfirmationHandler;

impl ConsoleConfirmationHandler {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ConsoleConfirmationHandler {
    fn default() -> Self {
        Self::new()
    }
}

/// Interpret a typed answer; an empty line declines
pub fn parse_answer(input: &str) -> PromptResult<bool> {
    match input.trim().to_lowercase().as_str() {
        "y" | "yes" => Ok(true),
        "" | "n" | "no" => Ok(false),
        other => Err(PromptError::InvalidInput(format!(
            "expected y or n, got '{}'",
            other
        ))),
    }
}

#[async_trait]
impl ConfirmationHandler for ConsoleConfirmationHandler {
    async fn confirm(&self, prompt: &ToolConfirmationPrompt) -> PromptResult<bool> {
        println!("\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        println!("🔐 TOOL CONFIRMATION");
        println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        println!("Tool: {}", prompt.tool_name);
        println!("Args: {}", prompt.args);
        println!("{}", prompt.message);

        let stdin = tokio::io::stdin();
        let mut reader = BufReader::new(stdin);
        loop {
            print!("Allow? [y/N]: ");
            std::io::stdout().flush()?;

            let mut line = String::new();
            if reader.read_line(&mut line).await? == 0 {
                return Err(PromptError::NoAnswer);
            }
            match parse_answer(&line) {
                Ok(answer) => return Ok(answer),
                Err(e) => println!("{}", e),
            }
        }
    }
}

/// Always gives the same answer
pub struct StaticConfirmationHandler {
    approve: bool,
}

impl StaticConfirmationHandler {
    pub fn new(approve: bool) -> Self {
        Self { approve }
    }
}

#[async_trait]
impl ConfirmationHandler for StaticConfirmationHandler {
    async fn confirm(&self, prompt: &ToolConfirmationPrompt) -> PromptResult<bool> {
        tracing::debug!(
            tool = %prompt.tool_name,
            approve = self.approve,
            "Answering tool confirmation"
        );
        Ok(self.approve)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_answer() {
        assert!(parse_answer("y\n").unwrap());
        assert!(parse_answer(" YES ").unwrap());
        assert!(!parse_answer("n").unwrap());
        assert!(!parse_answer("\n").unwrap());
        assert!(matches!(parse_answer("maybe"), Err(PromptError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_static_handler() {
        let prompt = ToolConfirmationPrompt {
            confirmation_id: "c1".to_string(),
            tool_name: "get_weather".to_string(),
            args: json!({"location": "Paris"}),
            message: "fetch weather data for Paris?".to_string(),
        };

        assert!(StaticConfirmationHandler::new(true).confirm(&prompt).await.unwrap());
        assert!(!StaticConfirmationHandler::new(false).confirm(&prompt).await.unwrap());
    }
}
