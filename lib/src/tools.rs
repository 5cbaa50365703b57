//! Tool definitions and execution
//!
//! Providers only ever see [`ToolDefinition`]s. Execution, confirmation gating
//! and cancellation payloads stay on the server side so the stream dispatcher
//! decides whether a side-effecting call actually runs.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ToolsConfig;
use crate::error::{AgentError, Result};

/// Description of a tool as advertised to providers and clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema of the arguments object
    pub parameters: Value,
    /// Gated tools need a client decision before they run
    pub requires_confirmation: bool,
}

/// A tool the server can run on behalf of a provider
#[async_trait]
pub trait Tool: Send + Sync {
    fn definition(&self) -> ToolDefinition;

    /// Human readable question shown to the user for gated tools
    fn confirmation_message(&self, args: &Value) -> String {
        format!("run {} with {}?", self.definition().name, args)
    }

    async fn execute(&self, args: Value) -> Result<Value>;

    /// Result handed back to the provider when the user denies the call
    fn cancelled(&self, _args: &Value, reason: Option<&str>) -> Value {
        let mut payload = json!({
            "error": format!("{} request cancelled by user", self.definition().name),
        });
        if let Some(reason) = reason {
            payload["reason"] = json!(reason);
        }
        payload
    }
}

/// Name-indexed set of tools shared by every session
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `get_weather` and `calculate`
    pub fn with_builtins(config: &ToolsConfig) -> Self {
        let latency = Duration::from_millis(config.simulated_latency_ms);
        let mut registry = Self::new();
        registry.register(Arc::new(WeatherTool { latency }));
        registry.register(Arc::new(CalculateTool { latency }));
        registry
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.definition().name;
        tracing::debug!("Registering tool: {}", name);
        self.tools.insert(name, tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|tool| tool.definition()).collect()
    }

    /// Unknown tools are never gated; they fail at execution instead
    pub fn requires_confirmation(&self, name: &str) -> bool {
        self.tools
            .get(name)
            .map(|tool| tool.definition().requires_confirmation)
            .unwrap_or(false)
    }

    pub fn confirmation_message(&self, name: &str, args: &Value) -> String {
        match self.tools.get(name) {
            Some(tool) => tool.confirmation_message(args),
            None => format!("run {}?", name),
        }
    }

    /// Run a tool, folding failures into an `{"error": ...}` payload
    ///
    /// A failing tool is a result the provider can react to, not a stream error.
    pub async fn execute(&self, name: &str, args: Value) -> Value {
        let Some(tool) = self.get(name) else {
            tracing::warn!("Provider requested unknown tool: {}", name);
            return json!({ "error": format!("unknown tool: {}", name) });
        };

        match tool.execute(args).await {
            Ok(output) => output,
            Err(e) => {
                tracing::info!("Tool {} failed: {}", name, e);
                json!({ "error": e.to_string() })
            }
        }
    }

    pub fn cancelled(&self, name: &str, args: &Value, reason: Option<&str>) -> Value {
        match self.tools.get(name) {
            Some(tool) => tool.cancelled(args, reason),
            None => json!({ "error": format!("{} request cancelled by user", name) }),
        }
    }
}

fn string_arg<'a>(args: &'a Value, key: &str) -> Result<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| AgentError::ToolExecution(format!("Missing '{}' argument", key)))
}

fn number_arg(args: &Value, key: &str) -> Result<f64> {
    args.get(key)
        .and_then(Value::as_f64)
        .ok_or_else(|| AgentError::ToolExecution(format!("Missing '{}' argument", key)))
}

/// First eight bytes of the SHA-256 of the lowercased location
fn location_seed(location: &str) -> u64 {
    let digest = Sha256::digest(location.to_lowercase().as_bytes());
    digest[..8]
        .iter()
        .fold(0u64, |seed, byte| (seed << 8) | u64::from(*byte))
}

/// Simulated weather lookup, gated behind user confirmation
struct WeatherTool {
    latency: Duration,
}

#[async_trait]
impl Tool for WeatherTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "get_weather".to_string(),
            description: "Get the current weather for a location".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "location": {
                        "type": "string",
                        "description": "The location to get weather for"
                    },
                    "unit": {
                        "type": "string",
                        "enum": ["celsius", "fahrenheit"],
                        "description": "Temperature unit"
                    }
                },
                "required": ["location"]
            }),
            requires_confirmation: true,
        }
    }

    fn confirmation_message(&self, args: &Value) -> String {
        let location = args
            .get("location")
            .and_then(Value::as_str)
            .unwrap_or("unknown location");
        format!("fetch weather data for {}?", location)
    }

    async fn execute(&self, args: Value) -> Result<Value> {
        let location = string_arg(&args, "location")?;
        let unit = args.get("unit").and_then(Value::as_str);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        // Stable per location so repeated questions agree with each other
        let seed = location_seed(location);

        let temperature = 10 + seed % 30;
        let conditions = ["sunny", "cloudy", "rainy", "snowy"][(seed / 30 % 4) as usize];
        let humidity = 40 + seed / 120 % 40;
        let unit_symbol = if unit == Some("celsius") { "C" } else { "F" };

        Ok(json!({
            "location": location,
            "temperature": format!("{}°{}", temperature, unit_symbol),
            "conditions": conditions,
            "humidity": format!("{}%", humidity),
        }))
    }

    fn cancelled(&self, args: &Value, reason: Option<&str>) -> Value {
        let mut payload = json!({
            "error": "weather request cancelled by user",
            "location": args.get("location").cloned().unwrap_or(Value::Null),
        });
        if let Some(reason) = reason {
            payload["reason"] = json!(reason);
        }
        payload
    }
}

/// Basic arithmetic, runs without confirmation
struct CalculateTool {
    latency: Duration,
}

#[async_trait]
impl Tool for CalculateTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "calculate".to_string(),
            description: "Perform basic mathematical calculations".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "operation": {
                        "type": "string",
                        "enum": ["add", "subtract", "multiply", "divide"],
                        "description": "The operation to perform"
                    },
                    "a": { "type": "number", "description": "First number" },
                    "b": { "type": "number", "description": "Second number" }
                },
                "required": ["operation", "a", "b"]
            }),
            requires_confirmation: false,
        }
    }

    async fn execute(&self, args: Value) -> Result<Value> {
        let operation = string_arg(&args, "operation")?;
        let a = number_arg(&args, "a")?;
        let b = number_arg(&args, "b")?;

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let result = match operation {
            "add" => a + b,
            "subtract" => a - b,
            "multiply" => a * b,
            "divide" => {
                if b == 0.0 {
                    return Err(AgentError::ToolExecution(
                        "Cannot divide by zero".to_string(),
                    ));
                }
                a / b
            }
            other => {
                return Err(AgentError::ToolExecution(format!(
                    "Unsupported operation: {}",
                    other
                )))
            }
        };

        Ok(json!({
            "operation": operation,
            "a": a,
            "b": b,
            "result": result,
            "expression": format!("{} {} {} = {}", a, operation, b, result),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ToolRegistry {
        ToolRegistry::with_builtins(&ToolsConfig::default())
    }

    #[test]
    fn test_builtin_definitions() {
        let definitions = registry().definitions();
        let names: Vec<&str> = definitions.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["calculate", "get_weather"]);

        let registry = registry();
        assert!(registry.requires_confirmation("get_weather"));
        assert!(!registry.requires_confirmation("calculate"));
        assert!(!registry.requires_confirmation("launch_rockets"));
    }

    #[test]
    fn test_definition_serializes_camel_case() {
        let value = serde_json::to_value(registry().definitions()).unwrap();
        assert_eq!(value[1]["requiresConfirmation"], json!(true));
    }

    #[tokio::test]
    async fn test_calculate() {
        let output = registry()
            .execute("calculate", json!({"operation": "multiply", "a": 6, "b": 7}))
            .await;
        assert_eq!(output["result"], json!(42.0));
        assert_eq!(output["expression"], json!("6 multiply 7 = 42"));
    }

    #[tokio::test]
    async fn test_divide_by_zero_is_error_payload() {
        let output = registry()
            .execute("calculate", json!({"operation": "divide", "a": 1, "b": 0}))
            .await;
        assert!(output["error"]
            .as_str()
            .unwrap()
            .contains("Cannot divide by zero"));
    }

    #[tokio::test]
    async fn test_weather_is_stable_per_location() {
        let registry = registry();
        let first = registry
            .execute("get_weather", json!({"location": "Lisbon", "unit": "celsius"}))
            .await;
        let second = registry
            .execute("get_weather", json!({"location": "lisbon", "unit": "celsius"}))
            .await;

        assert_eq!(first["temperature"], second["temperature"]);
        assert!(first["temperature"].as_str().unwrap().ends_with("°C"));
        assert_eq!(first["location"], json!("Lisbon"));
    }

    #[tokio::test]
    async fn test_weather_values_are_pinned() {
        assert_eq!(location_seed("Lisbon"), 3176277459607892979);

        let output = registry()
            .execute("get_weather", json!({"location": "Lisbon", "unit": "celsius"}))
            .await;
        assert_eq!(output["temperature"], json!("19°C"));
        assert_eq!(output["conditions"], json!("snowy"));
        assert_eq!(output["humidity"], json!("54%"));

        let output = registry()
            .execute("get_weather", json!({"location": "Paris"}))
            .await;
        assert_eq!(output["temperature"], json!("34°F"));
        assert_eq!(output["conditions"], json!("rainy"));
    }

    #[tokio::test]
    async fn test_unknown_tool_and_missing_args() {
        let registry = registry();
        let output = registry.execute("launch_rockets", json!({})).await;
        assert_eq!(output["error"], json!("unknown tool: launch_rockets"));

        let output = registry.execute("get_weather", json!({})).await;
        assert!(output["error"].as_str().unwrap().contains("location"));
    }

    #[test]
    fn test_confirmation_message_and_cancellation() {
        let registry = registry();
        let args = json!({"location": "Oslo"});

        assert_eq!(
            registry.confirmation_message("get_weather", &args),
            "fetch weather data for Oslo?"
        );

        let payload = registry.cancelled("get_weather", &args, Some("timeout"));
        assert_eq!(
            payload,
            json!({
                "error": "weather request cancelled by user",
                "location": "Oslo",
                "reason": "timeout"
            })
        );

        let payload = registry.cancelled("calculate", &json!({}), None);
        assert_eq!(payload, json!({"error": "calculate request cancelled by user"}));
    }
}
