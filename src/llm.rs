//! LLM completion gateway
//!
//! OpenRouter-compatible chat-completions client used by every stage.
//! Supports plain calls, tool-augmented calls, and a JSON response hint.
//! Uses a long-lived reqwest::Client for connection pooling.

use crate::error::AdvisoryError;
use crate::Result;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::env;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{error, info};

/// =============================
/// Message Types
/// =============================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

/// One role-tagged message in a completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallRequest>>,
    /// Set on tool-result messages, keyed by the originating invocation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn assistant_tool_calls(content: String, tool_calls: Vec<ToolCallRequest>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content,
            tool_calls: Some(tool_calls),
            tool_call_id: None,
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Tool,
            content: content.into(),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    #[serde(rename = "type", default = "function_kind")]
    pub kind: String,
    pub function: FunctionCall,
}

fn function_kind() -> String {
    "function".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// Serialized JSON arguments, exactly as the model produced them.
    pub arguments: String,
}

/// Declared tool surface advertised to the model.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: &'static str,
    pub description: String,
    pub parameters: Value,
}

impl ToolSpec {
    /// OpenAI-style function schema for the request payload.
    pub fn schema(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters,
            }
        })
    }
}

/// =============================
/// Request / Response
/// =============================

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub tools: Option<Vec<ToolSpec>>,
    pub json_response: bool,
    pub temperature: f32,
}

impl CompletionRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            tools: None,
            json_response: false,
            temperature: 0.0,
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolSpec>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn with_json_response(mut self) -> Self {
        self.json_response = true;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
}

impl CompletionResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            tool_calls: vec![],
        }
    }

    pub fn tool_call(id: &str, name: &str, arguments: Value) -> Self {
        Self {
            content: None,
            tool_calls: vec![ToolCallRequest {
                id: id.to_string(),
                kind: "function".to_string(),
                function: FunctionCall {
                    name: name.to_string(),
                    arguments: arguments.to_string(),
                },
            }],
        }
    }

    /// Final text content, empty string when absent.
    pub fn text_content(&self) -> String {
        self.content.clone().unwrap_or_default()
    }
}

/// Trait for the completion service. Stages depend on this, never on a
/// concrete client, so tests run against scripted responses.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse>;
}

/// =============================
/// OpenRouter Client
/// =============================

const DEFAULT_MODEL: &str = "openai/gpt-4o";

/// Reusable OpenRouter client (connection-pooled)
pub struct OpenRouterClient {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl OpenRouterClient {
    pub fn new(api_key: String, model: String) -> Self {
        let client = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .timeout(Duration::from_secs(180))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            api_key,
            model,
            base_url: "https://openrouter.ai/api/v1/chat/completions".to_string(),
        }
    }

    pub fn from_env() -> Self {
        let api_key = env::var("OPENROUTER_API_KEY").unwrap_or_default();
        let model = env::var("OPENROUTER_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        Self::new(api_key, model)
    }

    fn build_payload(&self, request: &CompletionRequest) -> Value {
        let mut payload = json!({
            "model": self.model,
            "messages": request.messages,
            "temperature": request.temperature,
        });

        if let Some(tools) = &request.tools {
            payload["tools"] = Value::Array(tools.iter().map(ToolSpec::schema).collect());
            payload["tool_choice"] = json!("auto");
        }

        if request.json_response {
            payload["response_format"] = json!({ "type": "json_object" });
        }

        payload
    }
}

#[derive(Debug, Deserialize)]
struct ApiCompletionResponse {
    choices: Vec<ApiChoice>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiMessage,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    content: Option<String>,
    tool_calls: Option<Vec<ToolCallRequest>>,
}

#[async_trait]
impl CompletionBackend for OpenRouterClient {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        if self.api_key.is_empty() {
            return Err(AdvisoryError::LlmError(
                "OPENROUTER_API_KEY not configured".to_string(),
            ));
        }

        let payload = self.build_payload(&request);

        info!(
            model = %self.model,
            message_count = request.messages.len(),
            with_tools = request.tools.is_some(),
            "Calling completion service"
        );

        let response = self
            .client
            .post(&self.base_url)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                error!("Completion request failed: {}", e);
                AdvisoryError::LlmError(format!("Completion request failed: {}", e))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            error!("Completion service error {}: {}", status, error_text);
            return Err(AdvisoryError::LlmError(format!(
                "Completion service returned {}: {}",
                status, error_text
            )));
        }

        let parsed: ApiCompletionResponse = response.json().await.map_err(|e| {
            error!("Failed to parse completion response: {}", e);
            AdvisoryError::LlmError(format!("Completion parse error: {}", e))
        })?;

        let choice = parsed.choices.into_iter().next().ok_or_else(|| {
            AdvisoryError::LlmError("No choices in completion response".to_string())
        })?;

        Ok(CompletionResponse {
            content: choice.message.content,
            tool_calls: choice.message.tool_calls.unwrap_or_default(),
        })
    }
}

/// =============================
/// Structured Output Parsing
/// =============================

/// Strip a leading/trailing markdown code fence from completion text.
fn strip_markdown_fences(raw: &str) -> &str {
    let mut text = raw.trim();
    if let Some(stripped) = text.strip_prefix("```json") {
        text = stripped;
    } else if let Some(stripped) = text.strip_prefix("```") {
        text = stripped;
    }
    if let Some(stripped) = text.strip_suffix("```") {
        text = stripped;
    }
    text.trim()
}

/// Parse completion text into a typed value.
///
/// Attempts a direct parse after fence stripping; falls back to the
/// outermost brace-delimited slice; on total failure returns a typed
/// extraction error carrying the raw text.
pub fn parse_structured<T: DeserializeOwned>(raw: &str) -> Result<T> {
    let cleaned = strip_markdown_fences(raw);

    match serde_json::from_str::<T>(cleaned) {
        Ok(value) => Ok(value),
        Err(first_err) => {
            if let (Some(start), Some(end)) = (raw.find('{'), raw.rfind('}')) {
                if start < end {
                    if let Ok(value) = serde_json::from_str::<T>(&raw[start..=end]) {
                        return Ok(value);
                    }
                }
            }
            Err(AdvisoryError::ExtractionError(format!(
                "{} | raw={}",
                first_err, raw
            )))
        }
    }
}

/// =============================
/// Scripted Backend (mock)
/// =============================

/// Scripted completion backend for development & testing.
/// Pops canned responses in order; errors when the script runs dry.
pub struct ScriptedBackend {
    responses: Mutex<VecDeque<CompletionResponse>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedBackend {
    pub fn new(responses: Vec<CompletionResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Requests observed so far, for assertions.
    pub fn seen_requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().expect("request log poisoned").clone()
    }
}

#[async_trait]
impl CompletionBackend for ScriptedBackend {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        self.requests
            .lock()
            .expect("request log poisoned")
            .push(request);

        self.responses
            .lock()
            .expect("script poisoned")
            .pop_front()
            .ok_or_else(|| AdvisoryError::LlmError("Scripted responses exhausted".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Verdict {
        route: String,
    }

    #[test]
    fn test_parse_structured_plain_json() {
        let parsed: Verdict = parse_structured(r#"{"route": "market_data"}"#).unwrap();
        assert_eq!(parsed.route, "market_data");
    }

    #[test]
    fn test_parse_structured_strips_fences() {
        let raw = "```json\n{\"route\": \"market_data\"}\n```";
        let parsed: Verdict = parse_structured(raw).unwrap();
        assert_eq!(parsed.route, "market_data");
    }

    #[test]
    fn test_parse_structured_brace_fallback() {
        let raw = "Here is my answer:\n{\"route\": \"investment_advisory\"} hope that helps";
        let parsed: Verdict = parse_structured(raw).unwrap();
        assert_eq!(parsed.route, "investment_advisory");
    }

    #[test]
    fn test_parse_structured_total_failure_is_typed() {
        let result = parse_structured::<Verdict>("no json here at all");
        assert!(matches!(result, Err(AdvisoryError::ExtractionError(_))));
    }

    #[test]
    fn test_request_payload_shape() {
        let client = OpenRouterClient::new("key".to_string(), "openai/gpt-4o".to_string());
        let request = CompletionRequest::new(vec![
            ChatMessage::system("You are a router."),
            ChatMessage::user("Price of Apple"),
        ])
        .with_tools(vec![ToolSpec {
            name: "get_market_price",
            description: "Get a quote".to_string(),
            parameters: json!({"type": "object", "properties": {"ticker": {"type": "string"}}}),
        }])
        .with_json_response();

        let payload = client.build_payload(&request);
        assert_eq!(payload["model"], "openai/gpt-4o");
        assert_eq!(payload["messages"].as_array().unwrap().len(), 2);
        assert_eq!(payload["tool_choice"], "auto");
        assert_eq!(
            payload["tools"][0]["function"]["name"],
            "get_market_price"
        );
        assert_eq!(payload["response_format"]["type"], "json_object");
    }

    #[tokio::test]
    async fn test_scripted_backend_pops_in_order() {
        let backend = ScriptedBackend::new(vec![
            CompletionResponse::text("first"),
            CompletionResponse::text("second"),
        ]);

        let req = || CompletionRequest::new(vec![ChatMessage::user("hi")]);
        assert_eq!(backend.complete(req()).await.unwrap().text_content(), "first");
        assert_eq!(backend.complete(req()).await.unwrap().text_content(), "second");
        assert!(backend.complete(req()).await.is_err());
        assert_eq!(backend.seen_requests().len(), 3);
    }
}
