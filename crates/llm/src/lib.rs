use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

pub mod provider;

pub use provider::{EnvSnapshot, Provider, ResolvedEndpoint, detect_provider, resolve_endpoint};

// ── Errors ────────────────────────────────────────────────────────────────────

/// Failures crossing the model boundary.  Model-call failures (network,
/// auth, rate limit) propagate out of the tool loop; the caller decides
/// whether to retry.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("model call failed: {0}")]
    ModelCall(String),
    #[error("unusable model response: {0}")]
    InvalidResponse(String),
    #[error("llm configuration error: {0}")]
    Configuration(String),
}

// ── Chat message types ────────────────────────────────────────────────────────

/// Role in a chat conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A single message in a chat conversation.
///
/// The in-process representation carries a timestamp for history bookkeeping;
/// [`messages_to_wire`] strips it when building the API payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// Tool calls requested by the assistant (assistant messages only).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// When role == Tool, identifies which tool call this result is for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: vec![],
            tool_call_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Assistant message carrying the model's tool_calls structure verbatim.
    pub fn assistant_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::new(Role::Assistant, content)
        }
    }

    /// Tool-role result message keyed by the originating call id.
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::new(Role::Tool, content)
        }
    }
}

/// A tool call requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Provider-issued id, stable within one turn; used to correlate the
    /// tool result back to the assistant message that requested it.
    #[serde(default)]
    pub id: String,
    /// Always "function" for OpenAI-compatible APIs.
    #[serde(default = "default_tool_call_type")]
    pub r#type: String,
    pub function: ToolCallFunction,
}

fn default_tool_call_type() -> String {
    "function".to_string()
}

/// The function name and arguments within a tool call.
///
/// The wire contract carries `arguments` as a JSON string; we normalise to a
/// parsed `Value` for downstream consumers and re-stringify on send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallFunction {
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// How the model may use the declared tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolChoice {
    Auto,
    None,
}

impl ToolChoice {
    pub fn as_wire(&self) -> &'static str {
        match self {
            ToolChoice::Auto => "auto",
            ToolChoice::None => "none",
        }
    }
}

/// One request against the chat-completions contract.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    /// Function-calling schemas to expose, if any.
    pub tools: Option<Vec<serde_json::Value>>,
    pub tool_choice: Option<ToolChoice>,
}

impl ChatRequest {
    pub fn plain(messages: Vec<Message>) -> Self {
        Self {
            messages,
            tools: None,
            tool_choice: None,
        }
    }

    pub fn with_tools(
        messages: Vec<Message>,
        tools: Vec<serde_json::Value>,
        tool_choice: ToolChoice,
    ) -> Self {
        Self {
            messages,
            tools: Some(tools),
            tool_choice: Some(tool_choice),
        }
    }
}

/// Response from a chat call.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    /// Text content (may be empty when tool_calls are present).
    pub content: String,
    /// Tool calls the assistant wants to make (empty for plain text).
    pub tool_calls: Vec<ToolCall>,
    /// "stop", "tool_calls", "length", …
    pub finish_reason: String,
}

impl ChatResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            tool_calls: vec![],
            finish_reason: "stop".to_string(),
        }
    }
}

// ── Model abstraction ─────────────────────────────────────────────────────────

/// Anything that answers a chat request.  The production implementation is
/// [`OpenAiCompatClient`]; tests drive the tool loop with scripted models.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, LlmError>;
}

// ── OpenAI-compatible HTTP client ─────────────────────────────────────────────

/// Chat-completions client for any OpenAI-compatible endpoint (OpenAI,
/// DeepSeek, DashScope compatible mode, …).
#[derive(Debug, Clone)]
pub struct OpenAiCompatClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiCompatClient {
    /// Build from configuration + environment, running provider
    /// autodetection for anything the caller left blank.  Fails loud when no
    /// API key can be resolved.
    pub fn from_config(config: &cortex_config::LlmConfig) -> Result<Self, LlmError> {
        let endpoint = resolve_endpoint(config, &EnvSnapshot::capture())?;
        tracing::info!(provider = ?endpoint.provider, model = %endpoint.model, "llm endpoint resolved");
        Self::new(
            endpoint.base_url,
            endpoint.api_key,
            endpoint.model,
            config.timeout_secs,
        )
    }

    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        timeout_secs: u64,
    ) -> Result<Self, LlmError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(LlmError::Configuration(
                "no API key configured (set LLM_API_KEY or a provider key)".to_string(),
            ));
        }
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs.max(1)))
            .build()
            .map_err(|e| LlmError::Configuration(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl ChatModel for OpenAiCompatClient {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, LlmError> {
        let endpoint = format!("{}/chat/completions", self.base_url);

        let mut payload = json!({
            "model": self.model,
            "messages": messages_to_wire(&request.messages),
        });
        if let Some(ref tools) = request.tools {
            payload["tools"] = json!(tools);
            payload["tool_choice"] = json!(
                request.tool_choice.unwrap_or(ToolChoice::Auto).as_wire()
            );
        }

        tracing::debug!(
            endpoint = %endpoint,
            messages = request.messages.len(),
            has_tools = request.tools.is_some(),
            "chat request"
        );

        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| LlmError::ModelCall(format!("request to {endpoint} failed: {e}")))?;

        let status = response.status();
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| LlmError::ModelCall(format!("unreadable response body: {e}")))?;

        if !status.is_success() {
            return Err(LlmError::ModelCall(format!(
                "chat completion returned {status}: {body}"
            )));
        }

        parse_chat_response(&body)
    }
}

// ── Wire conversion ───────────────────────────────────────────────────────────

/// Convert messages to the OpenAI-compatible payload shape.
///
/// Assistant tool_calls re-stringify `arguments`; tool-role messages carry
/// the correlated `tool_call_id`.
pub fn messages_to_wire(messages: &[Message]) -> Vec<serde_json::Value> {
    messages
        .iter()
        .map(|m| {
            let role = match m.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::Tool => "tool",
            };
            let mut msg = json!({ "role": role, "content": m.content });
            if !m.tool_calls.is_empty() {
                let calls: Vec<serde_json::Value> = m
                    .tool_calls
                    .iter()
                    .map(|tc| {
                        json!({
                            "id": tc.id,
                            "type": "function",
                            "function": {
                                "name": tc.function.name,
                                "arguments": if tc.function.arguments.is_string() {
                                    tc.function.arguments.clone()
                                } else {
                                    json!(tc.function.arguments.to_string())
                                }
                            }
                        })
                    })
                    .collect();
                msg["tool_calls"] = json!(calls);
            }
            if let Some(ref id) = m.tool_call_id {
                msg["tool_call_id"] = json!(id);
            }
            msg
        })
        .collect()
}

/// Parse an OpenAI-compatible `/chat/completions` response body.
pub fn parse_chat_response(body: &serde_json::Value) -> Result<ChatResponse, LlmError> {
    let choice = body
        .get("choices")
        .and_then(|c| c.get(0))
        .ok_or_else(|| LlmError::InvalidResponse(format!("no choices in response: {body}")))?;
    let message = choice.get("message");

    let content = message
        .and_then(|m| m.get("content"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();

    let finish_reason = choice
        .get("finish_reason")
        .and_then(|v| v.as_str())
        .unwrap_or("stop")
        .to_string();

    let tool_calls = message
        .and_then(|m| m.get("tool_calls"))
        .and_then(|v| v.as_array())
        .map(|calls| parse_wire_tool_calls(calls))
        .unwrap_or_default();

    Ok(ChatResponse {
        content,
        tool_calls,
        finish_reason,
    })
}

/// Parse a `tool_calls` array, normalising string-encoded arguments and
/// filling in ids for providers that omit them.
fn parse_wire_tool_calls(calls: &[serde_json::Value]) -> Vec<ToolCall> {
    calls
        .iter()
        .enumerate()
        .filter_map(|(i, tc)| {
            let id = tc
                .get("id")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            let func = tc.get("function")?;
            let name = func.get("name")?.as_str()?.to_string();
            let arguments = func
                .get("arguments")
                .map(|v| {
                    if let Some(s) = v.as_str() {
                        serde_json::from_str(s).unwrap_or(json!({}))
                    } else {
                        v.clone()
                    }
                })
                .unwrap_or(json!({}));
            Some(ToolCall {
                id: if id.is_empty() { format!("call_{i}") } else { id },
                r#type: "function".to_string(),
                function: ToolCallFunction { name, arguments },
            })
        })
        .collect()
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_messages_carry_roles_and_content() {
        let messages = vec![
            Message::system("be useful"),
            Message::user("hi"),
            Message::assistant("hello"),
        ];
        let wire = messages_to_wire(&messages);
        assert_eq!(wire.len(), 3);
        assert_eq!(wire[0]["role"], "system");
        assert_eq!(wire[1]["content"], "hi");
        assert_eq!(wire[2]["role"], "assistant");
        assert!(wire[0].get("tool_calls").is_none());
        assert!(wire[0].get("timestamp").is_none());
    }

    #[test]
    fn wire_assistant_tool_calls_stringify_arguments() {
        let call = ToolCall {
            id: "call_1".to_string(),
            r#type: "function".to_string(),
            function: ToolCallFunction {
                name: "calculator".to_string(),
                arguments: json!({"input": "1+1"}),
            },
        };
        let msg = Message::assistant_tool_calls("", vec![call]);
        let wire = messages_to_wire(&[msg]);
        let args = wire[0]["tool_calls"][0]["function"]["arguments"]
            .as_str()
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_str(args).unwrap();
        assert_eq!(parsed["input"], "1+1");
    }

    #[test]
    fn wire_tool_result_carries_call_id() {
        let msg = Message::tool_result("call_7", "42");
        let wire = messages_to_wire(&[msg]);
        assert_eq!(wire[0]["role"], "tool");
        assert_eq!(wire[0]["tool_call_id"], "call_7");
        assert_eq!(wire[0]["content"], "42");
    }

    #[test]
    fn parse_plain_text_response() {
        let body = json!({
            "choices": [{
                "message": { "content": "The answer is 42." },
                "finish_reason": "stop"
            }]
        });
        let response = parse_chat_response(&body).unwrap();
        assert_eq!(response.content, "The answer is 42.");
        assert!(response.tool_calls.is_empty());
        assert_eq!(response.finish_reason, "stop");
    }

    #[test]
    fn parse_tool_call_response_with_string_arguments() {
        let body = json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_abc",
                        "type": "function",
                        "function": {
                            "name": "calculator",
                            "arguments": "{\"input\":\"(15+25)*3\"}"
                        }
                    }]
                },
                "finish_reason": "tool_calls"
            }]
        });
        let response = parse_chat_response(&body).unwrap();
        assert_eq!(response.tool_calls.len(), 1);
        let call = &response.tool_calls[0];
        assert_eq!(call.id, "call_abc");
        assert_eq!(call.function.name, "calculator");
        assert_eq!(call.function.arguments["input"], "(15+25)*3");
        assert_eq!(response.finish_reason, "tool_calls");
    }

    #[test]
    fn parse_fills_missing_tool_call_ids() {
        let body = json!({
            "choices": [{
                "message": {
                    "content": "",
                    "tool_calls": [{
                        "function": { "name": "search", "arguments": {"query": "rust"} }
                    }]
                },
                "finish_reason": "tool_calls"
            }]
        });
        let response = parse_chat_response(&body).unwrap();
        assert_eq!(response.tool_calls[0].id, "call_0");
        assert_eq!(response.tool_calls[0].function.arguments["query"], "rust");
    }

    #[test]
    fn parse_rejects_empty_choices() {
        let body = json!({"choices": []});
        assert!(matches!(
            parse_chat_response(&body),
            Err(LlmError::InvalidResponse(_))
        ));
    }

    #[test]
    fn client_requires_api_key() {
        let result = OpenAiCompatClient::new("https://api.openai.com/v1", "  ", "gpt-4o-mini", 30);
        assert!(matches!(result, Err(LlmError::Configuration(_))));
    }
}
