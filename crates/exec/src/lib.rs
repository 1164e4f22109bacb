//! Tool executor: turns model output into tool invocations and tool results
//! back into dialogue messages.
//!
//! Two text protocols are understood, tried in order:
//! 1. JSON blocks delimited by `[[TOOL_CALL]] … [[/TOOL_CALL]]` whose body is
//!    `{"name": …, "arguments": {…}}`.
//! 2. The legacy inline form `[TOOL_CALL:<name>:<params>]`.
//!
//! Parsing is a total function: any input yields a (possibly empty) request
//! list, and one malformed block never hides a later well-formed one.

use std::sync::LazyLock;
use std::sync::atomic::{AtomicU64, Ordering};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use cortex_llm::{Message, ToolCall};
use cortex_tools::{JsonMap, Registered, ToolRegistry, value_to_text};

// ── Request / result types ───────────────────────────────────────────────────

/// One tool invocation the model asked for.  `id` is stable within a turn
/// and correlates the result back to the requesting assistant message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: JsonMap,
}

/// Outcome of one tool invocation.  Failures never cross the executor
/// boundary as errors; they come back as `success = false` results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallResult {
    pub id: String,
    pub name: String,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub success: bool,
}

impl ToolCallResult {
    pub fn ok(id: impl Into<String>, name: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            output: output.into(),
            error: None,
            success: true,
        }
    }

    pub fn failed(
        id: impl Into<String>,
        name: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            output: String::new(),
            error: Some(error.into()),
            success: false,
        }
    }
}

// ── Protocol regexes ─────────────────────────────────────────────────────────

static JSON_BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)\[\[TOOL_CALL\]\](.*?)\[\[/TOOL_CALL\]\]")
        .expect("tool-call block regex must compile")
});

static LEGACY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[TOOL_CALL:([A-Za-z0-9_\-]+):([^\]]*)\]")
        .expect("legacy tool-call regex must compile")
});

#[derive(Deserialize)]
struct JsonBlockBody {
    name: String,
    #[serde(default)]
    arguments: JsonMap,
}

// ── Executor ─────────────────────────────────────────────────────────────────

/// Wraps a registry reference per call plus a process-wide call counter used
/// to mint unique ids for text-protocol calls.
#[derive(Debug, Default)]
pub struct ToolExecutor {
    counter: AtomicU64,
}

impl ToolExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_call_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("call_{}_{}", chrono::Utc::now().timestamp_millis(), n)
    }

    // ── Intent parsing ───────────────────────────────────────────────────────

    /// Parse tool-call intents out of a plain text model response.
    ///
    /// If the JSON-block protocol produces any result, the legacy protocol
    /// is not consulted.
    pub fn parse_text_calls(&self, text: &str) -> Vec<ToolCallRequest> {
        let mut requests = Vec::new();

        for capture in JSON_BLOCK_RE.captures_iter(text) {
            let body = capture.get(1).map(|m| m.as_str().trim()).unwrap_or("");
            match serde_json::from_str::<JsonBlockBody>(body) {
                Ok(parsed) => requests.push(ToolCallRequest {
                    id: self.next_call_id(),
                    name: parsed.name,
                    arguments: parsed.arguments,
                }),
                Err(err) => {
                    warn!(%err, "skipping malformed tool-call block");
                }
            }
        }
        if !requests.is_empty() {
            return requests;
        }

        for capture in LEGACY_RE.captures_iter(text) {
            let name = capture.get(1).map(|m| m.as_str()).unwrap_or_default();
            let raw_params = capture.get(2).map(|m| m.as_str()).unwrap_or_default();
            match decode_legacy_params(raw_params) {
                Some(arguments) => requests.push(ToolCallRequest {
                    id: self.next_call_id(),
                    name: name.to_string(),
                    arguments,
                }),
                None => warn!(tool = name, "skipping legacy call with malformed JSON params"),
            }
        }

        debug!(count = requests.len(), "parsed text tool calls");
        requests
    }

    /// Map native function-calling output to requests, preserving the
    /// provider-issued ids.
    pub fn requests_from_native(&self, calls: &[ToolCall]) -> Vec<ToolCallRequest> {
        calls
            .iter()
            .map(|call| ToolCallRequest {
                id: call.id.clone(),
                name: call.function.name.clone(),
                arguments: call
                    .function
                    .arguments
                    .as_object()
                    .cloned()
                    .unwrap_or_default(),
            })
            .collect()
    }

    // ── Execution ────────────────────────────────────────────────────────────

    /// Execute one request.  Dispatch failures (unknown name) and body
    /// failures both become `success = false` results.
    pub async fn execute(
        &self,
        registry: &ToolRegistry,
        request: &ToolCallRequest,
    ) -> ToolCallResult {
        match registry.get(&request.name) {
            Some(Registered::Tool(tool)) => match tool.run(&request.arguments).await {
                Ok(output) => ToolCallResult::ok(&request.id, &request.name, output),
                Err(err) => ToolCallResult::failed(&request.id, &request.name, err.to_string()),
            },
            Some(Registered::Function(func)) => {
                let input = request
                    .arguments
                    .get("input")
                    .map(value_to_text)
                    .or_else(|| request.arguments.values().next().map(value_to_text))
                    .unwrap_or_default();
                ToolCallResult::ok(&request.id, &request.name, func(&input))
            }
            None => ToolCallResult::failed(
                &request.id,
                &request.name,
                format!("unknown tool: {}", request.name),
            ),
        }
    }

    /// Execute a batch sequentially, in order.
    pub async fn execute_all(
        &self,
        registry: &ToolRegistry,
        requests: &[ToolCallRequest],
    ) -> Vec<ToolCallResult> {
        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            results.push(self.execute(registry, request).await);
        }
        results
    }

    // ── Result formatting ────────────────────────────────────────────────────

    /// Format for the native protocol: a tool-role message correlated by
    /// `tool_call_id`.
    pub fn result_message(&self, result: &ToolCallResult) -> Message {
        let content = if result.success {
            result.output.clone()
        } else {
            format!("错误: {}", result.error.as_deref().unwrap_or("unknown"))
        };
        Message::tool_result(&result.id, content)
    }

    /// Format for the text protocol.
    pub fn result_text(&self, result: &ToolCallResult) -> String {
        if result.success {
            format!("[工具 {} 返回]: {}", result.name, result.output)
        } else {
            format!(
                "[工具 {} 执行失败]: {}",
                result.name,
                result.error.as_deref().unwrap_or("unknown")
            )
        }
    }
}

// ── Legacy param decoding ────────────────────────────────────────────────────

/// Decode the `<params>` segment of a legacy call.
///
/// Returns `None` only for a body that opens as JSON but does not parse;
/// everything else decodes to *something* so the model's intent is kept.
fn decode_legacy_params(raw: &str) -> Option<JsonMap> {
    let trimmed = raw.trim();

    if trimmed.starts_with('{') {
        return serde_json::from_str::<Value>(trimmed)
            .ok()
            .and_then(|v| v.as_object().cloned());
    }

    if trimmed
        .split(',')
        .next()
        .is_some_and(|first| first.contains('='))
    {
        let mut map = JsonMap::new();
        for pair in trimmed.split(',') {
            let Some((key, value)) = pair.split_once('=') else {
                continue;
            };
            map.insert(key.trim().to_string(), coerce_primitive(value.trim()));
        }
        return Some(map);
    }

    // Free-form string: bind to every conventional single-parameter name so
    // it works with the common built-ins regardless of their spelling.
    let mut map = JsonMap::new();
    for key in ["input", "query", "expression"] {
        map.insert(key.to_string(), json!(trimmed));
    }
    Some(map)
}

/// Primitive coercion for `key=value` pairs: unquoted numeric literals
/// become numbers, `true`/`false` (case-insensitive) become booleans,
/// everything else stays a string.
fn coerce_primitive(raw: &str) -> Value {
    if let Ok(n) = raw.parse::<i64>() {
        return json!(n);
    }
    if let Ok(f) = raw.parse::<f64>() {
        return json!(f);
    }
    if raw.eq_ignore_ascii_case("true") {
        return json!(true);
    }
    if raw.eq_ignore_ascii_case("false") {
        return json!(false);
    }
    json!(raw)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use anyhow::Result;
    use async_trait::async_trait;

    use cortex_llm::{Role, ToolCallFunction};
    use cortex_tools::{ParamKind, Tool, ToolParam, ToolSpec};

    use super::*;

    struct UpperTool;

    #[async_trait]
    impl Tool for UpperTool {
        fn spec(&self) -> ToolSpec {
            ToolSpec {
                name: "upper".to_string(),
                description: "uppercases input".to_string(),
                params: vec![ToolParam::required("input", ParamKind::String, "text")],
            }
        }

        async fn run(&self, args: &JsonMap) -> Result<String> {
            let input = args
                .get("input")
                .and_then(|v| v.as_str())
                .ok_or_else(|| anyhow::anyhow!("missing required param: input"))?;
            Ok(input.to_uppercase())
        }
    }

    fn registry() -> ToolRegistry {
        let mut reg = ToolRegistry::default();
        reg.register(Arc::new(UpperTool));
        reg
    }

    // ── JSON-block protocol ────────────────────────────────────────────────

    #[test]
    fn parses_single_json_block() {
        let executor = ToolExecutor::new();
        let text = r#"I will compute. [[TOOL_CALL]]{"name":"calculator","arguments":{"input":"(15+25)*3"}}[[/TOOL_CALL]]"#;
        let calls = executor.parse_text_calls(text);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "calculator");
        assert_eq!(calls[0].arguments["input"], "(15+25)*3");
        assert!(calls[0].id.starts_with("call_"));
    }

    #[test]
    fn parses_multiple_json_blocks() {
        let executor = ToolExecutor::new();
        let text = "[[TOOL_CALL]]\n{\"name\":\"a\",\"arguments\":{}}\n[[/TOOL_CALL]] and \
                    [[TOOL_CALL]]{\"name\":\"b\",\"arguments\":{\"x\":1}}[[/TOOL_CALL]]";
        let calls = executor.parse_text_calls(text);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].name, "a");
        assert_eq!(calls[1].name, "b");
        assert_ne!(calls[0].id, calls[1].id);
    }

    #[test]
    fn malformed_block_is_skipped_later_block_survives() {
        let executor = ToolExecutor::new();
        let text = "[[TOOL_CALL]]{not valid json}[[/TOOL_CALL]] \
                    [[TOOL_CALL]]{\"name\":\"good\",\"arguments\":{}}[[/TOOL_CALL]]";
        let calls = executor.parse_text_calls(text);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "good");
    }

    #[test]
    fn malformed_json_block_produces_zero_calls_never_panics() {
        let executor = ToolExecutor::new();
        let calls = executor.parse_text_calls("[[TOOL_CALL]]{oops[[/TOOL_CALL]]");
        assert!(calls.is_empty());
    }

    #[test]
    fn json_block_suppresses_legacy_protocol() {
        let executor = ToolExecutor::new();
        let text = "[[TOOL_CALL]]{\"name\":\"json_one\",\"arguments\":{}}[[/TOOL_CALL]] \
                    [TOOL_CALL:legacy_one:hello]";
        let calls = executor.parse_text_calls(text);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "json_one");
    }

    // ── Legacy protocol ────────────────────────────────────────────────────

    #[test]
    fn legacy_key_value_pairs_coerce_primitives() {
        let executor = ToolExecutor::new();
        let calls = executor.parse_text_calls("[TOOL_CALL:t:a=1,b=true,c=hi]");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].arguments["a"], json!(1));
        assert_eq!(calls[0].arguments["b"], json!(true));
        assert_eq!(calls[0].arguments["c"], json!("hi"));
    }

    #[test]
    fn legacy_free_string_binds_all_conventional_keys() {
        let executor = ToolExecutor::new();
        let calls = executor.parse_text_calls("[TOOL_CALL:t:hello]");
        assert_eq!(calls.len(), 1);
        for key in ["input", "query", "expression"] {
            assert_eq!(calls[0].arguments[key], json!("hello"));
        }
    }

    #[test]
    fn legacy_json_params() {
        let executor = ToolExecutor::new();
        let calls = executor.parse_text_calls(r#"[TOOL_CALL:t:{"input": "2+2"}]"#);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].arguments["input"], json!("2+2"));
    }

    #[test]
    fn legacy_float_and_case_insensitive_bool() {
        let executor = ToolExecutor::new();
        let calls = executor.parse_text_calls("[TOOL_CALL:t:x=2.5,flag=TRUE]");
        assert_eq!(calls[0].arguments["x"], json!(2.5));
        assert_eq!(calls[0].arguments["flag"], json!(true));
    }

    #[test]
    fn plain_text_yields_no_calls() {
        let executor = ToolExecutor::new();
        assert!(executor.parse_text_calls("just a normal answer").is_empty());
        assert!(executor.parse_text_calls("").is_empty());
    }

    // ── Native mapping ─────────────────────────────────────────────────────

    #[test]
    fn native_calls_preserve_provider_ids() {
        let executor = ToolExecutor::new();
        let calls = vec![ToolCall {
            id: "call_provider_9".to_string(),
            r#type: "function".to_string(),
            function: ToolCallFunction {
                name: "upper".to_string(),
                arguments: json!({"input": "hey"}),
            },
        }];
        let requests = executor.requests_from_native(&calls);
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].id, "call_provider_9");
        assert_eq!(requests[0].arguments["input"], json!("hey"));
    }

    // ── Execution ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn execute_success_and_dispatch_failure() {
        let executor = ToolExecutor::new();
        let reg = registry();

        let mut args = JsonMap::new();
        args.insert("input".to_string(), json!("abc"));
        let ok = executor
            .execute(
                &reg,
                &ToolCallRequest {
                    id: "c1".into(),
                    name: "upper".into(),
                    arguments: args,
                },
            )
            .await;
        assert!(ok.success);
        assert_eq!(ok.output, "ABC");

        let missing = executor
            .execute(
                &reg,
                &ToolCallRequest {
                    id: "c2".into(),
                    name: "nope".into(),
                    arguments: JsonMap::new(),
                },
            )
            .await;
        assert!(!missing.success);
        assert!(missing.error.as_deref().unwrap().contains("unknown tool"));
    }

    #[tokio::test]
    async fn tool_body_failure_becomes_result() {
        let executor = ToolExecutor::new();
        let reg = registry();
        let result = executor
            .execute(
                &reg,
                &ToolCallRequest {
                    id: "c3".into(),
                    name: "upper".into(),
                    arguments: JsonMap::new(),
                },
            )
            .await;
        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().contains("missing required param"));
    }

    #[tokio::test]
    async fn batch_matches_singleton_execution() {
        let executor = ToolExecutor::new();
        let reg = registry();

        let mut args = JsonMap::new();
        args.insert("input".to_string(), json!("x"));
        let requests = vec![
            ToolCallRequest { id: "a".into(), name: "upper".into(), arguments: args.clone() },
            ToolCallRequest { id: "b".into(), name: "missing".into(), arguments: JsonMap::new() },
        ];

        let batch = executor.execute_all(&reg, &requests).await;
        let mut singles = Vec::new();
        for request in &requests {
            singles.push(executor.execute(&reg, request).await);
        }

        assert_eq!(batch.len(), singles.len());
        for (lhs, rhs) in batch.iter().zip(&singles) {
            assert_eq!(lhs.id, rhs.id);
            assert_eq!(lhs.success, rhs.success);
            assert_eq!(lhs.output, rhs.output);
        }
    }

    // ── Formatting ─────────────────────────────────────────────────────────

    #[test]
    fn result_message_formats() {
        let executor = ToolExecutor::new();
        let ok = ToolCallResult::ok("c1", "upper", "ABC");
        let msg = executor.result_message(&ok);
        assert_eq!(msg.role, Role::Tool);
        assert_eq!(msg.tool_call_id.as_deref(), Some("c1"));
        assert_eq!(msg.content, "ABC");

        let failed = ToolCallResult::failed("c2", "upper", "boom");
        let msg = executor.result_message(&failed);
        assert_eq!(msg.content, "错误: boom");
    }

    #[test]
    fn result_text_formats() {
        let executor = ToolExecutor::new();
        let ok = ToolCallResult::ok("c1", "upper", "ABC");
        assert_eq!(executor.result_text(&ok), "[工具 upper 返回]: ABC");
        let failed = ToolCallResult::failed("c2", "upper", "boom");
        assert_eq!(executor.result_text(&failed), "[工具 upper 执行失败]: boom");
    }

    #[test]
    fn call_ids_are_unique_within_process() {
        let executor = ToolExecutor::new();
        let calls = executor.parse_text_calls(
            "[TOOL_CALL:a:x] then [TOOL_CALL:b:y] then [TOOL_CALL:c:z]",
        );
        let mut ids: Vec<&str> = calls.iter().map(|c| c.id.as_str()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 3);
    }
}
