//! Agent layer: the tool-calling loop plus the conversational agents built
//! on top of it.

pub mod base;
pub mod memory_agent;
pub mod tool_loop;

pub use base::BaseAgent;
pub use memory_agent::{KeywordExtractor, MemoryAgent, default_keyword_extractor};
pub use tool_loop::{CancelFlag, LoopOptions, ToolLoopResult, ToolStep, run_tool_loop};

use cortex_llm::LlmError;
use cortex_memory::MemoryError;

/// Failures a turn can surface to the caller.  Tool failures never appear
/// here: they are converted to unsuccessful results inside the loop so the
/// model can react to them.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error(transparent)]
    Model(#[from] LlmError),
    #[error("memory failure: {0}")]
    Memory(#[from] MemoryError),
    #[error("agent configuration error: {0}")]
    Configuration(String),
    /// The loop was cancelled between steps; the partial trace rides along.
    #[error("cancelled after {steps_used} step(s)")]
    Cancelled {
        trace: Vec<ToolStep>,
        steps_used: usize,
    },
}

// ── Shared test support ──────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use cortex_llm::{ChatModel, ChatRequest, ChatResponse, LlmError, ToolCall, ToolCallFunction};
    use serde_json::json;

    /// Scripted model: pops one canned response per call and records every
    /// request it saw, so tests can assert on the dialogue the loop built.
    pub struct ScriptedModel {
        responses: Mutex<VecDeque<ChatResponse>>,
        pub requests: Mutex<Vec<ChatRequest>>,
    }

    impl ScriptedModel {
        pub fn new(responses: Vec<ChatResponse>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                requests: Mutex::new(Vec::new()),
            }
        }

        pub fn request_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ChatModel for ScriptedModel {
        async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, LlmError> {
            self.requests.lock().unwrap().push(request);
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| LlmError::ModelCall("scripted model exhausted".to_string()))
        }
    }

    pub fn tool_call_response(id: &str, name: &str, arguments: serde_json::Value) -> ChatResponse {
        ChatResponse {
            content: String::new(),
            tool_calls: vec![ToolCall {
                id: id.to_string(),
                r#type: "function".to_string(),
                function: ToolCallFunction {
                    name: name.to_string(),
                    arguments,
                },
            }],
            finish_reason: "tool_calls".to_string(),
        }
    }

    pub fn calculator_call(id: &str, expression: &str) -> ChatResponse {
        tool_call_response(id, "calculator", json!({ "input": expression }))
    }
}
