//! The tool-calling loop.
//!
//! Drives the model↔tool dialogue to a fixed point or a step cap, under
//! either wire format:
//!
//! - *Native mode*: tool schemas go out with the request, tool calls come
//!   back as structured `tool_calls`, results return as tool-role messages.
//! - *Text mode*: a plain chat call, with tool-call intents parsed out of
//!   the returned text and results injected as a synthetic user message.
//!
//! Exhausting the step budget forces one final text-only completion so the
//! caller always gets an answer.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info, warn};

use cortex_exec::{ToolCallRequest, ToolCallResult, ToolExecutor};
use cortex_llm::{ChatModel, ChatRequest, Message, ToolChoice};
use cortex_tools::ToolRegistry;

use crate::AgentError;

/// Cooperative cancellation handle, checked between steps and between the
/// tool calls of a step.
pub type CancelFlag = Arc<AtomicBool>;

#[derive(Clone)]
pub struct LoopOptions {
    pub max_steps: usize,
    pub use_native_tool_calling: bool,
    pub cancel: Option<CancelFlag>,
}

impl Default for LoopOptions {
    fn default() -> Self {
        Self {
            max_steps: 5,
            use_native_tool_calling: true,
            cancel: None,
        }
    }
}

/// One recorded step.  A step with tool calls has exactly one result per
/// call, in call order; the terminal step has empty call and result lists.
#[derive(Debug, Clone)]
pub struct ToolStep {
    pub content: String,
    pub tool_calls: Vec<ToolCallRequest>,
    pub results: Vec<ToolCallResult>,
}

#[derive(Debug, Clone)]
pub struct ToolLoopResult {
    pub final_text: String,
    pub trace: Vec<ToolStep>,
    pub steps_used: usize,
    pub reached_max_steps: bool,
}

fn cancelled(cancel: &Option<CancelFlag>) -> bool {
    cancel
        .as_ref()
        .is_some_and(|flag| flag.load(Ordering::Relaxed))
}

/// Run the loop over `messages` (system + history + current turn).
///
/// Tool failures never abort the loop; model-call failures propagate and
/// the loop does not retry.  Cancellation surfaces as
/// [`AgentError::Cancelled`] carrying the partial trace.
pub async fn run_tool_loop(
    model: &dyn ChatModel,
    registry: &ToolRegistry,
    executor: &ToolExecutor,
    mut messages: Vec<Message>,
    opts: &LoopOptions,
) -> Result<ToolLoopResult, AgentError> {
    let schemas = registry.schemas();
    let mut trace: Vec<ToolStep> = Vec::new();

    for step in 1..=opts.max_steps {
        if cancelled(&opts.cancel) {
            return Err(AgentError::Cancelled {
                steps_used: step - 1,
                trace,
            });
        }

        debug!(step, messages = messages.len(), "tool loop iteration");
        let request = if opts.use_native_tool_calling {
            ChatRequest::with_tools(messages.clone(), schemas.clone(), ToolChoice::Auto)
        } else {
            ChatRequest::plain(messages.clone())
        };
        let response = model.chat(request).await?;

        let requests = if opts.use_native_tool_calling {
            executor.requests_from_native(&response.tool_calls)
        } else {
            executor.parse_text_calls(&response.content)
        };

        // Fixed point: no tool calls means the content is the answer.
        if requests.is_empty() {
            trace.push(ToolStep {
                content: response.content.clone(),
                tool_calls: vec![],
                results: vec![],
            });
            return Ok(ToolLoopResult {
                final_text: response.content,
                trace,
                steps_used: step,
                reached_max_steps: false,
            });
        }

        info!(step, count = requests.len(), "model requested tool calls");
        if opts.use_native_tool_calling {
            // Carry the provider's tool_calls structure verbatim.
            messages.push(Message::assistant_tool_calls(
                response.content.clone(),
                response.tool_calls.clone(),
            ));
        } else {
            messages.push(Message::assistant(response.content.clone()));
        }

        // Sequential execution in model order, with a cancellation check
        // between calls.
        let mut results: Vec<ToolCallResult> = Vec::with_capacity(requests.len());
        for request in &requests {
            if cancelled(&opts.cancel) {
                trace.push(ToolStep {
                    content: response.content.clone(),
                    tool_calls: requests.clone(),
                    results,
                });
                return Err(AgentError::Cancelled {
                    steps_used: step,
                    trace,
                });
            }
            results.push(executor.execute(registry, request).await);
        }

        if opts.use_native_tool_calling {
            for result in &results {
                messages.push(executor.result_message(result));
            }
        } else {
            let formatted: Vec<String> =
                results.iter().map(|r| executor.result_text(r)).collect();
            messages.push(Message::user(format!(
                "{}\n请根据以上工具结果继续回答。",
                formatted.join("\n")
            )));
        }

        trace.push(ToolStep {
            content: response.content,
            tool_calls: requests,
            results,
        });
    }

    // Step budget exhausted: force one final textual answer.
    warn!(max_steps = opts.max_steps, "tool loop hit step cap, forcing text answer");
    let final_request = if opts.use_native_tool_calling {
        ChatRequest::with_tools(messages, schemas, ToolChoice::None)
    } else {
        ChatRequest::plain(messages)
    };
    let response = model.chat(final_request).await?;

    Ok(ToolLoopResult {
        final_text: response.content,
        trace,
        steps_used: opts.max_steps,
        reached_max_steps: true,
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use cortex_llm::{ChatResponse, Message, Role};
    use cortex_tools::CalculatorTool;
    use serde_json::json;

    use crate::test_support::{ScriptedModel, calculator_call};

    use super::*;

    fn calculator_registry() -> ToolRegistry {
        let mut registry = ToolRegistry::default();
        registry.register(Arc::new(CalculatorTool));
        registry
    }

    fn seed_messages() -> Vec<Message> {
        vec![
            Message::system("you are an assistant"),
            Message::user("Compute (15+25)*3"),
        ]
    }

    /// Two-step arithmetic via native tool calling.
    #[tokio::test]
    async fn native_two_step_arithmetic() {
        let model = ScriptedModel::new(vec![
            calculator_call("call_1", "(15+25)*3"),
            ChatResponse::text("120"),
        ]);
        let registry = calculator_registry();
        let executor = ToolExecutor::new();

        let outcome = run_tool_loop(
            &model,
            &registry,
            &executor,
            seed_messages(),
            &LoopOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(outcome.final_text, "120");
        assert_eq!(outcome.steps_used, 2);
        assert!(!outcome.reached_max_steps);
        assert_eq!(outcome.trace.len(), 2);

        let first = &outcome.trace[0];
        assert_eq!(first.tool_calls.len(), 1);
        assert_eq!(first.results.len(), 1);
        assert!(first.results[0].success);
        assert_eq!(first.results[0].output, "120");
        assert_eq!(first.results[0].id, "call_1");

        // The terminal step has no tool calls.
        let last = outcome.trace.last().unwrap();
        assert!(last.tool_calls.is_empty());

        // Second request must carry the assistant tool_calls message and the
        // correlated tool result.
        let requests = model.requests.lock().unwrap();
        let followup = &requests[1].messages;
        let assistant = followup
            .iter()
            .find(|m| m.role == Role::Assistant)
            .expect("assistant tool-call message present");
        assert_eq!(assistant.tool_calls.len(), 1);
        let tool_msg = followup
            .iter()
            .find(|m| m.role == Role::Tool)
            .expect("tool result message present");
        assert_eq!(tool_msg.tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(tool_msg.content, "120");
    }

    /// Text-protocol fallback: intents parsed from content, results injected
    /// as a synthetic user message.
    #[tokio::test]
    async fn text_protocol_fallback() {
        let model = ScriptedModel::new(vec![
            ChatResponse::text(
                "I will compute. [[TOOL_CALL]]{\"name\":\"calculator\",\"arguments\":{\"input\":\"(15+25)*3\"}}[[/TOOL_CALL]]",
            ),
            ChatResponse::text("The answer is 120."),
        ]);
        let registry = calculator_registry();
        let executor = ToolExecutor::new();
        let opts = LoopOptions {
            use_native_tool_calling: false,
            ..LoopOptions::default()
        };

        let outcome = run_tool_loop(&model, &registry, &executor, seed_messages(), &opts)
            .await
            .unwrap();

        assert_eq!(outcome.final_text, "The answer is 120.");
        assert_eq!(outcome.steps_used, 2);
        assert!(!outcome.reached_max_steps);
        assert_eq!(outcome.trace[0].results[0].output, "120");

        // Text mode sends no schemas and injects a user-role result message.
        let requests = model.requests.lock().unwrap();
        assert!(requests[0].tools.is_none());
        let injected = requests[1]
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .unwrap();
        assert!(injected.content.contains("[工具 calculator 返回]: 120"));
        assert!(injected.content.contains("继续"));
    }

    /// Max-step termination forces a final text completion.
    #[tokio::test]
    async fn max_step_termination() {
        let model = ScriptedModel::new(vec![
            calculator_call("call_1", "1+1"),
            calculator_call("call_2", "2+2"),
            ChatResponse::text("Giving up."),
        ]);
        let registry = calculator_registry();
        let executor = ToolExecutor::new();
        let opts = LoopOptions {
            max_steps: 2,
            ..LoopOptions::default()
        };

        let outcome = run_tool_loop(&model, &registry, &executor, seed_messages(), &opts)
            .await
            .unwrap();

        assert_eq!(outcome.final_text, "Giving up.");
        assert_eq!(outcome.steps_used, 2);
        assert!(outcome.reached_max_steps);
        assert_eq!(outcome.trace.len(), 2);

        // The forced call must disable tools.
        let requests = model.requests.lock().unwrap();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[2].tool_choice, Some(ToolChoice::None));
    }

    /// Trace bookkeeping: |results| == |toolCalls| with matching ids, and
    /// the step count equals steps_used.
    #[tokio::test]
    async fn trace_invariants_hold() {
        let model = ScriptedModel::new(vec![
            ChatResponse {
                content: String::new(),
                tool_calls: vec![
                    cortex_llm::ToolCall {
                        id: "call_a".to_string(),
                        r#type: "function".to_string(),
                        function: cortex_llm::ToolCallFunction {
                            name: "calculator".to_string(),
                            arguments: json!({"input": "1+1"}),
                        },
                    },
                    cortex_llm::ToolCall {
                        id: "call_b".to_string(),
                        r#type: "function".to_string(),
                        function: cortex_llm::ToolCallFunction {
                            name: "no_such_tool".to_string(),
                            arguments: json!({}),
                        },
                    },
                ],
                finish_reason: "tool_calls".to_string(),
            },
            ChatResponse::text("done"),
        ]);
        let registry = calculator_registry();
        let executor = ToolExecutor::new();

        let outcome = run_tool_loop(
            &model,
            &registry,
            &executor,
            seed_messages(),
            &LoopOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(outcome.trace.len(), outcome.steps_used);
        for step in &outcome.trace {
            if !step.tool_calls.is_empty() {
                assert_eq!(step.results.len(), step.tool_calls.len());
                for (call, result) in step.tool_calls.iter().zip(&step.results) {
                    assert_eq!(call.id, result.id);
                }
            }
        }

        // The unknown tool failed without aborting the loop.
        let step = &outcome.trace[0];
        assert!(step.results[0].success);
        assert!(!step.results[1].success);
        assert_eq!(outcome.final_text, "done");
    }

    /// Tool failures surface to the model as error text, not as loop errors.
    #[tokio::test]
    async fn tool_failure_is_fed_back_to_model() {
        let model = ScriptedModel::new(vec![
            calculator_call("call_1", "1+"),
            ChatResponse::text("that expression is invalid"),
        ]);
        let registry = calculator_registry();
        let executor = ToolExecutor::new();

        let outcome = run_tool_loop(
            &model,
            &registry,
            &executor,
            seed_messages(),
            &LoopOptions::default(),
        )
        .await
        .unwrap();

        // Calculator reports failure as text, so the result is "successful"
        // from the executor's point of view and carries the failure message.
        assert!(outcome.trace[0].results[0].output.starts_with("计算失败"));

        let requests = model.requests.lock().unwrap();
        let tool_msg = requests[1]
            .messages
            .iter()
            .find(|m| m.role == Role::Tool)
            .unwrap();
        assert!(tool_msg.content.starts_with("计算失败"));
    }

    /// Model-call failures propagate; the loop does not retry.
    #[tokio::test]
    async fn model_failure_propagates() {
        let model = ScriptedModel::new(vec![]);
        let registry = calculator_registry();
        let executor = ToolExecutor::new();

        let result = run_tool_loop(
            &model,
            &registry,
            &executor,
            seed_messages(),
            &LoopOptions::default(),
        )
        .await;
        assert!(matches!(result, Err(AgentError::Model(_))));
        assert_eq!(model.request_count(), 1);
    }

    /// Cancellation before the first step returns an empty partial trace.
    #[tokio::test]
    async fn cancellation_stops_between_steps() {
        let model = ScriptedModel::new(vec![calculator_call("call_1", "1+1")]);
        let registry = calculator_registry();
        let executor = ToolExecutor::new();

        let flag: CancelFlag = Arc::new(AtomicBool::new(true));
        let opts = LoopOptions {
            cancel: Some(flag),
            ..LoopOptions::default()
        };

        let result = run_tool_loop(&model, &registry, &executor, seed_messages(), &opts).await;
        match result {
            Err(AgentError::Cancelled { steps_used, trace }) => {
                assert_eq!(steps_used, 0);
                assert!(trace.is_empty());
            }
            other => panic!("expected cancellation, got {other:?}"),
        }
        assert_eq!(model.request_count(), 0);
    }
}
