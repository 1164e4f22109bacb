//! The memory-augmented agent: retrieve → augment → tool loop → write-back.

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info};

use cortex_exec::ToolExecutor;
use cortex_llm::{ChatModel, ChatRequest, Message};
use cortex_memory::{
    Entity, MemoryManager, MemoryQuery, MemoryType, ScoredMemory,
    manager::IMPORTANCE_KEYWORDS, schema::JsonMap,
};
use cortex_tools::{Tool, ToolRegistry};

use crate::base::BaseAgent;
use crate::tool_loop::{CancelFlag, LoopOptions, run_tool_loop};
use crate::AgentError;

/// Injectable keyword extractor.  The default splits on whitespace and
/// filters stop tokens; Chinese deployments inject a dictionary or
/// statistical tokenizer instead.
pub type KeywordExtractor = Arc<dyn Fn(&str) -> Vec<String> + Send + Sync>;

const STOP_TOKENS: &[&str] = &[
    "the", "and", "for", "are", "was", "is", "what", "who", "how", "why", "when", "where",
    "this", "that", "with", "from", "about", "please", "could", "would", "tell", "me",
];

/// Up to three keywords, longest-first preference not applied: order of
/// appearance, like a reader would scan the sentence.
pub fn default_keyword_extractor(input: &str) -> Vec<String> {
    input
        .split_whitespace()
        .map(|w| {
            w.trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase()
        })
        .filter(|w| w.chars().count() >= 2)
        .filter(|w| !STOP_TOKENS.contains(&w.as_str()))
        .take(3)
        .collect()
}

/// Phrases that mark an assistant reply as knowledge worth keeping.
const KNOWLEDGE_INDICATORS: &[&str] = &[
    " is a ", " is an ", "refers to", "means", "defined as", "definition", "principle", "rule",
    "in general", "是指", "意味着", "定义", "原理", "规则",
];

/// Conversation importance: length, question-mark presence, importance
/// keywords; clamped to `[0, 1]`.
pub fn conversation_importance(input: &str) -> f32 {
    let mut score = 0.5f32;
    if input.chars().count() > 20 {
        score += 0.2;
    }
    if input.contains('?') || input.contains('？') {
        score += 0.1;
    }
    let lower = input.to_lowercase();
    if IMPORTANCE_KEYWORDS.iter().any(|k| lower.contains(k)) {
        score += 0.4;
    }
    score.clamp(0.0, 1.0)
}

fn contains_knowledge_indicator(reply: &str) -> bool {
    let lower = reply.to_lowercase();
    KNOWLEDGE_INDICATORS.iter().any(|k| lower.contains(k))
}

// ── Agent ────────────────────────────────────────────────────────────────────

pub struct MemoryAgent {
    base: BaseAgent,
    model: Arc<dyn ChatModel>,
    registry: ToolRegistry,
    executor: ToolExecutor,
    memory: MemoryManager,
    config: cortex_config::AgentConfig,
    user_id: String,
    keyword_fn: KeywordExtractor,
    cancel: Option<CancelFlag>,
    turn: u64,
}

impl MemoryAgent {
    pub fn new(
        model: Arc<dyn ChatModel>,
        memory: MemoryManager,
        config: cortex_config::AgentConfig,
        user_id: impl Into<String>,
    ) -> Self {
        let base = BaseAgent::new(&config.name, &config.system_prompt, config.max_history_length);
        Self {
            base,
            model,
            registry: ToolRegistry::default(),
            executor: ToolExecutor::new(),
            memory,
            config,
            user_id: user_id.into(),
            keyword_fn: Arc::new(default_keyword_extractor),
            cancel: None,
            turn: 0,
        }
    }

    pub fn register_tool(&mut self, tool: Arc<dyn Tool>) {
        self.registry.register(tool);
    }

    pub fn set_keyword_extractor(&mut self, extractor: KeywordExtractor) {
        self.keyword_fn = extractor;
    }

    /// Install a cancellation flag inherited by the tool loop.
    pub fn set_cancel_flag(&mut self, cancel: CancelFlag) {
        self.cancel = Some(cancel);
    }

    pub fn memory(&mut self) -> &mut MemoryManager {
        &mut self.memory
    }

    pub fn history(&self) -> &[Message] {
        self.base.history()
    }

    /// One conversational turn.  Not reentrant: history and memory
    /// write-back would interleave across concurrent calls.
    pub async fn run(&mut self, input: &str) -> Result<String, AgentError> {
        // 1. Retrieve: tiered memories plus graph entities for up to three
        //    extracted keywords.
        let memories = self
            .memory
            .retrieve_memories(
                &MemoryQuery::new(input, self.config.retrieval_top_k)
                    .for_user(&self.user_id)
                    .min_importance(self.config.rag_min_score),
            )
            .await;

        let keywords: Vec<String> = (self.keyword_fn)(input).into_iter().take(3).collect();
        let mut entities: Vec<Entity> = Vec::new();
        for keyword in &keywords {
            for entity in self.memory.search_entities(keyword, None, 3) {
                if !entities.iter().any(|e| e.entity_id == entity.entity_id) {
                    entities.push(entity);
                }
            }
        }
        debug!(
            memories = memories.len(),
            entities = entities.len(),
            keywords = ?keywords,
            "retrieval complete"
        );

        // 2. Augment.
        let system = self.build_system_prompt(&memories, &entities);
        let mut messages = vec![Message::system(system)];
        messages.extend(self.base.history().to_vec());
        messages.push(Message::user(input));

        // 3. Invoke.
        let tools_active = self.config.tools_enabled && !self.registry.is_empty();
        let reply = if tools_active {
            let opts = LoopOptions {
                max_steps: self.config.max_tool_steps,
                use_native_tool_calling: self.config.use_native_tool_calling,
                cancel: self.cancel.clone(),
            };
            run_tool_loop(
                self.model.as_ref(),
                &self.registry,
                &self.executor,
                messages,
                &opts,
            )
            .await?
            .final_text
        } else {
            self.model.as_ref().chat(ChatRequest::plain(messages)).await?.content
        };

        // 4. Write back, after the response is finalized.
        self.write_back(input, &reply).await;

        // 5. History and return.
        self.base.push_turn(input, &reply);
        self.turn += 1;
        Ok(reply)
    }

    /// System prompt: base + tool descriptions + memories block (tier tag
    /// and relevance score) + entities block.
    fn build_system_prompt(&self, memories: &[ScoredMemory], entities: &[Entity]) -> String {
        let mut prompt = self.base.system_prompt.clone();

        if self.config.tools_enabled && !self.registry.is_empty() {
            prompt.push_str("\n\nYou can use the following tools:\n");
            prompt.push_str(&self.registry.describe());
            if !self.config.use_native_tool_calling {
                prompt.push_str(
                    "\n\nTo call a tool, reply with a block of this exact form:\n\
                     [[TOOL_CALL]]\n{\"name\": \"tool_name\", \"arguments\": {\"param\": \"value\"}}\n[[/TOOL_CALL]]",
                );
            }
        }

        if !memories.is_empty() {
            prompt.push_str("\n\nRelevant memories:\n");
            for memory in memories {
                prompt.push_str(&format!(
                    "- [{}|{:.2}] {}\n",
                    memory.item.memory_type.as_str(),
                    memory.score,
                    memory.item.content
                ));
            }
        }

        if !entities.is_empty() {
            prompt.push_str("\nKnown entities:\n");
            for entity in entities {
                match entity.properties.get("description").and_then(|v| v.as_str()) {
                    Some(description) => prompt.push_str(&format!(
                        "- {} ({}): {}\n",
                        entity.name, entity.entity_type, description
                    )),
                    None => {
                        prompt.push_str(&format!("- {} ({})\n", entity.name, entity.entity_type))
                    }
                }
            }
        }

        prompt
    }

    /// Persist what the turn taught us: the user input as episodic when it
    /// clears the importance threshold, and the reply as semantic (at ×0.8)
    /// when it reads like knowledge.
    async fn write_back(&mut self, input: &str, reply: &str) {
        let importance = conversation_importance(input);
        if importance < self.config.conversation_importance_threshold {
            return;
        }

        let mut metadata = JsonMap::new();
        metadata.insert("session_id".to_string(), json!(self.config.session_id));
        metadata.insert("turn".to_string(), json!(self.turn));
        metadata.insert("importance".to_string(), json!(importance));
        let stored = self
            .memory
            .add_memory(input, &self.user_id, Some(MemoryType::Episodic), metadata)
            .await;
        info!(id = %stored.id, importance, "episodic write-back");

        if contains_knowledge_indicator(reply) {
            let mut metadata = JsonMap::new();
            metadata.insert("session_id".to_string(), json!(self.config.session_id));
            metadata.insert("turn".to_string(), json!(self.turn));
            metadata.insert("importance".to_string(), json!(importance * 0.8));
            let stored = self
                .memory
                .add_memory(reply, &self.user_id, Some(MemoryType::Semantic), metadata)
                .await;
            info!(id = %stored.id, "semantic write-back");
        } else {
            debug!("reply carries no knowledge indicator, skipping semantic write-back");
        }
    }
}

impl MemoryAgent {
    /// Release external resources, cascading to the memory manager (which
    /// closes the graph driver).
    pub fn close(&mut self) {
        self.memory.close();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
