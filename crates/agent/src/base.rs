//! Conversational scaffolding shared by every agent variant.

use cortex_llm::Message;
use tracing::debug;

/// Name, system prompt, and a FIFO-capped conversation history.
///
/// Not safe for concurrent `run()` use: one turn at a time per instance.
/// Serve multiple users with per-user agents.
pub struct BaseAgent {
    pub name: String,
    pub system_prompt: String,
    history: Vec<Message>,
    max_history_length: usize,
}

impl BaseAgent {
    pub fn new(
        name: impl Into<String>,
        system_prompt: impl Into<String>,
        max_history_length: usize,
    ) -> Self {
        Self {
            name: name.into(),
            system_prompt: system_prompt.into(),
            history: Vec::new(),
            max_history_length: max_history_length.max(2),
        }
    }

    /// Append a completed (user, assistant) exchange, dropping the oldest
    /// messages once the cap is exceeded.
    pub fn push_turn(&mut self, user: &str, assistant: &str) {
        self.history.push(Message::user(user));
        self.history.push(Message::assistant(assistant));
        if self.history.len() > self.max_history_length {
            let overflow = self.history.len() - self.max_history_length;
            self.history.drain(..overflow);
            debug!(agent = %self.name, dropped = overflow, "history cap reached");
        }
    }

    pub fn history(&self) -> &[Message] {
        &self.history
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }
}

#[cfg(test)]
mod tests {
    use cortex_llm::Role;

    use super::*;

    #[test]
    fn history_caps_fifo() {
        let mut agent = BaseAgent::new("test", "prompt", 4);
        agent.push_turn("q1", "a1");
        agent.push_turn("q2", "a2");
        agent.push_turn("q3", "a3");

        let history = agent.history();
        assert_eq!(history.len(), 4);
        // The oldest exchange was dropped.
        assert_eq!(history[0].content, "q2");
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[3].content, "a3");
        assert_eq!(history[3].role, Role::Assistant);
    }

    #[test]
    fn clear_history() {
        let mut agent = BaseAgent::new("test", "prompt", 10);
        agent.push_turn("q", "a");
        agent.clear_history();
        assert!(agent.history().is_empty());
    }
}
