use std::env;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

pub mod telemetry;

/// Construction-time configuration failures.  These fail loud: a missing
/// required key is an error at load/validate time, never a silent default.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required configuration key: {0}")]
    MissingKey(&'static str),
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

// ── LLM endpoint ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Explicit provider name ("openai", "deepseek", "dashscope").  Empty
    /// means autodetect from the environment snapshot.
    pub provider: String,
    pub model_id: String,
    pub api_key: String,
    pub base_url: String,
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: String::new(),
            model_id: String::new(),
            api_key: String::new(),
            base_url: String::new(),
            timeout_secs: 60,
        }
    }
}

// ── Embedding endpoint ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbedConfig {
    /// "openai", "dashscope", or "simple" (offline deterministic fallback).
    pub model_type: String,
    pub model_name: String,
    pub api_key: String,
    pub base_url: String,
    pub dimensions: usize,
}

impl Default for EmbedConfig {
    fn default() -> Self {
        Self {
            model_type: "simple".to_string(),
            model_name: "text-embedding-3-small".to_string(),
            api_key: String::new(),
            base_url: String::new(),
            dimensions: 1536,
        }
    }
}

// ── Vector store ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QdrantConfig {
    pub url: String,
    pub api_key: String,
    pub collection: String,
    pub vector_size: usize,
    /// "Cosine", "Dot", or "Euclid".
    pub distance: String,
    pub timeout_secs: u64,
}

impl Default for QdrantConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:6334".to_string(),
            api_key: String::new(),
            collection: "cortex_memory".to_string(),
            vector_size: 1536,
            distance: "Cosine".to_string(),
            timeout_secs: 10,
        }
    }
}

// ── Graph store ───────────────────────────────────────────────────────────────

/// Connection settings for a remote graph deployment.  The bundled graph
/// store is in-process; these keys are recognised so a remote backend can be
/// swapped in without touching call sites.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    pub uri: String,
    pub username: String,
    pub password: String,
    pub database: String,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            uri: "bolt://localhost:7687".to_string(),
            username: "neo4j".to_string(),
            password: String::new(),
            database: "neo4j".to_string(),
        }
    }
}

// ── Memory tiers ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub working_memory_capacity: usize,
    pub working_memory_ttl_minutes: i64,
    pub episodic_max_capacity: usize,
    pub semantic_max_capacity: usize,
    /// When `false` the long-term tiers run keyword-only (no vector writes).
    pub vector_storage_enabled: bool,
    pub episodic_collection: String,
    pub semantic_collection: String,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            working_memory_capacity: 100,
            working_memory_ttl_minutes: 60,
            episodic_max_capacity: 1000,
            semantic_max_capacity: 1000,
            vector_storage_enabled: true,
            episodic_collection: "cortex_episodic".to_string(),
            semantic_collection: "cortex_semantic".to_string(),
        }
    }
}

// ── Agent behaviour ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub name: String,
    pub system_prompt: String,
    pub max_history_length: usize,
    pub max_tool_steps: usize,
    pub use_native_tool_calling: bool,
    pub tools_enabled: bool,
    pub retrieval_top_k: usize,
    pub rag_min_score: f32,
    pub conversation_importance_threshold: f32,
    pub session_id: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "Cortex".to_string(),
            system_prompt: "You are a helpful assistant.".to_string(),
            max_history_length: 20,
            max_tool_steps: 5,
            use_native_tool_calling: true,
            tools_enabled: true,
            retrieval_top_k: 5,
            rag_min_score: 0.3,
            conversation_importance_threshold: 0.6,
            session_id: "default_session".to_string(),
        }
    }
}

// ── Telemetry ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// DEBUG, INFO, WARN, ERROR, or SILENT.
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "INFO".to_string(),
        }
    }
}

// ── Top-level config ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub agent: AgentConfig,
    pub llm: LlmConfig,
    pub embed: EmbedConfig,
    pub qdrant: QdrantConfig,
    pub graph: GraphConfig,
    pub memory: MemoryConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    /// Load from a TOML file (missing file = defaults), then apply
    /// environment overrides.  `.env` is honoured via dotenvy.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }
        config.apply_env();
        Ok(config)
    }

    /// Defaults + environment only (no TOML file).
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        let mut config = Self::default();
        config.apply_env();
        config
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    fn apply_env(&mut self) {
        override_from_env(&mut self.llm.model_id, "LLM_MODEL_ID");
        override_from_env(&mut self.llm.api_key, "LLM_API_KEY");
        override_from_env(&mut self.llm.base_url, "LLM_BASE_URL");
        override_num(&mut self.llm.timeout_secs, "LLM_TIMEOUT");

        override_from_env(&mut self.embed.model_type, "EMBED_MODEL_TYPE");
        override_from_env(&mut self.embed.model_name, "EMBED_MODEL_NAME");
        override_from_env(&mut self.embed.api_key, "EMBED_API_KEY");
        override_from_env(&mut self.embed.base_url, "EMBED_BASE_URL");
        override_num(&mut self.embed.dimensions, "EMBED_DIMENSIONS");

        override_from_env(&mut self.qdrant.url, "QDRANT_URL");
        override_from_env(&mut self.qdrant.api_key, "QDRANT_API_KEY");
        override_from_env(&mut self.qdrant.collection, "QDRANT_COLLECTION");
        override_num(&mut self.qdrant.vector_size, "QDRANT_VECTOR_SIZE");
        override_from_env(&mut self.qdrant.distance, "QDRANT_DISTANCE");
        override_num(&mut self.qdrant.timeout_secs, "QDRANT_TIMEOUT");

        override_from_env(&mut self.graph.uri, "NEO4J_URI");
        override_from_env(&mut self.graph.username, "NEO4J_USERNAME");
        override_from_env(&mut self.graph.password, "NEO4J_PASSWORD");
        override_from_env(&mut self.graph.database, "NEO4J_DATABASE");

        override_from_env(&mut self.telemetry.log_level, "LOG_LEVEL");
    }

    /// Validate the parts that must be present before clients are built.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(
            self.embed.model_type.as_str(),
            "openai" | "dashscope" | "simple"
        ) {
            return Err(ConfigError::InvalidValue {
                key: "EMBED_MODEL_TYPE",
                value: self.embed.model_type.clone(),
            });
        }
        if self.embed.model_type != "simple" && self.embed.api_key.is_empty() {
            return Err(ConfigError::MissingKey("EMBED_API_KEY"));
        }
        if !matches!(self.qdrant.distance.as_str(), "Cosine" | "Dot" | "Euclid") {
            return Err(ConfigError::InvalidValue {
                key: "QDRANT_DISTANCE",
                value: self.qdrant.distance.clone(),
            });
        }
        if self.embed.dimensions == 0 {
            return Err(ConfigError::InvalidValue {
                key: "EMBED_DIMENSIONS",
                value: "0".to_string(),
            });
        }
        Ok(())
    }
}

fn override_from_env(slot: &mut String, key: &str) {
    if let Ok(value) = env::var(key) {
        if !value.is_empty() {
            *slot = value;
        }
    }
}

fn override_num<T: std::str::FromStr>(slot: &mut T, key: &str) {
    if let Ok(value) = env::var(key) {
        if let Ok(parsed) = value.parse() {
            *slot = parsed;
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = AppConfig::default();
        assert_eq!(config.agent.max_tool_steps, 5);
        assert_eq!(config.agent.session_id, "default_session");
        assert_eq!(config.embed.model_type, "simple");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn toml_roundtrip_preserves_sections() {
        let config = AppConfig::default();
        let rendered = toml::to_string_pretty(&config).unwrap();
        let back: AppConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(back.memory.working_memory_capacity, 100);
        assert_eq!(back.qdrant.distance, "Cosine");
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let raw = r#"
            [agent]
            name = "Custom"

            [memory]
            working_memory_capacity = 7
        "#;
        let config: AppConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.agent.name, "Custom");
        assert_eq!(config.memory.working_memory_capacity, 7);
        assert_eq!(config.agent.max_history_length, 20);
        assert_eq!(config.telemetry.log_level, "INFO");
    }

    #[test]
    fn embed_backend_without_key_fails_validation() {
        let mut config = AppConfig::default();
        config.embed.model_type = "openai".to_string();
        config.embed.api_key = String::new();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingKey("EMBED_API_KEY"))
        ));
    }

    #[test]
    fn bad_distance_fails_validation() {
        let mut config = AppConfig::default();
        config.qdrant.distance = "Manhattan".to_string();
        assert!(config.validate().is_err());
    }
}
