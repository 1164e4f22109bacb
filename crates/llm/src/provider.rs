//! Provider selection for the chat endpoint.
//!
//! Selection is a pure function over the caller's options and a snapshot of
//! the environment, so the whole priority chain can be tested by
//! enumeration: explicit argument → provider-specific env key → base-URL
//! pattern → key prefix → default.

use serde::{Deserialize, Serialize};

use crate::LlmError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    OpenAi,
    DeepSeek,
    DashScope,
}

impl Provider {
    pub fn default_base_url(&self) -> &'static str {
        match self {
            Provider::OpenAi => "https://api.openai.com/v1",
            Provider::DeepSeek => "https://api.deepseek.com/v1",
            Provider::DashScope => "https://dashscope.aliyuncs.com/compatible-mode/v1",
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            Provider::OpenAi => "gpt-4o-mini",
            Provider::DeepSeek => "deepseek-chat",
            Provider::DashScope => "qwen-plus",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "openai" => Some(Provider::OpenAi),
            "deepseek" => Some(Provider::DeepSeek),
            "dashscope" | "qwen" => Some(Provider::DashScope),
            _ => None,
        }
    }
}

/// The environment keys that participate in autodetection, captured once so
/// detection stays a pure function.
#[derive(Debug, Clone, Default)]
pub struct EnvSnapshot {
    pub openai_api_key: Option<String>,
    pub deepseek_api_key: Option<String>,
    pub dashscope_api_key: Option<String>,
}

impl EnvSnapshot {
    pub fn capture() -> Self {
        fn non_empty(key: &str) -> Option<String> {
            std::env::var(key).ok().filter(|v| !v.trim().is_empty())
        }
        Self {
            openai_api_key: non_empty("OPENAI_API_KEY"),
            deepseek_api_key: non_empty("DEEPSEEK_API_KEY"),
            dashscope_api_key: non_empty("DASHSCOPE_API_KEY"),
        }
    }

    fn key_for(&self, provider: Provider) -> Option<&str> {
        match provider {
            Provider::OpenAi => self.openai_api_key.as_deref(),
            Provider::DeepSeek => self.deepseek_api_key.as_deref(),
            Provider::DashScope => self.dashscope_api_key.as_deref(),
        }
    }
}

/// Fully resolved endpoint after the priority chain has run.
#[derive(Debug, Clone)]
pub struct ResolvedEndpoint {
    pub provider: Provider,
    pub base_url: String,
    pub api_key: String,
    pub model: String,
}

/// Pick a provider from options + environment.  Never fails: the chain
/// bottoms out at OpenAI.
pub fn detect_provider(config: &cortex_config::LlmConfig, env: &EnvSnapshot) -> Provider {
    // 1. Explicit argument wins.
    if let Some(provider) = Provider::from_name(&config.provider) {
        return provider;
    }

    // 2. Provider-specific env keys, in a fixed order.
    if env.openai_api_key.is_some() {
        return Provider::OpenAi;
    }
    if env.deepseek_api_key.is_some() {
        return Provider::DeepSeek;
    }
    if env.dashscope_api_key.is_some() {
        return Provider::DashScope;
    }

    // 3. Base-URL pattern.
    let url = config.base_url.to_ascii_lowercase();
    if url.contains("deepseek") {
        return Provider::DeepSeek;
    }
    if url.contains("dashscope") || url.contains("aliyun") {
        return Provider::DashScope;
    }
    if url.contains("openai") {
        return Provider::OpenAi;
    }

    // 4. Key prefix.  DashScope keys historically start with "sk-" followed
    // by a long hex run; OpenAI project keys start with "sk-proj-".
    if config.api_key.starts_with("sk-proj-") {
        return Provider::OpenAi;
    }

    // 5. Default.
    Provider::OpenAi
}

/// Resolve the concrete endpoint.  Explicit config values always beat the
/// provider defaults; the API key falls back to the matching provider env
/// key.  A missing key is a construction-time configuration failure.
pub fn resolve_endpoint(
    config: &cortex_config::LlmConfig,
    env: &EnvSnapshot,
) -> Result<ResolvedEndpoint, LlmError> {
    let provider = detect_provider(config, env);

    let api_key = if !config.api_key.trim().is_empty() {
        config.api_key.clone()
    } else {
        env.key_for(provider)
            .map(str::to_string)
            .ok_or_else(|| {
                LlmError::Configuration(format!(
                    "no API key for provider {provider:?} (set LLM_API_KEY or the provider key)"
                ))
            })?
    };

    let base_url = if config.base_url.is_empty() {
        provider.default_base_url().to_string()
    } else {
        config.base_url.clone()
    };

    let model = if config.model_id.is_empty() {
        provider.default_model().to_string()
    } else {
        config.model_id.clone()
    };

    Ok(ResolvedEndpoint {
        provider,
        base_url,
        api_key,
        model,
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn config(provider: &str, base_url: &str, api_key: &str) -> cortex_config::LlmConfig {
        cortex_config::LlmConfig {
            provider: provider.to_string(),
            base_url: base_url.to_string(),
            api_key: api_key.to_string(),
            ..Default::default()
        }
    }

    fn env(openai: bool, deepseek: bool, dashscope: bool) -> EnvSnapshot {
        EnvSnapshot {
            openai_api_key: openai.then(|| "sk-openai".to_string()),
            deepseek_api_key: deepseek.then(|| "sk-deepseek".to_string()),
            dashscope_api_key: dashscope.then(|| "sk-dashscope".to_string()),
        }
    }

    #[test]
    fn explicit_argument_beats_everything() {
        let c = config("dashscope", "https://api.deepseek.com/v1", "sk-proj-x");
        assert_eq!(detect_provider(&c, &env(true, true, true)), Provider::DashScope);
    }

    #[test]
    fn provider_env_key_beats_url_pattern() {
        let c = config("", "https://api.deepseek.com/v1", "");
        assert_eq!(detect_provider(&c, &env(true, false, false)), Provider::OpenAi);
    }

    #[test]
    fn env_keys_checked_in_fixed_order() {
        let c = config("", "", "");
        assert_eq!(detect_provider(&c, &env(true, true, true)), Provider::OpenAi);
        assert_eq!(detect_provider(&c, &env(false, true, true)), Provider::DeepSeek);
        assert_eq!(detect_provider(&c, &env(false, false, true)), Provider::DashScope);
    }

    #[test]
    fn url_pattern_detection() {
        let e = env(false, false, false);
        assert_eq!(
            detect_provider(&config("", "https://api.deepseek.com/v1", ""), &e),
            Provider::DeepSeek
        );
        assert_eq!(
            detect_provider(
                &config("", "https://dashscope.aliyuncs.com/compatible-mode/v1", ""),
                &e
            ),
            Provider::DashScope
        );
        assert_eq!(
            detect_provider(&config("", "https://api.openai.com/v1", ""), &e),
            Provider::OpenAi
        );
    }

    #[test]
    fn key_prefix_then_default() {
        let e = env(false, false, false);
        assert_eq!(
            detect_provider(&config("", "", "sk-proj-abc123"), &e),
            Provider::OpenAi
        );
        assert_eq!(detect_provider(&config("", "", ""), &e), Provider::OpenAi);
    }

    #[test]
    fn resolve_uses_provider_defaults_for_blanks() {
        let c = config("deepseek", "", "sk-explicit");
        let resolved = resolve_endpoint(&c, &env(false, false, false)).unwrap();
        assert_eq!(resolved.base_url, "https://api.deepseek.com/v1");
        assert_eq!(resolved.model, "deepseek-chat");
        assert_eq!(resolved.api_key, "sk-explicit");
    }

    #[test]
    fn resolve_falls_back_to_provider_env_key() {
        let c = config("", "", "");
        let resolved = resolve_endpoint(&c, &env(false, true, false)).unwrap();
        assert_eq!(resolved.provider, Provider::DeepSeek);
        assert_eq!(resolved.api_key, "sk-deepseek");
    }

    #[test]
    fn resolve_fails_loud_without_any_key() {
        let c = config("openai", "", "");
        let result = resolve_endpoint(&c, &env(false, false, false));
        assert!(matches!(result, Err(LlmError::Configuration(_))));
    }

    #[test]
    fn explicit_config_values_beat_defaults() {
        let c = cortex_config::LlmConfig {
            provider: "openai".to_string(),
            model_id: "gpt-4.1".to_string(),
            api_key: "sk-x".to_string(),
            base_url: "https://proxy.internal/v1".to_string(),
            ..Default::default()
        };
        let resolved = resolve_endpoint(&c, &EnvSnapshot::default()).unwrap();
        assert_eq!(resolved.model, "gpt-4.1");
        assert_eq!(resolved.base_url, "https://proxy.internal/v1");
    }
}
