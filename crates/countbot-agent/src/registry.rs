//! Built-in provider registry — maps well-known provider IDs to their API
//! endpoints, default models, and routing quirks, so users configure an id
//! and a key instead of looking up URLs.

/// A well-known OpenAI-compatible LLM provider.
pub struct KnownProvider {
    /// Short identifier used in config (e.g. "zhipu", "deepseek").
    pub id: &'static str,
    /// Human-readable display name.
    pub name: &'static str,
    /// Base URL without trailing slash.
    pub base_url: &'static str,
    /// Path appended to base_url for chat completions.
    pub chat_path: &'static str,
    /// Recommended model for this provider.
    pub default_model: &'static str,
    /// Router-style prefix some gateways require on the model id
    /// (e.g. "openrouter" → "openrouter/<model>"). Empty means none.
    pub model_prefix: &'static str,
    /// Model-id prefixes that must NOT be re-prefixed (already routed).
    pub skip_prefixes: &'static [&'static str],
    /// Per-model request parameter overrides as `(model, key, json value)`.
    pub model_overrides: &'static [(&'static str, &'static str, &'static str)],
}

impl KnownProvider {
    pub fn endpoint(&self) -> String {
        format!("{}{}", self.base_url, self.chat_path)
    }
}

pub const KNOWN_PROVIDERS: &[KnownProvider] = &[
    KnownProvider {
        id: "zhipu",
        name: "Zhipu AI (GLM)",
        base_url: "https://open.bigmodel.cn/api/paas/v4",
        chat_path: "/chat/completions",
        default_model: "glm-4-flash",
        model_prefix: "",
        skip_prefixes: &[],
        model_overrides: &[],
    },
    KnownProvider {
        id: "deepseek",
        name: "DeepSeek",
        base_url: "https://api.deepseek.com/v1",
        chat_path: "/chat/completions",
        default_model: "deepseek-chat",
        model_prefix: "",
        skip_prefixes: &[],
        model_overrides: &[],
    },
    KnownProvider {
        id: "moonshot",
        name: "Moonshot AI (Kimi)",
        base_url: "https://api.moonshot.cn/v1",
        chat_path: "/chat/completions",
        default_model: "kimi-k2.5",
        model_prefix: "",
        skip_prefixes: &[],
        // Kimi rejects temperatures below 1.0 on its flagship model.
        model_overrides: &[("kimi-k2.5", "temperature", "1.0")],
    },
    KnownProvider {
        id: "openrouter",
        name: "OpenRouter",
        base_url: "https://openrouter.ai/api/v1",
        chat_path: "/chat/completions",
        default_model: "anthropic/claude-sonnet-4.5",
        model_prefix: "openrouter",
        skip_prefixes: &["openrouter/"],
        model_overrides: &[],
    },
    KnownProvider {
        id: "openai",
        name: "OpenAI",
        base_url: "https://api.openai.com",
        chat_path: "/v1/chat/completions",
        default_model: "gpt-4o",
        model_prefix: "",
        skip_prefixes: &[],
        model_overrides: &[],
    },
    KnownProvider {
        id: "qwen",
        name: "Qwen (DashScope)",
        base_url: "https://dashscope.aliyuncs.com/compatible-mode/v1",
        chat_path: "/chat/completions",
        default_model: "qwen-turbo",
        model_prefix: "",
        skip_prefixes: &[],
        model_overrides: &[],
    },
    KnownProvider {
        id: "groq",
        name: "Groq",
        base_url: "https://api.groq.com/openai/v1",
        chat_path: "/chat/completions",
        default_model: "llama-3.3-70b-versatile",
        model_prefix: "",
        skip_prefixes: &[],
        model_overrides: &[],
    },
    KnownProvider {
        id: "mistral",
        name: "Mistral AI",
        base_url: "https://api.mistral.ai/v1",
        chat_path: "/chat/completions",
        default_model: "mistral-large-latest",
        model_prefix: "",
        skip_prefixes: &[],
        model_overrides: &[],
    },
    KnownProvider {
        id: "gemini",
        name: "Google AI (Gemini)",
        base_url: "https://generativelanguage.googleapis.com/v1beta/openai",
        chat_path: "/chat/completions",
        default_model: "gemini-2.0-flash",
        model_prefix: "",
        skip_prefixes: &[],
        model_overrides: &[],
    },
    KnownProvider {
        id: "ollama",
        name: "Ollama (local)",
        base_url: "http://localhost:11434",
        chat_path: "/v1/chat/completions",
        default_model: "llama3.1",
        model_prefix: "",
        skip_prefixes: &[],
        model_overrides: &[],
    },
];

/// Look up a known provider by its ID.
pub fn lookup(id: &str) -> Option<&'static KnownProvider> {
    KNOWN_PROVIDERS.iter().find(|p| p.id == id)
}

/// Apply the provider's routing prefix unless the model is already routed.
pub fn apply_model_prefix(provider_id: &str, model: &str) -> String {
    let Some(provider) = lookup(provider_id) else {
        return model.to_string();
    };
    if provider.model_prefix.is_empty() {
        return model.to_string();
    }
    if provider.skip_prefixes.iter().any(|p| model.starts_with(p)) {
        return model.to_string();
    }
    format!("{}/{}", provider.model_prefix, model)
}

/// Per-model request overrides for the given provider, parsed to JSON.
pub fn model_overrides(
    provider_id: &str,
    model: &str,
) -> Option<Vec<(&'static str, serde_json::Value)>> {
    let provider = lookup(provider_id)?;
    let overrides: Vec<(&'static str, serde_json::Value)> = provider
        .model_overrides
        .iter()
        .filter(|(m, _, _)| *m == model)
        .filter_map(|(_, key, raw)| serde_json::from_str(raw).ok().map(|v| (*key, v)))
        .collect();
    if overrides.is_empty() {
        None
    } else {
        Some(overrides)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_finds_known_ids() {
        assert!(lookup("zhipu").is_some());
        assert!(lookup("deepseek").is_some());
        assert!(lookup("nonexistent").is_none());
    }

    #[test]
    fn prefix_is_applied_once() {
        assert_eq!(
            apply_model_prefix("openrouter", "gpt-4o"),
            "openrouter/gpt-4o"
        );
        assert_eq!(
            apply_model_prefix("openrouter", "openrouter/gpt-4o"),
            "openrouter/gpt-4o"
        );
    }

    #[test]
    fn providers_without_prefix_pass_model_through() {
        assert_eq!(apply_model_prefix("zhipu", "glm-4-flash"), "glm-4-flash");
        assert_eq!(apply_model_prefix("unknown", "m"), "m");
    }

    #[test]
    fn kimi_temperature_override_parses() {
        let overrides = model_overrides("moonshot", "kimi-k2.5").unwrap();
        assert_eq!(overrides[0].0, "temperature");
        assert_eq!(overrides[0].1, serde_json::json!(1.0));
    }

    #[test]
    fn endpoints_are_well_formed() {
        for p in KNOWN_PROVIDERS {
            assert!(p.endpoint().starts_with("http"), "{}", p.id);
            assert!(!p.base_url.ends_with('/'), "{}", p.id);
            assert!(p.chat_path.starts_with('/'), "{}", p.id);
        }
    }
}
