use std::sync::Arc;

use openmates_core::config::OpenAiCompatEntry;

use crate::gemini::GeminiProvider;
use crate::openai_compat::OpenAiCompatProvider;
use crate::provider::LlmProvider;

/// A well-known OpenAI-compatible vendor an operator can enable by config
/// alone. Grounded on `skynet-agent/src/registry.rs::KnownProvider`, trimmed to
/// the vendors SPEC_FULL.md §4.B names explicitly (OpenAI-compatible family,
/// Mistral, Groq) plus the handful the pack's other examples reach for.
#[derive(Debug, Clone, Copy)]
pub struct KnownProvider {
    pub id: &'static str,
    pub name: &'static str,
    pub base_url: &'static str,
    pub chat_path: &'static str,
    pub default_model: &'static str,
}

pub const KNOWN_PROVIDERS: &[KnownProvider] = &[
    KnownProvider { id: "openai", name: "OpenAI", base_url: "https://api.openai.com", chat_path: "/v1/chat/completions", default_model: "gpt-4.1-mini" },
    KnownProvider { id: "mistral", name: "Mistral", base_url: "https://api.mistral.ai", chat_path: "/v1/chat/completions", default_model: "mistral-small-latest" },
    KnownProvider { id: "groq", name: "Groq", base_url: "https://api.groq.com/openai", chat_path: "/v1/chat/completions", default_model: "llama-3.3-70b-versatile" },
];

pub fn lookup(id: &str) -> Option<&'static KnownProvider> {
    KNOWN_PROVIDERS.iter().find(|p| p.id == id)
}

/// Typed provider registry owned by the application object (SPEC_FULL.md §9:
/// replaces the teacher's global-singleton style with an explicit, boot-time-
/// constructed map). Built once; immutable afterwards.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: std::collections::HashMap<String, Arc<dyn LlmProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: impl Into<String>, provider: Arc<dyn LlmProvider>) {
        self.providers.insert(id.into(), provider);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn LlmProvider>> {
        self.providers.get(id).cloned()
    }

    /// Register every OpenAI-compatible vendor named in config, plus a native
    /// Gemini adapter if an API key is supplied for it. Every adapter is
    /// constructed with an explicit, already-resolved API key — see
    /// SPEC_FULL.md §9's decision that no adapter constructor is a no-op.
    pub fn bootstrap_openai_compat(&mut self, entries: &[OpenAiCompatEntry], api_keys: &std::collections::HashMap<String, String>) {
        for entry in entries {
            let Some(key) = api_keys.get(&entry.api_key_secret) else { continue };
            let provider = OpenAiCompatProvider::with_path(entry.id.clone(), key.clone(), entry.base_url.clone(), entry.chat_path.clone());
            self.register(entry.id.clone(), Arc::new(provider));
        }
    }

    pub fn register_gemini(&mut self, api_key: String) {
        self.register("gemini", Arc::new(GeminiProvider::new(api_key)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_finds_known_vendor() {
        assert_eq!(lookup("mistral").unwrap().default_model, "mistral-small-latest");
        assert!(lookup("does-not-exist").is_none());
    }

    #[test]
    fn bootstrap_skips_vendors_missing_their_secret() {
        let mut registry = ProviderRegistry::new();
        let entries = vec![OpenAiCompatEntry {
            id: "groq".into(),
            base_url: "https://api.groq.com/openai".into(),
            chat_path: "/v1/chat/completions".into(),
            default_model: "llama".into(),
            api_key_secret: "groq_api_key".into(),
        }];
        registry.bootstrap_openai_compat(&entries, &std::collections::HashMap::new());
        assert!(registry.get("groq").is_none());
    }
}
