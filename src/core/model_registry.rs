//! Model aliasing, provider resolution and capability lookup
//!
//! User-facing model names are mapped to a provider and the model id that
//! provider expects. Capability data (context window, vision support) comes
//! from a built-in table that configuration can extend.

use crate::core::config::{CatalogEntry, ModelConfig};
use crate::core::constants::models::DEFAULT_CONTEXT_WINDOW;
use crate::core::provider::ProviderKind;
use std::collections::HashMap;

/// Built-in capabilities, matched by longest model-name prefix
const BUILTIN_CAPABILITIES: &[(&str, usize, bool)] = &[
    ("gpt-4o-mini", 128_000, true),
    ("gpt-4o", 128_000, true),
    ("gpt-4-turbo", 128_000, true),
    ("gpt-4-vision", 128_000, true),
    ("gpt-4", 8_192, false),
    ("gpt-3.5-turbo", 16_385, false),
    ("gemini-1.5-pro", 2_097_152, true),
    ("gemini-1.5-flash", 1_048_576, true),
    ("gemini-2", 1_048_576, true),
    ("gemini-pro-vision", 12_288, true),
    ("gemini-pro", 32_760, false),
    ("claude-3", 200_000, true),
    ("llava", 4_096, true),
    ("llama3", 8_192, false),
    ("mistral", 32_000, false),
];

/// A model name resolved to the provider that serves it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedModel {
    pub kind: ProviderKind,
    /// Model id as the provider expects it, without routing prefix
    pub upstream_model: String,
}

/// Maps user-facing model names to providers and capabilities
pub struct ModelRegistry {
    aliases: HashMap<String, String>,
    catalog: HashMap<String, CatalogEntry>,
}

impl ModelRegistry {
    /// Create a new ModelRegistry from the model configuration
    pub fn new(config: &ModelConfig) -> Self {
        Self {
            aliases: config.aliases.clone(),
            catalog: config
                .catalog
                .iter()
                .map(|entry| (entry.name.clone(), entry.clone()))
                .collect(),
        }
    }

    /// Apply the alias map, returning the canonical model name
    pub fn canonical<'a>(&'a self, model: &'a str) -> &'a str {
        self.aliases.get(model).map(String::as_str).unwrap_or(model)
    }

    /// Resolve a model to its provider
    ///
    /// `gemini/`, `openrouter/` and `ollama/` prefixes select those
    /// providers and are stripped; anything else goes to OpenAI. An explicit
    /// `openai/` prefix is also accepted.
    pub fn resolve(&self, model: &str) -> ResolvedModel {
        let canonical = self.canonical(model);

        if let Some((prefix, rest)) = canonical.split_once('/') {
            if let Some(kind) = ProviderKind::from_prefix(prefix) {
                return ResolvedModel {
                    kind,
                    upstream_model: rest.to_string(),
                };
            }
        }

        ResolvedModel {
            kind: ProviderKind::OpenAI,
            upstream_model: canonical.to_string(),
        }
    }

    fn catalog_entry(&self, model: &str) -> Option<&CatalogEntry> {
        let canonical = self.canonical(model);
        self.catalog
            .get(model)
            .or_else(|| self.catalog.get(canonical))
            .or_else(|| self.catalog.get(&self.resolve(model).upstream_model))
    }

    fn builtin(&self, model: &str) -> Option<(usize, bool)> {
        let upstream = self.resolve(model).upstream_model.to_lowercase();
        // OpenRouter ids carry an organisation, e.g. `anthropic/claude-3-haiku`
        let name = upstream.rsplit('/').next().unwrap_or(&upstream);

        BUILTIN_CAPABILITIES
            .iter()
            .filter(|(prefix, _, _)| name.starts_with(prefix))
            .max_by_key(|(prefix, _, _)| prefix.len())
            .map(|(_, window, vision)| (*window, *vision))
    }

    /// Whether the model accepts image input; unknown models do not
    pub fn supports_vision(&self, model: &str) -> bool {
        if let Some(entry) = self.catalog_entry(model) {
            return entry.supports_vision;
        }
        self.builtin(model).map(|(_, vision)| vision).unwrap_or(false)
    }

    /// Context window of the model in tokens
    pub fn context_window(&self, model: &str) -> usize {
        if let Some(entry) = self.catalog_entry(model) {
            return entry.context_window;
        }
        self.builtin(model)
            .map(|(window, _)| window)
            .unwrap_or(DEFAULT_CONTEXT_WINDOW)
    }
}
