//! Per-tract configuration: the token budget policy and the content-type
//! registry extensions a host installs before opening a [`crate::tract::Tract`].

use crate::content::ContentTypeRegistry;
use crate::engine::{BudgetMode, TokenBudgetConfig};
use crate::llm::LLMConfig;

/// Bundled configuration passed to [`crate::tract::Tract::open`]. Carries no
/// encoding selector of its own — a tokenizer is injected directly as an
/// `Arc<dyn TokenCounter>` — since the encoding choice is a construction-time
/// dependency, not a tunable the store needs to persist.
#[derive(Clone)]
pub struct TractConfig {
    pub token_budget: TokenBudgetConfig,
    /// Applied to a commit's `generation_config` when the caller supplies
    /// `None` and the commit is not an `EDIT` inheriting its target's config.
    pub default_generation_config: Option<LLMConfig>,
    pub registry: ContentTypeRegistry,
}

impl Default for TractConfig {
    fn default() -> Self {
        Self {
            token_budget: TokenBudgetConfig::default(),
            default_generation_config: None,
            registry: ContentTypeRegistry::new(),
        }
    }
}

impl TractConfig {
    pub fn with_max_tokens(mut self, max_tokens: usize, mode: BudgetMode) -> Self {
        self.token_budget = TokenBudgetConfig {
            max_tokens: Some(max_tokens),
            mode,
        };
        self
    }

    pub fn with_default_generation_config(mut self, config: LLMConfig) -> Self {
        self.default_generation_config = Some(config);
        self
    }

    pub fn register_content_type(
        &mut self,
        tag: impl Into<String>,
        validator: impl Fn(&serde_json::Value) -> Result<(), String> + Send + Sync + 'static,
    ) {
        self.registry.register(tag, validator);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_no_budget_ceiling() {
        let config = TractConfig::default();
        assert!(config.token_budget.max_tokens.is_none());
    }

    #[test]
    fn register_content_type_extends_registry() {
        let mut config = TractConfig::default();
        config.register_content_type("widget", |_| Ok(()));
        assert!(config.registry.is_registered("widget"));
    }
}
