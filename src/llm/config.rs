//! `LLMConfig`: a frozen, cross-framework-compatible LLM call configuration.
//!
//! Grounded in a provenance-record precursor that normalizes
//! provider-specific parameters into dedicated fields with a catch-all JSON
//! bag for the rest. `LLMConfig` generalizes that shape into a value type
//! with an explicit `from_dict`/`to_dict` round-trip law, since generation
//! parameters here are resolved and merged across four precedence levels
//! before ever reaching a provider.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Keys accepted verbatim from a caller-supplied dict that map to a
/// dedicated field rather than `extra`.
const ALIASES: &[(&str, &str)] = &[("stop", "stop_sequences"), ("max_completion_tokens", "max_tokens")];

/// Keys stripped entirely on `from_dict` — transport/plumbing concerns that
/// never belong in a frozen generation config.
const PLUMBING_KEYS: &[&str] = &[
    "messages",
    "tools",
    "tool_choice",
    "stream",
    "response_format",
    "n",
    "logprobs",
    "top_logprobs",
    "functions",
    "function_call",
    "system",
    "metadata",
];

/// A frozen LLM call configuration. Every field is optional: an absent field
/// is omitted from outgoing kwargs rather than defaulted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LLMConfig {
    pub model: Option<String>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub max_tokens: Option<u64>,
    pub stop_sequences: Option<Vec<String>>,
    pub frequency_penalty: Option<f64>,
    pub presence_penalty: Option<f64>,
    pub top_k: Option<u64>,
    pub seed: Option<u64>,
    pub extra: BTreeMap<String, Value>,
}

impl LLMConfig {
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u64) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Build a config from a loosely-typed dict, routing known keys to
    /// dedicated fields, applying cross-framework aliases, dropping plumbing
    /// keys, and bucketing everything else into `extra`.
    pub fn from_dict(dict: &BTreeMap<String, Value>) -> Self {
        let mut normalized: BTreeMap<String, Value> = BTreeMap::new();
        for (key, value) in dict {
            if PLUMBING_KEYS.contains(&key.as_str()) {
                continue;
            }
            let resolved_key = ALIASES
                .iter()
                .find(|(from, _)| from == key)
                .map(|(_, to)| to.to_string())
                .unwrap_or_else(|| key.clone());
            normalized.insert(resolved_key, value.clone());
        }

        let mut config = LLMConfig::default();
        config.model = normalized.remove("model").and_then(|v| v.as_str().map(str::to_string));
        config.temperature = normalized.remove("temperature").and_then(|v| v.as_f64());
        config.top_p = normalized.remove("top_p").and_then(|v| v.as_f64());
        config.max_tokens = normalized.remove("max_tokens").and_then(|v| v.as_u64());
        config.stop_sequences = normalized.remove("stop_sequences").and_then(|v| {
            v.as_array()
                .map(|a| a.iter().filter_map(|s| s.as_str().map(str::to_string)).collect())
        });
        config.frequency_penalty = normalized.remove("frequency_penalty").and_then(|v| v.as_f64());
        config.presence_penalty = normalized.remove("presence_penalty").and_then(|v| v.as_f64());
        config.top_k = normalized.remove("top_k").and_then(|v| v.as_u64());
        config.seed = normalized.remove("seed").and_then(|v| v.as_u64());
        config.extra = normalized;
        config
    }

    /// Flatten back into a single dict: typed fields first, then `extra`.
    pub fn to_dict(&self) -> BTreeMap<String, Value> {
        let mut out = BTreeMap::new();
        if let Some(model) = &self.model {
            out.insert("model".to_string(), Value::String(model.clone()));
        }
        if let Some(v) = self.temperature {
            out.insert("temperature".to_string(), serde_json::json!(v));
        }
        if let Some(v) = self.top_p {
            out.insert("top_p".to_string(), serde_json::json!(v));
        }
        if let Some(v) = self.max_tokens {
            out.insert("max_tokens".to_string(), serde_json::json!(v));
        }
        if let Some(v) = &self.stop_sequences {
            out.insert("stop_sequences".to_string(), serde_json::json!(v));
        }
        if let Some(v) = self.frequency_penalty {
            out.insert("frequency_penalty".to_string(), serde_json::json!(v));
        }
        if let Some(v) = self.presence_penalty {
            out.insert("presence_penalty".to_string(), serde_json::json!(v));
        }
        if let Some(v) = self.top_k {
            out.insert("top_k".to_string(), serde_json::json!(v));
        }
        if let Some(v) = self.seed {
            out.insert("seed".to_string(), serde_json::json!(v));
        }
        for (k, v) in &self.extra {
            out.insert(k.clone(), v.clone());
        }
        out
    }

    /// Resolve the effective config for one call, highest precedence first:
    /// call-level sugar, call-level config, operation-level config,
    /// tract-level default. Scalar fields take the first `Some` in that
    /// order; `extra` is shallow-merged, with higher precedence winning
    /// per-key (an explicit choice for the ambiguity this resolves, see
    /// `DESIGN.md`).
    pub fn resolve(layers: [Option<&LLMConfig>; 4]) -> LLMConfig {
        let mut result = LLMConfig::default();
        // extra: fold lowest to highest precedence so later (higher-precedence)
        // inserts win per key.
        for layer in layers.iter().rev().filter_map(|l| *l) {
            for (k, v) in &layer.extra {
                result.extra.insert(k.clone(), v.clone());
            }
        }
        for layer in layers.into_iter().flatten() {
            result.model = result.model.or_else(|| layer.model.clone());
            result.temperature = result.temperature.or(layer.temperature);
            result.top_p = result.top_p.or(layer.top_p);
            result.max_tokens = result.max_tokens.or(layer.max_tokens);
            result.stop_sequences = result.stop_sequences.clone().or_else(|| layer.stop_sequences.clone());
            result.frequency_penalty = result.frequency_penalty.or(layer.frequency_penalty);
            result.presence_penalty = result.presence_penalty.or(layer.presence_penalty);
            result.top_k = result.top_k.or(layer.top_k);
            result.seed = result.seed.or(layer.seed);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trip_law_holds_for_typed_fields() {
        let config = LLMConfig::default()
            .with_model("gpt-4")
            .with_temperature(0.2)
            .with_max_tokens(256);
        let dict = config.to_dict();
        let back = LLMConfig::from_dict(&dict);
        assert_eq!(config, back);
    }

    #[test]
    fn round_trip_law_holds_with_extra_and_aliases() {
        let mut dict = BTreeMap::new();
        dict.insert("model".to_string(), json!("claude"));
        dict.insert("stop".to_string(), json!(["</s>"]));
        dict.insert("messages".to_string(), json!([{"role": "user"}]));
        dict.insert("custom_flag".to_string(), json!(true));

        let config = LLMConfig::from_dict(&dict);
        assert_eq!(config.model.as_deref(), Some("claude"));
        assert_eq!(config.stop_sequences, Some(vec!["</s>".to_string()]));
        assert!(!config.extra.contains_key("messages"));
        assert_eq!(config.extra.get("custom_flag"), Some(&json!(true)));

        let round_tripped = LLMConfig::from_dict(&config.to_dict());
        assert_eq!(config, round_tripped);
    }

    #[test]
    fn resolve_prefers_higher_precedence_scalars() {
        let tract_default = LLMConfig::default().with_model("gpt-3.5").with_temperature(0.9);
        let call_sugar = LLMConfig::default().with_model("gpt-4");
        let resolved = LLMConfig::resolve([Some(&call_sugar), None, None, Some(&tract_default)]);
        assert_eq!(resolved.model.as_deref(), Some("gpt-4"));
        assert_eq!(resolved.temperature, Some(0.9));
    }

    #[test]
    fn resolve_shallow_merges_extra_with_higher_precedence_winning() {
        let mut tract_default = LLMConfig::default();
        tract_default.extra.insert("a".to_string(), json!(1));
        tract_default.extra.insert("b".to_string(), json!(1));
        let mut call_sugar = LLMConfig::default();
        call_sugar.extra.insert("b".to_string(), json!(2));

        let resolved = LLMConfig::resolve([Some(&call_sugar), None, None, Some(&tract_default)]);
        assert_eq!(resolved.extra.get("a"), Some(&json!(1)));
        assert_eq!(resolved.extra.get("b"), Some(&json!(2)));
    }
}
