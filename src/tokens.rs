//! Token counting. The default implementation wraps a byte-pair encoder; a
//! post-call usage extractor (see [`crate::llm::client::Usage`]) overrides
//! the local count on the commit it references once the provider reports
//! authoritative numbers.

use std::sync::OnceLock;

use tiktoken_rs::CoreBPE;

/// A swappable token counter. `encoding_name` is recorded on commits as the
/// `token_source` tag (`"tiktoken:<encoding_name>"`).
pub trait TokenCounter: Send + Sync {
    fn count_text(&self, text: &str) -> usize;
    fn encoding_name(&self) -> &str;
}

/// Default token counter: `tiktoken-rs`'s `o200k_base` encoding, counting
/// with special tokens treated as ordinary text so literal control-token
/// strings embedded in user content are never misinterpreted.
pub struct BpeTokenCounter {
    bpe: CoreBPE,
    encoding_name: String,
}

impl BpeTokenCounter {
    pub fn o200k_base() -> Self {
        Self {
            bpe: tiktoken_rs::o200k_base().expect("o200k_base encoding is bundled"),
            encoding_name: "o200k_base".to_string(),
        }
    }

    pub fn cl100k_base() -> Self {
        Self {
            bpe: tiktoken_rs::cl100k_base().expect("cl100k_base encoding is bundled"),
            encoding_name: "cl100k_base".to_string(),
        }
    }
}

impl Default for BpeTokenCounter {
    fn default() -> Self {
        Self::o200k_base()
    }
}

impl TokenCounter for BpeTokenCounter {
    fn count_text(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }

    fn encoding_name(&self) -> &str {
        &self.encoding_name
    }
}

/// A rough fallback counter (roughly 4 bytes/token) for environments where
/// loading a BPE table is undesirable (e.g. constrained test harnesses).
/// Never used as the crate default; a caller must opt in explicitly.
pub struct CharEstimateTokenCounter;

impl TokenCounter for CharEstimateTokenCounter {
    fn count_text(&self, text: &str) -> usize {
        text.chars().count().div_ceil(4).max(if text.is_empty() { 0 } else { 1 })
    }

    fn encoding_name(&self) -> &str {
        "char-estimate"
    }
}

static DEFAULT_COUNTER: OnceLock<BpeTokenCounter> = OnceLock::new();

pub fn default_counter() -> &'static BpeTokenCounter {
    DEFAULT_COUNTER.get_or_init(BpeTokenCounter::o200k_base)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bpe_counts_nonempty_text_as_at_least_one_token() {
        let counter = BpeTokenCounter::o200k_base();
        assert!(counter.count_text("hello world") > 0);
        assert_eq!(counter.count_text(""), 0);
    }

    #[test]
    fn encoding_name_matches_configured_encoding() {
        assert_eq!(BpeTokenCounter::o200k_base().encoding_name(), "o200k_base");
        assert_eq!(BpeTokenCounter::cl100k_base().encoding_name(), "cl100k_base");
    }

    #[test]
    fn char_estimate_is_monotonic() {
        let counter = CharEstimateTokenCounter;
        assert!(counter.count_text("a longer string here") >= counter.count_text("short"));
    }
}
