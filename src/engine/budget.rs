//! Token budget policy, evaluated against the post-commit compiled token
//! total.

use std::sync::Arc;

/// What to do when a commit would push the compiled context over
/// `max_tokens`.
#[derive(Clone)]
pub enum BudgetMode {
    /// Log and allow the commit through.
    Warn,
    /// Roll the commit back and return `TraceError::BudgetExceeded`.
    Reject,
    /// Invoke the callback with the would-be total; the callback's return
    /// value decides whether to keep (`true`) or roll back (`false`) the
    /// commit.
    Callback(Arc<dyn Fn(usize, usize) -> bool + Send + Sync>),
}

impl std::fmt::Debug for BudgetMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BudgetMode::Warn => write!(f, "Warn"),
            BudgetMode::Reject => write!(f, "Reject"),
            BudgetMode::Callback(_) => write!(f, "Callback(..)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TokenBudgetConfig {
    pub max_tokens: Option<usize>,
    pub mode: BudgetMode,
}

impl Default for TokenBudgetConfig {
    fn default() -> Self {
        Self {
            max_tokens: None,
            mode: BudgetMode::Warn,
        }
    }
}

/// The result of evaluating budget policy against a compiled token total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetDecision {
    /// Within budget, or no budget configured.
    Within,
    /// Over budget but the commit is kept (warn mode, or a callback that
    /// returned `true`).
    OverButKept,
    /// Over budget and the commit must be rolled back.
    Rollback,
}

impl TokenBudgetConfig {
    pub fn evaluate(&self, compiled_tokens: usize) -> BudgetDecision {
        let Some(limit) = self.max_tokens else {
            return BudgetDecision::Within;
        };
        if compiled_tokens <= limit {
            return BudgetDecision::Within;
        }
        match &self.mode {
            BudgetMode::Warn => {
                tracing::warn!(
                    compiled_tokens,
                    limit,
                    "compiled context exceeds configured token budget"
                );
                BudgetDecision::OverButKept
            }
            BudgetMode::Reject => BudgetDecision::Rollback,
            BudgetMode::Callback(callback) => {
                if callback(compiled_tokens, limit) {
                    BudgetDecision::OverButKept
                } else {
                    BudgetDecision::Rollback
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn within_budget_when_unconfigured() {
        let config = TokenBudgetConfig::default();
        assert_eq!(config.evaluate(1_000_000), BudgetDecision::Within);
    }

    #[test]
    fn reject_mode_signals_rollback_over_limit() {
        let config = TokenBudgetConfig {
            max_tokens: Some(50),
            mode: BudgetMode::Reject,
        };
        assert_eq!(config.evaluate(51), BudgetDecision::Rollback);
        assert_eq!(config.evaluate(50), BudgetDecision::Within);
    }

    #[test]
    fn callback_mode_defers_to_closure() {
        let config = TokenBudgetConfig {
            max_tokens: Some(10),
            mode: BudgetMode::Callback(Arc::new(|compiled, _limit| compiled < 20)),
        };
        assert_eq!(config.evaluate(15), BudgetDecision::OverButKept);
        assert_eq!(config.evaluate(25), BudgetDecision::Rollback);
    }
}
