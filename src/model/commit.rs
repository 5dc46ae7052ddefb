//! The commit: the single immutable, content-addressed node of the graph.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::hash::{TraceHash, canonical_hash};
use crate::llm::LLMConfig;

/// Whether a commit appends new content to the chain or replaces the
/// effective content of an earlier commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Append,
    Edit,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Append => "APPEND",
            Operation::Edit => "EDIT",
        }
    }
}

/// An immutable commit. Two commits with identical `commit_hash` are, by
/// construction, identical in every field participating in the hash (see
/// [`Commit::compute_hash`]) — `token_count`/`token_source` may later diverge
/// via [`crate::engine::CommitEngine::record_usage`] without affecting identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Commit {
    pub commit_hash: TraceHash,
    pub tract_id: Uuid,
    pub content_hash: TraceHash,
    pub content_type: String,
    pub parent_hash: Option<TraceHash>,
    pub operation: Operation,
    pub edit_target: Option<TraceHash>,
    pub message: String,
    pub metadata: Value,
    pub generation_config: Option<LLMConfig>,
    pub token_count: u64,
    pub token_source: Option<String>,
    pub created_at: NaiveDateTime,
    pub reply_to: Option<TraceHash>,
}

/// The canonical tuple that identifies a commit. `reply_to`,
/// `token_count`, and `token_source` deliberately do not participate: the
/// first is a semantic annotation, the latter two are filled in after the
/// commit's identity is already fixed.
#[derive(Serialize)]
struct CommitHashInput<'a> {
    tract_id: Uuid,
    content_hash: TraceHash,
    content_type: &'a str,
    parent_hash: Option<TraceHash>,
    operation: Operation,
    edit_target: Option<TraceHash>,
    message: &'a str,
    metadata: &'a Value,
    generation_config: Option<&'a LLMConfig>,
    created_at: NaiveDateTime,
}

/// Parameters for constructing a not-yet-hashed commit. Built by
/// [`crate::engine::CommitEngine::create_commit`] once `parent_hash`,
/// `message`, and `created_at` have been resolved.
pub struct NewCommit {
    pub tract_id: Uuid,
    pub content_hash: TraceHash,
    pub content_type: String,
    pub parent_hash: Option<TraceHash>,
    pub operation: Operation,
    pub edit_target: Option<TraceHash>,
    pub message: String,
    pub metadata: Value,
    pub generation_config: Option<LLMConfig>,
    pub created_at: NaiveDateTime,
    pub reply_to: Option<TraceHash>,
}

impl NewCommit {
    /// Compute `commit_hash` and freeze into a [`Commit`] with `token_count`
    /// left at the caller-supplied value (set after token counting).
    pub fn into_commit(self, token_count: u64, token_source: Option<String>) -> Commit {
        let commit_hash = self.compute_hash();
        Commit {
            commit_hash,
            tract_id: self.tract_id,
            content_hash: self.content_hash,
            content_type: self.content_type,
            parent_hash: self.parent_hash,
            operation: self.operation,
            edit_target: self.edit_target,
            message: self.message,
            metadata: self.metadata,
            generation_config: self.generation_config,
            token_count,
            token_source,
            created_at: self.created_at,
            reply_to: self.reply_to,
        }
    }

    fn compute_hash(&self) -> TraceHash {
        let input = CommitHashInput {
            tract_id: self.tract_id,
            content_hash: self.content_hash,
            content_type: &self.content_type,
            parent_hash: self.parent_hash,
            operation: self.operation,
            edit_target: self.edit_target,
            message: &self.message,
            metadata: &self.metadata,
            generation_config: self.generation_config.as_ref(),
            created_at: self.created_at,
        };
        canonical_hash(&input).expect("commit hash input is always serializable")
    }
}

/// Synthesize a commit message from a content payload preview when the
/// caller supplied `None`. An explicit empty string is left as-is by the
/// caller and never reaches this function.
pub fn synthesize_message(content_type: &str, preview: &str) -> String {
    format!("{content_type}: {preview}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample(created_at: NaiveDateTime) -> NewCommit {
        NewCommit {
            tract_id: Uuid::from_u128(1),
            content_hash: TraceHash::of_bytes(b"hello"),
            content_type: "instruction".to_string(),
            parent_hash: None,
            operation: Operation::Append,
            edit_target: None,
            message: "instruction: hello".to_string(),
            metadata: json!({}),
            generation_config: None,
            created_at,
            reply_to: None,
        }
    }

    #[test]
    fn hash_is_deterministic_for_identical_fields() {
        let now = chrono::NaiveDate::from_ymd_opt(2026, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let a = sample(now).compute_hash();
        let b = sample(now).compute_hash();
        assert_eq!(a, b);
    }

    #[test]
    fn hash_changes_with_generation_config_but_not_content_hash() {
        let now = chrono::NaiveDate::from_ymd_opt(2026, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let mut with_config = sample(now);
        with_config.generation_config = Some(LLMConfig::default().with_model("gpt-4"));
        let plain = sample(now).compute_hash();
        let configured = with_config.compute_hash();
        assert_ne!(plain, configured);
    }

    #[test]
    fn reply_to_does_not_affect_hash() {
        let now = chrono::NaiveDate::from_ymd_opt(2026, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let mut a = sample(now);
        let b = sample(now);
        a.reply_to = Some(TraceHash::of_bytes(b"other"));
        assert_eq!(a.compute_hash(), b.compute_hash());
    }
}
