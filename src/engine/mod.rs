//! The commit engine: the only component allowed to mint a [`Commit`] or
//! mutate an [`Annotation`]. Everything above this layer (the compiler,
//! branch/merge, compression, the `Tract` facade) goes through here rather
//! than touching [`Store`] directly.

pub mod batch;
pub mod budget;

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use crate::content::{ContentPayload, ContentTypeRegistry};
use crate::errors::TraceError;
use crate::hash::TraceHash;
use crate::llm::LLMConfig;
use crate::model::commit::{synthesize_message, NewCommit, Operation};
use crate::model::{Commit, Priority};
use crate::storage::Store;
use crate::tokens::TokenCounter;

pub use batch::BatchScope;
pub use budget::{BudgetDecision, BudgetMode, TokenBudgetConfig};

pub struct CommitEngine {
    store: Arc<dyn Store>,
    tokenizer: Arc<dyn TokenCounter>,
    registry: ContentTypeRegistry,
}

impl CommitEngine {
    pub fn new(
        store: Arc<dyn Store>,
        tokenizer: Arc<dyn TokenCounter>,
        registry: ContentTypeRegistry,
    ) -> Self {
        Self {
            store,
            tokenizer,
            registry,
        }
    }

    pub(crate) fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn tokenizer(&self) -> &Arc<dyn TokenCounter> {
        &self.tokenizer
    }

    /// Validate and hash a commit without writing it anywhere. Shared by the
    /// immediate [`Self::create_commit`] path and [`BatchScope::create_commit`],
    /// which defers the actual writes.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn prepare_commit(
        &self,
        tract_id: Uuid,
        content: ContentPayload,
        operation: Operation,
        parent_hash: Option<TraceHash>,
        message: Option<String>,
        reply_to: Option<TraceHash>,
        edit_target: Option<TraceHash>,
        metadata: Value,
        mut generation_config: Option<LLMConfig>,
    ) -> Result<(Commit, Vec<u8>), TraceError> {
        content.validate(&self.registry)?;

        if operation == Operation::Edit {
            let target = edit_target.ok_or_else(|| {
                TraceError::validation("commit", "EDIT operation requires an edit_target")
            })?;
            let target_commit = self.store.get(target).await?;
            if target_commit.tract_id != tract_id {
                return Err(TraceError::validation(
                    "commit",
                    "edit_target belongs to a different tract",
                ));
            }
            if generation_config.is_none() {
                generation_config = target_commit.generation_config.clone();
            }
        } else if edit_target.is_some() {
            return Err(TraceError::validation(
                "commit",
                "edit_target is only valid for EDIT operations",
            ));
        }

        let content_hash = content.content_hash();
        let bytes = content.canonical_bytes();

        let message = match message {
            Some(m) => m,
            None => synthesize_message(content.content_type(), &content.preview(72)),
        };

        let created_at = Utc::now().naive_utc();
        let token_count = self.tokenizer.count_text(&content.as_message_text()) as u64;
        let token_source = format!("tiktoken:{}", self.tokenizer.encoding_name());

        let new_commit = NewCommit {
            tract_id,
            content_hash,
            content_type: content.content_type().to_string(),
            parent_hash,
            operation,
            edit_target,
            message,
            metadata,
            generation_config,
            created_at,
            reply_to,
        };
        let commit = new_commit.into_commit(token_count, Some(token_source));
        Ok((commit, bytes))
    }

    /// Mint and persist a commit immediately. `parent_hash` is the caller's
    /// current HEAD (or `None` for the first commit in a tract); the engine
    /// does not resolve HEAD itself — that is the `Tract` facade's job, since
    /// it alone owns the ref that names HEAD.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_commit(
        &self,
        tract_id: Uuid,
        content: ContentPayload,
        operation: Operation,
        parent_hash: Option<TraceHash>,
        message: Option<String>,
        reply_to: Option<TraceHash>,
        edit_target: Option<TraceHash>,
        metadata: Value,
        generation_config: Option<LLMConfig>,
    ) -> Result<Commit, TraceError> {
        let (commit, bytes) = self
            .prepare_commit(
                tract_id,
                content,
                operation,
                parent_hash,
                message,
                reply_to,
                edit_target,
                metadata,
                generation_config,
            )
            .await?;
        self.store.save_if_absent(commit.content_hash, &bytes).await?;
        self.store.create(&commit).await?;
        Ok(commit)
    }

    /// Attach a priority annotation to a commit. The latest annotation for a
    /// target wins; this always appends rather than
    /// overwriting a prior row.
    pub async fn annotate(
        &self,
        target_hash: TraceHash,
        priority: Priority,
        reason: Option<String>,
    ) -> Result<(), TraceError> {
        self.store.get(target_hash).await?;
        self.store
            .insert(target_hash, priority, reason.as_deref(), Utc::now().naive_utc())
            .await
    }

    /// Overwrite `token_count`/`token_source` with an authoritative usage
    /// report from the LLM provider. Restricted to the current HEAD: usage
    /// reporting for a commit that has since been superseded is rejected,
    /// since nothing downstream of HEAD has observed its token count yet.
    pub async fn record_usage(
        &self,
        commit_hash: TraceHash,
        current_head: Option<TraceHash>,
        prompt_tokens: u64,
        completion_tokens: u64,
    ) -> Result<(), TraceError> {
        if current_head != Some(commit_hash) {
            return Err(TraceError::validation(
                "record_usage",
                "target commit is not the tract's current HEAD",
            ));
        }
        let token_count = prompt_tokens + completion_tokens;
        let token_source = format!("api:{prompt_tokens}+{completion_tokens}");
        self.store
            .update_token_usage(commit_hash, token_count, &token_source)
            .await
    }

    /// Open a deferred-write batch scope over this engine.
    pub fn batch(&self) -> BatchScope<'_> {
        BatchScope::new(self)
    }
}
