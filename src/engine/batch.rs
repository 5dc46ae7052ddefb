//! The batch scope: a scoped, deferred-write boundary. While open,
//! `create_commit`/`annotate`/ref updates are buffered in memory; `commit()`
//! replays them atomically, and dropping the scope without calling it
//! discards everything. Modeled on an "acquire on construction, restore on
//! `Drop`" scoped-resource idiom, generalized from a thread-local restore to
//! a deferred-write flush.

use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use crate::content::ContentPayload;
use crate::errors::TraceError;
use crate::hash::TraceHash;
use crate::llm::LLMConfig;
use crate::model::commit::Operation;
use crate::model::{Commit, Priority};
use crate::storage::PendingWrite;

use super::CommitEngine;

pub struct BatchScope<'a> {
    engine: &'a CommitEngine,
    pending: Vec<PendingWrite>,
    finished: bool,
}

impl<'a> BatchScope<'a> {
    pub(crate) fn new(engine: &'a CommitEngine) -> Self {
        Self {
            engine,
            pending: Vec::new(),
            finished: false,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn create_commit(
        &mut self,
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
            .engine
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
        self.pending.push(PendingWrite::Blob {
            content_hash: commit.content_hash,
            bytes,
        });
        self.pending.push(PendingWrite::Commit(Box::new(commit.clone())));
        Ok(commit)
    }

    pub fn annotate(&mut self, target_hash: TraceHash, priority: Priority, reason: Option<String>) {
        self.pending.push(PendingWrite::Annotation {
            target_hash,
            priority,
            reason,
            created_at: Utc::now().naive_utc(),
        });
    }

    pub fn set_ref(&mut self, tract_id: Uuid, ref_name: String, commit_hash: TraceHash) {
        self.pending.push(PendingWrite::RefSet {
            tract_id,
            ref_name,
            commit_hash,
        });
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Flush every deferred write atomically. LLM-invoking operations are
    /// never buffered here — the engine rejects them outright while a batch
    /// is open, since they cannot be replayed or rolled back.
    pub async fn commit(mut self) -> Result<(), TraceError> {
        let ops = std::mem::take(&mut self.pending);
        self.finished = true;
        self.engine.store().execute_batch(ops).await
    }
}

impl Drop for BatchScope<'_> {
    fn drop(&mut self) {
        if !self.finished && !self.pending.is_empty() {
            tracing::debug!(
                discarded = self.pending.len(),
                "batch scope dropped without commit; deferred writes discarded"
            );
        }
    }
}
