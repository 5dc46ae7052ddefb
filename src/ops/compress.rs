//! Chain compression: collapsing a bounded run of commits into one
//! summarizing commit while leaving `PINNED` commits untouched.

use std::sync::Arc;

use chrono::{NaiveDateTime, Utc};
use dashmap::DashMap;
use serde_json::json;
use uuid::Uuid;

use crate::content::{ContentPayload, ContentTypeRegistry};
use crate::engine::CommitEngine;
use crate::errors::TraceError;
use crate::hash::TraceHash;
use crate::llm::client::ChatMessage;
use crate::llm::{LLMConfig, LlmClient};
use crate::model::annotation::Priority;
use crate::model::commit::Operation;
use crate::model::event::{OperationCommitRef, OperationEvent, OperationKind};
use crate::model::Commit;
use crate::storage::Store;

/// Who decides the summary text and when the rewrite is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Autonomy {
    /// The engine calls the configured LLM and applies the rewrite immediately.
    Autonomous,
    /// A proposal is staged and must be approved (optionally with an edited
    /// summary) before the chain is rewritten.
    Collaborative,
    /// The caller supplies the summary text directly; no LLM call is made.
    Manual,
}

/// One contiguous run of non-`PINNED` commits slated for summarization, or a
/// single `PINNED` commit replayed unchanged onto the rewritten chain.
enum GroupKind {
    Summarize(Vec<Commit>),
    Keep(Box<Commit>),
}

struct GroupPlan {
    kind: GroupKind,
}

/// A staged compression awaiting approval (`Autonomy::Collaborative`).
pub struct PendingCompression {
    pub pending_id: Uuid,
    pub tract_id: Uuid,
    pub anchor: Option<TraceHash>,
    /// All commit hashes in the requested range, in chain order, for display.
    pub source_commits: Vec<TraceHash>,
    /// Naive preview summaries, one per summarizable group, in chain order —
    /// a caller may edit these before approving.
    pub proposed_summaries: Vec<String>,
    pub created_at: NaiveDateTime,
}

struct PendingEntry {
    tract_id: Uuid,
    anchor: Option<TraceHash>,
    groups: Vec<GroupPlan>,
    proposed_summaries: Vec<String>,
    created_at: NaiveDateTime,
}

/// Result of applying a compression, autonomous or approved-collaborative.
pub struct CompressionOutcome {
    pub new_tip: TraceHash,
    /// Commit hashes that were summarized away (not `PINNED`, not kept).
    pub replaced: Vec<TraceHash>,
    /// The newly minted summary commits, in chain order.
    pub summary_commits: Vec<TraceHash>,
}

pub struct CompressionEngine {
    store: Arc<dyn Store>,
    pending: DashMap<Uuid, PendingEntry>,
}

impl CompressionEngine {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            pending: DashMap::new(),
        }
    }

    /// Oldest-first commits strictly after `start_exclusive` (or from the
    /// root) up to and including `end`, all on the first-parent chain.
    async fn range(&self, start_exclusive: Option<TraceHash>, end: TraceHash) -> Result<Vec<Commit>, TraceError> {
        let mut out = Vec::new();
        let mut cursor = Some(end);
        while let Some(hash) = cursor {
            if Some(hash) == start_exclusive {
                break;
            }
            let commit = self.store.get(hash).await?;
            cursor = commit.parent_hash;
            out.push(commit);
        }
        if start_exclusive.is_some() && cursor.is_none() {
            return Err(TraceError::InvalidRange(
                "range start is not an ancestor of range end on the first-parent chain".to_string(),
            ));
        }
        out.reverse();
        Ok(out)
    }

    /// Split a chain range into `PINNED`-bounded groups: consecutive
    /// non-`PINNED` commits become one `Summarize` group; each `PINNED`
    /// commit stands alone as a `Keep` group.
    async fn plan_groups(&self, commits: Vec<Commit>) -> Result<Vec<GroupPlan>, TraceError> {
        let hashes: Vec<TraceHash> = commits.iter().map(|c| c.commit_hash).collect();
        let annotations = self.store.batch_get_latest(&hashes).await?;

        let mut groups = Vec::new();
        let mut current: Vec<Commit> = Vec::new();
        for commit in commits {
            let pinned = annotations
                .get(&commit.commit_hash)
                .map(|a| a.priority == Priority::Pinned)
                .unwrap_or(false);
            if pinned {
                if !current.is_empty() {
                    groups.push(GroupPlan {
                        kind: GroupKind::Summarize(std::mem::take(&mut current)),
                    });
                }
                groups.push(GroupPlan {
                    kind: GroupKind::Keep(Box::new(commit)),
                });
            } else {
                current.push(commit);
            }
        }
        if !current.is_empty() {
            groups.push(GroupPlan {
                kind: GroupKind::Summarize(current),
            });
        }
        Ok(groups)
    }

    fn naive_preview(group: &[Commit]) -> String {
        group
            .iter()
            .map(|c| c.message.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    async fn llm_summarize(client: &Arc<dyn LlmClient>, group: &[Commit], registry: &ContentTypeRegistry, store: &Arc<dyn Store>) -> Result<String, TraceError> {
        let mut texts = Vec::with_capacity(group.len());
        for commit in group {
            let bytes = store.get_blob(commit.content_hash).await?;
            let value: serde_json::Value = serde_json::from_slice(&bytes)?;
            let payload = ContentPayload::from_canonical_value(&value, registry)?;
            texts.push(payload.as_message_text());
        }
        let prompt = format!(
            "Summarize the following conversation excerpt into a single concise passage \
             that preserves the decisions and facts a reader would need later:\n\n{}",
            texts.join("\n\n")
        );
        let response = client
            .chat(
                &[ChatMessage {
                    role: crate::content::Role::System,
                    text: prompt,
                }],
                &LLMConfig::default(),
            )
            .await?;
        Ok(response.text)
    }

    /// Apply a fully-resolved plan: replay `Keep` groups unchanged and emit
    /// one `Output` commit per `Summarize` group, re-parenting sequentially
    /// from `anchor`. Records one `compress` [`OperationEvent`] per
    /// summarized group (sources → the originals, result → the new commit).
    async fn apply(
        &self,
        engine: &CommitEngine,
        tract_id: Uuid,
        registry: &ContentTypeRegistry,
        anchor: Option<TraceHash>,
        groups: Vec<GroupPlan>,
        summaries: Vec<String>,
    ) -> Result<CompressionOutcome, TraceError> {
        let mut cursor = anchor;
        let mut replaced = Vec::new();
        let mut summary_commits = Vec::new();
        let mut summaries = summaries.into_iter();

        for group in groups {
            match group.kind {
                GroupKind::Keep(commit) => {
                    let bytes = self.store.get_blob(commit.content_hash).await?;
                    let value: serde_json::Value = serde_json::from_slice(&bytes)?;
                    let payload = ContentPayload::from_canonical_value(&value, registry)?;
                    let replayed = engine
                        .create_commit(
                            tract_id,
                            payload,
                            commit.operation,
                            cursor,
                            Some(commit.message.clone()),
                            commit.reply_to,
                            commit.edit_target,
                            commit.metadata.clone(),
                            commit.generation_config.clone(),
                        )
                        .await?;
                    self.store.insert(replayed.commit_hash, Priority::Pinned, None, Utc::now().naive_utc()).await?;
                    cursor = Some(replayed.commit_hash);
                }
                GroupKind::Summarize(members) => {
                    let summary = summaries
                        .next()
                        .ok_or_else(|| TraceError::CustomError("missing summary for compression group".to_string()))?;
                    let source_hashes: Vec<TraceHash> = members.iter().map(|c| c.commit_hash).collect();
                    let result = engine
                        .create_commit(
                            tract_id,
                            ContentPayload::Output { text: summary },
                            Operation::Append,
                            cursor,
                            Some(format!("compress: {} commits summarized", members.len())),
                            None,
                            None,
                            json!({"compressed_count": members.len()}),
                            None,
                        )
                        .await?;

                    let event = OperationEvent {
                        event_id: Uuid::now_v7(),
                        tract_id,
                        kind: OperationKind::Compress,
                        params: json!({"source_count": members.len()}),
                        created_at: Utc::now().naive_utc(),
                    };
                    self.store.save_event(&event).await?;
                    for source in &source_hashes {
                        self.store
                            .add_commit(&OperationCommitRef {
                                event_id: event.event_id,
                                role: "source".to_string(),
                                commit_hash: *source,
                            })
                            .await?;
                    }
                    self.store
                        .add_commit(&OperationCommitRef {
                            event_id: event.event_id,
                            role: "result".to_string(),
                            commit_hash: result.commit_hash,
                        })
                        .await?;

                    replaced.extend(source_hashes);
                    summary_commits.push(result.commit_hash);
                    cursor = Some(result.commit_hash);
                }
            }
        }

        let new_tip = cursor.ok_or_else(|| TraceError::InvalidRange("compression range was empty".to_string()))?;
        Ok(CompressionOutcome {
            new_tip,
            replaced,
            summary_commits,
        })
    }

    /// `Autonomy::Autonomous` or `Autonomy::Manual`: resolve groups and apply
    /// immediately. `manual_summary` is required (and used verbatim) when
    /// there is exactly one summarizable group and `llm_client` is `None`;
    /// a range spanning more than one summarizable group requires an LLM
    /// client, since a single caller-supplied string cannot stand in for
    /// more than one group.
    pub async fn compress(
        &self,
        engine: &CommitEngine,
        tract_id: Uuid,
        registry: &ContentTypeRegistry,
        start_exclusive: Option<TraceHash>,
        end: TraceHash,
        autonomy: Autonomy,
        llm_client: Option<&Arc<dyn LlmClient>>,
        manual_summary: Option<String>,
    ) -> Result<CompressionOutcome, TraceError> {
        if autonomy == Autonomy::Collaborative {
            return Err(TraceError::validation(
                "compress",
                "Autonomy::Collaborative must go through propose()/approve()",
            ));
        }

        let commits = self.range(start_exclusive, end).await?;
        let groups = self.plan_groups(commits).await?;

        let summarize_count = groups.iter().filter(|g| matches!(g.kind, GroupKind::Summarize(_))).count();
        let mut summaries = Vec::with_capacity(summarize_count);
        for group in &groups {
            if let GroupKind::Summarize(members) = &group.kind {
                let text = match autonomy {
                    Autonomy::Manual => {
                        if summarize_count != 1 {
                            return Err(TraceError::validation(
                                "compress",
                                "manual compression requires a single summarizable group per call",
                            ));
                        }
                        manual_summary
                            .clone()
                            .ok_or_else(|| TraceError::validation("compress", "manual compression requires a summary"))?
                    }
                    Autonomy::Autonomous => {
                        let client = llm_client.ok_or_else(|| {
                            TraceError::LLMConfigError("autonomous compression requires a configured llm_client".to_string())
                        })?;
                        Self::llm_summarize(client, members, registry, &self.store).await?
                    }
                    Autonomy::Collaborative => unreachable!("handled above"),
                };
                summaries.push(text);
            }
        }

        self.apply(engine, tract_id, registry, start_exclusive, groups, summaries).await
    }

    /// Stage a collaborative compression proposal. Returns a view the caller
    /// can present for approval; the plan itself is held until
    /// [`Self::approve`] or [`Self::reject`].
    pub async fn propose(
        &self,
        tract_id: Uuid,
        registry: &ContentTypeRegistry,
        start_exclusive: Option<TraceHash>,
        end: TraceHash,
    ) -> Result<PendingCompression, TraceError> {
        let commits = self.range(start_exclusive, end).await?;
        let source_commits: Vec<TraceHash> = commits.iter().map(|c| c.commit_hash).collect();
        let groups = self.plan_groups(commits).await?;

        let _ = registry;
        let mut previews = Vec::new();
        for group in &groups {
            if let GroupKind::Summarize(members) = &group.kind {
                previews.push(Self::naive_preview(members));
            }
        }

        let pending_id = Uuid::now_v7();
        let created_at = Utc::now().naive_utc();
        self.pending.insert(
            pending_id,
            PendingEntry {
                tract_id,
                anchor: start_exclusive,
                groups,
                proposed_summaries: previews.clone(),
                created_at,
            },
        );

        Ok(PendingCompression {
            pending_id,
            tract_id,
            anchor: start_exclusive,
            source_commits,
            proposed_summaries: previews,
            created_at,
        })
    }

    /// Apply a staged proposal. `summary_overrides`, if present, replaces the
    /// proposed summary text group-for-group (human review of the preview);
    /// its length must match the number of summarizable groups.
    pub async fn approve(
        &self,
        engine: &CommitEngine,
        registry: &ContentTypeRegistry,
        pending_id: Uuid,
        summary_overrides: Option<Vec<String>>,
    ) -> Result<CompressionOutcome, TraceError> {
        let (_, entry) = self
            .pending
            .remove(&pending_id)
            .ok_or_else(|| TraceError::not_found("pending_compression", pending_id))?;

        let summaries = match summary_overrides {
            Some(overrides) => {
                if overrides.len() != entry.proposed_summaries.len() {
                    return Err(TraceError::validation(
                        "approve",
                        "summary_overrides length must match the number of summarizable groups",
                    ));
                }
                overrides
            }
            None => entry.proposed_summaries,
        };

        self.apply(engine, entry.tract_id, registry, entry.anchor, entry.groups, summaries)
            .await
    }

    pub fn reject(&self, pending_id: Uuid) -> Result<(), TraceError> {
        self.pending
            .remove(&pending_id)
            .map(|_| ())
            .ok_or_else(|| TraceError::not_found("pending_compression", pending_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::Role;
    use crate::llm::client::{ChatResponse, Usage};
    use crate::storage::sqlite::SqlStore;
    use crate::tokens::{BpeTokenCounter, TokenCounter};
    use async_trait::async_trait;

    struct EchoClient;

    #[async_trait]
    impl LlmClient for EchoClient {
        async fn chat(&self, messages: &[ChatMessage], _config: &LLMConfig) -> Result<ChatResponse, TraceError> {
            Ok(ChatResponse {
                text: format!("summary of: {}", messages[0].text.lines().count()),
                model: "echo".to_string(),
                usage: Some(Usage {
                    prompt_tokens: 1,
                    completion_tokens: 1,
                }),
                raw: json!({}),
            })
        }
    }

    async fn harness() -> (CommitEngine, CompressionEngine, Uuid, ContentTypeRegistry) {
        let store = Arc::new(SqlStore::in_memory().await.expect("open"));
        let tokenizer: Arc<dyn TokenCounter> = Arc::new(BpeTokenCounter::o200k_base());
        let registry = ContentTypeRegistry::new();
        let engine = CommitEngine::new(store.clone(), tokenizer, registry.clone());
        let compress_engine = CompressionEngine::new(store);
        (engine, compress_engine, Uuid::from_u128(1), registry)
    }

    async fn append(engine: &CommitEngine, tract_id: Uuid, parent: Option<TraceHash>, text: &str) -> Commit {
        engine
            .create_commit(
                tract_id,
                ContentPayload::Output { text: text.to_string() },
                Operation::Append,
                parent,
                None,
                None,
                None,
                json!({}),
                None,
            )
            .await
            .expect("append")
    }

    #[tokio::test]
    async fn manual_compression_replaces_unpinned_run() {
        let (engine, compress_engine, tract_id, registry) = harness().await;
        let a = append(&engine, tract_id, None, "A").await;
        let b = append(&engine, tract_id, Some(a.commit_hash), "B").await;
        let c = append(&engine, tract_id, Some(b.commit_hash), "C").await;

        let outcome = compress_engine
            .compress(
                &engine,
                tract_id,
                &registry,
                None,
                c.commit_hash,
                Autonomy::Manual,
                None,
                Some("A, B, and C happened".to_string()),
            )
            .await
            .expect("compress");

        assert_eq!(outcome.replaced.len(), 3);
        assert_eq!(outcome.summary_commits.len(), 1);
        let new_commit = compress_engine.store.get(outcome.new_tip).await.expect("fetch");
        assert_eq!(new_commit.parent_hash, None);
    }

    #[tokio::test]
    async fn pinned_commit_survives_compression_as_new_node() {
        let (engine, compress_engine, tract_id, registry) = harness().await;
        let a = append(&engine, tract_id, None, "A").await;
        let b = engine
            .create_commit(
                tract_id,
                ContentPayload::Dialogue {
                    text: "pinned fact".to_string(),
                    role: Role::User,
                },
                Operation::Append,
                Some(a.commit_hash),
                None,
                None,
                None,
                json!({}),
                None,
            )
            .await
            .expect("append pinned");
        engine.annotate(b.commit_hash, Priority::Pinned, None).await.expect("pin");
        let c = append(&engine, tract_id, Some(b.commit_hash), "C").await;

        let outcome = compress_engine
            .compress(&engine, tract_id, &registry, None, c.commit_hash, Autonomy::Autonomous, Some(&(Arc::new(EchoClient) as Arc<dyn LlmClient>)), None)
            .await
            .expect("compress");

        assert_eq!(outcome.summary_commits.len(), 2);
        assert!(!outcome.replaced.contains(&b.commit_hash));
    }

    #[tokio::test]
    async fn collaborative_proposal_requires_approval() {
        let (engine, compress_engine, tract_id, registry) = harness().await;
        let a = append(&engine, tract_id, None, "A").await;
        let b = append(&engine, tract_id, Some(a.commit_hash), "B").await;

        let pending = compress_engine
            .propose(tract_id, &registry, None, b.commit_hash)
            .await
            .expect("propose");
        assert_eq!(pending.source_commits.len(), 2);
        assert_eq!(pending.proposed_summaries.len(), 1);

        let outcome = compress_engine
            .approve(&engine, &registry, pending.pending_id, Some(vec!["edited summary".to_string()]))
            .await
            .expect("approve");
        assert_eq!(outcome.replaced.len(), 2);

        let err = compress_engine.reject(pending.pending_id).unwrap_err();
        assert!(matches!(err, TraceError::NotFound(_)));
    }
}
