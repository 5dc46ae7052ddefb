//! Branch merge, rebase, and cross-branch import.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use crate::content::{ContentPayload, ContentTypeRegistry};
use crate::engine::CommitEngine;
use crate::errors::{ConflictItem, TraceError};
use crate::hash::TraceHash;
use crate::llm::LlmClient;
use crate::model::commit::Operation;
use crate::model::event::OperationKind;
use crate::model::{Commit, OperationEvent};
use crate::storage::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    FastForward,
    Ours,
    Theirs,
    ThreeWay,
    LlmSemantic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    EditTarget,
    ReplyTo,
    PinnedRange,
}

impl ConflictKind {
    fn as_str(&self) -> &'static str {
        match self {
            ConflictKind::EditTarget => "edit_target",
            ConflictKind::ReplyTo => "reply_to",
            ConflictKind::PinnedRange => "pinned_range",
        }
    }
}

pub struct MergeOutcome {
    pub merge_commit: Commit,
    pub common_ancestor: Option<TraceHash>,
}

pub struct MergeEngine {
    store: Arc<dyn Store>,
}

impl MergeEngine {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Oldest-first first-parent chain from `tip` to the root, inclusive.
    async fn chain(&self, tip: TraceHash) -> Result<Vec<Commit>, TraceError> {
        let mut out = Vec::new();
        let mut cursor = Some(tip);
        while let Some(hash) = cursor {
            let commit = self.store.get(hash).await?;
            cursor = commit.parent_hash;
            out.push(commit);
        }
        out.reverse();
        Ok(out)
    }

    /// Lowest common ancestor of two first-parent chains: the most recent
    /// commit present in both.
    pub async fn common_ancestor(&self, ours: TraceHash, theirs: TraceHash) -> Result<Option<TraceHash>, TraceError> {
        let our_chain = self.chain(ours).await?;
        let their_chain = self.chain(theirs).await?;
        let our_set: HashSet<TraceHash> = our_chain.iter().map(|c| c.commit_hash).collect();
        for commit in their_chain.iter().rev() {
            if our_set.contains(&commit.commit_hash) {
                return Ok(Some(commit.commit_hash));
            }
        }
        Ok(None)
    }

    fn commits_since(chain: &[Commit], ancestor: Option<TraceHash>) -> Vec<Commit> {
        match ancestor {
            None => chain.to_vec(),
            Some(a) => {
                let idx = chain.iter().position(|c| c.commit_hash == a);
                match idx {
                    Some(i) => chain[i + 1..].to_vec(),
                    None => chain.to_vec(),
                }
            }
        }
    }

    /// Classify conflicts between the commits added on each side since the
    /// common ancestor.
    async fn classify_conflicts(
        &self,
        tract_id: Uuid,
        ours_added: &[Commit],
        theirs_added: &[Commit],
    ) -> Result<Vec<ConflictItem>, TraceError> {
        let mut conflicts = Vec::new();

        for our in ours_added {
            if our.operation != Operation::Edit {
                continue;
            }
            let Some(our_target) = our.edit_target else { continue };
            for their in theirs_added {
                if their.operation == Operation::Edit && their.edit_target == Some(our_target) {
                    conflicts.push(ConflictItem {
                        kind: ConflictKind::EditTarget.as_str().to_string(),
                        ours: our.commit_hash.to_hex(),
                        theirs: their.commit_hash.to_hex(),
                    });
                }
            }
        }

        for our in ours_added {
            let Some(our_reply) = our.reply_to else { continue };
            for their in theirs_added {
                if their.reply_to == Some(our_reply) {
                    conflicts.push(ConflictItem {
                        kind: ConflictKind::ReplyTo.as_str().to_string(),
                        ours: our.commit_hash.to_hex(),
                        theirs: their.commit_hash.to_hex(),
                    });
                }
            }
        }

        // Overlapping pinned ranges: both sides independently compressed a
        // commit that was a `source` of a `compress` event recorded on that
        // side since the ancestor.
        let our_sources = self.compressed_sources(tract_id, ours_added).await?;
        let their_sources = self.compressed_sources(tract_id, theirs_added).await?;
        for hash in our_sources.intersection(&their_sources) {
            conflicts.push(ConflictItem {
                kind: ConflictKind::PinnedRange.as_str().to_string(),
                ours: hash.to_hex(),
                theirs: hash.to_hex(),
            });
        }

        Ok(conflicts)
    }

    async fn compressed_sources(&self, tract_id: Uuid, added: &[Commit]) -> Result<HashSet<TraceHash>, TraceError> {
        let added_set: HashSet<TraceHash> = added.iter().map(|c| c.commit_hash).collect();
        let events = self.store.list_events(tract_id).await?;
        let mut sources = HashSet::new();
        for event in events {
            if event.kind != OperationKind::Compress {
                continue;
            }
            let links = self.store.get_commits_for_event(event.event_id).await?;
            let is_ours_event = links.iter().any(|l| l.role == "result" && added_set.contains(&l.commit_hash));
            if !is_ours_event {
                continue;
            }
            for link in links {
                if link.role == "source" {
                    sources.insert(link.commit_hash);
                }
            }
        }
        Ok(sources)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn merge(
        &self,
        engine: &CommitEngine,
        tract_id: Uuid,
        registry: &ContentTypeRegistry,
        ours_head: TraceHash,
        theirs_head: TraceHash,
        strategy: MergeStrategy,
        llm_client: Option<&Arc<dyn LlmClient>>,
    ) -> Result<MergeOutcome, TraceError> {
        let ancestor = self.common_ancestor(ours_head, theirs_head).await?;

        match strategy {
            MergeStrategy::FastForward => {
                if ancestor != Some(ours_head) {
                    return Err(TraceError::validation(
                        "merge",
                        "fast_forward requires current branch to be an ancestor of source",
                    ));
                }
                let theirs_commit = self.store.get(theirs_head).await?;
                Ok(MergeOutcome {
                    merge_commit: theirs_commit,
                    common_ancestor: ancestor,
                })
            }
            MergeStrategy::Ours => {
                let ours_commit = self.store.get(ours_head).await?;
                Ok(MergeOutcome {
                    merge_commit: ours_commit,
                    common_ancestor: ancestor,
                })
            }
            MergeStrategy::Theirs => {
                let merge_commit = self
                    .write_merge_commit(engine, tract_id, ours_head, theirs_head, "theirs")
                    .await?;
                Ok(MergeOutcome { merge_commit, common_ancestor: ancestor })
            }
            MergeStrategy::ThreeWay => {
                let our_chain = self.chain(ours_head).await?;
                let their_chain = self.chain(theirs_head).await?;
                let ours_added = Self::commits_since(&our_chain, ancestor);
                let theirs_added = Self::commits_since(&their_chain, ancestor);
                let conflicts = self.classify_conflicts(tract_id, &ours_added, &theirs_added).await?;
                if !conflicts.is_empty() {
                    return Err(TraceError::MergeConflict(conflicts));
                }
                let merge_commit = self
                    .write_merge_commit(engine, tract_id, ours_head, theirs_head, "three_way")
                    .await?;
                Ok(MergeOutcome { merge_commit, common_ancestor: ancestor })
            }
            MergeStrategy::LlmSemantic => {
                let Some(client) = llm_client else {
                    return Err(TraceError::LLMConfigError(
                        "llm_semantic merge requires a configured llm_client".to_string(),
                    ));
                };
                let our_chain = self.chain(ours_head).await?;
                let their_chain = self.chain(theirs_head).await?;
                let ours_added = Self::commits_since(&our_chain, ancestor);
                let theirs_added = Self::commits_since(&their_chain, ancestor);
                let transcript = render_sides(&ours_added, &theirs_added);
                let messages = vec![crate::llm::client::ChatMessage {
                    role: crate::content::Role::System,
                    text: format!(
                        "Reconcile these two divergent branches into one narrative:\n{transcript}"
                    ),
                }];
                let response = client.chat(&messages, &crate::llm::LLMConfig::default()).await?;
                let merge_commit = engine
                    .create_commit(
                        tract_id,
                        ContentPayload::Output { text: response.text },
                        Operation::Append,
                        Some(ours_head),
                        Some(format!("merge: llm_semantic reconciliation of {theirs_head}")),
                        None,
                        None,
                        json!({"merge": true, "strategy": "llm_semantic", "resolver": "llm"}),
                        None,
                    )
                    .await?;
                self.store.add_parent(merge_commit.commit_hash, theirs_head).await?;
                let _ = registry;
                Ok(MergeOutcome { merge_commit, common_ancestor: ancestor })
            }
        }
    }

    async fn write_merge_commit(
        &self,
        engine: &CommitEngine,
        tract_id: Uuid,
        ours_head: TraceHash,
        theirs_head: TraceHash,
        strategy_name: &str,
    ) -> Result<Commit, TraceError> {
        let merge_commit = engine
            .create_commit(
                tract_id,
                ContentPayload::Freeform {
                    fields: Default::default(),
                },
                Operation::Append,
                Some(ours_head),
                Some(format!("merge: {strategy_name} merge of {theirs_head} into {ours_head}")),
                None,
                None,
                json!({"merge": true, "strategy": strategy_name}),
                None,
            )
            .await?;
        self.store.add_parent(merge_commit.commit_hash, theirs_head).await?;
        Ok(merge_commit)
    }

    /// Replay commits on top of `onto`, each replayed as a new `Append`
    /// commit with its own hash; originals become unreachable.
    pub async fn rebase(
        &self,
        engine: &CommitEngine,
        tract_id: Uuid,
        onto: TraceHash,
        range_start_exclusive: TraceHash,
        range_end: TraceHash,
        registry: &ContentTypeRegistry,
    ) -> Result<TraceHash, TraceError> {
        let chain = self.chain(range_end).await?;
        let start_idx = chain
            .iter()
            .position(|c| c.commit_hash == range_start_exclusive)
            .ok_or_else(|| TraceError::InvalidRange("range start is not on the first-parent chain".to_string()))?;
        let to_replay = &chain[start_idx + 1..];

        let mut cursor = onto;
        for commit in to_replay {
            let bytes = self.store.get_blob(commit.content_hash).await?;
            let value: serde_json::Value = serde_json::from_slice(&bytes)?;
            let payload = ContentPayload::from_canonical_value(&value, registry)?;
            let replayed = engine
                .create_commit(
                    tract_id,
                    payload,
                    commit.operation,
                    Some(cursor),
                    Some(commit.message.clone()),
                    commit.reply_to,
                    commit.edit_target,
                    commit.metadata.clone(),
                    commit.generation_config.clone(),
                )
                .await?;
            cursor = replayed.commit_hash;
        }
        Ok(cursor)
    }

    /// Copy a foreign commit onto the current branch as a new commit,
    /// recording an `import` operation event (source → result).
    pub async fn import_commit(
        &self,
        engine: &CommitEngine,
        tract_id: Uuid,
        source_hash: TraceHash,
        current_head: Option<TraceHash>,
        registry: &ContentTypeRegistry,
    ) -> Result<Commit, TraceError> {
        let source = self.store.get(source_hash).await?;
        let bytes = self.store.get_blob(source.content_hash).await?;
        let value: serde_json::Value = serde_json::from_slice(&bytes)?;
        let payload = ContentPayload::from_canonical_value(&value, registry)?;

        let imported = engine
            .create_commit(
                tract_id,
                payload,
                Operation::Append,
                current_head,
                Some(format!("import: {source_hash}")),
                None,
                None,
                json!({"imported_from": source_hash.to_hex()}),
                source.generation_config.clone(),
            )
            .await?;

        let event = OperationEvent {
            event_id: Uuid::now_v7(),
            tract_id,
            kind: OperationKind::Import,
            params: json!({"source": source_hash.to_hex()}),
            created_at: Utc::now().naive_utc(),
        };
        self.store.save_event(&event).await?;
        self.store
            .add_commit(&crate::model::event::OperationCommitRef {
                event_id: event.event_id,
                role: "source".to_string(),
                commit_hash: source_hash,
            })
            .await?;
        self.store
            .add_commit(&crate::model::event::OperationCommitRef {
                event_id: event.event_id,
                role: "result".to_string(),
                commit_hash: imported.commit_hash,
            })
            .await?;
        Ok(imported)
    }
}

fn render_sides(ours: &[Commit], theirs: &[Commit]) -> String {
    let ours_list = ours.iter().map(|c| c.message.clone()).collect::<Vec<_>>().join("\n");
    let theirs_list = theirs.iter().map(|c| c.message.clone()).collect::<Vec<_>>().join("\n");
    format!("OURS:\n{ours_list}\n\nTHEIRS:\n{theirs_list}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::sqlite::SqlStore;
    use crate::tokens::{BpeTokenCounter, TokenCounter};

    async fn harness() -> (CommitEngine, MergeEngine, ContentTypeRegistry, Uuid) {
        let store = Arc::new(SqlStore::in_memory().await.expect("open"));
        let tokenizer: Arc<dyn TokenCounter> = Arc::new(BpeTokenCounter::o200k_base());
        let registry = ContentTypeRegistry::new();
        let engine = CommitEngine::new(store.clone(), tokenizer, registry.clone());
        let merge_engine = MergeEngine::new(store);
        (engine, merge_engine, registry, Uuid::from_u128(1))
    }

    async fn append(engine: &CommitEngine, tract_id: Uuid, parent: Option<TraceHash>, text: &str) -> Commit {
        engine
            .create_commit(
                tract_id,
                ContentPayload::Dialogue {
                    text: text.to_string(),
                    role: crate::content::Role::User,
                },
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
    async fn common_ancestor_finds_shared_history() {
        let (engine, merge_engine, _registry, tract_id) = harness().await;
        let root = append(&engine, tract_id, None, "root").await;
        let shared = append(&engine, tract_id, Some(root.commit_hash), "shared").await;
        let ours = append(&engine, tract_id, Some(shared.commit_hash), "ours").await;
        let theirs = append(&engine, tract_id, Some(shared.commit_hash), "theirs").await;

        let ancestor = merge_engine
            .common_ancestor(ours.commit_hash, theirs.commit_hash)
            .await
            .expect("ancestor");
        assert_eq!(ancestor, Some(shared.commit_hash));
    }

    #[tokio::test]
    async fn fast_forward_requires_ours_to_be_ancestor() {
        let (engine, merge_engine, registry, tract_id) = harness().await;
        let root = append(&engine, tract_id, None, "root").await;
        let ahead = append(&engine, tract_id, Some(root.commit_hash), "ahead").await;

        let outcome = merge_engine
            .merge(
                &engine,
                tract_id,
                &registry,
                root.commit_hash,
                ahead.commit_hash,
                MergeStrategy::FastForward,
                None,
            )
            .await
            .expect("fast forward");
        assert_eq!(outcome.merge_commit.commit_hash, ahead.commit_hash);

        let err = merge_engine
            .merge(
                &engine,
                tract_id,
                &registry,
                ahead.commit_hash,
                root.commit_hash,
                MergeStrategy::FastForward,
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TraceError::ValidationError(..)));
    }

    #[tokio::test]
    async fn three_way_merge_detects_competing_edits() {
        let (engine, merge_engine, registry, tract_id) = harness().await;
        let root = append(&engine, tract_id, None, "root").await;
        let shared = append(&engine, tract_id, Some(root.commit_hash), "shared target").await;

        let our_edit = engine
            .create_commit(
                tract_id,
                ContentPayload::Dialogue {
                    text: "shared target, edited by us".to_string(),
                    role: crate::content::Role::User,
                },
                Operation::Edit,
                Some(shared.commit_hash),
                None,
                None,
                Some(shared.commit_hash),
                json!({}),
                None,
            )
            .await
            .expect("our edit");
        let their_edit = engine
            .create_commit(
                tract_id,
                ContentPayload::Dialogue {
                    text: "shared target, edited by them".to_string(),
                    role: crate::content::Role::User,
                },
                Operation::Edit,
                Some(shared.commit_hash),
                None,
                None,
                Some(shared.commit_hash),
                json!({}),
                None,
            )
            .await
            .expect("their edit");

        let err = merge_engine
            .merge(
                &engine,
                tract_id,
                &registry,
                our_edit.commit_hash,
                their_edit.commit_hash,
                MergeStrategy::ThreeWay,
                None,
            )
            .await
            .unwrap_err();
        match err {
            TraceError::MergeConflict(conflicts) => {
                assert!(conflicts.iter().any(|c| c.kind == "edit_target"));
            }
            other => panic!("expected merge conflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn three_way_merge_succeeds_with_no_overlap() {
        let (engine, merge_engine, registry, tract_id) = harness().await;
        let root = append(&engine, tract_id, None, "root").await;
        let shared = append(&engine, tract_id, Some(root.commit_hash), "shared").await;
        let ours = append(&engine, tract_id, Some(shared.commit_hash), "our addition").await;
        let theirs = append(&engine, tract_id, Some(shared.commit_hash), "their addition").await;

        let outcome = merge_engine
            .merge(
                &engine,
                tract_id,
                &registry,
                ours.commit_hash,
                theirs.commit_hash,
                MergeStrategy::ThreeWay,
                None,
            )
            .await
            .expect("merge");
        let parents = merge_engine
            .store
            .get_parents(outcome.merge_commit.commit_hash)
            .await
            .expect("parents");
        assert!(parents.contains(&ours.commit_hash));
        assert!(parents.contains(&theirs.commit_hash));
    }

    #[tokio::test]
    async fn import_commit_records_operation_event() {
        let (engine, merge_engine, registry, tract_id) = harness().await;
        let other_tract = Uuid::from_u128(2);
        let foreign = append(&engine, other_tract, None, "foreign commit").await;

        let imported = merge_engine
            .import_commit(&engine, tract_id, foreign.commit_hash, None, &registry)
            .await
            .expect("import");
        assert_eq!(imported.tract_id, tract_id);
        assert_ne!(imported.commit_hash, foreign.commit_hash);

        let events = merge_engine.store.list_events(tract_id).await.expect("events");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, OperationKind::Import);
    }

    #[tokio::test]
    async fn rebase_replays_onto_new_base() {
        let (engine, merge_engine, registry, tract_id) = harness().await;
        let root = append(&engine, tract_id, None, "root").await;
        let feature_base = append(&engine, tract_id, Some(root.commit_hash), "feature base").await;
        let feature_1 = append(&engine, tract_id, Some(feature_base.commit_hash), "feature one").await;
        let feature_2 = append(&engine, tract_id, Some(feature_1.commit_hash), "feature two").await;
        let new_base = append(&engine, tract_id, Some(root.commit_hash), "new base work").await;

        let new_tip = merge_engine
            .rebase(
                &engine,
                tract_id,
                new_base.commit_hash,
                feature_base.commit_hash,
                feature_2.commit_hash,
                &registry,
            )
            .await
            .expect("rebase");
        assert_ne!(new_tip, feature_2.commit_hash);

        let replayed_tip = merge_engine.store.get(new_tip).await.expect("tip");
        assert_eq!(replayed_tip.message, feature_2.message);
        let replayed_first = merge_engine.store.get(replayed_tip.parent_hash.unwrap()).await.expect("first");
        assert_eq!(replayed_first.parent_hash, Some(new_base.commit_hash));
    }
}
