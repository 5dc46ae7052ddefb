//! The context compiler and its incremental snapshot cache.
//!
//! Grounded in a context-pipeline precursor that accumulates frames
//! incrementally rather than replaying a whole history on every read; the
//! snapshot cache here generalizes that append-biased shape to a full
//! first-parent chain walk with edit resolution and same-role aggregation,
//! invalidated wholesale on anything that is not a pure append.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::NaiveDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::content::{ContentPayload, ContentTypeRegistry, Role};
use crate::errors::TraceError;
use crate::hash::TraceHash;
use crate::llm::LLMConfig;
use crate::model::{Commit, Priority};
use crate::model::commit::Operation;
use crate::storage::Store;
use crate::tokens::TokenCounter;

/// One position's resolved content after edit-collapsing, before same-role
/// aggregation. `source_hash` is whichever commit's payload actually won —
/// the position's own hash if never edited, or the latest edit's hash
/// otherwise (see `DESIGN.md` for why this crate records
/// the *winning* hash rather than the position's).
#[derive(Debug, Clone)]
struct EffectiveMessage {
    position_hash: TraceHash,
    source_hash: TraceHash,
    role: Role,
    text: String,
    generation_config: Option<LLMConfig>,
}

/// One aggregated message in a compiled output: consecutive effective
/// messages with identical role, concatenated with a blank line.
#[derive(Debug, Clone)]
pub struct AggregatedMessage {
    pub role: Role,
    pub text: String,
    pub token_count: u64,
    /// Source hashes of every effective message folded into this one, in
    /// order.
    pub contributing: Vec<TraceHash>,
}

/// Frozen compile output. Copy-on-output: every field here is an
/// owned copy, so a caller mutating the returned value can never corrupt the
/// snapshot cache.
#[derive(Debug, Clone)]
pub struct CompiledContext {
    pub messages: Vec<AggregatedMessage>,
    pub token_count: u64,
    pub commit_count: u64,
    pub head_hash: Option<TraceHash>,
    /// One entry per surviving position, in compiled order — the hash
    /// actually recorded in a `CompileRecord`'s `compile_effective` relation.
    pub effective_commit_hashes: Vec<TraceHash>,
    pub generation_configs: Vec<Option<LLMConfig>>,
}

impl CompiledContext {
    pub fn empty() -> Self {
        Self {
            messages: Vec::new(),
            token_count: 0,
            commit_count: 0,
            head_hash: None,
            effective_commit_hashes: Vec::new(),
            generation_configs: Vec::new(),
        }
    }

    /// Flatten to the chat-message shape the LLM client contract expects.
    pub fn to_chat_messages(&self) -> Vec<crate::llm::client::ChatMessage> {
        self.messages
            .iter()
            .map(|m| crate::llm::client::ChatMessage {
                role: m.role,
                text: m.text.clone(),
            })
            .collect()
    }
}

/// Optional filters/modes for [`ContextCompiler::compile`]. Any of
/// `as_of`/`up_to`/`order` bypasses the incremental cache.
#[derive(Debug, Clone, Default)]
pub struct CompileOptions {
    pub as_of: Option<NaiveDateTime>,
    pub up_to: Option<TraceHash>,
    pub order: Option<Vec<TraceHash>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReorderWarningKind {
    EditBeforeTarget,
    ResponseChainBreak,
}

#[derive(Debug, Clone)]
pub struct ReorderWarning {
    pub kind: ReorderWarningKind,
    pub commit_hash: TraceHash,
    pub detail: String,
}

pub struct CompileOutcome {
    pub context: CompiledContext,
    pub warnings: Vec<ReorderWarning>,
}

/// The materialized snapshot kept between compiles. Keyed implicitly by
/// `head_hash`: a fresh `APPEND` at the tip extends it in O(1); anything
/// else invalidates it wholesale ("cache keyed by HEAD").
struct Snapshot {
    head_hash: TraceHash,
    effective: Vec<EffectiveMessage>,
    aggregated: Vec<AggregatedMessage>,
    token_count: u64,
}

/// Counts full chain walks performed since construction — a test-only hook
/// that lets the incremental-extension property be
/// observed without reaching into private state.
#[derive(Default)]
pub struct CompileStats {
    pub full_walks: std::sync::atomic::AtomicU64,
    pub incremental_extensions: std::sync::atomic::AtomicU64,
}

pub struct ContextCompiler {
    store: Arc<dyn Store>,
    tokenizer: Arc<dyn TokenCounter>,
    snapshot: Mutex<Option<Snapshot>>,
    pub stats: CompileStats,
}

impl ContextCompiler {
    pub fn new(store: Arc<dyn Store>, tokenizer: Arc<dyn TokenCounter>) -> Self {
        Self {
            store,
            tokenizer,
            snapshot: Mutex::new(None),
            stats: CompileStats::default(),
        }
    }

    /// Invalidate the cache unconditionally. Called by the engine after any
    /// `EDIT`, `annotate`, history rewrite, or batch-scope exit.
    pub async fn invalidate(&self) {
        *self.snapshot.lock().await = None;
    }

    /// Extend the cache in O(1) for a pure `APPEND` at the new tip, without
    /// re-walking the chain. The caller (the commit engine) only calls this
    /// when it knows the commit is a plain append with no side effects that
    /// would otherwise require invalidation.
    pub async fn extend_for_append(&self, commit: &Commit, registry: &ContentTypeRegistry) -> Result<(), TraceError> {
        debug_assert_eq!(commit.operation, Operation::Append);
        let mut guard = self.snapshot.lock().await;
        let Some(snapshot) = guard.as_mut() else {
            return Ok(());
        };
        if snapshot.head_hash != commit.parent_hash.unwrap_or(snapshot.head_hash) {
            *guard = None;
            return Ok(());
        }
        let bytes = self.store.get_blob(commit.content_hash).await?;
        let value: serde_json::Value = serde_json::from_slice(&bytes)?;
        let payload = ContentPayload::from_canonical_value(&value, registry)?;
        let role = payload.default_role();
        let text = payload.as_message_text();

        let effective = EffectiveMessage {
            position_hash: commit.commit_hash,
            source_hash: commit.commit_hash,
            role,
            text: text.clone(),
            generation_config: commit.generation_config.clone(),
        };
        snapshot.effective.push(effective);

        match snapshot.aggregated.last_mut() {
            Some(last) if last.role == role => {
                last.text.push_str("\n\n");
                last.text.push_str(&text);
                let old_tokens = last.token_count;
                last.token_count = self.tokenizer.count_text(&last.text) as u64;
                snapshot.token_count = snapshot.token_count - old_tokens + last.token_count;
                last.contributing.push(commit.commit_hash);
            }
            _ => {
                let token_count = self.tokenizer.count_text(&text) as u64;
                snapshot.token_count += token_count;
                snapshot.aggregated.push(AggregatedMessage {
                    role,
                    text,
                    token_count,
                    contributing: vec![commit.commit_hash],
                });
            }
        }
        snapshot.head_hash = commit.commit_hash;
        self.stats
            .incremental_extensions
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Ok(())
    }

    /// Walk the first-parent chain from `head` (or `up_to`) to the root,
    /// oldest first.
    async fn walk_chain(
        &self,
        head: TraceHash,
        up_to: Option<TraceHash>,
        as_of: Option<NaiveDateTime>,
    ) -> Result<Vec<Commit>, TraceError> {
        let mut chain = Vec::new();
        let mut cursor = Some(up_to.unwrap_or(head));
        while let Some(hash) = cursor {
            let commit = self.store.get(hash).await?;
            cursor = commit.parent_hash;
            if let Some(limit) = as_of {
                if commit.created_at > limit {
                    continue;
                }
            }
            chain.push(commit);
        }
        chain.reverse();
        Ok(chain)
    }

    /// Resolve edits and priority filtering over a raw chain, producing the
    /// ordered list of effective (surviving) messages. Shared by the normal
    /// compile path and `compile_at`-style time travel.
    async fn resolve_effective(&self, chain: &[Commit], registry: &ContentTypeRegistry) -> Result<Vec<EffectiveMessage>, TraceError> {
        // latest EDIT per edit_target, by created_at.
        let mut latest_edit: HashMap<TraceHash, &Commit> = HashMap::new();
        for commit in chain {
            if commit.operation == Operation::Edit {
                if let Some(target) = commit.edit_target {
                    match latest_edit.get(&target) {
                        Some(existing) if existing.created_at >= commit.created_at => {}
                        _ => {
                            latest_edit.insert(target, commit);
                        }
                    }
                }
            }
        }

        let positions: Vec<&Commit> = chain.iter().filter(|c| c.operation == Operation::Append).collect();
        let position_hashes: Vec<TraceHash> = positions.iter().map(|c| c.commit_hash).collect();
        let annotations = self.store.batch_get_latest(&position_hashes).await?;

        let mut out = Vec::with_capacity(positions.len());
        for position in positions {
            if let Some(annotation) = annotations.get(&position.commit_hash) {
                if annotation.priority == Priority::Skip {
                    continue;
                }
            }
            let winner = latest_edit.get(&position.commit_hash).copied().unwrap_or(position);
            let bytes = self.store.get_blob(winner.content_hash).await?;
            let value: serde_json::Value = serde_json::from_slice(&bytes)?;
            let payload = ContentPayload::from_canonical_value(&value, registry)?;
            out.push(EffectiveMessage {
                position_hash: position.commit_hash,
                source_hash: winner.commit_hash,
                role: payload.default_role(),
                text: payload.as_message_text(),
                generation_config: winner.generation_config.clone(),
            });
        }
        Ok(out)
    }

    fn aggregate(&self, effective: &[EffectiveMessage]) -> (Vec<AggregatedMessage>, u64) {
        let mut out: Vec<AggregatedMessage> = Vec::new();
        let mut total = 0u64;
        for msg in effective {
            match out.last_mut() {
                Some(last) if last.role == msg.role => {
                    last.text.push_str("\n\n");
                    last.text.push_str(&msg.text);
                    let old = last.token_count;
                    last.token_count = self.tokenizer.count_text(&last.text) as u64;
                    total = total - old + last.token_count;
                    last.contributing.push(msg.source_hash);
                }
                _ => {
                    let token_count = self.tokenizer.count_text(&msg.text) as u64;
                    total += token_count;
                    out.push(AggregatedMessage {
                        role: msg.role,
                        text: msg.text.clone(),
                        token_count,
                        contributing: vec![msg.source_hash],
                    });
                }
            }
        }
        (out, total)
    }

    /// Full compile entry point.
    pub async fn compile(
        &self,
        tract_id: Uuid,
        head: Option<TraceHash>,
        registry: &ContentTypeRegistry,
        options: &CompileOptions,
    ) -> Result<CompileOutcome, TraceError> {
        let _ = tract_id;
        let Some(head) = head else {
            return Ok(CompileOutcome {
                context: CompiledContext::empty(),
                warnings: Vec::new(),
            });
        };

        let bypasses_cache = options.as_of.is_some() || options.up_to.is_some() || options.order.is_some();

        if !bypasses_cache {
            let guard = self.snapshot.lock().await;
            if let Some(snapshot) = guard.as_ref() {
                if snapshot.head_hash == head {
                    let context = CompiledContext {
                        messages: snapshot.aggregated.clone(),
                        token_count: snapshot.token_count,
                        commit_count: snapshot.effective.len() as u64,
                        head_hash: Some(head),
                        effective_commit_hashes: snapshot.effective.iter().map(|m| m.source_hash).collect(),
                        generation_configs: snapshot.effective.iter().map(|m| m.generation_config.clone()).collect(),
                    };
                    return Ok(CompileOutcome {
                        context,
                        warnings: Vec::new(),
                    });
                }
            }
        }

        let chain = self.walk_chain(head, options.up_to, options.as_of).await?;

        if let Some(order) = &options.order {
            return self.compile_with_order(&chain, registry, order).await;
        }

        let effective = self.resolve_effective(&chain, registry).await?;
        let (aggregated, token_count) = self.aggregate(&effective);

        self.stats.full_walks.fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        let context = CompiledContext {
            messages: aggregated.clone(),
            token_count,
            commit_count: effective.len() as u64,
            head_hash: Some(head),
            effective_commit_hashes: effective.iter().map(|m| m.source_hash).collect(),
            generation_configs: effective.iter().map(|m| m.generation_config.clone()).collect(),
        };

        if !bypasses_cache {
            let mut guard = self.snapshot.lock().await;
            *guard = Some(Snapshot {
                head_hash: head,
                effective,
                aggregated,
                token_count,
            });
        }

        Ok(CompileOutcome {
            context,
            warnings: Vec::new(),
        })
    }

    /// `compile(order=...)`: operates over the *raw* chain
    /// (`APPEND` and `EDIT` commits alike, each contributing its own
    /// message from its own payload) rather than the edit-collapsed view —
    /// see `DESIGN.md` for why: the seed scenario addresses an `EDIT`
    /// commit directly in `order`, which only makes sense if edits are
    /// independently addressable nodes in this mode.
    async fn compile_with_order(
        &self,
        chain: &[Commit],
        registry: &ContentTypeRegistry,
        order: &[TraceHash],
    ) -> Result<CompileOutcome, TraceError> {
        let index_of: HashMap<TraceHash, usize> = chain.iter().enumerate().map(|(i, c)| (c.commit_hash, i)).collect();

        let mut ordered_indices: Vec<usize> = Vec::with_capacity(chain.len());
        let mut seen = vec![false; chain.len()];
        for hash in order {
            if let Some(&idx) = index_of.get(hash) {
                if !seen[idx] {
                    ordered_indices.push(idx);
                    seen[idx] = true;
                }
            }
        }
        for (idx, was_seen) in seen.iter().enumerate() {
            if !was_seen {
                ordered_indices.push(idx);
            }
        }

        let position_of: HashMap<TraceHash, usize> =
            ordered_indices.iter().enumerate().map(|(pos, &idx)| (chain[idx].commit_hash, pos)).collect();

        let mut warnings = Vec::new();
        for commit in chain {
            if commit.operation == Operation::Edit {
                if let Some(target) = commit.edit_target {
                    match (position_of.get(&commit.commit_hash), position_of.get(&target)) {
                        (Some(&edit_pos), Some(&target_pos)) if edit_pos < target_pos => {
                            warnings.push(ReorderWarning {
                                kind: ReorderWarningKind::EditBeforeTarget,
                                commit_hash: commit.commit_hash,
                                detail: format!("edit {} precedes its target {}", commit.commit_hash, target),
                            });
                        }
                        (Some(_), None) => {
                            warnings.push(ReorderWarning {
                                kind: ReorderWarningKind::ResponseChainBreak,
                                commit_hash: commit.commit_hash,
                                detail: format!("edit_target {target} is not present in the reordered set"),
                            });
                        }
                        _ => {}
                    }
                }
            }
        }

        let mut effective = Vec::with_capacity(chain.len());
        for &idx in &ordered_indices {
            let commit = &chain[idx];
            let bytes = self.store.get_blob(commit.content_hash).await?;
            let value: serde_json::Value = serde_json::from_slice(&bytes)?;
            let payload = ContentPayload::from_canonical_value(&value, registry)?;
            effective.push(EffectiveMessage {
                position_hash: commit.commit_hash,
                source_hash: commit.commit_hash,
                role: payload.default_role(),
                text: payload.as_message_text(),
                generation_config: commit.generation_config.clone(),
            });
        }
        let (aggregated, token_count) = self.aggregate(&effective);

        let context = CompiledContext {
            messages: aggregated,
            token_count,
            commit_count: effective.len() as u64,
            head_hash: chain.last().map(|c| c.commit_hash),
            effective_commit_hashes: effective.iter().map(|m| m.source_hash).collect(),
            generation_configs: effective.iter().map(|m| m.generation_config.clone()).collect(),
        };

        Ok(CompileOutcome { context, warnings })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::Role as R;
    use crate::engine::CommitEngine;
    use crate::model::commit::Operation;
    use crate::storage::sqlite::SqlStore;
    use crate::tokens::BpeTokenCounter;
    use std::sync::atomic::Ordering;

    async fn harness() -> (CommitEngine, ContextCompiler, Arc<SqlStore>) {
        let store = Arc::new(SqlStore::in_memory().await.expect("open"));
        let tokenizer: Arc<dyn TokenCounter> = Arc::new(BpeTokenCounter::o200k_base());
        let engine = CommitEngine::new(store.clone(), tokenizer.clone(), ContentTypeRegistry::new());
        let compiler = ContextCompiler::new(store.clone(), tokenizer);
        (engine, compiler, store)
    }

    #[tokio::test]
    async fn basic_compile_orders_messages_by_role() {
        let (engine, compiler, _store) = harness().await;
        let tract_id = Uuid::from_u128(1);
        let registry = ContentTypeRegistry::new();

        let c1 = engine
            .create_commit(
                tract_id,
                ContentPayload::Instruction { text: "be helpful".into() },
                Operation::Append,
                None,
                None,
                None,
                None,
                serde_json::json!({}),
                None,
            )
            .await
            .unwrap();
        let c2 = engine
            .create_commit(
                tract_id,
                ContentPayload::Dialogue { text: "hi".into(), role: R::User },
                Operation::Append,
                Some(c1.commit_hash),
                None,
                None,
                None,
                serde_json::json!({}),
                None,
            )
            .await
            .unwrap();
        let c3 = engine
            .create_commit(
                tract_id,
                ContentPayload::Dialogue { text: "hello".into(), role: R::Assistant },
                Operation::Append,
                Some(c2.commit_hash),
                None,
                None,
                None,
                serde_json::json!({}),
                None,
            )
            .await
            .unwrap();

        let outcome = compiler
            .compile(tract_id, Some(c3.commit_hash), &registry, &CompileOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome.context.commit_count, 3);
        assert_eq!(outcome.context.messages.len(), 3);
        assert_eq!(outcome.context.messages[0].role, R::System);
        assert_eq!(outcome.context.messages[1].role, R::User);
        assert_eq!(outcome.context.messages[1].text, "hi");
        assert_eq!(outcome.context.messages[2].role, R::Assistant);
        assert!(outcome.context.token_count > 0);
    }

    #[tokio::test]
    async fn edit_replaces_effective_content_latest_wins() {
        let (engine, compiler, _store) = harness().await;
        let tract_id = Uuid::from_u128(2);
        let registry = ContentTypeRegistry::new();

        let user = engine
            .create_commit(
                tract_id,
                ContentPayload::Dialogue { text: "hi".into(), role: R::User },
                Operation::Append,
                None,
                None,
                None,
                None,
                serde_json::json!({}),
                None,
            )
            .await
            .unwrap();

        let edit1 = engine
            .create_commit(
                tract_id,
                ContentPayload::Dialogue { text: "hi there".into(), role: R::User },
                Operation::Edit,
                Some(user.commit_hash),
                None,
                None,
                Some(user.commit_hash),
                serde_json::json!({}),
                None,
            )
            .await
            .unwrap();

        let outcome = compiler
            .compile(tract_id, Some(edit1.commit_hash), &registry, &CompileOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome.context.commit_count, 1);
        assert_eq!(outcome.context.messages[0].text, "hi there");

        // a further edit wins over the first
        let edit2 = engine
            .create_commit(
                tract_id,
                ContentPayload::Dialogue { text: "hey".into(), role: R::User },
                Operation::Edit,
                Some(edit1.commit_hash),
                None,
                None,
                Some(user.commit_hash),
                serde_json::json!({}),
                None,
            )
            .await
            .unwrap();

        let outcome2 = compiler
            .compile(tract_id, Some(edit2.commit_hash), &registry, &CompileOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome2.context.commit_count, 1);
        assert_eq!(outcome2.context.messages[0].text, "hey");
    }

    #[tokio::test]
    async fn skip_excludes_and_restoring_normal_brings_it_back() {
        let (engine, compiler, store) = harness().await;
        let tract_id = Uuid::from_u128(3);
        let registry = ContentTypeRegistry::new();

        let a = engine
            .create_commit(
                tract_id,
                ContentPayload::Output { text: "A".into() },
                Operation::Append,
                None,
                None,
                None,
                None,
                serde_json::json!({}),
                None,
            )
            .await
            .unwrap();
        let b = engine
            .create_commit(
                tract_id,
                ContentPayload::Output { text: "B".into() },
                Operation::Append,
                Some(a.commit_hash),
                None,
                None,
                None,
                serde_json::json!({}),
                None,
            )
            .await
            .unwrap();
        let c = engine
            .create_commit(
                tract_id,
                ContentPayload::Output { text: "C".into() },
                Operation::Append,
                Some(b.commit_hash),
                None,
                None,
                None,
                serde_json::json!({}),
                None,
            )
            .await
            .unwrap();

        engine.annotate(b.commit_hash, Priority::Skip, None).await.unwrap();
        compiler.invalidate().await;
        let outcome = compiler
            .compile(tract_id, Some(c.commit_hash), &registry, &CompileOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome.context.messages.iter().map(|m| m.text.clone()).collect::<Vec<_>>(), vec!["A\n\nC"]);

        engine.annotate(b.commit_hash, Priority::Normal, None).await.unwrap();
        compiler.invalidate().await;
        let restored = compiler
            .compile(tract_id, Some(c.commit_hash), &registry, &CompileOptions::default())
            .await
            .unwrap();
        assert_eq!(
            restored.context.messages.iter().map(|m| m.text.clone()).collect::<Vec<_>>(),
            vec!["A\n\nB\n\nC"]
        );
        let _ = store;
    }

    #[tokio::test]
    async fn incremental_append_matches_fresh_compile() {
        let (engine, compiler, _store) = harness().await;
        let tract_id = Uuid::from_u128(4);
        let registry = ContentTypeRegistry::new();

        let mut head: Option<TraceHash> = None;
        for i in 0..50 {
            let commit = engine
                .create_commit(
                    tract_id,
                    ContentPayload::Output { text: format!("msg {i}") },
                    Operation::Append,
                    head,
                    None,
                    None,
                    None,
                    serde_json::json!({}),
                    None,
                )
                .await
                .unwrap();
            compiler.extend_for_append(&commit, &registry).await.unwrap();
            head = Some(commit.commit_hash);
        }

        let incremental = compiler
            .compile(tract_id, head, &registry, &CompileOptions::default())
            .await
            .unwrap();
        compiler.invalidate().await;
        let fresh = compiler
            .compile(tract_id, head, &registry, &CompileOptions::default())
            .await
            .unwrap();
        assert_eq!(incremental.context.token_count, fresh.context.token_count);
        assert_eq!(
            incremental.context.messages.iter().map(|m| m.text.clone()).collect::<Vec<_>>(),
            fresh.context.messages.iter().map(|m| m.text.clone()).collect::<Vec<_>>()
        );
        assert!(compiler.stats.incremental_extensions.load(Ordering::Relaxed) >= 50);
    }

    #[tokio::test]
    async fn reorder_reports_edit_before_target_warning() {
        let (engine, compiler, _store) = harness().await;
        let tract_id = Uuid::from_u128(5);
        let registry = ContentTypeRegistry::new();

        let a = engine
            .create_commit(
                tract_id,
                ContentPayload::Output { text: "A".into() },
                Operation::Append,
                None,
                None,
                None,
                None,
                serde_json::json!({}),
                None,
            )
            .await
            .unwrap();
        let b = engine
            .create_commit(
                tract_id,
                ContentPayload::Output { text: "B".into() },
                Operation::Append,
                Some(a.commit_hash),
                None,
                None,
                None,
                serde_json::json!({}),
                None,
            )
            .await
            .unwrap();
        let e = engine
            .create_commit(
                tract_id,
                ContentPayload::Output { text: "A'".into() },
                Operation::Edit,
                Some(b.commit_hash),
                None,
                None,
                Some(a.commit_hash),
                serde_json::json!({}),
                None,
            )
            .await
            .unwrap();

        let bad = compiler
            .compile(
                tract_id,
                Some(e.commit_hash),
                &registry,
                &CompileOptions {
                    order: Some(vec![e.commit_hash, a.commit_hash, b.commit_hash]),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(bad.warnings.iter().any(|w| w.kind == ReorderWarningKind::EditBeforeTarget));

        let good = compiler
            .compile(
                tract_id,
                Some(e.commit_hash),
                &registry,
                &CompileOptions {
                    order: Some(vec![a.commit_hash, e.commit_hash, b.commit_hash]),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(good.warnings.is_empty());
    }
}
