//! Garbage collection: reclaim commits (and their now-orphaned blobs) that
//! are no longer reachable from any branch tip or detached HEAD.
//!
//! Reachability is computed over `parent_hash` plus every row in
//! `commit_parents` (so merge commits' second parents count), deliberately
//! ignoring `reply_to` — a reply is a semantic annotation, not a structural
//! edge, and must never keep a commit alive on its own. A compression
//! event's result commit does not add reachability by itself either; only
//! refs (and the caller's detached heads) seed the walk.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use uuid::Uuid;

use crate::errors::TraceError;
use crate::hash::TraceHash;
use crate::model::event::OperationKind;
use crate::model::Ref;
use crate::storage::Store;

/// Tunables for one collection pass.
#[derive(Debug, Clone)]
pub struct GcConfig {
    /// Age, in days, an unreachable commit that is not a retained compression
    /// source must reach before it becomes a deletion candidate.
    pub orphan_retention_days: i64,
    /// Age, in days, an unreachable compression-event source commit must
    /// reach before it becomes a deletion candidate. `None` preserves such
    /// commits indefinitely regardless of age.
    pub archive_retention_days: Option<i64>,
    /// Scope reachability roots to a single branch's ref tip instead of
    /// every branch tip in the tract.
    pub branch: Option<String>,
    /// Compute the set of deletions without performing them.
    pub dry_run: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            orphan_retention_days: 7,
            archive_retention_days: None,
            branch: None,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GcResult {
    pub commits_removed: usize,
    pub blobs_removed: usize,
    pub tokens_freed: u64,
    pub source_commits_removed: usize,
    pub duration_seconds: f64,
}

pub struct GcEngine {
    store: Arc<dyn Store>,
}

impl GcEngine {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// BFS over `parent_hash` and `commit_parents` starting from every entry
    /// in `roots`. Cycles are impossible in a content-addressed DAG but the
    /// visited set guards against double-walking shared ancestors regardless.
    async fn reachable_from(&self, roots: Vec<TraceHash>) -> Result<HashSet<TraceHash>, TraceError> {
        let mut visited = HashSet::new();
        let mut queue = roots;
        while let Some(hash) = queue.pop() {
            if !visited.insert(hash) {
                continue;
            }
            for parent in self.store.get_parents(hash).await? {
                if !visited.contains(&parent) {
                    queue.push(parent);
                }
            }
        }
        Ok(visited)
    }

    async fn compression_sources(&self, tract_id: Uuid) -> Result<HashSet<TraceHash>, TraceError> {
        let mut sources = HashSet::new();
        for event in self.store.list_events(tract_id).await? {
            if event.kind != OperationKind::Compress {
                continue;
            }
            for link in self.store.get_commits_for_event(event.event_id).await? {
                if link.role == "source" {
                    sources.insert(link.commit_hash);
                }
            }
        }
        Ok(sources)
    }

    async fn roots_for(&self, tract_id: Uuid, branch: Option<&str>) -> Result<Vec<Ref>, TraceError> {
        let refs = self.store.list(tract_id, None).await?;
        match branch {
            Some(name) => {
                let ref_name = crate::model::refs::head_ref_name(name);
                Ok(refs.into_iter().filter(|r| r.ref_name == ref_name).collect())
            }
            None => Ok(refs),
        }
    }

    /// Run one collection pass over `tract_id`. `detached_heads` supplies any
    /// commit the tract currently points at outside of a named ref (e.g. a
    /// detached HEAD) so it is also treated as a root.
    pub async fn collect(
        &self,
        tract_id: Uuid,
        detached_heads: &[TraceHash],
        config: GcConfig,
    ) -> Result<GcResult, TraceError> {
        let started = Instant::now();

        let refs = self.roots_for(tract_id, config.branch.as_deref()).await?;
        let mut roots: Vec<TraceHash> = refs.iter().map(|r| r.commit_hash).collect();
        roots.extend(detached_heads.iter().copied());

        let reachable = self.reachable_from(roots).await?;

        let all_commits = self.store.get_by_tract(tract_id, None).await?;
        let archive_sources = self.compression_sources(tract_id).await?;
        let now = Utc::now().naive_utc();

        let mut to_delete = Vec::new();
        let mut source_removed = 0usize;
        for commit in &all_commits {
            if reachable.contains(&commit.commit_hash) {
                continue;
            }
            let age_days = (now - commit.created_at).num_days();
            let is_archive_source = archive_sources.contains(&commit.commit_hash);
            let prune = if is_archive_source {
                match config.archive_retention_days {
                    None => false,
                    Some(days) => age_days >= days,
                }
            } else {
                age_days >= config.orphan_retention_days
            };
            if prune {
                if is_archive_source {
                    source_removed += 1;
                }
                to_delete.push(commit.commit_hash);
            }
        }

        if config.dry_run {
            let tokens_freed: u64 = all_commits
                .iter()
                .filter(|c| to_delete.contains(&c.commit_hash))
                .map(|c| c.token_count)
                .sum();
            return Ok(GcResult {
                commits_removed: to_delete.len(),
                blobs_removed: 0,
                tokens_freed,
                source_commits_removed: source_removed,
                duration_seconds: started.elapsed().as_secs_f64(),
            });
        }

        let mut tokens_freed = 0u64;
        let content_hashes: Vec<TraceHash> = all_commits
            .iter()
            .filter(|c| to_delete.contains(&c.commit_hash))
            .map(|c| {
                tokens_freed += c.token_count;
                c.content_hash
            })
            .collect();

        for hash in &to_delete {
            self.store.delete(*hash).await?;
        }

        let mut blobs_removed = 0;
        for content_hash in content_hashes {
            if self.store.delete_if_orphaned(content_hash).await? {
                blobs_removed += 1;
            }
        }

        Ok(GcResult {
            commits_removed: to_delete.len(),
            blobs_removed,
            tokens_freed,
            source_commits_removed: source_removed,
            duration_seconds: started.elapsed().as_secs_f64(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::ContentPayload;
    use crate::engine::CommitEngine;
    use crate::model::commit::Operation;
    use crate::storage::sqlite::SqlStore;
    use crate::tokens::{BpeTokenCounter, TokenCounter};

    async fn harness() -> (CommitEngine, GcEngine, Arc<SqlStore>, Uuid) {
        let store = Arc::new(SqlStore::in_memory().await.expect("open"));
        let tokenizer: Arc<dyn TokenCounter> = Arc::new(BpeTokenCounter::o200k_base());
        let engine = CommitEngine::new(store.clone(), tokenizer, crate::content::ContentTypeRegistry::new());
        let gc = GcEngine::new(store.clone());
        (engine, gc, store, Uuid::from_u128(1))
    }

    fn aged(config: GcConfig) -> GcConfig {
        GcConfig {
            orphan_retention_days: 0,
            ..config
        }
    }

    #[tokio::test]
    async fn unreferenced_branch_is_collected() {
        let (engine, gc, store, tract_id) = harness().await;
        let root = engine
            .create_commit(
                tract_id,
                ContentPayload::Output { text: "root".to_string() },
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
        let kept = engine
            .create_commit(
                tract_id,
                ContentPayload::Output { text: "kept".to_string() },
                Operation::Append,
                Some(root.commit_hash),
                None,
                None,
                None,
                serde_json::json!({}),
                None,
            )
            .await
            .unwrap();
        let abandoned = engine
            .create_commit(
                tract_id,
                ContentPayload::Output { text: "abandoned".to_string() },
                Operation::Append,
                Some(root.commit_hash),
                None,
                None,
                None,
                serde_json::json!({}),
                None,
            )
            .await
            .unwrap();

        store.set(tract_id, "HEAD/main", kept.commit_hash).await.unwrap();

        let result = gc
            .collect(tract_id, &[], aged(GcConfig::default()))
            .await
            .unwrap();
        assert_eq!(result.commits_removed, 1);
        assert_eq!(result.blobs_removed, 1);

        let err = store.get(abandoned.commit_hash).await.unwrap_err();
        assert!(matches!(err, TraceError::NotFound(_)));
        assert!(store.get(root.commit_hash).await.is_ok());
        assert!(store.get(kept.commit_hash).await.is_ok());
    }

    #[tokio::test]
    async fn dry_run_reports_without_deleting() {
        let (engine, gc, store, tract_id) = harness().await;
        let root = engine
            .create_commit(
                tract_id,
                ContentPayload::Output { text: "root".to_string() },
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

        let result = gc
            .collect(
                tract_id,
                &[],
                aged(GcConfig {
                    dry_run: true,
                    ..GcConfig::default()
                }),
            )
            .await
            .unwrap();
        assert_eq!(result.commits_removed, 1);
        assert_eq!(result.blobs_removed, 0);
        assert!(store.get(root.commit_hash).await.is_ok());
    }

    #[tokio::test]
    async fn default_retention_keeps_fresh_orphans() {
        let (engine, gc, _store, tract_id) = harness().await;
        engine
            .create_commit(
                tract_id,
                ContentPayload::Output { text: "fresh orphan".to_string() },
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

        let result = gc.collect(tract_id, &[], GcConfig::default()).await.unwrap();
        assert_eq!(result.commits_removed, 0);
    }

    #[tokio::test]
    async fn archive_retention_none_preserves_compression_sources_indefinitely() {
        let (engine, gc, store, tract_id) = harness().await;
        let source = engine
            .create_commit(
                tract_id,
                ContentPayload::Output { text: "source".to_string() },
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
        let event = crate::model::OperationEvent {
            event_id: Uuid::new_v4(),
            tract_id,
            kind: OperationKind::Compress,
            params: serde_json::json!({}),
            created_at: Utc::now().naive_utc(),
        };
        store.save_event(&event).await.unwrap();
        store
            .add_commit(&crate::model::event::OperationCommitRef {
                event_id: event.event_id,
                role: "source".to_string(),
                commit_hash: source.commit_hash,
            })
            .await
            .unwrap();

        let result = gc
            .collect(tract_id, &[], aged(GcConfig::default()))
            .await
            .unwrap();
        assert_eq!(result.commits_removed, 0);
        assert!(store.get(source.commit_hash).await.is_ok());

        let result = gc
            .collect(
                tract_id,
                &[],
                aged(GcConfig {
                    archive_retention_days: Some(0),
                    ..GcConfig::default()
                }),
            )
            .await
            .unwrap();
        assert_eq!(result.commits_removed, 1);
        assert_eq!(result.source_commits_removed, 1);
        assert!(store.get(source.commit_hash).await.is_err());
    }
}
