//! Storage repositories: the abstract persistence seam between the engine
//! and a concrete backend. [`sqlite::SqlStore`] is the shipped realization.

pub mod sqlite;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use uuid::Uuid;

use crate::errors::TraceError;
use crate::hash::TraceHash;
use crate::model::event::{CompileRecord, OperationCommitRef};
use crate::model::{Annotation, Commit, OperationEvent, Priority, Ref, SpawnEdge, TractRecord};

/// Comparison operator for [`CommitRepository::get_by_config`] JSON-path
/// queries over `generation_config`/`metadata`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl ConfigOp {
    pub fn as_sql(&self) -> &'static str {
        match self {
            ConfigOp::Eq => "=",
            ConfigOp::Ne => "!=",
            ConfigOp::Gt => ">",
            ConfigOp::Gte => ">=",
            ConfigOp::Lt => "<",
            ConfigOp::Lte => "<=",
        }
    }
}

/// One predicate in an AND-composed `get_by_config_multi` query:
/// `json_extract(generation_config_json, '$.<field>') <op> <value>`.
#[derive(Debug, Clone)]
pub struct ConfigPredicate {
    pub field: String,
    pub op: ConfigOp,
    pub value: serde_json::Value,
}

#[async_trait]
pub trait BlobRepository: Send + Sync {
    /// Returns `true` if a new row was inserted, `false` if the content hash
    /// already existed (deduplication).
    async fn save_if_absent(&self, content_hash: TraceHash, bytes: &[u8]) -> Result<bool, TraceError>;
    async fn get_blob(&self, content_hash: TraceHash) -> Result<Vec<u8>, TraceError>;
    async fn delete_if_orphaned(&self, content_hash: TraceHash) -> Result<bool, TraceError>;
}

#[async_trait]
pub trait CommitRepository: Send + Sync {
    async fn create(&self, commit: &Commit) -> Result<(), TraceError>;
    async fn get(&self, commit_hash: TraceHash) -> Result<Commit, TraceError>;
    async fn get_by_tract(&self, tract_id: Uuid, limit: Option<u64>) -> Result<Vec<Commit>, TraceError>;
    async fn get_by_config(
        &self,
        tract_id: Uuid,
        predicate: ConfigPredicate,
    ) -> Result<Vec<Commit>, TraceError>;
    async fn get_by_config_multi(
        &self,
        tract_id: Uuid,
        predicates: &[ConfigPredicate],
    ) -> Result<Vec<Commit>, TraceError>;
    /// Children whose `parent_hash` or `edit_target` references `commit_hash`.
    async fn get_children(&self, commit_hash: TraceHash) -> Result<Vec<Commit>, TraceError>;
    /// Record an additional (non-first) parent in `commit_parents`, e.g. the
    /// second parent of a merge commit. The first parent is always recorded
    /// automatically by [`Self::create`] from `Commit::parent_hash`.
    async fn add_parent(&self, commit_hash: TraceHash, parent_hash: TraceHash) -> Result<(), TraceError>;
    /// All parents recorded in `commit_parents` for `commit_hash` (first
    /// parent included).
    async fn get_parents(&self, commit_hash: TraceHash) -> Result<Vec<TraceHash>, TraceError>;
    /// The one sanctioned post-hoc mutation: overwrite `token_count`/
    /// `token_source` after an authoritative provider usage report. Does not
    /// change `commit_hash` (it never participates in the identity tuple).
    async fn update_token_usage(
        &self,
        commit_hash: TraceHash,
        token_count: u64,
        token_source: &str,
    ) -> Result<(), TraceError>;
    /// Cascades: removes dependent annotations and `operation_commits` rows,
    /// nullifies children's `parent_hash`/`edit_target`, deletes refs pointing
    /// at the commit, then deletes the row itself.
    async fn delete(&self, commit_hash: TraceHash) -> Result<(), TraceError>;
}

#[async_trait]
pub trait RefRepository: Send + Sync {
    async fn set(&self, tract_id: Uuid, ref_name: &str, commit_hash: TraceHash) -> Result<(), TraceError>;
    async fn get(&self, tract_id: Uuid, ref_name: &str) -> Result<Option<TraceHash>, TraceError>;
    async fn list(&self, tract_id: Uuid, prefix: Option<&str>) -> Result<Vec<Ref>, TraceError>;
    async fn delete(&self, tract_id: Uuid, ref_name: &str) -> Result<(), TraceError>;
}

#[async_trait]
pub trait AnnotationRepository: Send + Sync {
    async fn insert(
        &self,
        target_hash: TraceHash,
        priority: Priority,
        reason: Option<&str>,
        created_at: NaiveDateTime,
    ) -> Result<(), TraceError>;
    async fn get_latest(&self, target_hash: TraceHash) -> Result<Option<Annotation>, TraceError>;
    /// One query returning the latest annotation per target, avoiding N+1
    /// lookups when the compiler resolves priorities for a whole chain.
    async fn batch_get_latest(
        &self,
        target_hashes: &[TraceHash],
    ) -> Result<std::collections::HashMap<TraceHash, Annotation>, TraceError>;
}

#[async_trait]
pub trait OperationEventRepository: Send + Sync {
    async fn save_event(&self, event: &OperationEvent) -> Result<(), TraceError>;
    async fn add_commit(&self, link: &OperationCommitRef) -> Result<(), TraceError>;
    async fn get_event(&self, event_id: Uuid) -> Result<OperationEvent, TraceError>;
    async fn get_commits_for_event(&self, event_id: Uuid) -> Result<Vec<OperationCommitRef>, TraceError>;
    async fn list_events(&self, tract_id: Uuid) -> Result<Vec<OperationEvent>, TraceError>;
}

#[async_trait]
pub trait CompileRecordRepository: Send + Sync {
    async fn save(&self, record: &CompileRecord, effective_commits: &[TraceHash]) -> Result<(), TraceError>;
    async fn list(&self, tract_id: Uuid) -> Result<Vec<CompileRecord>, TraceError>;
    async fn get_effective_commits(&self, record_id: Uuid) -> Result<Vec<TraceHash>, TraceError>;
}

/// The multi-tract session registry: which tracts belong to
/// which session, and how tracts were spawned from one another.
#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn create_session(&self, session_id: Uuid, created_at: NaiveDateTime) -> Result<(), TraceError>;
    async fn session_exists(&self, session_id: Uuid) -> Result<bool, TraceError>;
    async fn register_tract(
        &self,
        tract_id: Uuid,
        session_id: Uuid,
        display_name: Option<&str>,
        created_at: NaiveDateTime,
    ) -> Result<(), TraceError>;
    async fn get_tract(&self, tract_id: Uuid) -> Result<TractRecord, TraceError>;
    async fn list_tracts(&self, session_id: Uuid) -> Result<Vec<TractRecord>, TraceError>;
    async fn record_spawn(&self, edge: &SpawnEdge) -> Result<(), TraceError>;
    async fn get_spawn_edge(&self, child_tract_id: Uuid) -> Result<Option<SpawnEdge>, TraceError>;
    async fn list_children(&self, parent_tract_id: Uuid) -> Result<Vec<SpawnEdge>, TraceError>;
}

/// One deferred write recorded while a [`crate::engine::batch::BatchScope`]
/// is open.
#[derive(Debug, Clone)]
pub enum PendingWrite {
    Commit(Box<Commit>),
    Blob { content_hash: TraceHash, bytes: Vec<u8> },
    Annotation {
        target_hash: TraceHash,
        priority: Priority,
        reason: Option<String>,
        created_at: NaiveDateTime,
    },
    RefSet {
        tract_id: Uuid,
        ref_name: String,
        commit_hash: TraceHash,
    },
}

/// Umbrella trait implemented once by a concrete backend; repositories are
/// views over one connection rather than separate types, matching the
/// sibling async-SQL example this module is grounded on.
#[async_trait]
pub trait Store:
    BlobRepository
    + CommitRepository
    + RefRepository
    + AnnotationRepository
    + OperationEventRepository
    + CompileRecordRepository
    + SessionRepository
{
    /// Replay deferred writes atomically where the backend supports it.
    /// The default sequential replay gives no atomicity guarantee beyond
    /// what each individual repository call already provides; [`sqlite::SqlStore`]
    /// overrides this to wrap the whole batch in one database transaction.
    async fn execute_batch(&self, ops: Vec<PendingWrite>) -> Result<(), TraceError> {
        for op in ops {
            match op {
                PendingWrite::Commit(commit) => self.create(&commit).await?,
                PendingWrite::Blob { content_hash, bytes } => {
                    self.save_if_absent(content_hash, &bytes).await?;
                }
                PendingWrite::Annotation {
                    target_hash,
                    priority,
                    reason,
                    created_at,
                } => {
                    self.insert(target_hash, priority, reason.as_deref(), created_at).await?;
                }
                PendingWrite::RefSet {
                    tract_id,
                    ref_name,
                    commit_hash,
                } => {
                    self.set(tract_id, &ref_name, commit_hash).await?;
                }
            }
        }
        Ok(())
    }
}
