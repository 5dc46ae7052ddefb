//! `Session`: a registry owning one storage backend and many [`Tract`]s.
//!
//! A session groups tracts that belong to the same conversation or agent
//! run and records how they were spawned from one another, so a caller can
//! branch off an exploratory sub-conversation, fold it back into its parent
//! once finished, and reconstruct a combined timeline across all of them.

use std::sync::Arc;

use chrono::{NaiveDateTime, Utc};
use uuid::Uuid;

use crate::compiler::CompileOutcome;
use crate::config::TractConfig;
use crate::content::ContentPayload;
use crate::errors::TraceError;
use crate::hash::TraceHash;
use crate::llm::LlmClient;
use crate::model::commit::Operation;
use crate::model::event::{OperationCommitRef, OperationEvent, OperationKind};
use crate::model::{Commit, SpawnEdge, TractRecord};
use crate::ops::Autonomy;
use crate::storage::sqlite::SqlStore;
use crate::storage::Store;
use crate::tokens::{BpeTokenCounter, TokenCounter};
use crate::tract::Tract;

pub struct Session {
    rt: tokio::runtime::Runtime,
    store: Arc<dyn Store>,
    session_id: Uuid,
    config: TractConfig,
    tokenizer: Arc<dyn TokenCounter>,
    llm_client: Option<Arc<dyn LlmClient>>,
}

impl Session {
    fn new_runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("building a current-thread tokio runtime cannot fail absent resource exhaustion")
    }

    /// Dependency-injection constructor, mirroring [`Tract::from_components`].
    pub fn from_components(store: Arc<dyn Store>, session_id: Uuid, config: TractConfig) -> Result<Self, TraceError> {
        let rt = Self::new_runtime();
        if !rt.block_on(store.session_exists(session_id))? {
            rt.block_on(store.create_session(session_id, Utc::now().naive_utc()))?;
        }
        Ok(Self {
            rt,
            store,
            session_id,
            config,
            tokenizer: Arc::new(BpeTokenCounter::o200k_base()),
            llm_client: None,
        })
    }

    /// Open (or create) a session backed by an on-disk SQLite database.
    pub fn open(path: &str, session_id: Option<Uuid>, config: TractConfig) -> Result<Self, TraceError> {
        let rt = Self::new_runtime();
        let store: Arc<dyn Store> = Arc::new(rt.block_on(SqlStore::open(path))?);
        let session_id = session_id.unwrap_or_else(Uuid::now_v7);
        if !rt.block_on(store.session_exists(session_id))? {
            rt.block_on(store.create_session(session_id, Utc::now().naive_utc()))?;
        }
        Ok(Self {
            rt,
            store,
            session_id,
            config,
            tokenizer: Arc::new(BpeTokenCounter::o200k_base()),
            llm_client: None,
        })
    }

    /// Open (or create) a session backed by an in-memory SQLite database.
    pub fn open_in_memory(session_id: Option<Uuid>, config: TractConfig) -> Result<Self, TraceError> {
        let rt = Self::new_runtime();
        let store: Arc<dyn Store> = Arc::new(rt.block_on(SqlStore::in_memory())?);
        let session_id = session_id.unwrap_or_else(Uuid::now_v7);
        rt.block_on(store.create_session(session_id, Utc::now().naive_utc()))?;
        Ok(Self {
            rt,
            store,
            session_id,
            config,
            tokenizer: Arc::new(BpeTokenCounter::o200k_base()),
            llm_client: None,
        })
    }

    pub fn with_llm_client(mut self, client: Arc<dyn LlmClient>) -> Self {
        self.llm_client = Some(client);
        self
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    fn tract_from_record(&self, tract_id: Uuid) -> Tract {
        Tract::from_components(
            self.store.clone(),
            tract_id,
            self.config.clone(),
            self.tokenizer.clone(),
            self.llm_client.clone(),
        )
    }

    /// Allocate a fresh root tract and register it under this session.
    pub fn create_tract(&self, display_name: Option<&str>) -> Result<Tract, TraceError> {
        let tract_id = Uuid::now_v7();
        self.rt.block_on(self.store.register_tract(
            tract_id,
            self.session_id,
            display_name,
            Utc::now().naive_utc(),
        ))?;
        Ok(self.tract_from_record(tract_id))
    }

    /// Fork a new tract off `parent`'s current HEAD. The child's own commit
    /// graph starts empty — only the spawn edge records where it came from.
    pub fn spawn(&self, parent: &Tract, purpose: impl Into<String>) -> Result<Tract, TraceError> {
        let spawn_point = parent.head()?;
        let child_tract_id = Uuid::now_v7();
        let created_at = Utc::now().naive_utc();
        self.rt.block_on(
            self.store
                .register_tract(child_tract_id, self.session_id, None, created_at),
        )?;
        self.rt.block_on(self.store.record_spawn(&SpawnEdge {
            parent_tract_id: parent.tract_id(),
            child_tract_id,
            spawn_point_hash: spawn_point,
            purpose: Some(purpose.into()),
            created_at,
        }))?;
        Ok(self.tract_from_record(child_tract_id))
    }

    /// Summarize `child`'s entire history and append the summary to `parent`
    /// as a single commit referencing the child's final HEAD.
    ///
    /// `content` supplies the summary directly (required under
    /// [`Autonomy::Manual`] and [`Autonomy::Collaborative`], since neither
    /// autonomy mode calls an LLM here). Under [`Autonomy::Autonomous`] with
    /// no `content`, the session's LLM client summarizes the child's
    /// compiled context.
    pub fn collapse(
        &self,
        child: &Tract,
        parent: &Tract,
        content: Option<ContentPayload>,
        autonomy: Autonomy,
    ) -> Result<Commit, TraceError> {
        let outcome = child.compile(&crate::compiler::CompileOptions::default())?;
        let child_head = outcome.context.head_hash;

        let summary = match content {
            Some(payload) => payload,
            None => match autonomy {
                Autonomy::Manual | Autonomy::Collaborative => {
                    return Err(TraceError::validation(
                        "collapse",
                        "Manual and Collaborative autonomy require an explicit summary content",
                    ));
                }
                Autonomy::Autonomous => {
                    let client = self.llm_client.as_ref().ok_or_else(|| {
                        TraceError::LLMConfigError(
                            "collapse under Autonomous autonomy requires an LLM client when no content is given"
                                .to_string(),
                        )
                    })?;
                    let messages = outcome.context.to_chat_messages();
                    let config = self.config.default_generation_config.clone().unwrap_or_default();
                    let response = self.rt.block_on(client.chat(&messages, &config))?;
                    ContentPayload::Output { text: response.text }
                }
            },
        };

        let metadata = serde_json::json!({
            "collapsed_from_tract": child.tract_id().to_string(),
            "collapsed_from_head": child_head.map(|h| h.to_hex()),
        });

        let result = parent.commit(
            summary,
            Operation::Append,
            Some(format!("collapse: tract {}", child.tract_id())),
            None,
            None,
            metadata,
            None,
        )?;

        let event = OperationEvent {
            event_id: Uuid::now_v7(),
            tract_id: parent.tract_id(),
            kind: OperationKind::Reorganize,
            params: serde_json::json!({"collapsed_tract": child.tract_id().to_string()}),
            created_at: Utc::now().naive_utc(),
        };
        self.rt.block_on(self.store.save_event(&event))?;
        if let Some(hash) = child_head {
            self.rt.block_on(self.store.add_commit(&OperationCommitRef {
                event_id: event.event_id,
                role: "source".to_string(),
                commit_hash: hash,
            }))?;
        }
        self.rt.block_on(self.store.add_commit(&OperationCommitRef {
            event_id: event.event_id,
            role: "result".to_string(),
            commit_hash: result.commit_hash,
        }))?;

        Ok(result)
    }

    /// Every commit across every tract in this session, oldest first.
    pub fn timeline(&self) -> Result<Vec<Commit>, TraceError> {
        let tracts = self.rt.block_on(self.store.list_tracts(self.session_id))?;
        let mut commits = Vec::new();
        for tract in tracts {
            commits.extend(self.rt.block_on(self.store.get_by_tract(tract.tract_id, None))?);
        }
        commits.sort_by_key(|c| c.created_at);
        Ok(commits)
    }

    /// Substring match across every commit's serialized payload in this
    /// session, scanning raw blob bytes rather than a parsed payload so it
    /// works uniformly across every content type (built-in or custom).
    pub fn search(&self, term: &str) -> Result<Vec<Commit>, TraceError> {
        let commits = self.timeline()?;
        let mut matches = Vec::new();
        for commit in commits {
            let bytes = self.rt.block_on(self.store.get_blob(commit.content_hash))?;
            if String::from_utf8_lossy(&bytes).contains(term) {
                matches.push(commit);
            }
        }
        Ok(matches)
    }

    /// Time-travel compile of one tract in this session.
    pub fn compile_at(&self, tract_id: Uuid, at_time: NaiveDateTime) -> Result<CompileOutcome, TraceError> {
        self.tract_from_record(tract_id).compile_at(at_time)
    }

    /// The tract with the most recently created commit in this session
    /// (falling back to the most recently registered tract if none has any
    /// commits yet), for resuming a handoff.
    pub fn resume(&self) -> Result<Option<Tract>, TraceError> {
        let tracts = self.rt.block_on(self.store.list_tracts(self.session_id))?;
        if tracts.is_empty() {
            return Ok(None);
        }
        let mut best: Option<(Uuid, NaiveDateTime)> = None;
        for tract in &tracts {
            let last_activity = self
                .rt
                .block_on(self.store.get_by_tract(tract.tract_id, None))?
                .last()
                .map(|c| c.created_at)
                .unwrap_or(tract.created_at);
            if best.map(|(_, t)| last_activity > t).unwrap_or(true) {
                best = Some((tract.tract_id, last_activity));
            }
        }
        Ok(best.map(|(tract_id, _)| self.tract_from_record(tract_id)))
    }

    pub fn list_tracts(&self) -> Result<Vec<TractRecord>, TraceError> {
        self.rt.block_on(self.store.list_tracts(self.session_id))
    }

    pub fn get_spawn_edge(&self, child_tract_id: Uuid) -> Result<Option<SpawnEdge>, TraceError> {
        self.rt.block_on(self.store.get_spawn_edge(child_tract_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::Role;
    use crate::llm::client::ChatResponse;
    use async_trait::async_trait;

    fn session() -> Session {
        Session::open_in_memory(None, TractConfig::default()).expect("open session")
    }

    #[test]
    fn create_tract_registers_under_session() {
        let session = session();
        let tract = session.create_tract(Some("main")).expect("create tract");
        let tracts = session.list_tracts().expect("list");
        assert_eq!(tracts.len(), 1);
        assert_eq!(tracts[0].tract_id, tract.tract_id());
        assert_eq!(tracts[0].display_name.as_deref(), Some("main"));
    }

    #[test]
    fn spawn_records_edge_from_parents_head() {
        let session = session();
        let parent = session.create_tract(Some("root")).expect("root");
        parent
            .commit(
                ContentPayload::Instruction {
                    text: "stay focused".to_string(),
                },
                Operation::Append,
                None,
                None,
                None,
                serde_json::json!({}),
                None,
            )
            .expect("commit on parent");
        let parent_head = parent.head().expect("head").expect("some head");

        let child = session.spawn(&parent, "explore alternative approach").expect("spawn");
        let edge = session
            .get_spawn_edge(child.tract_id())
            .expect("edge lookup")
            .expect("edge exists");
        assert_eq!(edge.parent_tract_id, parent.tract_id());
        assert_eq!(edge.spawn_point_hash, Some(parent_head));
        assert!(child.head().expect("child head").is_none());
    }

    #[test]
    fn timeline_merges_commits_across_tracts_by_time() {
        let session = session();
        let a = session.create_tract(Some("a")).expect("a");
        let b = session.create_tract(Some("b")).expect("b");
        a.commit(
            ContentPayload::Output { text: "from a".to_string() },
            Operation::Append,
            None,
            None,
            None,
            serde_json::json!({}),
            None,
        )
        .expect("commit a");
        b.commit(
            ContentPayload::Output { text: "from b".to_string() },
            Operation::Append,
            None,
            None,
            None,
            serde_json::json!({}),
            None,
        )
        .expect("commit b");

        let timeline = session.timeline().expect("timeline");
        assert_eq!(timeline.len(), 2);
        assert!(timeline[0].created_at <= timeline[1].created_at);
    }

    #[test]
    fn search_finds_substring_across_session() {
        let session = session();
        let tract = session.create_tract(None).expect("tract");
        tract
            .commit(
                ContentPayload::Dialogue {
                    text: "the quick brown fox".to_string(),
                    role: Role::User,
                },
                Operation::Append,
                None,
                None,
                None,
                serde_json::json!({}),
                None,
            )
            .expect("commit");

        let found = session.search("brown fox").expect("search");
        assert_eq!(found.len(), 1);
        assert!(session.search("nonexistent term").expect("search").is_empty());
    }

    #[test]
    fn collapse_manual_requires_explicit_content() {
        let session = session();
        let child = session.create_tract(None).expect("child");
        let parent = session.create_tract(None).expect("parent");
        let err = session
            .collapse(&child, &parent, None, Autonomy::Manual)
            .unwrap_err();
        assert!(matches!(err, TraceError::ValidationError(..)));
    }

    #[test]
    fn collapse_appends_summary_referencing_child_head() {
        let session = session();
        let child = session.create_tract(None).expect("child");
        child
            .commit(
                ContentPayload::Output { text: "child result".to_string() },
                Operation::Append,
                None,
                None,
                None,
                serde_json::json!({}),
                None,
            )
            .expect("commit on child");
        let child_head = child.head().expect("head").expect("some");
        let parent = session.create_tract(None).expect("parent");

        let summary = session
            .collapse(
                &child,
                &parent,
                Some(ContentPayload::Output {
                    text: "folded summary".to_string(),
                }),
                Autonomy::Manual,
            )
            .expect("collapse");

        assert_eq!(
            summary.metadata["collapsed_from_head"],
            serde_json::json!(child_head.to_hex())
        );
        assert_eq!(parent.head().expect("parent head"), Some(summary.commit_hash));
    }

    struct EchoClient;

    #[async_trait]
    impl LlmClient for EchoClient {
        async fn chat(
            &self,
            messages: &[crate::llm::client::ChatMessage],
            _config: &crate::llm::LLMConfig,
        ) -> Result<ChatResponse, TraceError> {
            Ok(ChatResponse {
                text: format!("summary of {} messages", messages.len()),
                model: "echo".to_string(),
                usage: None,
                raw: serde_json::json!({}),
            })
        }
    }

    #[test]
    fn collapse_autonomous_without_content_uses_llm_client() {
        let session = session().with_llm_client(Arc::new(EchoClient));
        let child = session.create_tract(None).expect("child");
        child
            .commit(
                ContentPayload::Output { text: "child result".to_string() },
                Operation::Append,
                None,
                None,
                None,
                serde_json::json!({}),
                None,
            )
            .expect("commit on child");
        let parent = session.create_tract(None).expect("parent");

        let summary = session
            .collapse(&child, &parent, None, Autonomy::Autonomous)
            .expect("collapse");
        assert!(summary.message.starts_with("collapse:"));
    }
}
