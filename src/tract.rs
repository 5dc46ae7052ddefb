//! `Tract`: the public synchronous facade over one tract's commit graph.
//!
//! `sea-orm`/`sqlx-sqlite` are async; to honor the "core operations are
//! synchronous, non-cancellable" contract at the public boundary, each
//! `Tract` owns a single-threaded `tokio::runtime::Runtime` and every public
//! method blocks on it. No `async fn` and no tokio type crosses this
//! boundary. This mirrors an "acquire on construction, release on every exit
//! path" discipline for scoped resources, generalized from a thread-local
//! guard to a whole owned runtime.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{NaiveDateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::compiler::{CompileOptions, CompileOutcome, ContextCompiler};
use crate::config::TractConfig;
use crate::content::ContentPayload;
use crate::engine::{BudgetDecision, CommitEngine};
use crate::errors::TraceError;
use crate::hash::TraceHash;
use crate::llm::client::ChatMessage;
use crate::llm::{LLMConfig, LlmClient};
use crate::model::commit::Operation;
use crate::model::event::CompileRecord;
use crate::model::refs::{head_ref_name, ORIG_HEAD};
use crate::model::{Annotation, Commit, Priority};
use crate::ops::{
    Autonomy, CompressionEngine, CompressionOutcome, GcConfig, GcEngine, GcResult, MergeEngine, MergeOutcome,
    MergeStrategy, PendingCompression,
};
use crate::storage::sqlite::SqlStore;
use crate::storage::{ConfigOp, ConfigPredicate, Store};
use crate::tokens::{BpeTokenCounter, TokenCounter};

pub const DEFAULT_BRANCH: &str = "main";

/// Where a tract's HEAD currently points: a live branch ref, or a detached
/// commit outside any ref ("detached HEAD").
#[derive(Debug, Clone)]
enum HeadState {
    Branch(String),
    Detached(TraceHash),
}

/// One result of a `generate()` call: the newly minted commit plus the
/// compile record captured before the LLM was invoked.
pub struct GenerateOutcome {
    pub commit: Commit,
    pub compile_record_id: Uuid,
}

pub struct Tract {
    rt: tokio::runtime::Runtime,
    store: Arc<dyn Store>,
    engine: CommitEngine,
    compiler: ContextCompiler,
    merge: MergeEngine,
    compress: CompressionEngine,
    gc: GcEngine,
    tract_id: Uuid,
    config: TractConfig,
    llm_client: Option<Arc<dyn LlmClient>>,
    head: std::sync::Mutex<HeadState>,
    policies_paused: AtomicBool,
}

impl Tract {
    fn new_runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("building a current-thread tokio runtime cannot fail absent resource exhaustion")
    }

    /// Dependency-injection constructor: plug in any `Store`/`TokenCounter`/
    /// `LlmClient` (e.g. an in-memory mock for tests) without going through
    /// `open`'s file/`in_memory` dispatch.
    pub fn from_components(
        store: Arc<dyn Store>,
        tract_id: Uuid,
        config: TractConfig,
        tokenizer: Arc<dyn TokenCounter>,
        llm_client: Option<Arc<dyn LlmClient>>,
    ) -> Self {
        let registry = config.registry.clone();
        Self {
            rt: Self::new_runtime(),
            store: store.clone(),
            engine: CommitEngine::new(store.clone(), tokenizer.clone(), registry),
            compiler: ContextCompiler::new(store.clone(), tokenizer),
            merge: MergeEngine::new(store.clone()),
            compress: CompressionEngine::new(store.clone()),
            gc: GcEngine::new(store),
            tract_id,
            config,
            llm_client,
            head: std::sync::Mutex::new(HeadState::Branch(DEFAULT_BRANCH.to_string())),
            policies_paused: AtomicBool::new(false),
        }
    }

    /// Open (or create) a tract backed by an on-disk SQLite database.
    pub fn open(path: &str, tract_id: Option<Uuid>, config: TractConfig) -> Result<Self, TraceError> {
        let rt = Self::new_runtime();
        let store: Arc<dyn Store> = Arc::new(rt.block_on(SqlStore::open(path))?);
        let tract_id = tract_id.unwrap_or_else(Uuid::now_v7);
        let tokenizer: Arc<dyn TokenCounter> = Arc::new(BpeTokenCounter::o200k_base());
        Ok(Self::from_components_with_runtime(rt, store, tract_id, config, tokenizer, None))
    }

    /// Open (or create) a tract backed by an in-memory SQLite database.
    pub fn open_in_memory(tract_id: Option<Uuid>, config: TractConfig) -> Result<Self, TraceError> {
        let rt = Self::new_runtime();
        let store: Arc<dyn Store> = Arc::new(rt.block_on(SqlStore::in_memory())?);
        let tract_id = tract_id.unwrap_or_else(Uuid::now_v7);
        let tokenizer: Arc<dyn TokenCounter> = Arc::new(BpeTokenCounter::o200k_base());
        Ok(Self::from_components_with_runtime(rt, store, tract_id, config, tokenizer, None))
    }

    fn from_components_with_runtime(
        rt: tokio::runtime::Runtime,
        store: Arc<dyn Store>,
        tract_id: Uuid,
        config: TractConfig,
        tokenizer: Arc<dyn TokenCounter>,
        llm_client: Option<Arc<dyn LlmClient>>,
    ) -> Self {
        let registry = config.registry.clone();
        Self {
            rt,
            store: store.clone(),
            engine: CommitEngine::new(store.clone(), tokenizer.clone(), registry),
            compiler: ContextCompiler::new(store.clone(), tokenizer),
            merge: MergeEngine::new(store.clone()),
            compress: CompressionEngine::new(store.clone()),
            gc: GcEngine::new(store),
            tract_id,
            config,
            llm_client,
            head: std::sync::Mutex::new(HeadState::Branch(DEFAULT_BRANCH.to_string())),
            policies_paused: AtomicBool::new(false),
        }
    }

    pub fn with_llm_client(mut self, client: Arc<dyn LlmClient>) -> Self {
        self.llm_client = Some(client);
        self
    }

    pub fn tract_id(&self) -> Uuid {
        self.tract_id
    }

    fn current_branch_ref(&self) -> Option<String> {
        match &*self.head.lock().expect("head mutex poisoned") {
            HeadState::Branch(name) => Some(head_ref_name(name)),
            HeadState::Detached(_) => None,
        }
    }

    /// Resolve the commit HEAD currently points at, regardless of whether
    /// it's a live branch or detached.
    pub fn head(&self) -> Result<Option<TraceHash>, TraceError> {
        match &*self.head.lock().expect("head mutex poisoned") {
            HeadState::Branch(name) => {
                self.rt.block_on(self.store.get(self.tract_id, &head_ref_name(name)))
            }
            HeadState::Detached(hash) => Ok(Some(*hash)),
        }
    }

    fn set_head_to(&self, commit_hash: TraceHash) -> Result<(), TraceError> {
        let mut guard = self.head.lock().expect("head mutex poisoned");
        match &*guard {
            HeadState::Branch(name) => {
                let ref_name = head_ref_name(name);
                drop(guard);
                self.rt.block_on(self.store.set(self.tract_id, &ref_name, commit_hash))
            }
            HeadState::Detached(_) => {
                *guard = HeadState::Detached(commit_hash);
                Ok(())
            }
        }
    }

    /// Create and append (or edit) a commit at the current HEAD, applying
    /// the configured token budget policy afterwards: if
    /// the resulting compiled context exceeds `max_tokens` under
    /// `BudgetMode::Reject` (or a callback that declines), the commit is
    /// rolled back and `TraceError::BudgetExceeded` is returned.
    #[allow(clippy::too_many_arguments)]
    pub fn commit(
        &self,
        content: ContentPayload,
        operation: Operation,
        message: Option<String>,
        reply_to: Option<TraceHash>,
        edit_target: Option<TraceHash>,
        metadata: Value,
        generation_config: Option<LLMConfig>,
    ) -> Result<Commit, TraceError> {
        let parent_hash = self.head()?;
        let generation_config = generation_config.or_else(|| self.config.default_generation_config.clone());
        let is_append = operation == Operation::Append;
        let commit = self.rt.block_on(self.engine.create_commit(
            self.tract_id,
            content,
            operation,
            parent_hash,
            message,
            reply_to,
            edit_target,
            metadata,
            generation_config,
        ))?;

        if is_append {
            self.rt.block_on(self.compiler.extend_for_append(&commit, &self.config.registry))?;
        } else {
            self.rt.block_on(self.compiler.invalidate());
        }

        self.set_head_to(commit.commit_hash)?;

        let outcome = self.compile(&CompileOptions::default())?;
        match self.config.token_budget.evaluate(outcome.context.token_count as usize) {
            BudgetDecision::Within | BudgetDecision::OverButKept => Ok(commit),
            BudgetDecision::Rollback => {
                self.rt.block_on(self.store.delete(commit.commit_hash))?;
                self.rt.block_on(self.store.delete_if_orphaned(commit.content_hash))?;
                if let Some(parent) = parent_hash {
                    self.set_head_to(parent)?;
                } else if let HeadState::Branch(name) = &*self.head.lock().expect("head mutex poisoned") {
                    self.rt.block_on(self.store.delete(self.tract_id, &head_ref_name(name)))?;
                }
                self.rt.block_on(self.compiler.invalidate());
                Err(TraceError::BudgetExceeded {
                    compiled: outcome.context.token_count as usize,
                    limit: self.config.token_budget.max_tokens.unwrap_or_default(),
                })
            }
        }
    }

    pub fn compile(&self, options: &CompileOptions) -> Result<CompileOutcome, TraceError> {
        let head = self.head()?;
        self.rt.block_on(self.compiler.compile(self.tract_id, head, &self.config.registry, options))
    }

    /// Time-travel compile as of a past instant, always bypassing the cache.
    pub fn compile_at(&self, at_time: NaiveDateTime) -> Result<CompileOutcome, TraceError> {
        self.compile(&CompileOptions {
            as_of: Some(at_time),
            ..Default::default()
        })
    }

    pub fn get_commit(&self, commit_hash: TraceHash) -> Result<Commit, TraceError> {
        self.rt.block_on(self.store.get(commit_hash))
    }

    pub fn annotate(&self, target_hash: TraceHash, priority: Priority, reason: Option<String>) -> Result<(), TraceError> {
        self.rt.block_on(self.engine.annotate(target_hash, priority, reason))?;
        self.rt.block_on(self.compiler.invalidate());
        Ok(())
    }

    pub fn get_annotation(&self, target_hash: TraceHash) -> Result<Option<Annotation>, TraceError> {
        self.rt.block_on(self.store.get_latest(target_hash))
    }

    /// Oldest-first first-parent chain from the current HEAD.
    pub fn log(&self) -> Result<Vec<Commit>, TraceError> {
        let Some(head) = self.head()? else {
            return Ok(Vec::new());
        };
        let mut chain = Vec::new();
        let mut cursor = Some(head);
        while let Some(hash) = cursor {
            let commit = self.rt.block_on(self.store.get(hash))?;
            cursor = commit.parent_hash;
            chain.push(commit);
        }
        chain.reverse();
        Ok(chain)
    }

    /// Run `f` against a deferred-write batch scope, flushing atomically if
    /// `f` returns `Ok`. Invalidates the compile cache on a successful flush
    /// since batched writes may include edits/annotations the incremental
    /// append path cannot account for.
    pub fn batch<F, T>(&self, f: F) -> Result<T, TraceError>
    where
        F: for<'a> FnOnce(&mut crate::engine::BatchScope<'a>, &'a CommitEngine) -> Result<T, TraceError>,
    {
        self.rt.block_on(async {
            let mut scope = self.engine.batch();
            let result = f(&mut scope, &self.engine)?;
            scope.commit().await?;
            self.compiler.invalidate().await;
            Ok(result)
        })
    }

    /// Create a new branch ref pointing at the current HEAD, without
    /// switching to it.
    pub fn branch(&self, name: &str) -> Result<(), TraceError> {
        let head = self.head()?.ok_or(TraceError::DetachedHead)?;
        self.rt.block_on(self.store.set(self.tract_id, &head_ref_name(name), head))
    }

    /// Switch HEAD to a branch (creating it at the current commit if it
    /// doesn't exist yet) or, if `target` doesn't name a known branch,
    /// detach HEAD at the commit hash it parses as.
    pub fn checkout(&self, target: &str) -> Result<(), TraceError> {
        let ref_name = head_ref_name(target);
        let existing = self.rt.block_on(self.store.get(self.tract_id, &ref_name))?;
        let mut head = self.head.lock().expect("head mutex poisoned");
        if existing.is_some() {
            *head = HeadState::Branch(target.to_string());
            return Ok(());
        }
        let hash: TraceHash = target.parse().map_err(TraceError::CustomError)?;
        self.rt.block_on(self.store.get(hash))?;
        *head = HeadState::Detached(hash);
        Ok(())
    }

    pub fn merge(&self, theirs_head: TraceHash, strategy: MergeStrategy) -> Result<MergeOutcome, TraceError> {
        let ours_head = self.head()?.ok_or(TraceError::DetachedHead)?;
        let outcome = self.rt.block_on(self.merge.merge(
            &self.engine,
            self.tract_id,
            &self.config.registry,
            ours_head,
            theirs_head,
            strategy,
            self.llm_client.as_ref(),
        ))?;
        self.set_head_to(outcome.merge_commit.commit_hash)?;
        self.rt.block_on(self.compiler.invalidate());
        Ok(outcome)
    }

    pub fn rebase(&self, onto: TraceHash, range_start_exclusive: TraceHash) -> Result<TraceHash, TraceError> {
        let head = self.head()?.ok_or(TraceError::DetachedHead)?;
        if let Some(name) = self.current_branch_ref() {
            self.rt.block_on(self.store.set(self.tract_id, &format!("{name}/{ORIG_HEAD}"), head))?;
        }
        let new_tip = self.rt.block_on(self.merge.rebase(
            &self.engine,
            self.tract_id,
            onto,
            range_start_exclusive,
            head,
            &self.config.registry,
        ))?;
        self.set_head_to(new_tip)?;
        self.rt.block_on(self.compiler.invalidate());
        Ok(new_tip)
    }

    pub fn import_commit(&self, source_hash: TraceHash) -> Result<Commit, TraceError> {
        let head = self.head()?;
        let imported = self.rt.block_on(self.merge.import_commit(
            &self.engine,
            self.tract_id,
            source_hash,
            head,
            &self.config.registry,
        ))?;
        self.set_head_to(imported.commit_hash)?;
        self.rt.block_on(self.compiler.extend_for_append(&imported, &self.config.registry))?;
        Ok(imported)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn compress(
        &self,
        start_exclusive: Option<TraceHash>,
        end: TraceHash,
        autonomy: Autonomy,
        manual_summary: Option<String>,
    ) -> Result<CompressionOutcome, TraceError> {
        let outcome = self.rt.block_on(self.compress.compress(
            &self.engine,
            self.tract_id,
            &self.config.registry,
            start_exclusive,
            end,
            autonomy,
            self.llm_client.as_ref(),
            manual_summary,
        ))?;
        if self.head()? == Some(end) {
            self.set_head_to(outcome.new_tip)?;
        }
        self.rt.block_on(self.compiler.invalidate());
        Ok(outcome)
    }

    pub fn propose_compression(&self, start_exclusive: Option<TraceHash>, end: TraceHash) -> Result<PendingCompression, TraceError> {
        self.rt.block_on(self.compress.propose(self.tract_id, &self.config.registry, start_exclusive, end))
    }

    pub fn approve_compression(
        &self,
        pending_id: Uuid,
        summary_overrides: Option<Vec<String>>,
    ) -> Result<CompressionOutcome, TraceError> {
        let outcome = self.rt.block_on(self.compress.approve(&self.engine, &self.config.registry, pending_id, summary_overrides))?;
        self.rt.block_on(self.compiler.invalidate());
        Ok(outcome)
    }

    pub fn reject_compression(&self, pending_id: Uuid) -> Result<(), TraceError> {
        self.compress.reject(pending_id)
    }

    pub fn gc(&self, detached_heads: &[TraceHash], config: GcConfig) -> Result<GcResult, TraceError> {
        self.rt.block_on(self.gc.collect(self.tract_id, detached_heads, config))
    }

    pub fn query_by_config(&self, field: &str, op: ConfigOp, value: Value) -> Result<Vec<Commit>, TraceError> {
        self.rt.block_on(self.store.get_by_config(
            self.tract_id,
            ConfigPredicate {
                field: field.to_string(),
                op,
                value,
            },
        ))
    }

    pub fn query_by_config_multi(&self, predicates: Vec<ConfigPredicate>) -> Result<Vec<Commit>, TraceError> {
        self.rt.block_on(self.store.get_by_config_multi(self.tract_id, &predicates))
    }

    pub fn compile_records(&self) -> Result<Vec<CompileRecord>, TraceError> {
        self.rt.block_on(self.store.list(self.tract_id))
    }

    pub fn compile_record_commits(&self, record_id: Uuid) -> Result<Vec<TraceHash>, TraceError> {
        self.rt.block_on(self.store.get_effective_commits(record_id))
    }

    pub fn record_usage(&self, commit_hash: TraceHash, prompt_tokens: u64, completion_tokens: u64) -> Result<(), TraceError> {
        let head = self.head()?;
        self.rt.block_on(self.engine.record_usage(commit_hash, head, prompt_tokens, completion_tokens))
    }

    pub fn register_content_type(
        &mut self,
        tag: impl Into<String>,
        validator: impl Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
    ) {
        self.config.register_content_type(tag, validator);
        let registry = self.config.registry.clone();
        self.engine = CommitEngine::new(self.store.clone(), self.engine.tokenizer().clone(), registry);
    }

    /// A hook point for a host-built policy engine to check before firing an
    /// auto-trigger ("policy-engine auto-triggers... excluded — the
    /// core must expose enough hooks for them to be built on top"). The core
    /// itself has no policies to pause.
    pub fn pause_all_policies(&self) {
        self.policies_paused.store(true, Ordering::SeqCst);
    }

    pub fn resume_all_policies(&self) {
        self.policies_paused.store(false, Ordering::SeqCst);
    }

    pub fn policies_paused(&self) -> bool {
        self.policies_paused.load(Ordering::SeqCst)
    }

    /// The LLM-invoking operation: records a `CompileRecord`
    /// against the about-to-be-sent HEAD and effective commits *before*
    /// calling the client, so intent survives a failed call; on success,
    /// appends the response as an `Output` commit whose `generation_config`
    /// reflects the provider's reported model, and records authoritative
    /// usage when the provider supplies it.
    pub fn generate(&self, input: Option<ContentPayload>, generation_config: Option<LLMConfig>) -> Result<GenerateOutcome, TraceError> {
        let client = self
            .llm_client
            .clone()
            .ok_or_else(|| TraceError::LLMConfigError("generate() requires a configured llm_client".to_string()))?;

        if let Some(input) = input {
            self.commit(input, Operation::Append, None, None, None, Value::Null, None)?;
        }

        let resolved_config = LLMConfig::resolve([
            generation_config.as_ref(),
            self.config.default_generation_config.as_ref(),
            None,
            None,
        ]);

        let outcome = self.compile(&CompileOptions::default())?;
        let head = outcome.context.head_hash;

        let record = CompileRecord {
            record_id: Uuid::now_v7(),
            tract_id: self.tract_id,
            head_hash: head,
            token_count: outcome.context.token_count,
            commit_count: outcome.context.commit_count,
            token_source: format!("tiktoken:{}", self.engine.tokenizer().encoding_name()),
            created_at: Utc::now().naive_utc(),
        };
        self.rt.block_on(self.store.save(&record, &outcome.context.effective_commit_hashes))?;

        let messages: Vec<ChatMessage> = outcome.context.to_chat_messages();
        let response = self.rt.block_on(client.chat(&messages, &resolved_config))?;

        let mut response_config = resolved_config;
        response_config.model = Some(response.model.clone());

        let commit = self.commit(
            ContentPayload::Output { text: response.text },
            Operation::Append,
            None,
            head,
            None,
            response.raw.clone(),
            Some(response_config),
        )?;

        if let Some(usage) = response.usage {
            self.record_usage(commit.commit_hash, usage.prompt_tokens, usage.completion_tokens)?;
        }

        Ok(GenerateOutcome {
            commit,
            compile_record_id: record.record_id,
        })
    }
}
