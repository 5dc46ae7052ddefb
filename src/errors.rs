//! Error types for the contextvcs crate.
//!
//! This module defines a unified error enumeration used across the content
//! model, storage repositories, the commit engine, the compiler, and the
//! branch/merge/compression/gc operations. It integrates with `thiserror` to
//! provide rich `Display` implementations and error source chaining.
//!
//! Notes:
//! - Each variant carries contextual details via its message payload.
//! - Storage-layer integrity failures surface through `#[from]` conversions
//!   rather than being swallowed.

use thiserror::Error;

/// A single classified merge conflict, part of [`TraceError::MergeConflict`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictItem {
    /// What kind of conflict this is (e.g. `"edit_target"`, `"reply_to"`, `"pinned_range"`).
    pub kind: String,
    /// Commit hash on the current branch involved in the conflict.
    pub ours: String,
    /// Commit hash on the source branch involved in the conflict.
    pub theirs: String,
}

#[derive(Error, Debug)]
/// Unified error enumeration for the contextvcs library.
pub enum TraceError {
    /// Payload failed structural validation for its content type.
    #[error("validation failed for content type `{0}`: {1}")]
    ValidationError(String, String),

    /// A custom content type tag was used without being registered.
    #[error("unknown content type `{0}`")]
    UnknownContentType(String),

    /// A referenced commit, ref, blob, annotation, or event does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A commit would push the compiled context over its configured token budget.
    #[error("token budget exceeded: {compiled} tokens > limit {limit}")]
    BudgetExceeded {
        /// Token count of the context that would result from the commit.
        compiled: usize,
        /// The configured maximum.
        limit: usize,
    },

    /// A three-way merge could not be resolved automatically.
    #[error("merge conflict: {0:?}")]
    MergeConflict(Vec<ConflictItem>),

    /// The tract is in detached-HEAD state and the requested operation requires a branch.
    #[error("operation requires an active branch; tract is in detached HEAD state")]
    DetachedHead,

    /// An LLM-invoking operation was requested without a configured client, or with
    /// parameters that cannot be resolved (e.g. called from within a batch scope).
    #[error("LLM configuration error: {0}")]
    LLMConfigError(String),

    /// A compression or rebase range does not lie on the first-parent chain.
    #[error("invalid range: {0}")]
    InvalidRange(String),

    /// I/O error from the underlying filesystem.
    #[error("IO error: {0}")]
    IOError(#[from] std::io::Error),

    /// Database error from the storage backend.
    #[error("storage error: {0}")]
    StorageError(#[from] sea_orm::DbErr),

    /// JSON (de)serialization error.
    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Generic catch-all for failures that do not fit a named variant above,
    /// such as a schema-version mismatch on open.
    #[error("{0}")]
    CustomError(String),
}

impl TraceError {
    pub fn not_found(kind: &str, id: impl std::fmt::Display) -> Self {
        TraceError::NotFound(format!("{kind} `{id}`"))
    }

    pub fn validation(content_type: impl Into<String>, reason: impl Into<String>) -> Self {
        TraceError::ValidationError(content_type.into(), reason.into())
    }
}
