//! Operation-event provenance (compress / reorganize / import) and
//! compile-record provenance (per-`generate()`-call accounting).

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::hash::TraceHash;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Compress,
    Reorganize,
    Import,
}

/// A single structural operation, with its source/result commits recorded
/// separately in `operation_commits` (role-tagged, many-to-many).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationEvent {
    pub event_id: Uuid,
    pub tract_id: Uuid,
    pub kind: OperationKind,
    pub params: Value,
    pub created_at: NaiveDateTime,
}

/// One row of the `operation_commits` relation: `event_id` relates to
/// `commit_hash` under `role` (e.g. `"source"`, `"result"`, `"imported"`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationCommitRef {
    pub event_id: Uuid,
    pub role: String,
    pub commit_hash: TraceHash,
}

/// Token/commit accounting for one `generate()` call, captured before the
/// LLM is invoked so intent is recorded even if the call fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompileRecord {
    pub record_id: Uuid,
    pub tract_id: Uuid,
    pub head_hash: Option<TraceHash>,
    pub token_count: u64,
    pub commit_count: u64,
    pub token_source: String,
    pub created_at: NaiveDateTime,
}
