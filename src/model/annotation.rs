//! Priority annotations: append-only labels targeting a commit.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::hash::TraceHash;

/// Compression/compile-time priority. Latest annotation per target wins,
/// ties broken by `created_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Pinned,
    Normal,
    Skip,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Pinned => "PINNED",
            Priority::Normal => "NORMAL",
            Priority::Skip => "SKIP",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Annotation {
    pub id: i64,
    pub target_hash: TraceHash,
    pub priority: Priority,
    pub reason: Option<String>,
    pub created_at: NaiveDateTime,
}
