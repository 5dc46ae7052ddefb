//! The multi-tract session layer's persisted shapes: a session groups one or
//! more tracts, and a spawn edge records that one tract was forked from a
//! point in another's history.

use chrono::NaiveDateTime;
use uuid::Uuid;

use crate::hash::TraceHash;

/// One tract registered under a session.
#[derive(Debug, Clone)]
pub struct TractRecord {
    pub tract_id: Uuid,
    pub session_id: Uuid,
    pub display_name: Option<String>,
    pub created_at: NaiveDateTime,
}

/// An edge recording that `child_tract_id` was spawned from
/// `spawn_point_hash` in `parent_tract_id`'s history. `spawn_point_hash` is
/// `None` for a session's first (root) tract, which has no parent.
#[derive(Debug, Clone)]
pub struct SpawnEdge {
    pub parent_tract_id: Uuid,
    pub child_tract_id: Uuid,
    pub spawn_point_hash: Option<TraceHash>,
    pub purpose: Option<String>,
    pub created_at: NaiveDateTime,
}
