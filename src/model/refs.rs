//! Named pointers into a tract's commit graph.

use crate::hash::TraceHash;

/// `HEAD/<branch>` and other named refs resolve to a commit hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ref {
    pub ref_name: String,
    pub commit_hash: TraceHash,
}

pub const ORIG_HEAD: &str = "ORIG_HEAD";

pub fn head_ref_name(branch: &str) -> String {
    format!("HEAD/{branch}")
}

pub fn branch_from_head_ref(ref_name: &str) -> Option<&str> {
    ref_name.strip_prefix("HEAD/")
}
