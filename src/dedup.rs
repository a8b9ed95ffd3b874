//! In-memory record of comments that already received a reply.
//!
//! Lives as long as the tenant's executor. Losing it only costs extra
//! remote checks; the remote remains the authority on whether the page has
//! replied.

use std::collections::{HashMap, HashSet};

#[derive(Debug, Default)]
pub struct DedupCache {
    replied: HashSet<String>,
    remote_checks: HashMap<String, bool>,
}

impl DedupCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_known_replied(&self, comment_id: &str) -> bool {
        self.replied.contains(comment_id)
    }

    pub fn mark_replied(&mut self, comment_id: &str) {
        if !self.replied.contains(comment_id) {
            self.replied.insert(comment_id.to_string());
        }
    }

    /// Result of an earlier remote "has the page replied" check.
    pub fn cached_remote_check(&self, comment_id: &str) -> Option<bool> {
        self.remote_checks.get(comment_id).copied()
    }

    pub fn record_remote_check(&mut self, comment_id: &str, replied: bool) {
        self.remote_checks.insert(comment_id.to_string(), replied);
        if replied {
            self.mark_replied(comment_id);
        }
    }

    pub fn replied_count(&self) -> usize {
        self.replied.len()
    }
}
