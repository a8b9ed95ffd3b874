use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Page identifier used for tenants that have no page-scoped settings.
pub const DEFAULT_PAGE_ID: &str = "default";

/// Keyword that turns a rule into a match-everything rule.
pub const WILDCARD_KEYWORD: &str = ".";

/// Identifies an independent monitoring domain. All scheduling, dedup and
/// config state is partitioned by this key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TenantKey {
    pub user_id: i64,
    pub page_id: String,
}

impl TenantKey {
    pub fn new(user_id: i64, page_id: impl Into<String>) -> Self {
        let page_id = page_id.into();
        let page_id = if page_id.trim().is_empty() {
            DEFAULT_PAGE_ID.to_string()
        } else {
            page_id
        };
        Self { user_id, page_id }
    }

    /// Tenant for a user without explicit page scope.
    pub fn default_page(user_id: i64) -> Self {
        Self::new(user_id, DEFAULT_PAGE_ID)
    }
}

impl fmt::Display for TenantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "user {} / page {}", self.user_id, self.page_id)
    }
}

/// Per-reel reply rule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Rule {
    pub object_id: String,
    #[serde(default)]
    pub match_words: Vec<String>,
    pub reply_message: String,
    #[serde(default)]
    pub inbox_message: Option<String>,
    #[serde(default)]
    pub enabled: bool,
}

impl Rule {
    /// Build a rule, keeping the first occurrence of each keyword
    /// (compared case-insensitively) in the order given.
    pub fn new(
        object_id: impl Into<String>,
        match_words: impl IntoIterator<Item = impl Into<String>>,
        reply_message: impl Into<String>,
    ) -> Self {
        let mut words: Vec<String> = Vec::new();
        for word in match_words.into_iter().map(Into::into) {
            if !words.iter().any(|w| w.to_lowercase() == word.to_lowercase()) {
                words.push(word);
            }
        }
        Self {
            object_id: object_id.into(),
            match_words: words,
            reply_message: reply_message.into(),
            inbox_message: None,
            enabled: true,
        }
    }

    pub fn with_inbox(mut self, message: impl Into<String>) -> Self {
        self.inbox_message = Some(message.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn is_wildcard(&self) -> bool {
        self.match_words.is_empty() || self.match_words.iter().any(|w| w == WILDCARD_KEYWORD)
    }

    /// Non-blank inbox message, if any.
    pub fn inbox(&self) -> Option<&str> {
        self.inbox_message
            .as_deref()
            .filter(|m| !m.trim().is_empty())
    }
}

/// A monitorable content unit on the page.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Reel {
    pub id: String,
    pub description: Option<String>,
    pub updated_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommentAuthor {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Comment {
    pub id: String,
    pub message: String,
    pub author: Option<CommentAuthor>,
    pub created_time: DateTime<Utc>,
    pub updated_time: Option<DateTime<Utc>>,
    /// Nested replies as returned by the remote; may be truncated.
    pub replies: Vec<Comment>,
    /// Total reply count from the remote summary, when it was sent.
    pub reply_count: Option<u64>,
}

impl Comment {
    pub fn is_authored_by(&self, page_id: &str) -> bool {
        self.author.as_ref().is_some_and(|a| a.id == page_id)
    }

    pub fn has_nested_reply_from(&self, page_id: &str) -> bool {
        self.replies.iter().any(|r| r.is_authored_by(page_id))
    }

    /// True when the summary reports more replies than were returned inline.
    pub fn replies_truncated(&self) -> bool {
        self.reply_count
            .is_some_and(|total| total > self.replies.len() as u64)
    }
}

/// Snapshot of a scheduled job. The registry owns the live state.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MonitoringJob {
    pub tenant: TenantKey,
    pub interval_seconds: u64,
    pub enabled: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub running: bool,
}

/// Outcome counters of one monitoring pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CycleSummary {
    /// Reels returned by the listing call.
    pub reels_scanned: u64,
    /// Reels that had an enabled rule and were processed.
    pub reels_with_enabled_rule: u64,
    pub comments_scanned: u64,
    pub replies_sent: u64,
    pub inbox_sent: u64,
    /// Remote calls actually issued during the cycle.
    pub api_calls: u64,
    pub duration_seconds: f64,
    /// Replies rejected by the remote as duplicates.
    pub already_replied: u64,
    pub reply_failures: u64,
    pub inbox_failures: u64,
    /// Reels whose comment fetch failed.
    pub reel_failures: u64,
}

impl CycleSummary {
    pub fn is_empty(&self) -> bool {
        self.reels_scanned == 0 && self.comments_scanned == 0 && self.api_calls == 0
    }
}

/// Runtime view of a tenant for administrative callers.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TenantStatus {
    pub tenant: TenantKey,
    pub enabled: bool,
    pub interval_seconds: u64,
    pub scheduled: bool,
    pub running: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub last_summary: Option<CycleSummary>,
}
