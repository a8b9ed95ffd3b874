//! One monitoring pass for a tenant: fetch reels, classify their comments
//! and dispatch replies.
//!
//! Failures of a single reel or comment are isolated: they become outcome
//! values counted in the [`CycleSummary`], and the pass carries on. Only a
//! failed reel listing ends the cycle early.

use chrono::Utc;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

use crate::config;
use crate::dedup::DedupCache;
use crate::error::CycleError;
use crate::matcher;
use crate::metrics::MetricsSink;
use crate::model::{Comment, CycleSummary, Rule, TenantKey};
use crate::source::{ContentSource, ReplyOutcome, SourceError};

#[derive(Debug, Clone)]
pub struct MonitorOptions {
    /// Upper bound for each individual remote call.
    pub call_timeout: Duration,
    /// Treat a missing reply summary as possibly truncated.
    pub verify_when_summary_missing: bool,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self::from(&config::Monitor::default())
    }
}

impl From<&config::Monitor> for MonitorOptions {
    fn from(cfg: &config::Monitor) -> Self {
        Self {
            call_timeout: cfg.call_timeout(),
            verify_when_summary_missing: cfg.verify_when_summary_missing,
        }
    }
}

/// What happened to one comment during a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommentOutcome {
    /// Handled earlier in this process.
    Known,
    /// Written by the page itself.
    OwnComment,
    /// The page already replied, per nested data or the remote check.
    AlreadySatisfied,
    NoMatch,
    Replied(InboxOutcome),
    /// The remote refused the reply as a duplicate.
    DuplicateReply,
    ReplyFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboxOutcome {
    NotConfigured,
    Sent,
    AlreadySent,
    Failed,
}

impl CycleSummary {
    fn tally(&mut self, outcome: &CommentOutcome) {
        match outcome {
            CommentOutcome::Replied(inbox) => {
                self.replies_sent += 1;
                match inbox {
                    InboxOutcome::Sent => self.inbox_sent += 1,
                    InboxOutcome::Failed => self.inbox_failures += 1,
                    InboxOutcome::NotConfigured | InboxOutcome::AlreadySent => {}
                }
            }
            CommentOutcome::DuplicateReply => self.already_replied += 1,
            CommentOutcome::ReplyFailed => self.reply_failures += 1,
            CommentOutcome::Known
            | CommentOutcome::OwnComment
            | CommentOutcome::AlreadySatisfied
            | CommentOutcome::NoMatch => {}
        }
    }
}

/// Long-lived per tenant; owns the tenant's dedup cache.
pub struct CycleExecutor {
    dedup: DedupCache,
    metrics: Arc<dyn MetricsSink>,
    options: MonitorOptions,
}

impl CycleExecutor {
    pub fn new(metrics: Arc<dyn MetricsSink>, options: MonitorOptions) -> Self {
        Self {
            dedup: DedupCache::new(),
            metrics,
            options,
        }
    }

    pub fn dedup(&self) -> &DedupCache {
        &self.dedup
    }

    /// Runs one pass over `rules` keyed by object id.
    #[instrument(skip_all, fields(user_id = tenant.user_id, page_id = %tenant.page_id))]
    pub async fn run_cycle(
        &mut self,
        tenant: &TenantKey,
        source: &dyn ContentSource,
        rules: &HashMap<String, Rule>,
    ) -> Result<CycleSummary, CycleError> {
        let started_at = Utc::now();
        let clock = Instant::now();
        let mut summary = CycleSummary::default();

        let enabled: HashMap<&str, &Rule> = rules
            .values()
            .filter(|r| r.enabled)
            .map(|r| (r.object_id.as_str(), r))
            .collect();
        if enabled.is_empty() {
            debug!(rules = rules.len(), "no enabled rules; skipping cycle");
            return Ok(summary);
        }

        let reels = self
            .call(&mut summary, source.list_reels())
            .await
            .map_err(CycleError::ReelFetch)?;
        summary.reels_scanned = reels.len() as u64;
        debug!(reels = reels.len(), "fetched reels");

        let page_id = source.page_id().to_string();
        for reel in &reels {
            let Some(rule) = enabled.get(reel.id.as_str()) else {
                debug!(reel_id = %reel.id, "no enabled rule for reel");
                continue;
            };
            summary.reels_with_enabled_rule += 1;

            let comments = match self.call(&mut summary, source.list_comments(&reel.id)).await {
                Ok(comments) => comments,
                Err(err) => {
                    warn!(reel_id = %reel.id, %err, "failed to fetch comments; skipping reel");
                    summary.reel_failures += 1;
                    continue;
                }
            };
            summary.comments_scanned += comments.len() as u64;
            debug!(reel_id = %reel.id, comments = comments.len(), "processing comments");

            for comment in &comments {
                let outcome = self
                    .process_comment(&mut summary, source, &page_id, &reel.id, rule, comment)
                    .await;
                debug!(reel_id = %reel.id, comment_id = %comment.id, ?outcome, "comment classified");
                summary.tally(&outcome);
            }
        }

        summary.duration_seconds = clock.elapsed().as_secs_f64();
        info!(
            fetched_reels = summary.reels_scanned,
            processed_reels = summary.reels_with_enabled_rule,
            comments = summary.comments_scanned,
            replies = summary.replies_sent,
            inbox = summary.inbox_sent,
            failures = summary.reply_failures + summary.reel_failures,
            api_calls = summary.api_calls,
            rules = rules.len(),
            enabled_rules = enabled.len(),
            duration = summary.duration_seconds,
            "monitoring cycle complete"
        );
        self.metrics.record_cycle(tenant, started_at, &summary).await;
        Ok(summary)
    }

    async fn process_comment(
        &mut self,
        summary: &mut CycleSummary,
        source: &dyn ContentSource,
        page_id: &str,
        reel_id: &str,
        rule: &Rule,
        comment: &Comment,
    ) -> CommentOutcome {
        if self.dedup.is_known_replied(&comment.id) {
            return CommentOutcome::Known;
        }
        if comment.is_authored_by(page_id) {
            return CommentOutcome::OwnComment;
        }
        if self.already_satisfied(summary, source, page_id, comment).await {
            self.dedup.mark_replied(&comment.id);
            return CommentOutcome::AlreadySatisfied;
        }
        if !matcher::matches(&comment.message, rule) {
            return CommentOutcome::NoMatch;
        }

        let reply = self
            .call(summary, source.post_public_reply(&comment.id, &rule.reply_message))
            .await;
        match reply {
            Ok(ReplyOutcome::Sent) => {
                self.dedup.mark_replied(&comment.id);
                let inbox = self.send_inbox(summary, source, reel_id, rule, comment).await;
                CommentOutcome::Replied(inbox)
            }
            Ok(ReplyOutcome::AlreadyReplied) => {
                debug!(reel_id, comment_id = %comment.id, "remote reports reply already sent");
                self.dedup.mark_replied(&comment.id);
                CommentOutcome::DuplicateReply
            }
            Err(err) => {
                warn!(reel_id, comment_id = %comment.id, %err, transient = err.is_transient(), "failed to reply to comment");
                CommentOutcome::ReplyFailed
            }
        }
    }

    /// Nested replies first; the remote check only runs when the nested
    /// data is known (or, optionally, suspected) to be truncated.
    async fn already_satisfied(
        &mut self,
        summary: &mut CycleSummary,
        source: &dyn ContentSource,
        page_id: &str,
        comment: &Comment,
    ) -> bool {
        if comment.has_nested_reply_from(page_id) {
            return true;
        }
        let needs_check = comment.replies_truncated()
            || (self.options.verify_when_summary_missing && comment.reply_count.is_none());
        if !needs_check {
            return false;
        }
        if let Some(cached) = self.dedup.cached_remote_check(&comment.id) {
            return cached;
        }
        match self.call(summary, source.has_already_replied(&comment.id)).await {
            Ok(replied) => {
                self.dedup.record_remote_check(&comment.id, replied);
                replied
            }
            Err(err) => {
                // A duplicate reply is refused by the remote anyway.
                warn!(comment_id = %comment.id, %err, "reply check failed; assuming not replied");
                false
            }
        }
    }

    async fn send_inbox(
        &mut self,
        summary: &mut CycleSummary,
        source: &dyn ContentSource,
        reel_id: &str,
        rule: &Rule,
        comment: &Comment,
    ) -> InboxOutcome {
        let Some(message) = rule.inbox() else {
            return InboxOutcome::NotConfigured;
        };
        match self
            .call(summary, source.post_private_reply(&comment.id, message))
            .await
        {
            Ok(ReplyOutcome::Sent) => InboxOutcome::Sent,
            Ok(ReplyOutcome::AlreadyReplied) => InboxOutcome::AlreadySent,
            Err(err) => {
                warn!(reel_id, comment_id = %comment.id, %err, "failed to send private reply");
                InboxOutcome::Failed
            }
        }
    }

    /// Issue one remote call under the per-call timeout and count it.
    async fn call<T, F>(&self, summary: &mut CycleSummary, fut: F) -> Result<T, SourceError>
    where
        F: Future<Output = Result<T, SourceError>>,
    {
        summary.api_calls += 1;
        match tokio::time::timeout(self.options.call_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(SourceError::Timeout(self.options.call_timeout)),
        }
    }
}
