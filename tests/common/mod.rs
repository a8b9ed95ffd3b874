#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reel_watchbot::error::CycleError;
use reel_watchbot::metrics::MetricsSink;
use reel_watchbot::model::{Comment, CommentAuthor, CycleSummary, Reel, Rule, TenantKey};
use reel_watchbot::source::{ContentSource, ReplyOutcome, SourceError, SourceFactory};
use reel_watchbot::store::{ConfigProvider, TenantSettings, TenantStore};

pub const PAGE: &str = "page-1";

pub fn ts(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, minute, 0).unwrap()
}

pub fn reel(id: &str) -> Reel {
    Reel {
        id: id.into(),
        description: None,
        updated_time: ts(0),
    }
}

pub fn comment(id: &str, message: &str, author_id: &str) -> Comment {
    Comment {
        id: id.into(),
        message: message.into(),
        author: Some(CommentAuthor {
            id: author_id.into(),
            name: format!("user {author_id}"),
        }),
        created_time: ts(1),
        updated_time: None,
        replies: Vec::new(),
        reply_count: None,
    }
}

pub fn rules(list: Vec<Rule>) -> HashMap<String, Rule> {
    list.into_iter().map(|r| (r.object_id.clone(), r)).collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    ListReels,
    ListComments(String),
    PublicReply { comment_id: String, text: String },
    PrivateReply { comment_id: String, text: String },
    CheckReplied(String),
}

#[derive(Debug, Default)]
struct FakeState {
    reels: Vec<Reel>,
    comments: HashMap<String, Vec<Comment>>,
    fail_reels: bool,
    fail_comments: HashSet<String>,
    fail_replies: HashSet<String>,
    duplicate_replies: HashSet<String>,
    fail_inbox: HashSet<String>,
    remote_replied: HashSet<String>,
    delay: Option<Duration>,
}

/// Scripted content source that records every call.
#[derive(Debug)]
pub struct FakeSource {
    page_id: String,
    state: Mutex<FakeState>,
    calls: Mutex<Vec<Call>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl FakeSource {
    pub fn new(page_id: &str) -> Arc<Self> {
        Arc::new(Self {
            page_id: page_id.into(),
            state: Mutex::new(FakeState::default()),
            calls: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        })
    }

    pub fn add_reel(&self, reel_id: &str, comments: Vec<Comment>) {
        let mut state = self.state.lock().unwrap();
        state.reels.push(reel(reel_id));
        state.comments.insert(reel_id.into(), comments);
    }

    pub fn fail_reels(&self, fail: bool) {
        self.state.lock().unwrap().fail_reels = fail;
    }

    pub fn fail_comments(&self, reel_id: &str) {
        self.state.lock().unwrap().fail_comments.insert(reel_id.into());
    }

    pub fn fail_reply(&self, comment_id: &str, fail: bool) {
        let mut state = self.state.lock().unwrap();
        if fail {
            state.fail_replies.insert(comment_id.into());
        } else {
            state.fail_replies.remove(comment_id);
        }
    }

    pub fn duplicate_reply(&self, comment_id: &str) {
        self.state.lock().unwrap().duplicate_replies.insert(comment_id.into());
    }

    pub fn fail_inbox(&self, comment_id: &str) {
        self.state.lock().unwrap().fail_inbox.insert(comment_id.into());
    }

    pub fn mark_remote_replied(&self, comment_id: &str) {
        self.state.lock().unwrap().remote_replied.insert(comment_id.into());
    }

    /// Every call sleeps this long before answering.
    pub fn set_delay(&self, delay: Duration) {
        self.state.lock().unwrap().delay = Some(delay);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn public_replies(&self) -> Vec<(String, String)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::PublicReply { comment_id, text } => Some((comment_id, text)),
                _ => None,
            })
            .collect()
    }

    pub fn private_replies(&self) -> Vec<(String, String)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::PrivateReply { comment_id, text } => Some((comment_id, text)),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|c| pred(*c)).count()
    }

    pub fn list_reels_calls(&self) -> usize {
        self.count(|c| matches!(c, Call::ListReels))
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    async fn enter(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
        let delay = self.state.lock().unwrap().delay;
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    fn api_error(message: &str) -> SourceError {
        SourceError::Api {
            status: 500,
            code: Some(1),
            message: message.into(),
        }
    }
}

#[async_trait]
impl ContentSource for FakeSource {
    fn page_id(&self) -> &str {
        &self.page_id
    }

    async fn list_reels(&self) -> Result<Vec<Reel>, SourceError> {
        self.enter(Call::ListReels).await;
        let state = self.state.lock().unwrap();
        if state.fail_reels {
            return Err(Self::api_error("reels unavailable"));
        }
        Ok(state.reels.clone())
    }

    async fn list_comments(&self, reel_id: &str) -> Result<Vec<Comment>, SourceError> {
        self.enter(Call::ListComments(reel_id.into())).await;
        let state = self.state.lock().unwrap();
        if state.fail_comments.contains(reel_id) {
            return Err(Self::api_error("comments unavailable"));
        }
        Ok(state.comments.get(reel_id).cloned().unwrap_or_default())
    }

    async fn post_public_reply(
        &self,
        comment_id: &str,
        text: &str,
    ) -> Result<ReplyOutcome, SourceError> {
        self.enter(Call::PublicReply {
            comment_id: comment_id.into(),
            text: text.into(),
        })
        .await;
        let mut state = self.state.lock().unwrap();
        if state.fail_replies.contains(comment_id) {
            return Err(SourceError::RateLimited("slow down".into()));
        }
        if state.duplicate_replies.contains(comment_id) {
            return Ok(ReplyOutcome::AlreadyReplied);
        }
        // The reply shows up nested under the comment from now on.
        let page_id = self.page_id.clone();
        for comments in state.comments.values_mut() {
            if let Some(c) = comments.iter_mut().find(|c| c.id == comment_id) {
                let mut reply = comment(&format!("{comment_id}-reply"), text, &page_id);
                reply.created_time = ts(2);
                c.replies.push(reply);
            }
        }
        Ok(ReplyOutcome::Sent)
    }

    async fn post_private_reply(
        &self,
        comment_id: &str,
        text: &str,
    ) -> Result<ReplyOutcome, SourceError> {
        self.enter(Call::PrivateReply {
            comment_id: comment_id.into(),
            text: text.into(),
        })
        .await;
        if self.state.lock().unwrap().fail_inbox.contains(comment_id) {
            return Err(Self::api_error("messaging unavailable"));
        }
        Ok(ReplyOutcome::Sent)
    }

    async fn has_already_replied(&self, comment_id: &str) -> Result<bool, SourceError> {
        self.enter(Call::CheckReplied(comment_id.into())).await;
        Ok(self.state.lock().unwrap().remote_replied.contains(comment_id))
    }
}

/// In-memory configuration of one tenant.
#[derive(Debug, Default)]
pub struct MemoryConfig {
    pub settings: Mutex<TenantSettings>,
    pub rules: Mutex<HashMap<String, Rule>>,
    pub fail: AtomicBool,
}

impl MemoryConfig {
    fn check(&self) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(anyhow!("store unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl ConfigProvider for MemoryConfig {
    async fn is_monitoring_enabled(&self) -> Result<bool> {
        self.check()?;
        Ok(self.settings.lock().unwrap().monitoring_enabled)
    }

    async fn interval_seconds(&self, default: u64) -> Result<u64> {
        self.check()?;
        Ok(self.settings.lock().unwrap().interval_seconds.unwrap_or(default))
    }

    async fn set_enabled(&self, enabled: bool) -> Result<()> {
        self.check()?;
        self.settings.lock().unwrap().monitoring_enabled = enabled;
        Ok(())
    }

    async fn set_interval_seconds(&self, seconds: u64) -> Result<()> {
        self.check()?;
        self.settings.lock().unwrap().interval_seconds = Some(seconds);
        Ok(())
    }

    async fn load_settings(&self) -> Result<TenantSettings> {
        self.check()?;
        Ok(self.settings.lock().unwrap().clone())
    }

    async fn load_enabled_rules(&self) -> Result<HashMap<String, Rule>> {
        self.check()?;
        Ok(self
            .rules
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, r)| r.enabled)
            .map(|(k, r)| (k.clone(), r.clone()))
            .collect())
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tenants: Mutex<Vec<TenantKey>>,
    configs: Mutex<HashMap<TenantKey, Arc<MemoryConfig>>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a tenant with working credentials.
    pub fn add_tenant(
        &self,
        tenant: &TenantKey,
        enabled: bool,
        interval: Option<u64>,
        rules: Vec<Rule>,
    ) -> Arc<MemoryConfig> {
        let config = self.config(tenant);
        {
            let mut settings = config.settings.lock().unwrap();
            settings.access_token = Some("token".into());
            settings.graph_page_id = Some(PAGE.into());
            settings.monitoring_enabled = enabled;
            settings.interval_seconds = interval;
        }
        *config.rules.lock().unwrap() = self::rules(rules);
        let mut tenants = self.tenants.lock().unwrap();
        if !tenants.contains(tenant) {
            tenants.push(tenant.clone());
        }
        config
    }

    pub fn remove_tenant(&self, tenant: &TenantKey) {
        self.tenants.lock().unwrap().retain(|t| t != tenant);
    }

    pub fn config(&self, tenant: &TenantKey) -> Arc<MemoryConfig> {
        self.configs
            .lock()
            .unwrap()
            .entry(tenant.clone())
            .or_default()
            .clone()
    }
}

#[async_trait]
impl TenantStore for MemoryStore {
    async fn list_tenants(&self) -> Result<Vec<TenantKey>> {
        Ok(self.tenants.lock().unwrap().clone())
    }

    fn provider(&self, tenant: &TenantKey) -> Arc<dyn ConfigProvider> {
        self.config(tenant)
    }
}

/// Hands out pre-registered sources after checking credentials.
#[derive(Debug, Default)]
pub struct FakeFactory {
    sources: Mutex<HashMap<TenantKey, Arc<FakeSource>>>,
    builds: AtomicUsize,
}

impl FakeFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, tenant: &TenantKey, source: Arc<FakeSource>) {
        self.sources.lock().unwrap().insert(tenant.clone(), source);
    }

    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

impl SourceFactory for FakeFactory {
    fn build(
        &self,
        tenant: &TenantKey,
        settings: &TenantSettings,
    ) -> Result<Arc<dyn ContentSource>, CycleError> {
        settings.credentials(tenant)?;
        self.builds.fetch_add(1, Ordering::SeqCst);
        let source = self
            .sources
            .lock()
            .unwrap()
            .get(tenant)
            .cloned()
            .ok_or_else(|| CycleError::config(tenant, "no source registered"))?;
        Ok(source)
    }
}

#[derive(Debug, Default)]
pub struct RecordingMetrics {
    cycles: Mutex<Vec<(TenantKey, CycleSummary)>>,
    jobs: AtomicUsize,
}

impl RecordingMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn cycles(&self) -> Vec<(TenantKey, CycleSummary)> {
        self.cycles.lock().unwrap().clone()
    }

    pub fn cycles_for(&self, tenant: &TenantKey) -> usize {
        self.cycles().iter().filter(|(t, _)| t == tenant).count()
    }

    pub fn jobs(&self) -> usize {
        self.jobs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MetricsSink for RecordingMetrics {
    async fn record_cycle(&self, tenant: &TenantKey, _started_at: DateTime<Utc>, summary: &CycleSummary) {
        self.cycles.lock().unwrap().push((tenant.clone(), summary.clone()));
    }

    fn set_jobs_scheduled(&self, count: usize) {
        self.jobs.store(count, Ordering::SeqCst);
    }
}
