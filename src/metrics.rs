//! Cycle metrics: the sink interface, an in-memory registry rendered in the
//! Prometheus text format, and a SQLite history sink.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::db;
use crate::model::{CycleSummary, TenantKey};

/// Upper bounds of the cycle duration histogram, in seconds.
const DURATION_BUCKETS: [f64; 11] = [0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

#[async_trait]
pub trait MetricsSink: Send + Sync {
    /// Called once per completed cycle. Must not fail the cycle.
    async fn record_cycle(&self, tenant: &TenantKey, started_at: DateTime<Utc>, summary: &CycleSummary);

    fn set_jobs_scheduled(&self, _count: usize) {}
}

/// Sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

#[async_trait]
impl MetricsSink for NoopMetrics {
    async fn record_cycle(&self, _: &TenantKey, _: DateTime<Utc>, _: &CycleSummary) {}
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct DurationStats {
    pub count: u64,
    pub sum: f64,
    pub max: f64,
    /// Cumulative counts per entry of the bucket bounds.
    pub buckets: [u64; DURATION_BUCKETS.len()],
}

impl DurationStats {
    fn observe(&mut self, seconds: f64) {
        self.count += 1;
        self.sum += seconds;
        if seconds > self.max {
            self.max = seconds;
        }
        for (bound, slot) in DURATION_BUCKETS.iter().zip(self.buckets.iter_mut()) {
            if seconds <= *bound {
                *slot += 1;
            }
        }
    }
}

/// Counters accumulated for one tenant since process start.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct TenantCounters {
    pub cycles: u64,
    pub api_calls: u64,
    pub reels_processed: u64,
    pub comments_scanned: u64,
    pub replies_sent: u64,
    pub inbox_sent: u64,
    pub already_replied: u64,
    pub reply_failures: u64,
    pub duration: DurationStats,
}

#[derive(Debug, Default)]
pub struct MetricsRegistry {
    tenants: Mutex<BTreeMap<TenantKey, TenantCounters>>,
    jobs_scheduled: AtomicUsize,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&self, tenant: &TenantKey, summary: &CycleSummary) {
        let mut tenants = self.tenants.lock().unwrap_or_else(|e| e.into_inner());
        let counters = tenants.entry(tenant.clone()).or_default();
        counters.cycles += 1;
        counters.api_calls += summary.api_calls;
        counters.reels_processed += summary.reels_with_enabled_rule;
        counters.comments_scanned += summary.comments_scanned;
        counters.replies_sent += summary.replies_sent;
        counters.inbox_sent += summary.inbox_sent;
        counters.already_replied += summary.already_replied;
        counters.reply_failures += summary.reply_failures;
        counters.duration.observe(summary.duration_seconds);
    }

    pub fn snapshot(&self, tenant: &TenantKey) -> Option<TenantCounters> {
        let tenants = self.tenants.lock().unwrap_or_else(|e| e.into_inner());
        tenants.get(tenant).cloned()
    }

    pub fn jobs_scheduled(&self) -> usize {
        self.jobs_scheduled.load(Ordering::Relaxed)
    }

    /// Prometheus text exposition of every tenant's counters.
    pub fn render(&self) -> String {
        let tenants = self.tenants.lock().unwrap_or_else(|e| e.into_inner());
        let mut out = String::new();

        let counters: [(&str, &str, fn(&TenantCounters) -> u64); 5] = [
            (
                "monitoring_cycle_api_calls_total",
                "Remote API calls made during monitoring cycles",
                |c| c.api_calls,
            ),
            (
                "monitoring_cycle_reels_scanned_total",
                "Reels with an enabled rule processed during monitoring cycles",
                |c| c.reels_processed,
            ),
            (
                "monitoring_cycle_comments_scanned_total",
                "Comments scanned during monitoring cycles",
                |c| c.comments_scanned,
            ),
            (
                "monitoring_cycle_replies_sent_total",
                "Public comment replies sent during monitoring cycles",
                |c| c.replies_sent,
            ),
            (
                "monitoring_cycle_inbox_messages_sent_total",
                "Private replies sent during monitoring cycles",
                |c| c.inbox_sent,
            ),
        ];
        for (name, help, value) in counters {
            let _ = writeln!(out, "# HELP {name} {help}");
            let _ = writeln!(out, "# TYPE {name} counter");
            for (tenant, c) in tenants.iter() {
                let _ = writeln!(out, "{name}{{{}}} {}", labels(tenant), value(c));
            }
        }

        let name = "monitoring_cycle_duration_seconds";
        let _ = writeln!(out, "# HELP {name} Duration of a monitoring cycle in seconds");
        let _ = writeln!(out, "# TYPE {name} histogram");
        for (tenant, c) in tenants.iter() {
            let l = labels(tenant);
            for (bound, count) in DURATION_BUCKETS.iter().zip(c.duration.buckets.iter()) {
                let _ = writeln!(out, "{name}_bucket{{{l},le=\"{bound}\"}} {count}");
            }
            let _ = writeln!(out, "{name}_bucket{{{l},le=\"+Inf\"}} {}", c.duration.count);
            let _ = writeln!(out, "{name}_sum{{{l}}} {}", c.duration.sum);
            let _ = writeln!(out, "{name}_count{{{l}}} {}", c.duration.count);
        }

        let _ = writeln!(out, "# HELP scheduler_jobs_scheduled Monitoring jobs currently scheduled");
        let _ = writeln!(out, "# TYPE scheduler_jobs_scheduled gauge");
        let _ = writeln!(out, "scheduler_jobs_scheduled {}", self.jobs_scheduled());
        out
    }
}

impl MetricsRegistry {
    /// Replace `path` with the current exposition, via a sibling temp file
    /// renamed into place.
    pub async fn write_to(&self, path: &Path) -> std::io::Result<()> {
        let text = self.render();
        let tmp = path.with_extension("prom.tmp");
        tokio::fs::write(&tmp, text.as_bytes()).await?;
        tokio::fs::rename(&tmp, path).await?;
        debug!(path = %path.display(), bytes = text.len(), "metrics written");
        Ok(())
    }
}

fn labels(tenant: &TenantKey) -> String {
    let page = tenant.page_id.replace('\\', "\\\\").replace('"', "\\\"");
    format!("user_id=\"{}\",page_id=\"{}\"", tenant.user_id, page)
}

#[async_trait]
impl MetricsSink for MetricsRegistry {
    async fn record_cycle(&self, tenant: &TenantKey, _started_at: DateTime<Utc>, summary: &CycleSummary) {
        self.observe(tenant, summary);
    }

    fn set_jobs_scheduled(&self, count: usize) {
        self.jobs_scheduled.store(count, Ordering::Relaxed);
    }
}

/// Persists one `monitoring_metrics` row per cycle.
#[derive(Debug, Clone)]
pub struct SqliteMetricsSink {
    pool: db::Pool,
}

impl SqliteMetricsSink {
    pub fn new(pool: db::Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MetricsSink for SqliteMetricsSink {
    async fn record_cycle(&self, tenant: &TenantKey, started_at: DateTime<Utc>, summary: &CycleSummary) {
        if let Err(err) = db::insert_cycle_metric(&self.pool, tenant, started_at, summary).await {
            warn!(
                ?err,
                user_id = tenant.user_id,
                page_id = %tenant.page_id,
                "failed to persist cycle metrics"
            );
        }
    }
}

/// Forwards to several sinks in order.
#[derive(Clone, Default)]
pub struct MetricsFanout {
    sinks: Vec<Arc<dyn MetricsSink>>,
}

impl MetricsFanout {
    pub fn new(sinks: Vec<Arc<dyn MetricsSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl MetricsSink for MetricsFanout {
    async fn record_cycle(&self, tenant: &TenantKey, started_at: DateTime<Utc>, summary: &CycleSummary) {
        for sink in &self.sinks {
            sink.record_cycle(tenant, started_at, summary).await;
        }
    }

    fn set_jobs_scheduled(&self, count: usize) {
        for sink in &self.sinks {
            sink.set_jobs_scheduled(count);
        }
    }
}
