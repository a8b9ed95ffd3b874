//! Row and view models returned by repositories.
//!
//! Keep these structs focused on the data returned by queries. Business logic
//! should live in higher layers.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::model::{CycleSummary, TenantKey};

/// One persisted monitoring cycle.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CycleMetricRow {
    pub id: i64,
    pub user_id: i64,
    pub page_id: String,
    pub start_time: DateTime<Utc>,
    pub duration_seconds: f64,
    pub reels_scanned: i64,
    pub reels_active: i64,
    pub comments_scanned: i64,
    pub replies_sent: i64,
    pub inbox_sent: i64,
    pub api_calls: i64,
}

/// Optional tenant filter for metric queries. `None` fields match all rows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsFilter {
    pub user_id: Option<i64>,
    pub page_id: Option<String>,
}

/// Totals over the rows matching a [`MetricsFilter`].
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct MetricsAggregate {
    pub rows: i64,
    /// Enabled rules currently configured for the filter.
    pub reels_active: i64,
    pub comments_scanned: i64,
    pub replies_sent: i64,
    pub inbox_sent: i64,
    pub api_calls: i64,
}

/// A queued manual cycle. The daemon claims it by setting `started_at` and
/// records `summary` or `error` when the cycle ends.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TriggerRequest {
    pub id: i64,
    pub user_id: i64,
    pub page_id: String,
    pub requested_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub summary: Option<CycleSummary>,
    pub error: Option<String>,
}

impl TriggerRequest {
    pub fn tenant(&self) -> TenantKey {
        TenantKey::new(self.user_id, self.page_id.as_str())
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }
}
