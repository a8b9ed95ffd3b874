use super::model::{CycleMetricRow, MetricsAggregate, MetricsFilter, TriggerRequest};
use crate::model::{CycleSummary, Rule, TenantKey, DEFAULT_PAGE_ID};
use crate::store::TenantSettings;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use tracing::{instrument, warn};

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized)
        .await
        .with_context(|| format!("failed to open database {normalized}"))?;
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    let Some(rest) = url.strip_prefix("sqlite:") else {
        return url.to_string();
    };
    if rest.starts_with(":memory") {
        return url.to_string();
    }

    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = format!("sqlite://{expanded_path}");
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    } else {
        rebuilt.push_str("?mode=rwc");
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn get_or_create_user(pool: &Pool, username: &str) -> Result<i64> {
    if let Some(id) = sqlx::query_scalar::<_, i64>("SELECT id FROM users WHERE username = ?")
        .bind(username)
        .fetch_optional(pool)
        .await?
    {
        return Ok(id);
    }

    let id = sqlx::query_scalar::<_, i64>("INSERT INTO users (username) VALUES (?) RETURNING id")
        .bind(username)
        .fetch_one(pool)
        .await?;
    Ok(id)
}

/// Every user paired with each page it has settings or rules for; users
/// without page-scoped rows map to the default page.
#[instrument(skip_all)]
pub async fn list_tenants(pool: &Pool) -> Result<Vec<TenantKey>> {
    let user_ids: Vec<i64> = sqlx::query_scalar("SELECT id FROM users ORDER BY id")
        .fetch_all(pool)
        .await?;
    let pages: Vec<(i64, Option<String>)> = sqlx::query_as(
        "SELECT user_id, page_id FROM page_settings \
         UNION SELECT user_id, page_id FROM rules \
         ORDER BY 1, 2",
    )
    .fetch_all(pool)
    .await?;

    let mut tenants = Vec::new();
    for user_id in user_ids {
        let mut found = false;
        for (uid, page_id) in pages.iter().filter(|(uid, _)| *uid == user_id) {
            let key = TenantKey::new(*uid, page_id.clone().unwrap_or_default());
            if !tenants.contains(&key) {
                tenants.push(key);
            }
            found = true;
        }
        if !found {
            tenants.push(TenantKey::new(user_id, DEFAULT_PAGE_ID));
        }
    }
    Ok(tenants)
}

fn settings_from_row(row: &SqliteRow) -> TenantSettings {
    let limit = |col: &str| {
        row.try_get::<Option<i64>, _>(col)
            .ok()
            .flatten()
            .and_then(|v| u32::try_from(v).ok())
            .filter(|v| *v > 0)
    };
    TenantSettings {
        access_token: row.try_get("access_token").ok().flatten(),
        graph_page_id: row.try_get("graph_page_id").ok().flatten(),
        api_version: row.try_get("api_version").ok().flatten(),
        reels_limit: limit("reels_limit"),
        comments_limit: limit("comments_limit"),
        replies_limit: limit("replies_limit"),
        monitoring_enabled: row.try_get("monitoring_enabled").unwrap_or(false),
        interval_seconds: row
            .try_get::<Option<i64>, _>("interval_seconds")
            .ok()
            .flatten()
            .and_then(|v| u64::try_from(v).ok())
            .filter(|v| *v >= 1),
    }
}

#[instrument(skip_all)]
pub async fn load_page_settings(pool: &Pool, tenant: &TenantKey) -> Result<Option<TenantSettings>> {
    let row = sqlx::query(
        "SELECT access_token, graph_page_id, api_version, reels_limit, comments_limit, \
                replies_limit, monitoring_enabled, interval_seconds \
         FROM page_settings WHERE user_id = ? AND page_id = ?",
    )
    .bind(tenant.user_id)
    .bind(tenant.page_id.as_str())
    .fetch_optional(pool)
    .await?;
    Ok(row.as_ref().map(settings_from_row))
}

#[instrument(skip_all)]
pub async fn upsert_page_settings(
    pool: &Pool,
    tenant: &TenantKey,
    settings: &TenantSettings,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO page_settings (user_id, page_id, access_token, graph_page_id, api_version, \
                reels_limit, comments_limit, replies_limit, monitoring_enabled, interval_seconds) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT (user_id, page_id) DO UPDATE SET \
            access_token = excluded.access_token, \
            graph_page_id = excluded.graph_page_id, \
            api_version = excluded.api_version, \
            reels_limit = excluded.reels_limit, \
            comments_limit = excluded.comments_limit, \
            replies_limit = excluded.replies_limit, \
            monitoring_enabled = excluded.monitoring_enabled, \
            interval_seconds = excluded.interval_seconds, \
            updated_at = CURRENT_TIMESTAMP",
    )
    .bind(tenant.user_id)
    .bind(tenant.page_id.as_str())
    .bind(settings.access_token.as_deref())
    .bind(settings.graph_page_id.as_deref())
    .bind(settings.api_version.as_deref())
    .bind(settings.reels_limit.map(i64::from))
    .bind(settings.comments_limit.map(i64::from))
    .bind(settings.replies_limit.map(i64::from))
    .bind(settings.monitoring_enabled)
    .bind(settings.interval_seconds.map(to_i64))
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn set_monitoring_enabled(pool: &Pool, tenant: &TenantKey, enabled: bool) -> Result<()> {
    sqlx::query(
        "INSERT INTO page_settings (user_id, page_id, monitoring_enabled) VALUES (?, ?, ?) \
         ON CONFLICT (user_id, page_id) DO UPDATE SET \
            monitoring_enabled = excluded.monitoring_enabled, updated_at = CURRENT_TIMESTAMP",
    )
    .bind(tenant.user_id)
    .bind(tenant.page_id.as_str())
    .bind(enabled)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn set_interval_seconds(pool: &Pool, tenant: &TenantKey, seconds: u64) -> Result<()> {
    sqlx::query(
        "INSERT INTO page_settings (user_id, page_id, interval_seconds) VALUES (?, ?, ?) \
         ON CONFLICT (user_id, page_id) DO UPDATE SET \
            interval_seconds = excluded.interval_seconds, updated_at = CURRENT_TIMESTAMP",
    )
    .bind(tenant.user_id)
    .bind(tenant.page_id.as_str())
    .bind(to_i64(seconds))
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn upsert_rule(pool: &Pool, tenant: &TenantKey, rule: &Rule) -> Result<()> {
    let words = serde_json::to_string(&rule.match_words)?;
    sqlx::query(
        "INSERT INTO rules (user_id, page_id, object_id, match_words, reply_message, inbox_message, enabled) \
         VALUES (?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT (user_id, page_id, object_id) DO UPDATE SET \
            match_words = excluded.match_words, \
            reply_message = excluded.reply_message, \
            inbox_message = excluded.inbox_message, \
            enabled = excluded.enabled",
    )
    .bind(tenant.user_id)
    .bind(tenant.page_id.as_str())
    .bind(rule.object_id.as_str())
    .bind(words)
    .bind(rule.reply_message.as_str())
    .bind(rule.inbox_message.as_deref())
    .bind(rule.enabled)
    .execute(pool)
    .await?;
    Ok(())
}

fn rule_from_row(row: &SqliteRow) -> Result<Rule> {
    let object_id: String = row.get("object_id");
    let raw_words: Option<String> = row.try_get("match_words").ok().flatten();
    let words: Vec<String> = match raw_words.as_deref().map(str::trim) {
        None | Some("") => Vec::new(),
        Some(raw) => serde_json::from_str(raw)
            .with_context(|| format!("rule {object_id} has malformed match_words"))?,
    };
    let reply: String = row.try_get("reply_message").unwrap_or_default();
    let mut rule = Rule::new(object_id, words, reply);
    rule.inbox_message = row.try_get("inbox_message").ok().flatten();
    rule.enabled = row.try_get("enabled").unwrap_or(false);
    Ok(rule)
}

/// Rules for the tenant keyed by object id.
#[instrument(skip_all)]
pub async fn load_rules(
    pool: &Pool,
    tenant: &TenantKey,
    enabled_only: bool,
) -> Result<HashMap<String, Rule>> {
    let rows = sqlx::query(
        "SELECT object_id, match_words, reply_message, inbox_message, enabled \
         FROM rules WHERE user_id = ? AND page_id = ? AND (enabled = 1 OR ? = 0)",
    )
    .bind(tenant.user_id)
    .bind(tenant.page_id.as_str())
    .bind(enabled_only)
    .fetch_all(pool)
    .await?;

    let mut rules = HashMap::with_capacity(rows.len());
    for row in &rows {
        match rule_from_row(row) {
            Ok(rule) => {
                rules.insert(rule.object_id.clone(), rule);
            }
            Err(err) => {
                let object_id: String = row.try_get("object_id").unwrap_or_default();
                warn!(
                    ?err,
                    user_id = tenant.user_id,
                    page_id = %tenant.page_id,
                    %object_id,
                    "skipping rule with malformed keywords"
                );
            }
        }
    }
    Ok(rules)
}

#[instrument(skip_all)]
pub async fn insert_cycle_metric(
    pool: &Pool,
    tenant: &TenantKey,
    start_time: DateTime<Utc>,
    summary: &CycleSummary,
) -> Result<i64> {
    let id = sqlx::query_scalar::<_, i64>(
        "INSERT INTO monitoring_metrics (user_id, page_id, start_time, duration_seconds, \
                reels_scanned, reels_active, comments_scanned, replies_sent, inbox_sent, api_calls) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(tenant.user_id)
    .bind(tenant.page_id.as_str())
    .bind(start_time)
    .bind(summary.duration_seconds)
    .bind(to_i64(summary.reels_scanned))
    .bind(to_i64(summary.reels_with_enabled_rule))
    .bind(to_i64(summary.comments_scanned))
    .bind(to_i64(summary.replies_sent))
    .bind(to_i64(summary.inbox_sent))
    .bind(to_i64(summary.api_calls))
    .fetch_one(pool)
    .await?;
    Ok(id)
}

/// Most recent cycles first.
#[instrument(skip_all)]
pub async fn recent_cycle_metrics(
    pool: &Pool,
    filter: &MetricsFilter,
    limit: i64,
) -> Result<Vec<CycleMetricRow>> {
    let rows = sqlx::query(
        "SELECT id, user_id, page_id, start_time, duration_seconds, reels_scanned, reels_active, \
                comments_scanned, replies_sent, inbox_sent, api_calls \
         FROM monitoring_metrics \
         WHERE (? IS NULL OR user_id = ?) AND (? IS NULL OR page_id = ?) \
         ORDER BY id DESC LIMIT ?",
    )
    .bind(filter.user_id)
    .bind(filter.user_id)
    .bind(filter.page_id.as_deref())
    .bind(filter.page_id.as_deref())
    .bind(limit.max(0))
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| -> Result<CycleMetricRow> {
            Ok(CycleMetricRow {
                id: row.try_get("id")?,
                user_id: row.try_get("user_id")?,
                page_id: row.try_get("page_id")?,
                start_time: row.try_get("start_time")?,
                duration_seconds: row.try_get("duration_seconds")?,
                reels_scanned: row.try_get("reels_scanned")?,
                reels_active: row.try_get("reels_active")?,
                comments_scanned: row.try_get("comments_scanned")?,
                replies_sent: row.try_get("replies_sent")?,
                inbox_sent: row.try_get("inbox_sent")?,
                api_calls: row.try_get("api_calls")?,
            })
        })
        .collect()
}

#[instrument(skip_all)]
pub async fn aggregate_cycle_metrics(pool: &Pool, filter: &MetricsFilter) -> Result<MetricsAggregate> {
    let row = sqlx::query(
        "SELECT COUNT(id) AS row_count, \
                COALESCE(SUM(comments_scanned), 0) AS comments_scanned, \
                COALESCE(SUM(replies_sent), 0) AS replies_sent, \
                COALESCE(SUM(inbox_sent), 0) AS inbox_sent, \
                COALESCE(SUM(api_calls), 0) AS api_calls \
         FROM monitoring_metrics \
         WHERE (? IS NULL OR user_id = ?) AND (? IS NULL OR page_id = ?)",
    )
    .bind(filter.user_id)
    .bind(filter.user_id)
    .bind(filter.page_id.as_deref())
    .bind(filter.page_id.as_deref())
    .fetch_one(pool)
    .await?;

    let reels_active: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM rules WHERE enabled = 1 \
         AND (? IS NULL OR user_id = ?) AND (? IS NULL OR page_id = ?)",
    )
    .bind(filter.user_id)
    .bind(filter.user_id)
    .bind(filter.page_id.as_deref())
    .bind(filter.page_id.as_deref())
    .fetch_one(pool)
    .await?;

    Ok(MetricsAggregate {
        rows: row.try_get("row_count")?,
        reels_active,
        comments_scanned: row.try_get("comments_scanned")?,
        replies_sent: row.try_get("replies_sent")?,
        inbox_sent: row.try_get("inbox_sent")?,
        api_calls: row.try_get("api_calls")?,
    })
}

/// Returns the number of deleted rows.
#[instrument(skip_all)]
pub async fn delete_cycle_metrics(pool: &Pool, filter: &MetricsFilter) -> Result<u64> {
    let res = sqlx::query(
        "DELETE FROM monitoring_metrics \
         WHERE (? IS NULL OR user_id = ?) AND (? IS NULL OR page_id = ?)",
    )
    .bind(filter.user_id)
    .bind(filter.user_id)
    .bind(filter.page_id.as_deref())
    .bind(filter.page_id.as_deref())
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}

const TRIGGER_COLUMNS: &str =
    "id, user_id, page_id, requested_at, started_at, finished_at, summary, error";

fn trigger_from_row(row: &SqliteRow) -> Result<TriggerRequest> {
    let id: i64 = row.try_get("id")?;
    let summary = match row.try_get::<Option<String>, _>("summary")? {
        Some(raw) => Some(
            serde_json::from_str::<CycleSummary>(&raw)
                .with_context(|| format!("trigger request {id} has a malformed summary"))?,
        ),
        None => None,
    };
    Ok(TriggerRequest {
        id,
        user_id: row.try_get("user_id")?,
        page_id: row.try_get("page_id")?,
        requested_at: row.try_get("requested_at")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        summary,
        error: row.try_get("error")?,
    })
}

/// Queue a manual cycle for the daemon. Returns the request id.
#[instrument(skip_all)]
pub async fn enqueue_trigger(pool: &Pool, tenant: &TenantKey) -> Result<i64> {
    let id = sqlx::query_scalar::<_, i64>(
        "INSERT INTO trigger_requests (user_id, page_id, requested_at) VALUES (?, ?, ?) RETURNING id",
    )
    .bind(tenant.user_id)
    .bind(tenant.page_id.as_str())
    .bind(Utc::now())
    .fetch_one(pool)
    .await?;
    Ok(id)
}

/// Mark every pending request as started and return them, oldest first.
#[instrument(skip_all)]
pub async fn claim_triggers(pool: &Pool) -> Result<Vec<TriggerRequest>> {
    let rows = sqlx::query(&format!(
        "UPDATE trigger_requests SET started_at = ? WHERE started_at IS NULL RETURNING {TRIGGER_COLUMNS}"
    ))
    .bind(Utc::now())
    .fetch_all(pool)
    .await?;
    let mut requests = rows.iter().map(trigger_from_row).collect::<Result<Vec<_>>>()?;
    requests.sort_by_key(|r| r.id);
    Ok(requests)
}

#[instrument(skip_all)]
pub async fn finish_trigger(
    pool: &Pool,
    id: i64,
    outcome: std::result::Result<&CycleSummary, &str>,
) -> Result<()> {
    let (summary, error) = match outcome {
        Ok(summary) => (Some(serde_json::to_string(summary)?), None),
        Err(message) => (None, Some(message)),
    };
    sqlx::query("UPDATE trigger_requests SET finished_at = ?, summary = ?, error = ? WHERE id = ?")
        .bind(Utc::now())
        .bind(summary)
        .bind(error)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn load_trigger(pool: &Pool, id: i64) -> Result<Option<TriggerRequest>> {
    let row = sqlx::query(&format!("SELECT {TRIGGER_COLUMNS} FROM trigger_requests WHERE id = ?"))
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(trigger_from_row).transpose()
}

/// Put requests claimed by a daemon that never finished them back in the
/// queue. Returns how many were requeued.
#[instrument(skip_all)]
pub async fn requeue_unfinished_triggers(pool: &Pool) -> Result<u64> {
    let res = sqlx::query(
        "UPDATE trigger_requests SET started_at = NULL \
         WHERE started_at IS NOT NULL AND finished_at IS NULL",
    )
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}

fn to_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}
