use anyhow::{bail, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

use reel_watchbot::config;
use reel_watchbot::db::{self, MetricsFilter, SqliteStore};
use reel_watchbot::model::{Rule, TenantKey};
use reel_watchbot::store::TenantStore;
use reel_watchbot::trigger::TriggerQueue;

#[derive(Debug, Parser)]
#[command(author, version, about = "Administer reel monitoring tenants")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, ClapArgs)]
struct Target {
    /// Numeric user id
    #[arg(long)]
    user: i64,

    /// Page id; blank means the default page
    #[arg(long, default_value = "")]
    page: String,
}

impl Target {
    fn tenant(&self) -> TenantKey {
        TenantKey::new(self.user, self.page.as_str())
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create a user (or look it up) and print its id
    User {
        #[arg(long)]
        username: String,
    },
    /// Store the access token and remote page id of a tenant
    Credentials {
        #[command(flatten)]
        target: Target,
        #[arg(long)]
        token: String,
        #[arg(long)]
        graph_page: String,
        #[arg(long)]
        api_version: Option<String>,
    },
    /// Create or replace the rule for one reel
    Rule {
        #[command(flatten)]
        target: Target,
        /// Reel id the rule applies to
        #[arg(long)]
        object: String,
        /// Comma separated keywords; "." matches every comment
        #[arg(long, value_delimiter = ',')]
        words: Vec<String>,
        #[arg(long)]
        reply: String,
        #[arg(long)]
        inbox: Option<String>,
        #[arg(long)]
        disabled: bool,
    },
    /// Print the stored configuration of a tenant
    Status {
        #[command(flatten)]
        target: Target,
    },
    Enable {
        #[command(flatten)]
        target: Target,
    },
    Disable {
        #[command(flatten)]
        target: Target,
    },
    /// Set the polling interval of a tenant
    Interval {
        #[command(flatten)]
        target: Target,
        #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
        seconds: u64,
    },
    /// Ask the daemon to run one cycle now, ignoring the enabled flag
    Trigger {
        #[command(flatten)]
        target: Target,
        /// Seconds to wait for the daemon; 0 only queues the request
        #[arg(long, default_value = "300")]
        wait: u64,
    },
    /// Show persisted cycle metrics
    Metrics {
        #[arg(long)]
        user: Option<i64>,
        #[arg(long)]
        page: Option<String>,
        #[arg(long, default_value = "20")]
        limit: i64,
        /// Delete the matching rows instead of listing them
        #[arg(long)]
        purge: bool,
    },
}

#[derive(Debug, Serialize)]
struct StoredStatus {
    tenant: TenantKey,
    enabled: bool,
    interval_seconds: u64,
    has_credentials: bool,
    enabled_rules: usize,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn set_enabled(store: &SqliteStore, target: &Target, enabled: bool) -> Result<()> {
    let tenant = target.tenant();
    store.provider(&tenant).set_enabled(enabled).await?;
    print_json(&serde_json::json!({ "tenant": tenant, "enabled": enabled }))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;
    let store = SqliteStore::new(pool.clone());
    let default_interval = cfg.scheduler.default_interval_seconds;

    match args.command {
        Command::User { username } => {
            let id = db::get_or_create_user(&pool, &username).await?;
            print_json(&serde_json::json!({ "id": id, "username": username }))?;
        }
        Command::Credentials {
            target,
            token,
            graph_page,
            api_version,
        } => {
            let tenant = target.tenant();
            let mut settings = db::load_page_settings(&pool, &tenant)
                .await?
                .unwrap_or_default();
            settings.access_token = Some(token);
            settings.graph_page_id = Some(graph_page);
            if api_version.is_some() {
                settings.api_version = api_version;
            }
            db::upsert_page_settings(&pool, &tenant, &settings).await?;
            print_json(&tenant)?;
        }
        Command::Rule {
            target,
            object,
            words,
            reply,
            inbox,
            disabled,
        } => {
            let tenant = target.tenant();
            let mut rule = Rule::new(object, words, reply);
            if let Some(inbox) = inbox {
                rule = rule.with_inbox(inbox);
            }
            if disabled {
                rule = rule.disabled();
            }
            db::upsert_rule(&pool, &tenant, &rule).await?;
            print_json(&rule)?;
        }
        Command::Status { target } => {
            let tenant = target.tenant();
            let provider = store.provider(&tenant);
            let settings = provider.load_settings().await?;
            let status = StoredStatus {
                enabled: settings.monitoring_enabled,
                interval_seconds: settings.interval_seconds.unwrap_or(default_interval),
                has_credentials: settings.credentials(&tenant).is_ok(),
                enabled_rules: provider.load_enabled_rules().await?.len(),
                tenant,
            };
            print_json(&status)?;
        }
        Command::Enable { target } => set_enabled(&store, &target, true).await?,
        Command::Disable { target } => set_enabled(&store, &target, false).await?,
        Command::Interval { target, seconds } => {
            let tenant = target.tenant();
            store.provider(&tenant).set_interval_seconds(seconds).await?;
            print_json(&serde_json::json!({ "tenant": tenant, "interval_seconds": seconds }))?;
        }
        Command::Trigger { target, wait } => {
            let tenant = target.tenant();
            let queue = TriggerQueue::new(pool.clone());
            let id = queue.request(&tenant).await?;
            if wait == 0 {
                print_json(&serde_json::json!({ "id": id, "tenant": tenant, "queued": true }))?;
                return Ok(());
            }
            let poll = Duration::from_secs(cfg.scheduler.trigger_poll_seconds.max(1));
            let Some(request) = queue.wait(id, poll, Duration::from_secs(wait)).await? else {
                bail!("request {id} for {tenant} still pending after {wait}s; is the daemon running?");
            };
            print_json(&request)?;
            if let Some(err) = &request.error {
                bail!("cycle failed for {tenant}: {err}");
            }
        }
        Command::Metrics {
            user,
            page,
            limit,
            purge,
        } => {
            let filter = MetricsFilter {
                user_id: user,
                page_id: page,
            };
            if purge {
                let deleted = db::delete_cycle_metrics(&pool, &filter).await?;
                print_json(&serde_json::json!({ "deleted": deleted }))?;
            } else {
                let recent = db::recent_cycle_metrics(&pool, &filter, limit).await?;
                let totals = db::aggregate_cycle_metrics(&pool, &filter).await?;
                print_json(&serde_json::json!({ "totals": totals, "recent": recent }))?;
            }
        }
    }
    Ok(())
}
