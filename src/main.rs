use anyhow::Result;
use clap::Parser;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use reel_watchbot::config;
use reel_watchbot::db;
use reel_watchbot::graph::GraphSourceFactory;
use reel_watchbot::metrics::{MetricsFanout, MetricsRegistry, MetricsSink, SqliteMetricsSink};
use reel_watchbot::scheduler::{Scheduler, SchedulerDeps, SchedulerOptions};
use reel_watchbot::trigger::TriggerQueue;

#[derive(Debug, Parser)]
#[command(author, version, about = "Watch reel comments and reply according to per-page rules")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

/// Run `task` every `seconds`, first after one period. 0 disables it.
fn spawn_every<F, Fut>(seconds: u64, mut task: F) -> Option<JoinHandle<()>>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    (seconds > 0).then(|| {
        tokio::spawn(async move {
            let period = Duration::from_secs(seconds);
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                task().await;
            }
        })
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let registry = Arc::new(MetricsRegistry::new());
    let metrics: Arc<dyn MetricsSink> = Arc::new(MetricsFanout::new(vec![
        registry.clone() as Arc<dyn MetricsSink>,
        Arc::new(SqliteMetricsSink::new(pool.clone())),
    ]));
    let deps = SchedulerDeps {
        store: Arc::new(db::SqliteStore::new(pool.clone())),
        sources: Arc::new(GraphSourceFactory::from_config(&cfg.graph)?),
        metrics,
    };
    let scheduler = Scheduler::new(deps, SchedulerOptions::from(&cfg));

    let triggers = TriggerQueue::new(pool.clone());
    let requeued = db::requeue_unfinished_triggers(&pool).await?;
    if requeued > 0 {
        info!(requeued, "requeued unfinished manual cycles");
    }

    let scheduled = scheduler.start().await?;
    info!(scheduled, "monitoring scheduler started");

    let mut tasks = Vec::new();

    // Picks up tenants and settings changed by other processes.
    tasks.extend(spawn_every(cfg.scheduler.resync_seconds, {
        let scheduler = scheduler.clone();
        move || {
            let scheduler = scheduler.clone();
            async move {
                match scheduler.resync().await {
                    Ok(jobs) => info!(jobs, "resynced monitoring jobs"),
                    Err(err) => warn!(%err, "failed to resync monitoring jobs"),
                }
            }
        }
    }));

    tasks.extend(spawn_every(cfg.scheduler.trigger_poll_seconds, {
        let scheduler = scheduler.clone();
        let triggers = triggers.clone();
        move || {
            let scheduler = scheduler.clone();
            let triggers = triggers.clone();
            async move {
                if let Err(err) = triggers.drain(&scheduler).await {
                    warn!(?err, "failed to drain manual cycle requests");
                }
            }
        }
    }));

    let metrics_path = cfg.metrics_path();
    tasks.extend(spawn_every(cfg.app.metrics_flush_seconds, {
        let registry = registry.clone();
        let path = metrics_path.clone();
        move || {
            let registry = registry.clone();
            let path = path.clone();
            async move {
                if let Err(err) = registry.write_to(&path).await {
                    warn!(?err, path = %path.display(), "failed to write metrics file");
                }
            }
        }
    }));

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(?err, "failed to listen for shutdown signal");
    }
    info!("shutting down");
    for task in tasks {
        task.abort();
    }
    scheduler.shutdown();
    if cfg.app.metrics_flush_seconds > 0 {
        if let Err(err) = registry.write_to(&metrics_path).await {
            warn!(?err, path = %metrics_path.display(), "failed to write metrics file");
        }
    }
    Ok(())
}
