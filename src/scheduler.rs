//! Per-tenant recurring monitoring jobs.
//!
//! Each scheduled tenant owns one timer task on the shared runtime. A tick
//! hands the cycle to a bounded worker pool. A tenant never has two cycles
//! in flight: ticks that arrive while one is running are coalesced, and
//! manual triggers wait for it.

use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{CycleError, SchedulerError};
use crate::metrics::MetricsSink;
use crate::model::{CycleSummary, MonitoringJob, TenantKey, TenantStatus};
use crate::monitor::{CycleExecutor, MonitorOptions};
use crate::source::SourceFactory;
use crate::store::TenantStore;

pub const DEFAULT_INTERVAL_SECONDS: u64 = 300;

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub default_interval_seconds: u64,
    /// Ticks delayed beyond this are dropped instead of run late.
    pub misfire_grace: Duration,
    pub max_concurrent_cycles: usize,
    /// Hard limit for a whole cycle; unset means no limit.
    pub cycle_timeout: Option<Duration>,
    pub monitor: MonitorOptions,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            default_interval_seconds: DEFAULT_INTERVAL_SECONDS,
            misfire_grace: Duration::from_secs(30),
            max_concurrent_cycles: 8,
            cycle_timeout: None,
            monitor: MonitorOptions::default(),
        }
    }
}

impl From<&Config> for SchedulerOptions {
    fn from(cfg: &Config) -> Self {
        Self {
            default_interval_seconds: cfg.scheduler.default_interval_seconds,
            misfire_grace: cfg.scheduler.misfire_grace(),
            max_concurrent_cycles: cfg.scheduler.max_concurrent_cycles,
            cycle_timeout: cfg.scheduler.cycle_timeout(),
            monitor: MonitorOptions::from(&cfg.monitor),
        }
    }
}

/// Collaborators injected into the scheduler.
#[derive(Clone)]
pub struct SchedulerDeps {
    pub store: Arc<dyn TenantStore>,
    pub sources: Arc<dyn SourceFactory>,
    pub metrics: Arc<dyn MetricsSink>,
}

/// Cloneable handle to the job registry.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

struct Inner {
    deps: SchedulerDeps,
    options: SchedulerOptions,
    workers: Arc<Semaphore>,
    jobs: Mutex<HashMap<TenantKey, JobEntry>>,
    slots: Mutex<HashMap<TenantKey, Arc<TenantSlot>>>,
    closed: AtomicBool,
}

struct JobEntry {
    interval_seconds: u64,
    timer: JoinHandle<()>,
}

/// Per-tenant execution state. Outlives job removal so the dedup cache
/// survives a disable/enable round trip.
struct TenantSlot {
    executor: Arc<AsyncMutex<CycleExecutor>>,
    running: AtomicBool,
    record: Mutex<RunRecord>,
}

#[derive(Default)]
struct RunRecord {
    last_run: Option<chrono::DateTime<chrono::Utc>>,
    last_summary: Option<CycleSummary>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Timer,
    Manual,
}

impl Trigger {
    fn as_str(&self) -> &'static str {
        match self {
            Trigger::Timer => "timer",
            Trigger::Manual => "manual",
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn validate_interval(seconds: u64) -> Result<u64, SchedulerError> {
    if seconds == 0 {
        return Err(SchedulerError::InvalidInterval(seconds));
    }
    Ok(seconds)
}

impl Scheduler {
    pub fn new(deps: SchedulerDeps, options: SchedulerOptions) -> Self {
        let workers = Arc::new(Semaphore::new(options.max_concurrent_cycles.max(1)));
        Self {
            inner: Arc::new(Inner {
                deps,
                options,
                workers,
                jobs: Mutex::new(HashMap::new()),
                slots: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn options(&self) -> &SchedulerOptions {
        &self.inner.options
    }

    /// Install a timer for `tenant`, replacing any existing one.
    pub fn schedule(&self, tenant: &TenantKey, interval_seconds: u64) -> Result<(), SchedulerError> {
        let interval = validate_interval(interval_seconds)?;
        self.inner.ensure_open()?;
        self.inner.install(tenant, interval);
        Ok(())
    }

    /// Change the interval of a tenant's job. A disabled tenant ends up
    /// without a job.
    pub async fn reschedule(
        &self,
        tenant: &TenantKey,
        interval_seconds: u64,
    ) -> Result<Option<u64>, SchedulerError> {
        let interval = validate_interval(interval_seconds)?;
        self.inner.ensure_open()?;
        let provider = self.inner.deps.store.provider(tenant);
        match provider.is_monitoring_enabled().await {
            Ok(false) => {
                info!(user_id = tenant.user_id, page_id = %tenant.page_id, "monitoring disabled; not scheduling job");
                self.inner.uninstall(tenant);
                Ok(None)
            }
            Ok(true) => {
                self.inner.install(tenant, interval);
                Ok(Some(interval))
            }
            Err(err) => {
                warn!(?err, user_id = tenant.user_id, page_id = %tenant.page_id, "could not read enabled flag; scheduling anyway");
                self.inner.install(tenant, interval);
                Ok(Some(interval))
            }
        }
    }

    /// Reconcile a tenant's job with its stored configuration. Returns the
    /// interval of the job afterwards, if one is scheduled.
    pub async fn refresh(&self, tenant: &TenantKey) -> Result<Option<u64>, SchedulerError> {
        self.inner.ensure_open()?;
        let default = self.inner.options.default_interval_seconds;
        let provider = self.inner.deps.store.provider(tenant);

        let wanted = async {
            if !provider.is_monitoring_enabled().await? {
                return Ok::<_, anyhow::Error>(None);
            }
            let interval = provider.interval_seconds(default).await?;
            Ok(Some(if interval == 0 { default } else { interval }))
        }
        .await;

        let current = self.inner.job_interval(tenant);
        match wanted {
            Ok(None) => {
                if self.inner.uninstall(tenant) {
                    info!(user_id = tenant.user_id, page_id = %tenant.page_id, "monitoring disabled; job removed");
                }
                Ok(None)
            }
            Ok(Some(interval)) if current == Some(interval) => Ok(current),
            Ok(Some(interval)) => {
                self.inner.install(tenant, interval);
                Ok(Some(interval))
            }
            Err(err) => {
                warn!(?err, user_id = tenant.user_id, page_id = %tenant.page_id, "could not read tenant configuration");
                if current.is_some() {
                    return Ok(current);
                }
                self.inner.install(tenant, default);
                Ok(Some(default))
            }
        }
    }

    /// Drop a tenant's timer. Returns whether one existed.
    pub fn remove(&self, tenant: &TenantKey) -> bool {
        self.inner.uninstall(tenant)
    }

    /// Schedule every known tenant according to its configuration.
    pub async fn start(&self) -> Result<usize, SchedulerError> {
        let scheduled = self.resync().await?;
        if scheduled == 0 {
            info!("no enabled tenants; scheduler idle");
        }
        Ok(scheduled)
    }

    /// Refresh every known tenant and remove jobs of tenants that no longer
    /// exist. Returns the number of scheduled jobs.
    pub async fn resync(&self) -> Result<usize, SchedulerError> {
        self.inner.ensure_open()?;
        let tenants = self.inner.deps.store.list_tenants().await?;
        let known: HashSet<TenantKey> = tenants.iter().cloned().collect();

        let stale: Vec<TenantKey> = lock(&self.inner.jobs)
            .keys()
            .filter(|t| !known.contains(*t))
            .cloned()
            .collect();
        for tenant in &stale {
            self.inner.uninstall(tenant);
        }

        let results = join_all(tenants.iter().map(|t| self.refresh(t))).await;
        for (tenant, result) in tenants.iter().zip(results) {
            if let Err(err) = result {
                warn!(%err, user_id = tenant.user_id, page_id = %tenant.page_id, "failed to refresh tenant");
            }
        }
        Ok(lock(&self.inner.jobs).len())
    }

    /// Stop all timers. Queued cycles are not started; running ones are
    /// left to finish on their own.
    pub fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.workers.close();
        let mut jobs = lock(&self.inner.jobs);
        for (_, job) in jobs.drain() {
            job.timer.abort();
        }
        drop(jobs);
        self.inner.deps.metrics.set_jobs_scheduled(0);
        info!("monitoring scheduler shut down");
    }

    /// Run a cycle right away, regardless of the enabled flag. Waits for
    /// an in-flight cycle of the same tenant to finish first.
    pub async fn trigger_now(&self, tenant: &TenantKey) -> Result<CycleSummary, SchedulerError> {
        self.inner.ensure_open()?;
        let slot = self.inner.slot(tenant);
        let guard = slot.executor.clone().lock_owned().await;
        let _permit = self
            .inner
            .workers
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| CycleError::ShuttingDown)?;
        let span = cycle_span(tenant, Trigger::Manual);
        let summary = self
            .inner
            .execute(tenant, guard, Trigger::Manual)
            .instrument(span)
            .await?;
        Ok(summary.unwrap_or_default())
    }

    pub async fn monitoring_enabled(&self, tenant: &TenantKey) -> Result<bool, SchedulerError> {
        Ok(self
            .inner
            .deps
            .store
            .provider(tenant)
            .is_monitoring_enabled()
            .await?)
    }

    /// Persist the flag and reconcile the tenant's job.
    pub async fn set_monitoring_enabled(
        &self,
        tenant: &TenantKey,
        enabled: bool,
    ) -> Result<Option<u64>, SchedulerError> {
        self.inner
            .deps
            .store
            .provider(tenant)
            .set_enabled(enabled)
            .await?;
        info!(user_id = tenant.user_id, page_id = %tenant.page_id, enabled, "monitoring flag updated");
        self.refresh(tenant).await
    }

    pub async fn interval_seconds(&self, tenant: &TenantKey) -> Result<u64, SchedulerError> {
        Ok(self
            .inner
            .deps
            .store
            .provider(tenant)
            .interval_seconds(self.inner.options.default_interval_seconds)
            .await?)
    }

    /// Persist the interval and apply it to the running job.
    pub async fn set_interval_seconds(
        &self,
        tenant: &TenantKey,
        seconds: u64,
    ) -> Result<Option<u64>, SchedulerError> {
        let seconds = validate_interval(seconds)?;
        self.inner
            .deps
            .store
            .provider(tenant)
            .set_interval_seconds(seconds)
            .await?;
        self.reschedule(tenant, seconds).await
    }

    pub async fn status(&self, tenant: &TenantKey) -> Result<TenantStatus, SchedulerError> {
        let enabled = self.monitoring_enabled(tenant).await?;
        let interval_seconds = self.interval_seconds(tenant).await?;
        let scheduled = self.inner.job_interval(tenant).is_some();
        let slot = lock(&self.inner.slots).get(tenant).cloned();
        let (running, last_run, last_summary) = match slot {
            Some(slot) => {
                let record = lock(&slot.record);
                (
                    slot.running.load(Ordering::SeqCst),
                    record.last_run,
                    record.last_summary.clone(),
                )
            }
            None => (false, None, None),
        };
        Ok(TenantStatus {
            tenant: tenant.clone(),
            enabled,
            interval_seconds,
            scheduled,
            running,
            last_run,
            last_summary,
        })
    }

    /// Snapshots of all scheduled jobs, ordered by tenant. `enabled` is the
    /// stored flag; a job installed by [`Scheduler::schedule`] for a disabled
    /// tenant reports `false` and skips its ticks.
    pub async fn jobs(&self) -> Vec<MonitoringJob> {
        let mut intervals: Vec<(TenantKey, u64)> = lock(&self.inner.jobs)
            .iter()
            .map(|(t, j)| (t.clone(), j.interval_seconds))
            .collect();
        intervals.sort_by(|a, b| a.0.cmp(&b.0));

        let flags = join_all(intervals.iter().map(|(tenant, _)| async move {
            match self.inner.deps.store.provider(tenant).is_monitoring_enabled().await {
                Ok(enabled) => enabled,
                Err(err) => {
                    warn!(?err, user_id = tenant.user_id, page_id = %tenant.page_id, "could not read enabled flag");
                    true
                }
            }
        }))
        .await;

        let slots = lock(&self.inner.slots);
        intervals
            .into_iter()
            .zip(flags)
            .map(|((tenant, interval_seconds), enabled)| {
                let slot = slots.get(&tenant);
                MonitoringJob {
                    interval_seconds,
                    enabled,
                    last_run: slot.and_then(|s| lock(&s.record).last_run),
                    running: slot.is_some_and(|s| s.running.load(Ordering::SeqCst)),
                    tenant,
                }
            })
            .collect()
    }
}

/// Clears the running flag when the cycle ends, including when its future
/// is dropped mid-flight.
struct RunningGuard<'a>(&'a AtomicBool);

impl<'a> RunningGuard<'a> {
    fn set(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn cycle_span(tenant: &TenantKey, trigger: Trigger) -> tracing::Span {
    info_span!(
        "cycle",
        cycle_id = %Uuid::new_v4(),
        user_id = tenant.user_id,
        page_id = %tenant.page_id,
        trigger = trigger.as_str()
    )
}

impl Inner {
    fn ensure_open(&self) -> Result<(), CycleError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CycleError::ShuttingDown);
        }
        Ok(())
    }

    fn slot(&self, tenant: &TenantKey) -> Arc<TenantSlot> {
        lock(&self.slots)
            .entry(tenant.clone())
            .or_insert_with(|| {
                Arc::new(TenantSlot {
                    executor: Arc::new(AsyncMutex::new(CycleExecutor::new(
                        self.deps.metrics.clone(),
                        self.options.monitor.clone(),
                    ))),
                    running: AtomicBool::new(false),
                    record: Mutex::new(RunRecord::default()),
                })
            })
            .clone()
    }

    fn job_interval(&self, tenant: &TenantKey) -> Option<u64> {
        lock(&self.jobs).get(tenant).map(|j| j.interval_seconds)
    }

    fn install(self: &Arc<Self>, tenant: &TenantKey, interval_seconds: u64) {
        let mut jobs = lock(&self.jobs);
        if let Some(previous) = jobs.remove(tenant) {
            previous.timer.abort();
        }
        let timer = tokio::spawn(run_timer(
            Arc::downgrade(self),
            tenant.clone(),
            Duration::from_secs(interval_seconds),
        ));
        jobs.insert(
            tenant.clone(),
            JobEntry {
                interval_seconds,
                timer,
            },
        );
        let count = jobs.len();
        drop(jobs);
        self.deps.metrics.set_jobs_scheduled(count);
        info!(
            user_id = tenant.user_id,
            page_id = %tenant.page_id,
            interval_seconds,
            "monitoring job scheduled"
        );
    }

    fn uninstall(&self, tenant: &TenantKey) -> bool {
        let mut jobs = lock(&self.jobs);
        let removed = jobs.remove(tenant);
        let count = jobs.len();
        drop(jobs);
        match removed {
            Some(job) => {
                job.timer.abort();
                self.deps.metrics.set_jobs_scheduled(count);
                info!(user_id = tenant.user_id, page_id = %tenant.page_id, "monitoring job removed");
                true
            }
            None => false,
        }
    }

    /// Timer tick: start a cycle unless one is already in flight.
    fn fire(self: &Arc<Self>, tenant: &TenantKey) {
        let slot = self.slot(tenant);
        let Ok(guard) = slot.executor.clone().try_lock_owned() else {
            debug!(user_id = tenant.user_id, page_id = %tenant.page_id, "previous cycle still running; tick coalesced");
            return;
        };
        let inner = Arc::clone(self);
        let tenant = tenant.clone();
        let span = cycle_span(&tenant, Trigger::Timer);
        tokio::spawn(
            async move {
                let Ok(_permit) = inner.workers.clone().acquire_owned().await else {
                    debug!("worker pool closed; dropping cycle");
                    return;
                };
                match inner.execute(&tenant, guard, Trigger::Timer).await {
                    Ok(Some(_)) => {}
                    Ok(None) => debug!("monitoring disabled; skipped scheduled run"),
                    Err(err) if err.is_config() => warn!(%err, "skipping scheduled run"),
                    Err(err) => error!(%err, "scheduled monitoring cycle failed"),
                }
            }
            .instrument(span),
        );
    }

    /// Runs a cycle while holding the tenant's executor. `Ok(None)` means a
    /// timer-driven run found monitoring disabled.
    async fn execute(
        &self,
        tenant: &TenantKey,
        mut executor: OwnedMutexGuard<CycleExecutor>,
        trigger: Trigger,
    ) -> Result<Option<CycleSummary>, CycleError> {
        let slot = self.slot(tenant);
        let running = RunningGuard::set(&slot.running);
        let body = self.cycle_body(tenant, &mut executor, trigger);
        let result = match self.options.cycle_timeout {
            Some(limit) => tokio::time::timeout(limit, body)
                .await
                .unwrap_or(Err(CycleError::TimedOut(limit))),
            None => body.await,
        };
        drop(running);

        if let Ok(Some(summary)) = &result {
            let mut record = lock(&slot.record);
            record.last_run = Some(chrono::Utc::now());
            record.last_summary = Some(summary.clone());
        }
        result
    }

    async fn cycle_body(
        &self,
        tenant: &TenantKey,
        executor: &mut CycleExecutor,
        trigger: Trigger,
    ) -> Result<Option<CycleSummary>, CycleError> {
        let provider = self.deps.store.provider(tenant);
        if trigger == Trigger::Timer && !provider.is_monitoring_enabled().await? {
            return Ok(None);
        }
        let settings = provider.load_settings().await?;
        let source = self.deps.sources.build(tenant, &settings)?;
        let rules = provider.load_enabled_rules().await?;
        debug!(rules = rules.len(), "running monitoring cycle");
        let summary = executor.run_cycle(tenant, source.as_ref(), &rules).await?;
        Ok(Some(summary))
    }
}

async fn run_timer(inner: Weak<Inner>, tenant: TenantKey, period: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        let scheduled = ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let late = Instant::now().saturating_duration_since(scheduled);
        if late > inner.options.misfire_grace {
            warn!(
                user_id = tenant.user_id,
                page_id = %tenant.page_id,
                late_ms = late.as_millis() as u64,
                "tick missed its grace window; dropped"
            );
            continue;
        }
        inner.fire(&tenant);
    }
}
