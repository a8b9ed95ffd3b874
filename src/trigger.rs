//! Manual cycle requests handed to the daemon through the database.
//!
//! `reelctl trigger` only enqueues; the daemon claims pending requests and
//! runs them through its own [`Scheduler::trigger_now`], so a manual cycle
//! shares the tenant's lock and dedup cache with the timer cycles.

use anyhow::{Context, Result};
use futures::future::join_all;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, instrument, warn};

use crate::db::{self, TriggerRequest};
use crate::model::TenantKey;
use crate::scheduler::Scheduler;

#[derive(Debug, Clone)]
pub struct TriggerQueue {
    pool: db::Pool,
}

impl TriggerQueue {
    pub fn new(pool: db::Pool) -> Self {
        Self { pool }
    }

    pub async fn request(&self, tenant: &TenantKey) -> Result<i64> {
        let id = db::enqueue_trigger(&self.pool, tenant).await?;
        info!(id, user_id = tenant.user_id, page_id = %tenant.page_id, "manual cycle queued");
        Ok(id)
    }

    /// Run every pending request on `scheduler`. Returns how many ran.
    #[instrument(skip_all)]
    pub async fn drain(&self, scheduler: &Scheduler) -> Result<usize> {
        let requests = db::claim_triggers(&self.pool).await?;
        join_all(requests.iter().map(|r| self.run(scheduler, r))).await;
        Ok(requests.len())
    }

    async fn run(&self, scheduler: &Scheduler, request: &TriggerRequest) {
        let tenant = request.tenant();
        let outcome = scheduler.trigger_now(&tenant).await;
        let stored = match &outcome {
            Ok(summary) => {
                info!(id = request.id, user_id = tenant.user_id, page_id = %tenant.page_id, replies = summary.replies_sent, "manual cycle finished");
                db::finish_trigger(&self.pool, request.id, Ok(summary)).await
            }
            Err(err) => {
                warn!(id = request.id, user_id = tenant.user_id, page_id = %tenant.page_id, %err, "manual cycle failed");
                db::finish_trigger(&self.pool, request.id, Err(&err.to_string())).await
            }
        };
        if let Err(err) = stored {
            warn!(?err, id = request.id, "failed to record manual cycle result");
        }
    }

    /// Poll until request `id` finishes. `None` means `timeout` passed first;
    /// the request stays queued.
    pub async fn wait(&self, id: i64, poll: Duration, timeout: Duration) -> Result<Option<TriggerRequest>> {
        let deadline = Instant::now() + timeout;
        loop {
            let request = db::load_trigger(&self.pool, id)
                .await?
                .with_context(|| format!("trigger request {id} not found"))?;
            if request.is_finished() {
                return Ok(Some(request));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(poll).await;
        }
    }
}
