use std::time::Duration;
use thiserror::Error;

use crate::model::TenantKey;
use crate::source::SourceError;

/// Errors that end a monitoring cycle as a whole. Per-comment and per-reel
/// failures never surface here; they are counted in the cycle summary.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("{tenant} is not configured: {reason}")]
    Config {
        tenant: TenantKey,
        reason: &'static str,
    },
    #[error("failed to list reels: {0}")]
    ReelFetch(#[source] SourceError),
    #[error("storage error: {0:#}")]
    Store(#[from] anyhow::Error),
    #[error("cycle exceeded {0:?}")]
    TimedOut(Duration),
    #[error("scheduler is shut down")]
    ShuttingDown,
}

impl CycleError {
    pub fn config(tenant: &TenantKey, reason: &'static str) -> Self {
        CycleError::Config {
            tenant: tenant.clone(),
            reason,
        }
    }

    pub fn is_config(&self) -> bool {
        matches!(self, CycleError::Config { .. })
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("interval must be at least 1 second, got {0}")]
    InvalidInterval(u64),
    #[error("storage error: {0:#}")]
    Store(#[from] anyhow::Error),
    #[error(transparent)]
    Cycle(#[from] CycleError),
}
