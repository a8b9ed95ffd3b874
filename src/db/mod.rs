//! Database module: row models, SQL repositories and the store adapters.
//!
//! This module is split into three submodules:
//! - `model`: row and view models returned by repositories.
//! - `repo`: SQL-only functions that map rows into entities.
//! - `store`: `TenantStore`/`ConfigProvider` implementations over the pool.
//!
//! External modules should import from `reel_watchbot::db`; the repository
//! API and commonly used models are re-exported here.

pub mod model;
pub mod repo;
pub mod store;

pub use repo::*;

pub use model::{CycleMetricRow, MetricsAggregate, MetricsFilter, TriggerRequest};
pub use store::{SqliteStore, SqliteTenantConfig};
