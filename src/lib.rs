pub mod config;
pub mod db;
pub mod dedup;
pub mod error;
pub mod graph;
pub mod matcher;
pub mod metrics;
pub mod model;
pub mod monitor;
pub mod scheduler;
pub mod source;
pub mod store;
pub mod trigger;
