//! Capability interfaces for persisted tenant configuration.
//!
//! Storage values are typed at this boundary; business logic never sees
//! raw column strings.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::CycleError;
use crate::model::{Rule, TenantKey};

pub const DEFAULT_REELS_LIMIT: u32 = 25;
pub const DEFAULT_COMMENTS_LIMIT: u32 = 100;
pub const DEFAULT_REPLIES_LIMIT: u32 = 100;

/// Per-tenant settings. Absent values are `None` and resolved by callers
/// against process defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantSettings {
    pub access_token: Option<String>,
    /// Remote page id the tenant acts as.
    pub graph_page_id: Option<String>,
    pub api_version: Option<String>,
    pub reels_limit: Option<u32>,
    pub comments_limit: Option<u32>,
    pub replies_limit: Option<u32>,
    pub monitoring_enabled: bool,
    pub interval_seconds: Option<u64>,
}

/// Credentials required before any remote call is made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_token: String,
    pub page_id: String,
}

impl TenantSettings {
    pub fn credentials(&self, tenant: &TenantKey) -> Result<Credentials, CycleError> {
        let access_token = non_blank(self.access_token.as_deref())
            .ok_or_else(|| CycleError::config(tenant, "missing access token"))?;
        let page_id = non_blank(self.graph_page_id.as_deref())
            .ok_or_else(|| CycleError::config(tenant, "missing page id"))?;
        Ok(Credentials {
            access_token: access_token.to_string(),
            page_id: page_id.to_string(),
        })
    }

    pub fn reels_limit(&self) -> u32 {
        self.reels_limit.unwrap_or(DEFAULT_REELS_LIMIT)
    }

    pub fn comments_limit(&self) -> u32 {
        self.comments_limit.unwrap_or(DEFAULT_COMMENTS_LIMIT)
    }

    pub fn replies_limit(&self) -> u32 {
        self.replies_limit.unwrap_or(DEFAULT_REPLIES_LIMIT)
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Configuration of one tenant.
#[async_trait]
pub trait ConfigProvider: Send + Sync {
    async fn is_monitoring_enabled(&self) -> Result<bool>;

    async fn interval_seconds(&self, default: u64) -> Result<u64>;

    async fn set_enabled(&self, enabled: bool) -> Result<()>;

    async fn set_interval_seconds(&self, seconds: u64) -> Result<()>;

    async fn load_settings(&self) -> Result<TenantSettings>;

    /// Enabled rules keyed by the object id they monitor.
    async fn load_enabled_rules(&self) -> Result<HashMap<String, Rule>>;
}

/// Directory of all known tenants.
#[async_trait]
pub trait TenantStore: Send + Sync {
    async fn list_tenants(&self) -> Result<Vec<TenantKey>>;

    fn provider(&self, tenant: &TenantKey) -> Arc<dyn ConfigProvider>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_require_token_and_page() {
        let tenant = TenantKey::new(1, "p");
        let mut settings = TenantSettings::default();
        let err = settings.credentials(&tenant).unwrap_err();
        assert!(err.to_string().contains("access token"));

        settings.access_token = Some("tok".into());
        settings.graph_page_id = Some("  ".into());
        let err = settings.credentials(&tenant).unwrap_err();
        assert!(err.is_config());
        assert!(err.to_string().contains("page id"));

        settings.graph_page_id = Some("1234".into());
        let creds = settings.credentials(&tenant).unwrap();
        assert_eq!(creds.page_id, "1234");
    }

    #[test]
    fn limits_default_when_unset() {
        let settings = TenantSettings {
            comments_limit: Some(10),
            ..Default::default()
        };
        assert_eq!(settings.reels_limit(), DEFAULT_REELS_LIMIT);
        assert_eq!(settings.comments_limit(), 10);
        assert_eq!(settings.replies_limit(), DEFAULT_REPLIES_LIMIT);
    }
}
