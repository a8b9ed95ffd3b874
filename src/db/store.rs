use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use super::repo::{self, Pool};
use crate::model::{Rule, TenantKey};
use crate::store::{ConfigProvider, TenantSettings, TenantStore};

/// Tenant directory backed by SQLite.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: Pool,
}

impl SqliteStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

#[async_trait]
impl TenantStore for SqliteStore {
    async fn list_tenants(&self) -> Result<Vec<TenantKey>> {
        repo::list_tenants(&self.pool).await
    }

    fn provider(&self, tenant: &TenantKey) -> Arc<dyn ConfigProvider> {
        Arc::new(SqliteTenantConfig {
            pool: self.pool.clone(),
            tenant: tenant.clone(),
        })
    }
}

/// Configuration of a single tenant, read on every call.
#[derive(Debug, Clone)]
pub struct SqliteTenantConfig {
    pool: Pool,
    tenant: TenantKey,
}

#[async_trait]
impl ConfigProvider for SqliteTenantConfig {
    async fn is_monitoring_enabled(&self) -> Result<bool> {
        Ok(self.load_settings().await?.monitoring_enabled)
    }

    async fn interval_seconds(&self, default: u64) -> Result<u64> {
        Ok(self
            .load_settings()
            .await?
            .interval_seconds
            .unwrap_or(default))
    }

    async fn set_enabled(&self, enabled: bool) -> Result<()> {
        repo::set_monitoring_enabled(&self.pool, &self.tenant, enabled).await
    }

    async fn set_interval_seconds(&self, seconds: u64) -> Result<()> {
        repo::set_interval_seconds(&self.pool, &self.tenant, seconds).await
    }

    async fn load_settings(&self) -> Result<TenantSettings> {
        Ok(repo::load_page_settings(&self.pool, &self.tenant)
            .await?
            .unwrap_or_default())
    }

    async fn load_enabled_rules(&self) -> Result<HashMap<String, Rule>> {
        repo::load_rules(&self.pool, &self.tenant, true).await
    }
}
