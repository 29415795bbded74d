pub mod health;

use std::sync::Arc;

use anyhow::{Context, Result};
use clickhouse_rs::Pool;

use crate::config::ClickHouseStoreConfig;
use crate::store::ClickHouseStateStore;

use self::health::HealthMetrics;

/// Manages the ClickHouse native TCP connection pool of the state store.
///
/// LZ4 compression, pool of 2 to 5 connections.
pub struct ClickHouseConnection {
    cfg: ClickHouseStoreConfig,
    pool: Option<Pool>,
}

impl ClickHouseConnection {
    pub fn new(cfg: ClickHouseStoreConfig) -> Self {
        Self { cfg, pool: None }
    }

    /// Opens the connection pool and verifies connectivity with a ping.
    pub async fn start(&mut self) -> Result<()> {
        let dsn = self.build_dsn();
        let pool = Pool::new(dsn);

        let mut handle = pool
            .get_handle()
            .await
            .context("opening ClickHouse connection")?;

        handle.ping().await.context("pinging ClickHouse")?;

        tracing::info!(endpoint = %self.cfg.endpoint, "ClickHouse state store connected");

        self.pool = Some(pool);

        Ok(())
    }

    /// Returns the connection pool, if started.
    pub fn pool(&self) -> Option<&Pool> {
        self.pool.as_ref()
    }

    pub fn config(&self) -> &ClickHouseStoreConfig {
        &self.cfg
    }

    /// Builds the slot state store over the open pool.
    pub fn state_store(&self, health: Option<Arc<HealthMetrics>>) -> Result<ClickHouseStateStore> {
        let pool = self
            .pool
            .clone()
            .context("ClickHouse connection not started")?;
        Ok(ClickHouseStateStore::new(
            pool,
            self.cfg.database.clone(),
            self.cfg.table.clone(),
            health,
        ))
    }

    /// Closes the connection pool.
    pub async fn stop(&mut self) -> Result<()> {
        self.pool.take();
        Ok(())
    }

    /// Builds a clickhouse-rs compatible TCP DSN from configuration.
    ///
    /// Format: `tcp://[user[:pass]@]host:port/database?options`
    fn build_dsn(&self) -> String {
        let mut dsn = "tcp://".to_string();

        if !self.cfg.username.is_empty() {
            dsn.push_str(&self.cfg.username);
            if !self.cfg.password.is_empty() {
                dsn.push(':');
                dsn.push_str(&self.cfg.password);
            }
            dsn.push('@');
        }

        dsn.push_str(&self.cfg.endpoint);
        dsn.push('/');
        dsn.push_str(&self.cfg.database);
        dsn.push_str("?compression=lz4&pool_min=2&pool_max=5");

        dsn
    }
}
