//! Read/write pool composition
//!
//! [`ConnectionPoolManager`] owns exactly two pools, one per [`PoolType`],
//! and routes releases back to the pool a connection was leased from.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::connection::{
    Connection, ConnectionFactory, ConnectionPool, PoolConfig, PoolError, PoolStats, PoolType,
};

/// Statistics for both pools
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStats {
    pub read: PoolStats,
    pub write: PoolStats,
}

impl ManagerStats {
    pub fn total_connections(&self) -> usize {
        self.read.total_connections + self.write.total_connections
    }

    pub fn total_errors(&self) -> u64 {
        self.read.total_errors + self.write.total_errors
    }
}

/// Connection pool manager for the read and write roles
pub struct ConnectionPoolManager<F: ConnectionFactory> {
    read: Arc<ConnectionPool<F>>,
    write: Arc<ConnectionPool<F>>,
}

impl<F: ConnectionFactory> ConnectionPoolManager<F> {
    /// Create both pools, each with its own factory
    pub fn new(
        read_config: PoolConfig,
        read_factory: F,
        write_config: PoolConfig,
        write_factory: F,
    ) -> Result<Self, PoolError> {
        Ok(Self {
            read: Arc::new(ConnectionPool::new(PoolType::Read, read_config, read_factory)?),
            write: Arc::new(ConnectionPool::new(PoolType::Write, write_config, write_factory)?),
        })
    }

    pub fn read_pool(&self) -> &Arc<ConnectionPool<F>> {
        &self.read
    }

    pub fn write_pool(&self) -> &Arc<ConnectionPool<F>> {
        &self.write
    }

    pub fn pool(&self, pool_type: PoolType) -> &Arc<ConnectionPool<F>> {
        match pool_type {
            PoolType::Read => &self.read,
            PoolType::Write => &self.write,
        }
    }

    pub async fn get_read_connection(
        &self,
        timeout: Option<Duration>,
    ) -> Result<Connection<F::Handle>, PoolError> {
        self.read.get_connection(timeout).await
    }

    pub async fn get_write_connection(
        &self,
        timeout: Option<Duration>,
    ) -> Result<Connection<F::Handle>, PoolError> {
        self.write.get_connection(timeout).await
    }

    /// Return a connection to the pool recorded on it
    pub async fn release_connection(&self, conn: Connection<F::Handle>) {
        self.pool(conn.pool_type()).release_connection(conn).await;
    }

    /// Close a broken connection and free its slot
    pub async fn discard_connection(&self, conn: Connection<F::Handle>) {
        self.pool(conn.pool_type()).discard_connection(conn).await;
    }

    /// Get statistics for both pools, warning on saturated ones
    pub fn get_pool_stats(&self) -> ManagerStats {
        let stats = ManagerStats {
            read: self.read.get_stats(),
            write: self.write.get_stats(),
        };

        for pool in [&stats.read, &stats.write] {
            if pool.is_saturated() {
                warn!(
                    pool = %pool.pool_type,
                    utilization_percent = pool.utilization_percent,
                    active = pool.active_connections,
                    max = pool.max_connections,
                    "Connection pool utilization is high"
                );
            }
        }

        stats
    }

    /// Pre-warm both pools to their minimum size
    pub async fn prewarm(&self) -> Result<usize, PoolError> {
        let read = self.read.prewarm().await?;
        let write = self.write.prewarm().await?;
        Ok(read + write)
    }

    /// Reap idle connections in both pools
    pub async fn close_idle_connections(&self, idle_timeout: Option<Duration>) -> usize {
        let read = self.read.close_idle_connections(idle_timeout).await;
        let write = self.write.close_idle_connections(idle_timeout).await;
        read + write
    }

    /// Start a background task that reaps idle connections every `interval`
    pub fn start_idle_reaper(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let closed = self.close_idle_connections(None).await;
                debug!(closed, "Idle reaper pass finished");
            }
        })
    }
}
