use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::Config;
use crate::optimizer::{NPlusOnePattern, QueryMetrics, QueryOptimizer};
use crate::pool::{
    CircuitBreaker, CircuitBreakerConfig, CircuitProtectedPool, CircuitStats, Connection,
    ConnectionFactory, ConnectionPoolManager, ManagerStats, PoolError, PoolType,
    ProtectedPoolError,
};
use crate::routing::{
    DatabaseTarget, MonitorConfig, Priority, Query, ReplicaMonitor, ReplicaStatus, TargetType,
    WorkloadIsolator,
};

/// Breaker names for the two pools
pub const READ_BREAKER: &str = "db-read";
pub const WRITE_BREAKER: &str = "db-write";

/// A leased connection together with the routing decision that chose it
#[derive(Debug)]
pub struct RoutedConnection<H> {
    pub target: DatabaseTarget,
    pub connection: Connection<H>,
}

/// Combined snapshot of every component
#[derive(Debug, Clone, Serialize)]
pub struct LayerStats {
    pub pools: ManagerStats,
    pub read_circuit: CircuitStats,
    pub write_circuit: CircuitStats,
    pub replicas: Vec<ReplicaStatus>,
    pub queries: QueryMetrics,
}

/// Database layer shared by request handlers
///
/// Owns both pools, their circuit breakers, the router and the query
/// optimizer. Everything is passed in at construction time; handlers share
/// one instance behind an `Arc`.
///
/// Replica targets lease from the read pool and primary targets from the
/// write pool, so a read that falls back to the primary uses a primary
/// connection.
pub struct DatabaseLayer<F: ConnectionFactory> {
    pools: Arc<ConnectionPoolManager<F>>,
    read: CircuitProtectedPool<F>,
    write: CircuitProtectedPool<F>,
    isolator: Arc<WorkloadIsolator>,
    optimizer: Arc<QueryOptimizer>,
}

impl<F: ConnectionFactory> DatabaseLayer<F> {
    /// Build every component from configuration
    pub fn new(config: &Config, read_factory: F, write_factory: F) -> Result<Self, PoolError> {
        let pools = Arc::new(ConnectionPoolManager::new(
            config.pools.read.to_pool_config(),
            read_factory,
            config.pools.write.to_pool_config(),
            write_factory,
        )?);
        let isolator = Arc::new(WorkloadIsolator::new(
            config.routing.to_isolator_config(),
            config.routing.replicas.clone(),
        ));
        let optimizer = Arc::new(QueryOptimizer::new(
            config.optimizer.to_optimizer_config(),
        ));

        Ok(Self::from_parts(
            pools,
            isolator,
            optimizer,
            config.circuit_breaker.to_breaker_config(),
            config.retry.max_retries,
        ))
    }

    /// Assemble the layer from prebuilt components
    ///
    /// Use this to supply an isolator with a lag check or an optimizer with
    /// an explain callback.
    pub fn from_parts(
        pools: Arc<ConnectionPoolManager<F>>,
        isolator: Arc<WorkloadIsolator>,
        optimizer: Arc<QueryOptimizer>,
        breaker_config: CircuitBreakerConfig,
        max_retries: usize,
    ) -> Self {
        let read = CircuitProtectedPool::new(
            Arc::clone(pools.read_pool()),
            Arc::new(CircuitBreaker::new(READ_BREAKER, breaker_config.clone())),
            max_retries,
        );
        let write = CircuitProtectedPool::new(
            Arc::clone(pools.write_pool()),
            Arc::new(CircuitBreaker::new(WRITE_BREAKER, breaker_config)),
            max_retries,
        );

        Self {
            pools,
            read,
            write,
            isolator,
            optimizer,
        }
    }

    pub fn pools(&self) -> &Arc<ConnectionPoolManager<F>> {
        &self.pools
    }

    pub fn isolator(&self) -> &Arc<WorkloadIsolator> {
        &self.isolator
    }

    pub fn optimizer(&self) -> &Arc<QueryOptimizer> {
        &self.optimizer
    }

    fn protected(&self, pool_type: PoolType) -> &CircuitProtectedPool<F> {
        match pool_type {
            PoolType::Read => &self.read,
            PoolType::Write => &self.write,
        }
    }

    /// The circuit breaker guarding a pool
    pub fn breaker(&self, pool_type: PoolType) -> &Arc<CircuitBreaker> {
        self.protected(pool_type).breaker()
    }

    fn pool_for(target: &DatabaseTarget) -> PoolType {
        match target.target_type {
            TargetType::Primary => PoolType::Write,
            TargetType::Replica => PoolType::Read,
        }
    }

    /// Route a query and lease a connection from the matching pool
    pub async fn acquire(
        &self,
        query: &Query,
        priority: Priority,
        timeout: Option<Duration>,
    ) -> Result<RoutedConnection<F::Handle>, ProtectedPoolError> {
        let target = self.isolator.route_query(query, priority);
        let pool_type = Self::pool_for(&target);
        debug!(
            pool = %pool_type,
            target = %target.endpoint(),
            reason = %target.reason,
            "Acquiring routed connection"
        );

        let connection = self.protected(pool_type).get_connection(timeout).await?;
        Ok(RoutedConnection { target, connection })
    }

    /// Return a routed connection to its pool
    pub async fn release(&self, routed: RoutedConnection<F::Handle>) {
        self.pools.release_connection(routed.connection).await;
    }

    /// Report how a query went
    ///
    /// The outcome feeds the breaker of the pool the target uses, and the
    /// query is tracked by the optimizer under `request_id`.
    pub fn record_outcome(
        &self,
        target: &DatabaseTarget,
        query: &Query,
        elapsed: Duration,
        succeeded: bool,
        request_id: Option<&str>,
    ) {
        let breaker = self.breaker(Self::pool_for(target));
        if succeeded {
            breaker.record_success();
        } else {
            breaker.record_failure();
        }
        self.optimizer
            .track_query(&query.text, elapsed, query.params.clone(), request_id);
    }

    /// Close out a request: report its N+1 patterns and drop its context
    pub fn finish_request(&self, request_id: &str) -> Vec<NPlusOnePattern> {
        let patterns = self.optimizer.detect_n_plus_one_for_request(request_id);
        let cleared = self.optimizer.clear_request_context(request_id);
        debug!(request_id, queries = cleared, "Request context cleared");
        patterns
    }

    /// Pre-warm both pools
    pub async fn prewarm(&self) -> Result<usize, PoolError> {
        let created = self.pools.prewarm().await?;
        info!(created, "Connection pools pre-warmed");
        Ok(created)
    }

    /// Start the idle reaper and the replica monitor
    ///
    /// The monitor task exits immediately when monitoring is disabled or the
    /// isolator has no lag check.
    pub fn start_maintenance(
        &self,
        reap_interval: Duration,
        monitor: MonitorConfig,
    ) -> Vec<JoinHandle<()>> {
        let reaper = Arc::clone(&self.pools).start_idle_reaper(reap_interval);
        let monitor = Arc::new(ReplicaMonitor::new(Arc::clone(&self.isolator), monitor)).start();
        vec![reaper, monitor]
    }

    pub fn stats(&self) -> LayerStats {
        LayerStats {
            pools: self.pools.get_pool_stats(),
            read_circuit: self.read.breaker().get_stats(),
            write_circuit: self.write.breaker().get_stats(),
            replicas: self.isolator.get_replica_status(),
            queries: self.optimizer.get_metrics(),
        }
    }
}
