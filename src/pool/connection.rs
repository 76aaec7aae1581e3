//! Bounded connection pool for one database role
//!
//! This module provides a per-role pool of reusable database handles with:
//! - A hard cap on live connections (`max_connections`)
//! - Timeout-bounded acquisition that fails with a pool-exhaustion error
//! - Idle connection reaping that never drops below `min_connections`
//! - Eager pre-warming up to the configured floor
//!
//! Every leased connection holds one semaphore permit; idle connections hold
//! none. A connection is only created while holding a permit and while the
//! idle queue is empty, which keeps `idle + leased <= max_connections`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Unique identifier for a connection within its pool
pub type ConnectionId = u64;

/// Boxed error returned by connection factories
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Database role served by a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolType {
    Read,
    Write,
}

impl PoolType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolType::Read => "read",
            PoolType::Write => "write",
        }
    }
}

impl fmt::Display for PoolType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error types for connection pool operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum PoolError {
    #[error("Connection pool '{pool}' exhausted after waiting {timeout:?}")]
    PoolExhausted { pool: PoolType, timeout: Duration },

    #[error("Failed to create connection for pool '{pool}': {reason}")]
    ConnectionFailed { pool: PoolType, reason: String },

    #[error("Invalid pool configuration: {0}")]
    InvalidConfig(String),
}

/// Produces and disposes of raw database handles for a pool
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    type Handle: Send + 'static;

    /// Open a new physical connection
    async fn connect(&self) -> Result<Self::Handle, BoxError>;

    /// Close a physical connection; dropping the handle is the default
    async fn close(&self, handle: Self::Handle) {
        drop(handle);
    }
}

/// Configuration for connection pool behavior
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Minimum number of connections to keep warm
    pub min_connections: usize,

    /// Maximum number of live connections
    pub max_connections: usize,

    /// Maximum idle time before a connection becomes eligible for reaping
    pub idle_timeout: Duration,

    /// Default wait for a free connection when no timeout is given
    pub acquire_timeout: Duration,
}

impl PoolConfig {
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.max_connections == 0 {
            return Err(PoolError::InvalidConfig(
                "max_connections must be at least 1".to_string(),
            ));
        }
        if self.min_connections > self.max_connections {
            return Err(PoolError::InvalidConfig(format!(
                "min_connections ({}) exceeds max_connections ({})",
                self.min_connections, self.max_connections
            )));
        }
        Ok(())
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 2,
            max_connections: 20,
            idle_timeout: Duration::from_secs(300),
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

/// A leased physical database handle
#[derive(Debug)]
pub struct Connection<H> {
    id: ConnectionId,
    handle: H,
    pool_type: PoolType,
    created_at: Instant,
    last_used: Instant,
    is_active: bool,
}

impl<H> Connection<H> {
    fn new(id: ConnectionId, handle: H, pool_type: PoolType) -> Self {
        let now = Instant::now();
        Self {
            id,
            handle,
            pool_type,
            created_at: now,
            last_used: now,
            is_active: false,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Role of the pool this connection was leased from
    pub fn pool_type(&self) -> PoolType {
        self.pool_type
    }

    pub fn handle(&self) -> &H {
        &self.handle
    }

    /// Mutable access to the raw handle; marks the connection as used
    pub fn handle_mut(&mut self) -> &mut H {
        self.last_used = Instant::now();
        &mut self.handle
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    pub fn is_active(&self) -> bool {
        self.is_active
    }

    fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_used)
    }
}

/// Registry entry for every live connection, leased or idle
#[derive(Debug, Clone, Copy)]
struct ConnectionInfo {
    created_at: Instant,
    is_active: bool,
}

struct PoolState<H> {
    /// Connections ready to be leased, least recently used at the front
    idle: VecDeque<Connection<H>>,

    /// All live connections owned by this pool
    registry: HashMap<ConnectionId, ConnectionInfo>,
}

/// What happens to a connection handed back through `release_connection`
enum Release<H> {
    Idle,
    Overflow(Connection<H>),
    Unknown(Connection<H>),
}

#[derive(Debug, Default)]
struct PoolCounters {
    total_created: u64,
    total_closed: u64,
    total_errors: u64,
    total_acquisitions: u64,
    exhausted_count: u64,
    total_wait: Duration,
}

/// Statistics for a connection pool
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub pool_type: PoolType,

    /// Live connections (active + idle)
    pub total_connections: usize,

    /// Leased connections
    pub active_connections: usize,

    /// Connections waiting in the idle queue
    pub idle_connections: usize,

    pub min_connections: usize,
    pub max_connections: usize,

    /// Active connections as a percentage of `max_connections`
    pub utilization_percent: f64,

    pub total_created: u64,
    pub total_closed: u64,

    /// Connection factory failures
    pub total_errors: u64,

    pub total_acquisitions: u64,

    /// Acquisitions that timed out
    pub exhausted_count: u64,

    pub avg_wait_time_ms: f64,
}

impl PoolStats {
    /// Utilization above this percentage should be surfaced to monitoring
    pub const SATURATION_PERCENT: f64 = 80.0;

    pub fn is_saturated(&self) -> bool {
        self.utilization_percent > Self::SATURATION_PERCENT
    }
}

/// Bounded registry of reusable connections for one role
pub struct ConnectionPool<F: ConnectionFactory> {
    pool_type: PoolType,
    config: PoolConfig,
    factory: F,

    state: Mutex<PoolState<F::Handle>>,
    counters: Mutex<PoolCounters>,

    /// One permit per connection that may be leased
    leases: Semaphore,
    next_id: AtomicU64,
}

impl<F: ConnectionFactory> ConnectionPool<F> {
    /// Create a new pool; no connections are opened until first use or
    /// [`ConnectionPool::prewarm`]
    pub fn new(pool_type: PoolType, config: PoolConfig, factory: F) -> Result<Self, PoolError> {
        config.validate()?;
        info!(
            pool = %pool_type,
            min = config.min_connections,
            max = config.max_connections,
            "Creating connection pool"
        );

        Ok(Self {
            pool_type,
            leases: Semaphore::new(config.max_connections),
            state: Mutex::new(PoolState {
                idle: VecDeque::with_capacity(config.max_connections),
                registry: HashMap::with_capacity(config.max_connections),
            }),
            counters: Mutex::new(PoolCounters::default()),
            next_id: AtomicU64::new(1),
            config,
            factory,
        })
    }

    pub fn pool_type(&self) -> PoolType {
        self.pool_type
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn state(&self) -> MutexGuard<'_, PoolState<F::Handle>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn counters(&self) -> MutexGuard<'_, PoolCounters> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lease a connection, reusing an idle one when possible
    ///
    /// Waits up to `timeout` (or the configured `acquire_timeout`) for a free
    /// slot before failing with [`PoolError::PoolExhausted`].
    pub async fn get_connection(
        &self,
        timeout: Option<Duration>,
    ) -> Result<Connection<F::Handle>, PoolError> {
        let timeout = timeout.unwrap_or(self.config.acquire_timeout);
        let started = Instant::now();

        let permit = match self.leases.try_acquire() {
            Ok(permit) => permit,
            Err(_) => match tokio::time::timeout(timeout, self.leases.acquire()).await {
                Ok(Ok(permit)) => permit,
                // The semaphore is never closed, so only the timeout remains
                Ok(Err(_)) | Err(_) => {
                    self.counters().exhausted_count += 1;
                    warn!(pool = %self.pool_type, ?timeout, "Connection pool exhausted");
                    return Err(PoolError::PoolExhausted {
                        pool: self.pool_type,
                        timeout,
                    });
                }
            },
        };

        let reused = {
            let mut state = self.state();
            let reused = state.idle.pop_back();
            if let Some(conn) = &reused {
                if let Some(info) = state.registry.get_mut(&conn.id) {
                    info.is_active = true;
                }
            }
            reused
        };

        let mut conn = match reused {
            Some(conn) => {
                debug!(
                    pool = %self.pool_type,
                    conn_id = conn.id,
                    age_secs = conn.created_at.elapsed().as_secs(),
                    "Reusing connection"
                );
                conn
            }
            None => self.create_connection().await?,
        };

        conn.is_active = true;
        conn.last_used = Instant::now();
        permit.forget();

        let mut counters = self.counters();
        counters.total_acquisitions += 1;
        counters.total_wait += started.elapsed();

        Ok(conn)
    }

    /// Open a new connection through the factory and register it as active
    async fn create_connection(&self) -> Result<Connection<F::Handle>, PoolError> {
        let handle = match self.factory.connect().await {
            Ok(handle) => handle,
            Err(e) => {
                self.counters().total_errors += 1;
                warn!(pool = %self.pool_type, error = %e, "Connection factory failed");
                return Err(PoolError::ConnectionFailed {
                    pool: self.pool_type,
                    reason: e.to_string(),
                });
            }
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let conn = Connection::new(id, handle, self.pool_type);
        self.state().registry.insert(
            id,
            ConnectionInfo {
                created_at: conn.created_at,
                is_active: true,
            },
        );

        let total_created = {
            let mut counters = self.counters();
            counters.total_created += 1;
            counters.total_created
        };
        info!(pool = %self.pool_type, conn_id = id, total_created, "Created new connection");

        Ok(conn)
    }

    /// Return a leased connection to the idle queue
    ///
    /// If the idle queue is already at capacity the connection is closed
    /// instead. A connection that does not belong to this pool is closed and
    /// never enters the idle queue.
    pub async fn release_connection(&self, mut conn: Connection<F::Handle>) {
        if conn.pool_type != self.pool_type {
            warn!(
                pool = %self.pool_type,
                conn_pool = %conn.pool_type,
                conn_id = conn.id,
                "Refusing connection from another pool"
            );
            self.factory.close(conn.handle).await;
            return;
        }

        conn.is_active = false;
        conn.last_used = Instant::now();

        let disposition = {
            let mut state = self.state();
            if !state.registry.contains_key(&conn.id) {
                Release::Unknown(conn)
            } else if state.idle.len() >= self.config.max_connections {
                state.registry.remove(&conn.id);
                Release::Overflow(conn)
            } else {
                if let Some(info) = state.registry.get_mut(&conn.id) {
                    info.is_active = false;
                }
                state.idle.push_back(conn);
                Release::Idle
            }
        };

        match disposition {
            Release::Idle => self.leases.add_permits(1),
            Release::Overflow(conn) => {
                self.leases.add_permits(1);
                debug!(pool = %self.pool_type, conn_id = conn.id, "Idle queue full, closing released connection");
                self.close(conn).await;
            }
            Release::Unknown(conn) => {
                warn!(pool = %self.pool_type, conn_id = conn.id, "Released connection is not registered");
                self.factory.close(conn.handle).await;
            }
        }
    }

    /// Close a leased connection the caller knows to be broken
    pub async fn discard_connection(&self, conn: Connection<F::Handle>) {
        let owned = conn.pool_type == self.pool_type
            && self.state().registry.remove(&conn.id).is_some();
        if owned {
            self.leases.add_permits(1);
        }
        debug!(pool = %self.pool_type, conn_id = conn.id, "Discarding connection");
        self.close(conn).await;
    }

    async fn close(&self, conn: Connection<F::Handle>) {
        self.factory.close(conn.handle).await;
        self.counters().total_closed += 1;
    }

    /// Close connections idle longer than `idle_timeout` (or the configured
    /// one), never dropping the live count below `min_connections`
    pub async fn close_idle_connections(&self, idle_timeout: Option<Duration>) -> usize {
        let idle_timeout = idle_timeout.unwrap_or(self.config.idle_timeout);
        let now = Instant::now();

        let (expired, remaining) = {
            let mut state = self.state();
            let budget = state
                .registry
                .len()
                .saturating_sub(self.config.min_connections);

            let mut expired = Vec::new();
            let mut kept = VecDeque::with_capacity(state.idle.len());
            while let Some(conn) = state.idle.pop_front() {
                if expired.len() < budget && conn.idle_for(now) > idle_timeout {
                    expired.push(conn);
                } else {
                    kept.push_back(conn);
                }
            }
            state.idle = kept;
            for conn in &expired {
                state.registry.remove(&conn.id);
            }
            (expired, state.registry.len())
        };

        let closed = expired.len();
        for conn in expired {
            self.close(conn).await;
        }

        if closed > 0 {
            debug!(
                pool = %self.pool_type,
                closed,
                remaining,
                "Closed idle connections"
            );
        }
        closed
    }

    /// Open connections until the pool holds `min_connections`
    pub async fn prewarm(&self) -> Result<usize, PoolError> {
        let mut created = 0;

        loop {
            if self.state().registry.len() >= self.config.min_connections {
                break;
            }
            // Holding a permit while connecting keeps the cap intact
            let Ok(permit) = self.leases.try_acquire() else {
                break;
            };
            if self.state().registry.len() >= self.config.min_connections {
                break;
            }

            let mut conn = self.create_connection().await?;
            conn.is_active = false;
            {
                let mut state = self.state();
                if let Some(info) = state.registry.get_mut(&conn.id) {
                    info.is_active = false;
                }
                state.idle.push_back(conn);
            }
            drop(permit);
            created += 1;
        }

        if created > 0 {
            info!(pool = %self.pool_type, created, "Pre-warmed connections");
        }
        Ok(created)
    }

    /// Get pool statistics
    pub fn get_stats(&self) -> PoolStats {
        let (total, active, idle) = {
            let state = self.state();
            let active = state.registry.values().filter(|info| info.is_active).count();
            (state.registry.len(), active, state.idle.len())
        };
        let counters = self.counters();

        let avg_wait_time_ms = if counters.total_acquisitions == 0 {
            0.0
        } else {
            counters.total_wait.as_secs_f64() * 1000.0 / counters.total_acquisitions as f64
        };

        PoolStats {
            pool_type: self.pool_type,
            total_connections: total,
            active_connections: active,
            idle_connections: idle,
            min_connections: self.config.min_connections,
            max_connections: self.config.max_connections,
            utilization_percent: active as f64 / self.config.max_connections as f64 * 100.0,
            total_created: counters.total_created,
            total_closed: counters.total_closed,
            total_errors: counters.total_errors,
            total_acquisitions: counters.total_acquisitions,
            exhausted_count: counters.exhausted_count,
            avg_wait_time_ms,
        }
    }

    /// Age of the oldest live connection
    pub fn oldest_connection_age(&self) -> Option<Duration> {
        self.state()
            .registry
            .values()
            .map(|info| info.created_at.elapsed())
            .max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    #[derive(Default)]
    struct CountingFactory {
        opened: AtomicU64,
        closed: Arc<AtomicU64>,
        fail: AtomicBool,
    }

    #[async_trait]
    impl ConnectionFactory for CountingFactory {
        type Handle = u64;

        async fn connect(&self) -> Result<u64, BoxError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err("connection refused".into());
            }
            Ok(self.opened.fetch_add(1, Ordering::SeqCst))
        }

        async fn close(&self, _handle: u64) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn config(min: usize, max: usize) -> PoolConfig {
        PoolConfig {
            min_connections: min,
            max_connections: max,
            idle_timeout: Duration::from_millis(20),
            acquire_timeout: Duration::from_millis(50),
        }
    }

    fn pool(min: usize, max: usize) -> ConnectionPool<CountingFactory> {
        ConnectionPool::new(PoolType::Read, config(min, max), CountingFactory::default()).unwrap()
    }

    #[test]
    fn test_pool_config_defaults() {
        let config = PoolConfig::default();
        assert_eq!(config.max_connections, 20);
        assert_eq!(config.min_connections, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_pool_config_rejects_inverted_bounds() {
        assert!(matches!(
            config(5, 2).validate(),
            Err(PoolError::InvalidConfig(_))
        ));
        assert!(config(0, 0).validate().is_err());
    }

    #[tokio::test]
    async fn test_reuses_released_connection() {
        let pool = pool(0, 2);

        let conn = pool.get_connection(None).await.unwrap();
        let id = conn.id();
        assert!(conn.is_active());
        pool.release_connection(conn).await;

        let again = pool.get_connection(None).await.unwrap();
        assert_eq!(again.id(), id);

        let stats = pool.get_stats();
        assert_eq!(stats.total_created, 1);
        assert_eq!(stats.total_acquisitions, 2);
        assert_eq!(stats.active_connections, 1);
    }

    #[tokio::test]
    async fn test_exhausted_after_timeout() {
        let pool = pool(0, 1);
        let _held = pool.get_connection(None).await.unwrap();

        let result = pool.get_connection(Some(Duration::from_millis(10))).await;
        assert!(matches!(result, Err(PoolError::PoolExhausted { pool: PoolType::Read, .. })));
        assert_eq!(pool.get_stats().exhausted_count, 1);
    }

    #[tokio::test]
    async fn test_release_into_full_idle_queue_closes() {
        let pool = pool(0, 2);
        let first = pool.get_connection(None).await.unwrap();
        let second = pool.get_connection(None).await.unwrap();
        let second_id = second.id();
        pool.release_connection(first).await;

        // A shrink racing with this release leaves the idle queue at capacity
        {
            let mut state = pool.state();
            let extra = Connection::new(99, 99, PoolType::Read);
            state.registry.insert(
                extra.id,
                ConnectionInfo {
                    created_at: extra.created_at,
                    is_active: false,
                },
            );
            state.idle.push_back(extra);
            assert_eq!(state.idle.len(), 2);
        }

        pool.release_connection(second).await;

        assert_eq!(pool.factory.closed.load(Ordering::SeqCst), 1);
        let stats = pool.get_stats();
        assert_eq!(stats.total_closed, 1);
        assert_eq!(stats.idle_connections, 2);
        assert!(stats.total_connections <= stats.max_connections);
        assert!(pool.state().idle.iter().all(|conn| conn.id != second_id));

        // Every slot is still usable
        let a = pool.get_connection(None).await.unwrap();
        let b = pool.get_connection(None).await.unwrap();
        assert_eq!(pool.get_stats().total_created, 2);
        pool.release_connection(a).await;
        pool.release_connection(b).await;
    }

    #[tokio::test]
    async fn test_waiter_gets_released_connection() {
        let pool = Arc::new(pool(0, 1));
        let held = pool.get_connection(None).await.unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.get_connection(Some(Duration::from_secs(1))).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        pool.release_connection(held).await;

        let conn = waiter.await.unwrap().unwrap();
        assert_eq!(pool.get_stats().total_created, 1);
        pool.release_connection(conn).await;
    }

    #[tokio::test]
    async fn test_factory_failure_counts_error_and_frees_slot() {
        let pool = pool(0, 1);
        pool.factory.fail.store(true, Ordering::SeqCst);

        let result = pool.get_connection(None).await;
        assert!(matches!(result, Err(PoolError::ConnectionFailed { .. })));
        assert_eq!(pool.get_stats().total_errors, 1);

        pool.factory.fail.store(false, Ordering::SeqCst);
        assert!(pool.get_connection(Some(Duration::from_millis(10))).await.is_ok());
    }

    #[tokio::test]
    async fn test_never_exceeds_max_connections() {
        let pool = Arc::new(pool(0, 3));
        let mut handles = Vec::new();
        for _ in 0..10 {
            let pool = Arc::clone(&pool);
            handles.push(tokio::spawn(async move {
                if let Ok(conn) = pool.get_connection(Some(Duration::from_millis(200))).await {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    pool.release_connection(conn).await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let stats = pool.get_stats();
        assert!(stats.total_created <= 3);
        assert!(stats.total_connections <= 3);
        assert_eq!(stats.active_connections, 0);
    }

    #[tokio::test]
    async fn test_close_idle_respects_min_connections() {
        let pool = pool(2, 5);
        let mut leased = Vec::new();
        for _ in 0..4 {
            leased.push(pool.get_connection(None).await.unwrap());
        }
        for conn in leased {
            pool.release_connection(conn).await;
        }

        tokio::time::sleep(Duration::from_millis(40)).await;
        let closed = pool.close_idle_connections(None).await;

        assert_eq!(closed, 2);
        let stats = pool.get_stats();
        assert_eq!(stats.total_connections, 2);
        assert_eq!(stats.total_closed, 2);

        // Nothing more to reap at the floor
        assert_eq!(pool.close_idle_connections(Some(Duration::ZERO)).await, 0);
    }

    #[tokio::test]
    async fn test_close_idle_keeps_recent_connections() {
        let pool = pool(0, 3);
        let conn = pool.get_connection(None).await.unwrap();
        pool.release_connection(conn).await;

        assert_eq!(pool.close_idle_connections(Some(Duration::from_secs(60))).await, 0);
        assert_eq!(pool.get_stats().idle_connections, 1);
    }

    #[tokio::test]
    async fn test_prewarm_fills_to_min() {
        let pool = pool(3, 5);
        assert_eq!(pool.prewarm().await.unwrap(), 3);

        let stats = pool.get_stats();
        assert_eq!(stats.idle_connections, 3);
        assert_eq!(stats.active_connections, 0);

        // Already warm
        assert_eq!(pool.prewarm().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_release_foreign_connection_is_closed() {
        let read = pool(0, 2);
        let write =
            ConnectionPool::new(PoolType::Write, config(0, 2), CountingFactory::default()).unwrap();

        let conn = write.get_connection(None).await.unwrap();
        read.release_connection(conn).await;

        assert_eq!(read.get_stats().idle_connections, 0);
        assert_eq!(read.factory.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_discard_frees_slot() {
        let pool = pool(0, 1);
        let conn = pool.get_connection(None).await.unwrap();
        pool.discard_connection(conn).await;

        let stats = pool.get_stats();
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.total_closed, 1);
        assert!(pool.get_connection(Some(Duration::from_millis(10))).await.is_ok());
    }

    #[test]
    fn test_saturation_signal() {
        let mut stats = pool(0, 10).get_stats();
        assert!(!stats.is_saturated());
        stats.utilization_percent = 90.0;
        assert!(stats.is_saturated());
    }
}
