//! Circuit-protected connection acquisition
//!
//! [`CircuitProtectedPool`] runs every acquisition attempt through a
//! [`CircuitBreaker`] and retries failed attempts with the breaker's backoff
//! schedule. Retrying stops as soon as the breaker opens.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::circuit::{CallError, CircuitBreaker, CircuitError, CircuitState, CircuitStats};
use super::connection::{Connection, ConnectionFactory, ConnectionPool, PoolError, PoolStats};

/// Error types for protected acquisition
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtectedPoolError {
    #[error(transparent)]
    Circuit(#[from] CircuitError),

    #[error(transparent)]
    Pool(#[from] PoolError),
}

impl ProtectedPoolError {
    /// True when the caller should back off rather than retry right away
    pub fn is_circuit_open(&self) -> bool {
        matches!(
            self,
            ProtectedPoolError::Circuit(
                CircuitError::CircuitOpen { .. } | CircuitError::HalfOpenLimitReached(_)
            )
        )
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, ProtectedPoolError::Pool(PoolError::PoolExhausted { .. }))
    }
}

/// Pool statistics merged with the guarding breaker's statistics
#[derive(Debug, Clone, Serialize)]
pub struct ProtectedPoolStats {
    pub pool: PoolStats,
    pub circuit: CircuitStats,
}

/// A connection pool whose acquisition path is guarded by a circuit breaker
pub struct CircuitProtectedPool<F: ConnectionFactory> {
    pool: Arc<ConnectionPool<F>>,
    breaker: Arc<CircuitBreaker>,
    max_retries: usize,
}

impl<F: ConnectionFactory> CircuitProtectedPool<F> {
    pub fn new(pool: Arc<ConnectionPool<F>>, breaker: Arc<CircuitBreaker>, max_retries: usize) -> Self {
        Self {
            pool,
            breaker,
            max_retries,
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool<F>> {
        &self.pool
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Acquire a connection with up to `max_retries` attempts
    pub async fn get_connection(
        &self,
        timeout: Option<Duration>,
    ) -> Result<Connection<F::Handle>, ProtectedPoolError> {
        let attempts = self.max_retries.max(1);
        let mut attempt = 0;

        loop {
            match self.breaker.call(|| self.pool.get_connection(timeout)).await {
                Ok(conn) => return Ok(conn),

                Err(CallError::Rejected(e)) => return Err(e.into()),

                Err(CallError::Failed(e)) => {
                    if self.breaker.get_state() == CircuitState::Open {
                        warn!(
                            pool = %self.pool.pool_type(),
                            breaker = %self.breaker.name(),
                            attempt = attempt + 1,
                            error = %e,
                            "Circuit opened during acquisition, giving up"
                        );
                        return Err(e.into());
                    }

                    if attempt + 1 >= attempts {
                        warn!(
                            pool = %self.pool.pool_type(),
                            attempts,
                            error = %e,
                            "Connection acquisition retries exhausted"
                        );
                        return Err(e.into());
                    }

                    let delay = self.breaker.get_backoff_delay(attempt)?;
                    debug!(
                        pool = %self.pool.pool_type(),
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Acquisition failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    pub async fn release_connection(&self, conn: Connection<F::Handle>) {
        self.pool.release_connection(conn).await;
    }

    pub fn get_stats(&self) -> ProtectedPoolStats {
        ProtectedPoolStats {
            pool: self.pool.get_stats(),
            circuit: self.breaker.get_stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::circuit::CircuitBreakerConfig;
    use crate::pool::connection::{BoxError, PoolConfig, PoolType};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails the first `failures` connects, then succeeds
    struct FlakyFactory {
        failures: usize,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ConnectionFactory for FlakyFactory {
        type Handle = usize;

        async fn connect(&self) -> Result<usize, BoxError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(format!("connect attempt {} refused", call).into())
            } else {
                Ok(call)
            }
        }
    }

    fn protected(
        failures: usize,
        threshold: f64,
        max_retries: usize,
    ) -> (CircuitProtectedPool<FlakyFactory>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let pool = ConnectionPool::new(
            PoolType::Write,
            PoolConfig {
                min_connections: 0,
                max_connections: 2,
                idle_timeout: Duration::from_secs(60),
                acquire_timeout: Duration::from_millis(20),
            },
            FlakyFactory {
                failures,
                calls: Arc::clone(&calls),
            },
        )
        .unwrap();
        let breaker = CircuitBreaker::new(
            "db-write",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                failure_window: Duration::from_secs(60),
                recovery_timeout: Duration::from_secs(60),
                backoff_delays: vec![Duration::from_millis(1), Duration::from_millis(2)],
                min_samples: 2,
            },
        );
        (
            CircuitProtectedPool::new(Arc::new(pool), Arc::new(breaker), max_retries),
            calls,
        )
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        // A rate threshold of 1.0 can never be exceeded, so the circuit stays closed
        let (pool, calls) = protected(2, 1.0, 3);

        let conn = pool.get_connection(None).await.unwrap();
        assert_eq!(*conn.handle(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let stats = pool.get_stats();
        assert_eq!(stats.pool.total_errors, 2);
        assert_eq!(stats.circuit.total_failures, 2);
        assert_eq!(stats.circuit.total_successes, 1);
    }

    #[tokio::test]
    async fn test_exhausting_retries_returns_last_error() {
        let (pool, calls) = protected(10, 1.0, 3);

        let err = pool.get_connection(None).await.unwrap_err();
        assert!(matches!(err, ProtectedPoolError::Pool(PoolError::ConnectionFailed { .. })));
        assert!(err.to_string().contains("attempt 2"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_stops_when_circuit_opens() {
        let (pool, calls) = protected(10, 0.5, 5);

        let err = pool.get_connection(None).await.unwrap_err();
        assert!(matches!(err, ProtectedPoolError::Pool(_)));
        // The second failure opens the circuit, so no third attempt is made
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(pool.breaker().get_state(), CircuitState::Open);

        let rejected = pool.get_connection(None).await.unwrap_err();
        assert!(rejected.is_circuit_open());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
