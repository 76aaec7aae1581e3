//! Connection pooling and circuit breaker module
//!
//! This module provides:
//! - Bounded per-role connection pools (read, write)
//! - A failure-rate circuit breaker
//! - Circuit-protected acquisition with bounded backoff retries
//! - Idle connection reaping and pre-warming

pub mod circuit;
pub mod connection;
pub mod manager;
pub mod protected;

pub use circuit::{
    CallError, CircuitBreaker, CircuitBreakerConfig, CircuitError, CircuitState, CircuitStats,
    MIN_SAMPLES_FLOOR,
};
pub use connection::{
    BoxError, Connection, ConnectionFactory, ConnectionId, ConnectionPool, PoolConfig, PoolError,
    PoolStats, PoolType,
};
pub use manager::{ConnectionPoolManager, ManagerStats};
pub use protected::{CircuitProtectedPool, ProtectedPoolError, ProtectedPoolStats};
