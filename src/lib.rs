//! dbguard - database resilience and workload routing layer
//!
//! Circuit breakers, bounded read/write connection pools, primary/replica
//! query routing and runtime query diagnostics.

pub mod cli;
pub mod config;
pub mod core;
pub mod optimizer;
pub mod pool;
pub mod routing;

pub use config::Config;
pub use crate::core::DatabaseLayer;
