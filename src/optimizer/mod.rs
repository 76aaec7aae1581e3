//! Query diagnostics module
//!
//! This module provides:
//! - Query history with slow-query metrics
//! - Per-request N+1 pattern detection
//! - Index suggestions from recurring WHERE/JOIN/ORDER BY columns
//! - Execution plan analysis through an injected explain callback

pub mod explain;
pub mod indexes;
pub mod patterns;
pub mod tracker;

pub use explain::{ExplainCallback, QueryAnalysis};
pub use indexes::IndexSuggestion;
pub use patterns::{normalize_query, NPlusOnePattern};
pub use tracker::{OptimizerConfig, OptimizerError, QueryLog, QueryMetrics, QueryOptimizer};
