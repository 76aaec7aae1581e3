use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::explain::{self, ExplainCallback, QueryAnalysis};
use super::indexes::{self, IndexSuggestion};
use super::patterns::{self, NPlusOnePattern};
use crate::routing::QueryType;

/// Optimizer errors
#[derive(Debug, Error)]
pub enum OptimizerError {
    #[error("No explain callback configured")]
    NoExplainCallback,

    #[error("Explain failed: {0}")]
    ExplainFailed(String),

    #[error("Invalid execution plan: {0}")]
    InvalidPlan(String),
}

/// Configuration for query tracking and analysis
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    /// Queries slower than this are counted and reported as slow
    pub slow_query_threshold: Duration,
    /// Number of recent queries kept in history
    pub max_query_history: usize,
    /// A query shape repeated more than this many times in one request is an N+1
    pub n_plus_one_threshold: usize,
    /// Minimum number of slow queries sharing columns before an index is proposed
    pub index_min_occurrences: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            slow_query_threshold: Duration::from_millis(100),
            max_query_history: 1000,
            n_plus_one_threshold: 3,
            index_min_occurrences: 3,
        }
    }
}

/// One recorded query execution
#[derive(Debug, Clone)]
pub struct QueryLog {
    pub query_id: u64,
    pub text: String,
    pub execution_time: Duration,
    pub timestamp: DateTime<Utc>,
    pub execution_plan: Option<Value>,
    pub params: Vec<Value>,
    pub query_type: QueryType,
}

impl QueryLog {
    pub fn is_slow(&self, threshold: Duration) -> bool {
        self.execution_time > threshold
    }
}

/// Aggregate query metrics
#[derive(Debug, Clone, Serialize)]
pub struct QueryMetrics {
    pub total_queries: u64,
    pub slow_queries: u64,
    /// Slow queries as a percentage of all queries
    pub slow_query_rate: f64,
    pub avg_execution_time_ms: f64,
    pub history_len: usize,
    pub active_requests: usize,
}

#[derive(Default)]
struct History {
    logs: VecDeque<QueryLog>,
    total_queries: u64,
    slow_queries: u64,
    total_time: Duration,
}

/// Records executed queries and diagnoses slow queries, N+1 patterns and
/// missing indexes
///
/// Safe to share across concurrently executing requests: the history and the
/// per-request contexts each sit behind their own mutex.
pub struct QueryOptimizer {
    config: OptimizerConfig,
    explain: Option<ExplainCallback>,
    next_id: AtomicU64,
    history: Mutex<History>,
    requests: Mutex<HashMap<String, Vec<QueryLog>>>,
}

impl QueryOptimizer {
    pub fn new(config: OptimizerConfig) -> Self {
        Self {
            config,
            explain: None,
            next_id: AtomicU64::new(1),
            history: Mutex::new(History::default()),
            requests: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_explain_callback(mut self, explain: ExplainCallback) -> Self {
        self.explain = Some(explain);
        self
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Record one executed query
    ///
    /// The query is appended to history (evicting the oldest entry beyond
    /// `max_query_history`) and, when `request_id` is given, to that request's
    /// context for N+1 analysis. Slow queries get their execution plan
    /// attached when an explain callback is configured.
    pub fn track_query(
        &self,
        text: &str,
        execution_time: Duration,
        params: Vec<Value>,
        request_id: Option<&str>,
    ) -> QueryLog {
        let slow = execution_time > self.config.slow_query_threshold;
        let execution_plan = if slow {
            self.capture_plan(text, &params)
        } else {
            None
        };

        let log = QueryLog {
            query_id: self.next_id.fetch_add(1, Ordering::Relaxed),
            text: text.to_string(),
            execution_time,
            timestamp: Utc::now(),
            execution_plan,
            params,
            query_type: QueryType::classify(text),
        };

        {
            let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
            history.total_queries += 1;
            history.total_time += execution_time;
            if slow {
                history.slow_queries += 1;
            }
            history.logs.push_back(log.clone());
            while history.logs.len() > self.config.max_query_history {
                history.logs.pop_front();
            }
        }

        if let Some(request_id) = request_id {
            let mut requests = self.requests.lock().unwrap_or_else(PoisonError::into_inner);
            requests
                .entry(request_id.to_string())
                .or_default()
                .push(log.clone());
        }

        if slow {
            warn!(
                query_id = log.query_id,
                elapsed_ms = execution_time.as_secs_f64() * 1000.0,
                query = %text,
                "Slow query"
            );
        } else {
            debug!(query_id = log.query_id, "Query tracked");
        }

        log
    }

    fn capture_plan(&self, text: &str, params: &[Value]) -> Option<Value> {
        let callback = self.explain.as_ref()?;
        match callback(text, params) {
            Ok(plan) => Some(plan),
            Err(e) => {
                warn!(query = %text, error = %e, "Could not capture plan for slow query");
                None
            }
        }
    }

    /// Run the explain callback for a query and analyze its plan
    pub fn analyze_query(
        &self,
        text: &str,
        params: &[Value],
    ) -> Result<QueryAnalysis, OptimizerError> {
        let callback = self
            .explain
            .as_ref()
            .ok_or(OptimizerError::NoExplainCallback)?;

        let plan =
            callback(text, params).map_err(|e| OptimizerError::ExplainFailed(e.to_string()))?;

        explain::analyze_plan(text, plan, self.config.slow_query_threshold).ok_or_else(|| {
            OptimizerError::InvalidPlan("no plan node with a \"Node Type\" found".to_string())
        })
    }

    /// Report query shapes repeated more than the N+1 threshold in `queries`
    pub fn detect_n_plus_one<I, S>(&self, queries: I) -> Vec<NPlusOnePattern>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        patterns::detect(queries, self.config.n_plus_one_threshold)
    }

    /// Report N+1 patterns among the queries tracked for `request_id`
    pub fn detect_n_plus_one_for_request(&self, request_id: &str) -> Vec<NPlusOnePattern> {
        let texts: Vec<String> = {
            let requests = self.requests.lock().unwrap_or_else(PoisonError::into_inner);
            match requests.get(request_id) {
                Some(logs) => logs.iter().map(|log| log.text.clone()).collect(),
                None => return Vec::new(),
            }
        };

        let found = self.detect_n_plus_one(&texts);
        for pattern in &found {
            warn!(
                request_id,
                count = pattern.count,
                table = pattern.table.as_deref().unwrap_or("-"),
                pattern = %pattern.pattern,
                "N+1 query pattern detected"
            );
        }
        found
    }

    /// Propose indexes for column combinations recurring in `logs`
    pub fn suggest_indexes(&self, logs: &[QueryLog]) -> Vec<IndexSuggestion> {
        indexes::suggest(
            logs.iter().map(|log| log.text.as_str()),
            self.config.index_min_occurrences,
        )
    }

    /// Propose indexes from the slow queries still in history
    pub fn suggest_indexes_from_history(&self) -> Vec<IndexSuggestion> {
        let slow = self.slow_queries();
        let suggestions = self.suggest_indexes(&slow);
        if !suggestions.is_empty() {
            info!(
                count = suggestions.len(),
                slow_queries = slow.len(),
                "Index suggestions available"
            );
        }
        suggestions
    }

    /// Slow queries currently in history, oldest first
    pub fn slow_queries(&self) -> Vec<QueryLog> {
        let threshold = self.config.slow_query_threshold;
        let history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        history
            .logs
            .iter()
            .filter(|log| log.is_slow(threshold))
            .cloned()
            .collect()
    }

    /// Queries currently in history, oldest first
    pub fn recent_queries(&self) -> Vec<QueryLog> {
        let history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        history.logs.iter().cloned().collect()
    }

    pub fn get_metrics(&self) -> QueryMetrics {
        let active_requests = self
            .requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        let history = self.history.lock().unwrap_or_else(PoisonError::into_inner);

        let (slow_query_rate, avg_execution_time_ms) = if history.total_queries > 0 {
            (
                history.slow_queries as f64 / history.total_queries as f64 * 100.0,
                history.total_time.as_secs_f64() * 1000.0 / history.total_queries as f64,
            )
        } else {
            (0.0, 0.0)
        };

        QueryMetrics {
            total_queries: history.total_queries,
            slow_queries: history.slow_queries,
            slow_query_rate,
            avg_execution_time_ms,
            history_len: history.logs.len(),
            active_requests,
        }
    }

    /// Clear counters and history; request contexts are left alone
    pub fn reset_metrics(&self) {
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        *history = History::default();
        info!("Query metrics reset");
    }

    /// Drop the query context of a finished request
    ///
    /// Returns the number of queries that were recorded for it.
    pub fn clear_request_context(&self, request_id: &str) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(request_id)
            .map_or(0, |logs| logs.len())
    }
}

impl Default for QueryOptimizer {
    fn default() -> Self {
        Self::new(OptimizerConfig::default())
    }
}
