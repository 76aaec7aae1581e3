//! Command implementations
//!
//! Each command builds a serializable report; rendering lives in the handler.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::optimizer::{IndexSuggestion, NPlusOnePattern, QueryMetrics, QueryOptimizer};
use crate::routing::{
    DatabaseTarget, Priority, Query, QueryType, ReplicaStatus, WorkloadIsolator,
};

/// Result of `dbguard route`
#[derive(Debug, Clone, Serialize)]
pub struct RouteReport {
    pub query: String,
    pub query_type: QueryType,
    pub priority: Priority,
    pub target: DatabaseTarget,
    pub replicas: Vec<ReplicaStatus>,
}

/// Route one statement against the configured replica snapshot
///
/// `lags` overrides the recorded lag of replicas by `host:port` id.
pub fn cmd_route(
    config: &Config,
    sql: &str,
    priority: Priority,
    query_type: Option<QueryType>,
    lags: &[(String, f64)],
) -> Result<RouteReport> {
    let mut replicas = config.routing.replicas.clone();
    for (id, lag) in lags {
        let replica = replicas
            .iter_mut()
            .find(|r| &r.id() == id)
            .with_context(|| format!("No configured replica '{}'", id))?;
        replica.replication_lag = *lag;
    }

    let isolator = WorkloadIsolator::new(config.routing.to_isolator_config(), replicas);

    let mut query = Query::new(sql);
    if let Some(kind) = query_type {
        query = query.with_type(kind);
    }

    let target = isolator.route_query(&query, priority);
    info!(
        target = %target.endpoint(),
        reason = %target.reason,
        "Route decided"
    );

    Ok(RouteReport {
        query_type: query.query_type(),
        query: query.text,
        priority,
        target,
        replicas: isolator.get_replica_status(),
    })
}

/// One line of a replayed query log
#[derive(Debug, Clone, Deserialize)]
pub struct QueryRecord {
    #[serde(alias = "text", alias = "sql")]
    pub query: String,

    #[serde(alias = "execution_time_ms", alias = "elapsed_ms")]
    pub duration_ms: f64,

    #[serde(default)]
    pub request_id: Option<String>,

    #[serde(default)]
    pub params: Vec<serde_json::Value>,
}

/// N+1 patterns found within one request
#[derive(Debug, Clone, Serialize)]
pub struct RequestPatterns {
    pub request_id: String,
    pub patterns: Vec<NPlusOnePattern>,
}

/// Result of `dbguard analyze`
#[derive(Debug, Clone, Serialize)]
pub struct AnalyzeReport {
    pub metrics: QueryMetrics,
    pub n_plus_one: Vec<RequestPatterns>,
    pub index_suggestions: Vec<IndexSuggestion>,
    /// Lines that could not be parsed
    pub skipped_lines: usize,
}

/// Replay a JSON-lines query log through a fresh optimizer
pub async fn cmd_analyze(config: &Config, file: &Path, slow_ms: Option<f64>) -> Result<AnalyzeReport> {
    let content = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read query log: {:?}", file))?;

    let mut optimizer_config = config.optimizer.to_optimizer_config();
    if let Some(ms) = slow_ms {
        optimizer_config.slow_query_threshold =
            Duration::try_from_secs_f64(ms / 1000.0).context("Invalid --slow-ms")?;
    }
    let optimizer = QueryOptimizer::new(optimizer_config);

    let mut skipped_lines = 0;
    let mut seen = HashSet::new();
    let mut request_order = Vec::new();

    for (index, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let record: QueryRecord = match serde_json::from_str(line) {
            Ok(record) => record,
            Err(e) => {
                warn!(line = index + 1, error = %e, "Skipping malformed query log line");
                skipped_lines += 1;
                continue;
            }
        };
        let Ok(elapsed) = Duration::try_from_secs_f64(record.duration_ms / 1000.0) else {
            warn!(line = index + 1, "Skipping query log line with invalid duration");
            skipped_lines += 1;
            continue;
        };

        if let Some(request_id) = &record.request_id {
            if seen.insert(request_id.clone()) {
                request_order.push(request_id.clone());
            }
        }
        optimizer.track_query(
            &record.query,
            elapsed,
            record.params,
            record.request_id.as_deref(),
        );
    }

    let mut n_plus_one = Vec::new();
    for request_id in request_order {
        let patterns = optimizer.detect_n_plus_one_for_request(&request_id);
        optimizer.clear_request_context(&request_id);
        if !patterns.is_empty() {
            n_plus_one.push(RequestPatterns {
                request_id,
                patterns,
            });
        }
    }

    let index_suggestions = optimizer.suggest_indexes_from_history();
    let metrics = optimizer.get_metrics();
    debug!(
        total = metrics.total_queries,
        skipped = skipped_lines,
        "Query log replayed"
    );

    Ok(AnalyzeReport {
        metrics,
        n_plus_one,
        index_suggestions,
        skipped_lines,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::{ReplicaInfo, TargetType};
    use std::io::Write;

    fn config_with_replicas() -> Config {
        let mut config = Config::new();
        config.routing.replicas = vec![
            ReplicaInfo::new("r1", 5432).with_lag(0.2),
            ReplicaInfo::new("r2", 5432).with_lag(1.0),
        ];
        config
    }

    #[test]
    fn test_route_with_lag_override() {
        let config = config_with_replicas();

        let report = cmd_route(&config, "SELECT 1", Priority::Normal, None, &[]).unwrap();
        assert_eq!(report.target.host, "r1");
        assert_eq!(report.replicas.len(), 2);

        let lags = vec![("r1:5432".to_string(), 30.0)];
        let report = cmd_route(&config, "SELECT 1", Priority::Normal, None, &lags).unwrap();
        assert_eq!(report.target.host, "r2");

        assert!(cmd_route(&config, "SELECT 1", Priority::Normal, None, &[("r9:1".to_string(), 0.0)]).is_err());
    }

    #[test]
    fn test_route_with_type_override() {
        let config = config_with_replicas();
        let report = cmd_route(
            &config,
            "CALL archive_orders()",
            Priority::Normal,
            Some(QueryType::Update),
            &[],
        )
        .unwrap();
        assert_eq!(report.query_type, QueryType::Update);
        assert_eq!(report.target.target_type, TargetType::Primary);
    }

    #[tokio::test]
    async fn test_analyze_query_log() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"query": "SELECT * FROM posts WHERE id = 1", "duration_ms": 3, "request_id": "a"}}"#).unwrap();
        for id in 0..6 {
            writeln!(
                file,
                r#"{{"query": "SELECT * FROM comments WHERE post_id = {}", "duration_ms": 250, "request_id": "a"}}"#,
                id
            )
            .unwrap();
        }
        writeln!(file, "not json").unwrap();
        writeln!(file).unwrap();

        let report = cmd_analyze(&Config::new(), file.path(), None).await.unwrap();

        assert_eq!(report.metrics.total_queries, 7);
        assert_eq!(report.metrics.slow_queries, 6);
        assert_eq!(report.skipped_lines, 1);
        assert_eq!(report.n_plus_one.len(), 1);
        assert_eq!(report.n_plus_one[0].request_id, "a");
        assert_eq!(report.n_plus_one[0].patterns[0].count, 6);
        assert_eq!(report.index_suggestions.len(), 1);
        assert_eq!(report.index_suggestions[0].table, "comments");
        assert_eq!(report.index_suggestions[0].columns, vec!["post_id".to_string()]);
    }

    #[tokio::test]
    async fn test_analyze_slow_override() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"sql": "SELECT 1", "elapsed_ms": 20}}"#).unwrap();

        let report = cmd_analyze(&Config::new(), file.path(), Some(10.0)).await.unwrap();
        assert_eq!(report.metrics.slow_queries, 1);
        assert!(report.n_plus_one.is_empty());
    }

    #[tokio::test]
    async fn test_analyze_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(cmd_analyze(&Config::new(), &dir.path().join("missing.jsonl"), None)
            .await
            .is_err());
    }
}
