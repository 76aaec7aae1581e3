use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::pool::BoxError;
use crate::routing::QueryType;

/// Runs an EXPLAIN for `(query, params)` and returns the plan tree
///
/// The expected shape is PostgreSQL's `EXPLAIN (FORMAT JSON)` output: either
/// the top-level array, a single `{"Plan": ...}` object, or a bare plan node.
pub type ExplainCallback = Arc<dyn Fn(&str, &[Value]) -> Result<Value, BoxError> + Send + Sync>;

static SELECT_STAR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bSELECT\s+\*").unwrap());
static LEADING_WILDCARD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bI?LIKE\s+'%").unwrap());
static ORDER_BY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bORDER\s+BY\b").unwrap());
static LIMIT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bLIMIT\b").unwrap());

/// Result of analyzing one query's execution plan
#[derive(Debug, Clone, Serialize)]
pub struct QueryAnalysis {
    pub query: String,
    pub query_type: QueryType,
    /// Root plan node type, e.g. "Index Scan" or "Seq Scan"
    pub node_type: String,
    /// Whether any node of the plan uses an index
    pub has_index: bool,
    pub startup_cost: Option<f64>,
    pub total_cost: Option<f64>,
    pub plan_rows: Option<f64>,
    pub actual_rows: Option<f64>,
    /// Measured execution time in milliseconds (EXPLAIN ANALYZE only)
    pub execution_time_ms: Option<f64>,
    pub is_slow: bool,
    /// Tables read by a sequential scan somewhere in the plan
    pub seq_scan_tables: Vec<String>,
    pub suggestions: Vec<String>,
    #[serde(skip_serializing)]
    pub plan: Value,
}

/// Locate the root plan node in an EXPLAIN result
pub fn root_node(plan: &Value) -> Option<&Value> {
    let top = match plan {
        Value::Array(items) => items.first()?,
        other => other,
    };
    match top.get("Plan") {
        Some(node) => Some(node),
        None if top.get("Node Type").is_some() => Some(top),
        None => None,
    }
}

fn walk<'a>(node: &'a Value, visit: &mut impl FnMut(&'a Value)) {
    visit(node);
    if let Some(Value::Array(children)) = node.get("Plans") {
        for child in children {
            walk(child, visit);
        }
    }
}

fn number(node: &Value, key: &str) -> Option<f64> {
    node.get(key).and_then(Value::as_f64)
}

/// Analyze `plan` for `query`
///
/// Returns `None` if the plan contains no recognizable root node.
pub fn analyze_plan(
    query: &str,
    plan: Value,
    slow_query_threshold: Duration,
) -> Option<QueryAnalysis> {
    let root = root_node(&plan)?;
    let node_type = root.get("Node Type")?.as_str()?.to_string();

    let mut has_index = false;
    let mut seq_scan_tables = Vec::new();
    walk(root, &mut |node| {
        let Some(kind) = node.get("Node Type").and_then(Value::as_str) else {
            return;
        };
        if kind.contains("Index") {
            has_index = true;
        }
        if kind == "Seq Scan" {
            if let Some(table) = node.get("Relation Name").and_then(Value::as_str) {
                if !seq_scan_tables.iter().any(|t| t == table) {
                    seq_scan_tables.push(table.to_string());
                }
            }
        }
    });

    let top = match &plan {
        Value::Array(items) => items.first().unwrap_or(&plan),
        other => other,
    };
    let execution_time_ms =
        number(top, "Execution Time").or_else(|| number(root, "Actual Total Time"));
    let is_slow = execution_time_ms
        .map(|ms| {
            Duration::try_from_secs_f64(ms.max(0.0) / 1000.0).unwrap_or(Duration::MAX)
                > slow_query_threshold
        })
        .unwrap_or(false);

    let mut suggestions: Vec<String> = seq_scan_tables
        .iter()
        .map(|table| {
            format!(
                "Sequential scan on {}; consider an index on the filtered columns",
                table
            )
        })
        .collect();
    suggestions.extend(heuristics(query));

    Some(QueryAnalysis {
        query: query.to_string(),
        query_type: QueryType::classify(query),
        startup_cost: number(root, "Startup Cost"),
        total_cost: number(root, "Total Cost"),
        plan_rows: number(root, "Plan Rows"),
        actual_rows: number(root, "Actual Rows"),
        node_type,
        has_index,
        execution_time_ms,
        is_slow,
        seq_scan_tables,
        suggestions,
        plan,
    })
}

/// Text-level advice that does not need a plan
pub fn heuristics(query: &str) -> Vec<String> {
    let mut found = Vec::new();
    if SELECT_STAR_RE.is_match(query) {
        found.push("Avoid SELECT *; list only the columns you need".to_string());
    }
    if LEADING_WILDCARD_RE.is_match(query) {
        found.push("LIKE with a leading wildcard cannot use a btree index".to_string());
    }
    if ORDER_BY_RE.is_match(query) && !LIMIT_RE.is_match(query) {
        found.push("ORDER BY without LIMIT sorts the full result set".to_string());
    }
    found
}
