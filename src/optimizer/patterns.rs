use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;

use crate::routing::QueryType;

static STRING_LITERAL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"'(?:[^']|'')*'").unwrap());
static NUMBER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d+(?:\.\d+)?\b").unwrap());
static POSITIONAL_PARAM_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\$\d+").unwrap());
static IN_LIST_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bIN\s*\(\s*\?(?:\s*,\s*\?)*\s*\)").unwrap());
static WHITESPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());
static TABLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)\b(?:FROM|INTO|UPDATE)\s+([A-Za-z_"][\w."]*)"#).unwrap());

/// A group of structurally identical queries seen within one request or batch
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NPlusOnePattern {
    /// Normalized query shape shared by every member of the group
    pub pattern: String,
    pub count: usize,
    pub table: Option<String>,
    /// First concrete query of the group
    pub example: String,
    pub recommendation: String,
}

/// Reduce a query to its structure: literals and bind parameters become `?`,
/// `IN (...)` lists collapse, whitespace is normalized
pub fn normalize_query(sql: &str) -> String {
    let sql = STRING_LITERAL_RE.replace_all(sql, "?");
    let sql = POSITIONAL_PARAM_RE.replace_all(&sql, "?");
    let sql = NUMBER_RE.replace_all(&sql, "?");
    let sql = IN_LIST_RE.replace_all(&sql, "IN (?)");
    let sql = WHITESPACE_RE.replace_all(&sql, " ");
    sql.trim().trim_end_matches(';').trim_end().to_string()
}

/// First table a statement reads from or writes to
pub fn extract_table(sql: &str) -> Option<String> {
    TABLE_RE
        .captures(sql)
        .map(|caps| caps[1].trim_matches('"').to_string())
}

/// Group `queries` by normalized shape and report every group larger than
/// `threshold`, largest first
pub fn detect<I, S>(queries: I, threshold: usize) -> Vec<NPlusOnePattern>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    // pattern -> (first seen index, example, count)
    let mut groups: HashMap<String, (usize, String, usize)> = HashMap::new();

    for (index, query) in queries.into_iter().enumerate() {
        let query = query.as_ref();
        if query.trim().is_empty() {
            continue;
        }
        let entry = groups
            .entry(normalize_query(query))
            .or_insert_with(|| (index, query.to_string(), 0));
        entry.2 += 1;
    }

    let mut found: Vec<(usize, NPlusOnePattern)> = groups
        .into_iter()
        .filter(|(_, (_, _, count))| *count > threshold)
        .map(|(pattern, (first_seen, example, count))| {
            let table = extract_table(&example);
            let recommendation = recommendation_for(&example, table.as_deref(), count);
            (
                first_seen,
                NPlusOnePattern {
                    pattern,
                    count,
                    table,
                    example,
                    recommendation,
                },
            )
        })
        .collect();

    found.sort_by(|a, b| b.1.count.cmp(&a.1.count).then(a.0.cmp(&b.0)));
    found.into_iter().map(|(_, pattern)| pattern).collect()
}

fn recommendation_for(example: &str, table: Option<&str>, count: usize) -> String {
    let target = table.unwrap_or("the related table");
    match QueryType::classify(example) {
        QueryType::Select => format!(
            "{} identical lookups on {}; eager-load the relation or fetch all rows in one query with WHERE ... IN (...)",
            count, target
        ),
        QueryType::Insert => format!(
            "{} single-row inserts into {}; use one multi-row INSERT or a bulk copy",
            count, target
        ),
        QueryType::Update | QueryType::Delete => format!(
            "{} per-row statements against {}; apply them as one set-based statement",
            count, target
        ),
        QueryType::Other => format!(
            "{} repetitions of the same statement; batch them into a single round trip",
            count
        ),
    }
}
