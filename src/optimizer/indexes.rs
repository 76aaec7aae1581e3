use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};

use super::patterns::normalize_query;

const COLUMN: &str = r"[A-Za-z_]\w*(?:\.[A-Za-z_]\w*)?";

static TABLE_REF_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:FROM|JOIN|UPDATE)\s+([A-Za-z_][\w.]*)(?:\s+(?:AS\s+)?([A-Za-z_]\w*))?").unwrap()
});
static WHERE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?is)\bWHERE\b(.*?)(?:\bGROUP\s+BY\b|\bORDER\s+BY\b|\bLIMIT\b|\bHAVING\b|\bOFFSET\b|\bRETURNING\b|$)",
    )
    .unwrap()
});
static CONDITION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"(?i)\b({})\s*(?:=|<>|!=|<=|>=|<|>|\s(?:NOT\s+)?(?:LIKE|ILIKE|IN|BETWEEN)\b|\sIS\b)",
        COLUMN
    ))
    .unwrap()
});
static JOIN_ON_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"(?i)\bON\s+({})\s*=\s*({})", COLUMN, COLUMN)).unwrap()
});
static ORDER_BY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)\bORDER\s+BY\s+(.*?)(?:\bLIMIT\b|\bOFFSET\b|\bFOR\b|$)").unwrap()
});
static COLUMN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(&format!("^{}$", COLUMN)).unwrap());

/// Words that can follow a table name or precede an operator without being
/// an alias or a column
const KEYWORDS: &[&str] = &[
    "and", "as", "asc", "between", "by", "case", "cross", "desc", "else", "end", "exists",
    "false", "for", "from", "full", "group", "having", "ilike", "in", "inner", "is", "join",
    "left", "like", "limit", "natural", "not", "null", "offset", "on", "or", "order", "outer",
    "returning", "right", "select", "set", "then", "true", "union", "using", "when", "where",
];

fn is_keyword(word: &str) -> bool {
    KEYWORDS.contains(&word.to_ascii_lowercase().as_str())
}

/// A proposed index over columns that recur in slow queries
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexSuggestion {
    pub table: String,
    pub columns: Vec<String>,
    /// Number of queries that would use this index
    pub frequency: usize,
    pub create_statement: String,
}

impl IndexSuggestion {
    fn new(table: String, columns: Vec<String>, frequency: usize) -> Self {
        let name = format!("idx_{}_{}", table.replace('.', "_"), columns.join("_"));
        let create_statement = format!(
            "CREATE INDEX {} ON {} ({});",
            name,
            table,
            columns.join(", ")
        );
        Self {
            table,
            columns,
            frequency,
            create_statement,
        }
    }
}

/// Table references of one statement, with alias resolution
struct Tables {
    primary: Option<String>,
    aliases: HashMap<String, String>,
}

impl Tables {
    fn parse(sql: &str) -> Self {
        let mut primary = None;
        let mut aliases = HashMap::new();

        for caps in TABLE_REF_RE.captures_iter(sql) {
            let table = caps[1].to_ascii_lowercase();
            if is_keyword(&table) {
                continue;
            }
            if primary.is_none() {
                primary = Some(table.clone());
            }
            if let Some(alias) = caps.get(2) {
                let alias = alias.as_str().to_ascii_lowercase();
                if !is_keyword(&alias) {
                    aliases.insert(alias, table.clone());
                }
            }
            aliases.insert(table.clone(), table);
        }

        Self { primary, aliases }
    }

    /// Resolve `col` or `qualifier.col` to `(table, column)`
    fn resolve(&self, reference: &str) -> Option<(String, String)> {
        let reference = reference.to_ascii_lowercase();
        match reference.rsplit_once('.') {
            Some((qualifier, column)) => {
                let table = self
                    .aliases
                    .get(qualifier)
                    .cloned()
                    .unwrap_or_else(|| qualifier.to_string());
                Some((table, column.to_string()))
            }
            None => {
                if is_keyword(&reference) {
                    return None;
                }
                self.primary.clone().map(|table| (table, reference))
            }
        }
    }
}

fn push_unique(columns: &mut Vec<String>, column: String) {
    if !columns.contains(&column) {
        columns.push(column);
    }
}

/// Candidate `(table, columns)` combinations used by one statement
fn candidates(sql: &str) -> HashSet<(String, Vec<String>)> {
    let sql = normalize_query(sql);
    let tables = Tables::parse(&sql);
    let mut found = HashSet::new();

    // Filter columns on the same table form one composite candidate
    if let Some(clause) = WHERE_RE.captures(&sql).and_then(|c| c.get(1)) {
        let mut by_table: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for caps in CONDITION_RE.captures_iter(clause.as_str()) {
            if let Some((table, column)) = tables.resolve(&caps[1]) {
                push_unique(by_table.entry(table).or_default(), column);
            }
        }
        found.extend(by_table);
    }

    for caps in JOIN_ON_RE.captures_iter(&sql) {
        for side in [&caps[1], &caps[2]] {
            if let Some((table, column)) = tables.resolve(side) {
                found.insert((table, vec![column]));
            }
        }
    }

    if let Some(clause) = ORDER_BY_RE.captures(&sql).and_then(|c| c.get(1)) {
        let mut by_table: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for item in clause.as_str().split(',') {
            let Some(expr) = item.split_whitespace().next() else {
                continue;
            };
            if !COLUMN_RE.is_match(expr) {
                continue;
            }
            if let Some((table, column)) = tables.resolve(expr) {
                push_unique(by_table.entry(table).or_default(), column);
            }
        }
        found.extend(by_table);
    }

    found
}

/// Count candidate column combinations across `queries` and propose an index
/// for each combination used by at least `min_occurrences` of them
pub fn suggest<'a, I>(queries: I, min_occurrences: usize) -> Vec<IndexSuggestion>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut counts: HashMap<(String, Vec<String>), usize> = HashMap::new();
    for sql in queries {
        for candidate in candidates(sql) {
            *counts.entry(candidate).or_insert(0) += 1;
        }
    }

    let mut suggestions: Vec<IndexSuggestion> = counts
        .into_iter()
        .filter(|(_, frequency)| *frequency >= min_occurrences)
        .map(|((table, columns), frequency)| IndexSuggestion::new(table, columns, frequency))
        .collect();

    suggestions.sort_by(|a, b| {
        b.frequency
            .cmp(&a.frequency)
            .then_with(|| a.table.cmp(&b.table))
            .then_with(|| a.columns.cmp(&b.columns))
    });
    suggestions
}

#[cfg(test)]
mod tests {
    use super::*;

    fn columns_of(sql: &str) -> Vec<(String, Vec<String>)> {
        let mut found: Vec<_> = candidates(sql).into_iter().collect();
        found.sort();
        found
    }

    fn combo(table: &str, columns: &[&str]) -> (String, Vec<String>) {
        (
            table.to_string(),
            columns.iter().map(|c| c.to_string()).collect(),
        )
    }

    #[test]
    fn test_where_columns() {
        assert_eq!(
            columns_of("SELECT * FROM users WHERE email = 'a@b.c' AND status IN ('x', 'y')"),
            vec![combo("users", &["email", "status"])]
        );
    }

    #[test]
    fn test_alias_and_join_resolution() {
        let found = columns_of(
            "SELECT p.title FROM posts p JOIN users AS u ON p.author_id = u.id \
             WHERE u.country = 'NZ' ORDER BY p.created_at DESC LIMIT 10",
        );
        assert_eq!(
            found,
            vec![
                combo("posts", &["author_id"]),
                combo("posts", &["created_at"]),
                combo("users", &["country"]),
                combo("users", &["id"]),
            ]
        );
    }

    #[test]
    fn test_keyword_is_not_alias() {
        let tables = Tables::parse("SELECT * FROM orders WHERE total > 5");
        assert_eq!(tables.primary.as_deref(), Some("orders"));
        assert!(!tables.aliases.contains_key("where"));
    }

    #[test]
    fn test_is_null_and_like() {
        assert_eq!(
            columns_of("select id from accounts where deleted_at is null and name like 'bo%'"),
            vec![combo("accounts", &["deleted_at", "name"])]
        );
    }

    #[test]
    fn test_suggest_threshold() {
        let five: Vec<String> = (0..5)
            .map(|i| format!("SELECT * FROM users WHERE email = 'user{}@example.com'", i))
            .collect();
        let suggestions = suggest(five.iter().map(String::as_str), 3);
        assert_eq!(suggestions.len(), 1);
        assert_eq!(suggestions[0].table, "users");
        assert_eq!(suggestions[0].columns, vec!["email".to_string()]);
        assert_eq!(suggestions[0].frequency, 5);
        assert_eq!(
            suggestions[0].create_statement,
            "CREATE INDEX idx_users_email ON users (email);"
        );

        assert!(suggest(five[..2].iter().map(String::as_str), 3).is_empty());
    }

    #[test]
    fn test_queries_without_predicates() {
        assert!(columns_of("SELECT count(*) FROM users").is_empty());
        assert!(columns_of("VACUUM").is_empty());
    }
}
