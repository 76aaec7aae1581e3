use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Statement kind, as far as routing is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QueryType {
    Select,
    Insert,
    Update,
    Delete,
    /// Anything that is not recognized; routed to the primary
    Other,
}

impl QueryType {
    /// Classify a statement by its leading keyword
    ///
    /// Leading whitespace and comments are skipped. For `WITH` statements
    /// the statement following the CTE list decides, unless a CTE body
    /// itself modifies data, in which case that write wins.
    pub fn classify(sql: &str) -> QueryType {
        let mut words = SqlWords::new(sql);
        let Some((first, _)) = words.next() else {
            return QueryType::Other;
        };

        if !first.eq_ignore_ascii_case("with") {
            return QueryType::from_keyword(first).unwrap_or(QueryType::Other);
        }

        let mut main = None;
        for (word, depth) in words {
            let Some(kind) = QueryType::from_keyword(word) else {
                continue;
            };
            if depth > 0 && kind.is_write() {
                return kind;
            }
            if depth == 0 && main.is_none() {
                main = Some(kind);
            }
        }
        main.unwrap_or(QueryType::Other)
    }

    /// Map a statement keyword (case-insensitive) to its type
    pub fn from_keyword(word: &str) -> Option<QueryType> {
        match word.to_ascii_uppercase().as_str() {
            "SELECT" => Some(QueryType::Select),
            "INSERT" => Some(QueryType::Insert),
            "UPDATE" => Some(QueryType::Update),
            "DELETE" => Some(QueryType::Delete),
            _ => None,
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(self, QueryType::Insert | QueryType::Update | QueryType::Delete)
    }

    pub fn is_read(&self) -> bool {
        matches!(self, QueryType::Select)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QueryType::Select => "SELECT",
            QueryType::Insert => "INSERT",
            QueryType::Update => "UPDATE",
            QueryType::Delete => "DELETE",
            QueryType::Other => "OTHER",
        }
    }
}

impl fmt::Display for QueryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Routing priority hint supplied by the caller
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    #[default]
    Normal,
    High,
    /// Always served by the primary
    Critical,
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            other => Err(format!(
                "unknown priority '{}', expected normal, high or critical",
                other
            )),
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        })
    }
}

/// A unit of work to route
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub text: String,

    #[serde(default)]
    pub params: Vec<serde_json::Value>,

    /// Declared type; classified from `text` when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_type: Option<QueryType>,
}

impl Query {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            params: Vec::new(),
            query_type: None,
        }
    }

    pub fn with_params(mut self, params: Vec<serde_json::Value>) -> Self {
        self.params = params;
        self
    }

    pub fn with_type(mut self, query_type: QueryType) -> Self {
        self.query_type = Some(query_type);
        self
    }

    /// Declared type, or the type classified from the text
    pub fn query_type(&self) -> QueryType {
        self.query_type
            .unwrap_or_else(|| QueryType::classify(&self.text))
    }
}

/// Iterator over identifier-like words of a SQL string and their paren depth,
/// skipping comments and quoted literals
struct SqlWords<'a> {
    sql: &'a str,
    pos: usize,
    depth: usize,
}

impl<'a> SqlWords<'a> {
    fn new(sql: &'a str) -> Self {
        Self { sql, pos: 0, depth: 0 }
    }

    fn skip_quoted(&mut self, quote: u8) {
        let bytes = self.sql.as_bytes();
        self.pos += 1;
        while self.pos < bytes.len() {
            if bytes[self.pos] == quote {
                // A doubled quote is an escaped quote
                if bytes.get(self.pos + 1) == Some(&quote) {
                    self.pos += 2;
                    continue;
                }
                self.pos += 1;
                return;
            }
            self.pos += 1;
        }
    }
}

impl<'a> Iterator for SqlWords<'a> {
    type Item = (&'a str, usize);

    fn next(&mut self) -> Option<Self::Item> {
        let bytes = self.sql.as_bytes();

        while self.pos < bytes.len() {
            let c = bytes[self.pos];
            let next = bytes.get(self.pos + 1).copied();

            match c {
                b'-' if next == Some(b'-') => {
                    self.pos = self.sql[self.pos..]
                        .find('\n')
                        .map_or(bytes.len(), |i| self.pos + i + 1);
                }
                b'/' if next == Some(b'*') => {
                    self.pos = self.sql[self.pos + 2..]
                        .find("*/")
                        .map_or(bytes.len(), |i| self.pos + 2 + i + 2);
                }
                b'\'' | b'"' | b'`' => self.skip_quoted(c),
                b'(' => {
                    self.depth += 1;
                    self.pos += 1;
                }
                b')' => {
                    self.depth = self.depth.saturating_sub(1);
                    self.pos += 1;
                }
                c if c.is_ascii_alphabetic() || c == b'_' => {
                    let start = self.pos;
                    while self.pos < bytes.len()
                        && (bytes[self.pos].is_ascii_alphanumeric() || bytes[self.pos] == b'_')
                    {
                        self.pos += 1;
                    }
                    return Some((&self.sql[start..self.pos], self.depth));
                }
                _ => self.pos += 1,
            }
        }

        None
    }
}
