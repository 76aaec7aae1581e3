use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::routing::{Priority, QueryType};

/// dbguard - database resilience and workload routing toolkit
#[derive(Parser, Debug)]
#[command(name = "dbguard")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file path (YAML); environment variables are used when absent
    #[arg(long, global = true, env = "DBGUARD_CONFIG")]
    pub config: Option<String>,

    /// Log level (error, warn, info, debug, trace); RUST_LOG takes precedence
    #[arg(long, global = true, default_value = "warn")]
    pub log_level: String,

    /// Output format (text, json)
    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Classify a SQL statement and show where it would be routed
    Route {
        /// SQL statement
        #[arg(value_name = "SQL")]
        sql: String,

        /// Routing priority (normal, high, critical)
        #[arg(short, long, default_value = "normal")]
        priority: Priority,

        /// Override the classified statement type
        #[arg(long, value_parser = parse_query_type)]
        query_type: Option<QueryType>,

        /// Override a replica's lag for this decision (HOST:PORT=SECONDS), repeatable
        #[arg(long = "lag", value_name = "HOST:PORT=SECONDS", value_parser = parse_lag_override)]
        lags: Vec<(String, f64)>,
    },

    /// Replay a JSON-lines query log: metrics, N+1 patterns and index suggestions
    Analyze {
        /// Query log file, one JSON object per line
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Override the slow query threshold in milliseconds
        #[arg(long)]
        slow_ms: Option<f64>,
    },

    /// Print the effective configuration
    Config {
        /// Only validate, print nothing on success
        #[arg(long)]
        check: bool,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

/// Parse a statement type name (select, insert, update, delete, other)
pub fn parse_query_type(raw: &str) -> Result<QueryType> {
    match raw.to_ascii_lowercase().as_str() {
        "other" => Ok(QueryType::Other),
        word => QueryType::from_keyword(word)
            .with_context(|| format!("Unknown query type '{}'", raw)),
    }
}

/// Parse `HOST:PORT=SECONDS`
pub fn parse_lag_override(raw: &str) -> Result<(String, f64)> {
    let (id, lag) = raw
        .split_once('=')
        .with_context(|| format!("Expected HOST:PORT=SECONDS, got '{}'", raw))?;
    let lag: f64 = lag
        .trim()
        .parse()
        .with_context(|| format!("Invalid lag in '{}'", raw))?;
    Ok((id.trim().to_string(), lag))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_lag_override() {
        assert_eq!(
            parse_lag_override("db-r1:5432=2.5").unwrap(),
            ("db-r1:5432".to_string(), 2.5)
        );
        assert!(parse_lag_override("db-r1:5432").is_err());
        assert!(parse_lag_override("db-r1:5432=soon").is_err());
    }

    #[test]
    fn test_parse_query_type() {
        assert_eq!(parse_query_type("Insert").unwrap(), QueryType::Insert);
        assert_eq!(parse_query_type("other").unwrap(), QueryType::Other);
        assert!(parse_query_type("merge").is_err());
    }

    #[test]
    fn test_cli_parses_route() {
        let cli = Cli::try_parse_from([
            "dbguard",
            "--format",
            "json",
            "route",
            "SELECT 1",
            "--priority",
            "critical",
            "--lag",
            "r1:5432=9",
        ])
        .unwrap();

        assert_eq!(cli.format, OutputFormat::Json);
        match cli.command {
            Commands::Route {
                sql,
                priority,
                query_type,
                lags,
            } => {
                assert_eq!(sql, "SELECT 1");
                assert_eq!(priority, Priority::Critical);
                assert!(query_type.is_none());
                assert_eq!(lags, vec![("r1:5432".to_string(), 9.0)]);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
