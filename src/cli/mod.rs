//! CLI module for dbguard
//!
//! Operator commands that exercise the routing and diagnostics layers
//! against a configuration, without a live database.
//!
//! # Usage
//!
//! ```bash
//! # Where would this statement go?
//! dbguard --config dbguard.yaml route "SELECT * FROM orders WHERE id = 7"
//!
//! # Same decision with replica r1 lagging 12 seconds
//! dbguard route "SELECT 1" --lag db-r1:5432=12 --format json
//!
//! # Replay a query log for N+1 patterns and index suggestions
//! dbguard analyze queries.jsonl --slow-ms 50
//!
//! # Show the effective configuration
//! dbguard config
//! ```

pub mod args;
pub mod commands;
pub mod handler;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::config;
use args::{Cli, Commands};
use commands::{cmd_analyze, cmd_route};
use handler::CLIHandler;

/// Run the CLI application
pub async fn run(cli: Cli) -> Result<()> {
    debug!("CLI arguments: {:?}", cli);

    let config = config::load_config(cli.config.as_deref()).context("Failed to load configuration")?;
    let mut handler = CLIHandler::stdout(cli.format);

    match cli.command {
        Commands::Route {
            sql,
            priority,
            query_type,
            lags,
        } => {
            let report = cmd_route(&config, &sql, priority, query_type, &lags)?;
            handler.print_route(&report)?;
        }

        Commands::Analyze { file, slow_ms } => {
            let report = cmd_analyze(&config, &file, slow_ms).await?;
            handler.print_analysis(&report)?;
        }

        Commands::Config { check } => {
            if !check {
                handler.print_config(&config)?;
            }
        }
    }

    info!("Command completed successfully");
    Ok(())
}

/// Initialize logging to stderr; RUST_LOG wins over `level`
pub fn init_logging(level: &str) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();
}
