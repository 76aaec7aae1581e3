use anyhow::{Context, Result};
use serde::Serialize;
use std::io::Write;

use super::commands::{AnalyzeReport, RouteReport};
use crate::cli::args::OutputFormat;
use crate::config::Config;

/// CLI Handler - renders command reports in the selected output format
pub struct CLIHandler<W: Write> {
    format: OutputFormat,
    out: W,
}

impl CLIHandler<std::io::Stdout> {
    pub fn stdout(format: OutputFormat) -> Self {
        Self::new(format, std::io::stdout())
    }
}

impl<W: Write> CLIHandler<W> {
    pub fn new(format: OutputFormat, out: W) -> Self {
        Self { format, out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn json<T: Serialize>(&mut self, value: &T) -> Result<()> {
        serde_json::to_writer_pretty(&mut self.out, value).context("Failed to encode JSON")?;
        writeln!(self.out)?;
        Ok(())
    }

    pub fn print_route(&mut self, report: &RouteReport) -> Result<()> {
        if self.format == OutputFormat::Json {
            return self.json(report);
        }

        let target = &report.target;
        writeln!(self.out, "Query type: {}", report.query_type)?;
        writeln!(self.out, "Priority:   {}", report.priority)?;
        writeln!(
            self.out,
            "Target:     {} {}:{}",
            target.target_type, target.host, target.port
        )?;
        writeln!(self.out, "Reason:     {}", target.reason)?;

        if !report.replicas.is_empty() {
            writeln!(self.out)?;
            writeln!(
                self.out,
                "{:<28} {:>8} {:>10} {:>9}",
                "REPLICA", "HEALTHY", "LAG (s)", "ELIGIBLE"
            )?;
            for replica in &report.replicas {
                writeln!(
                    self.out,
                    "{:<28} {:>8} {:>10.3} {:>9}",
                    replica.id,
                    if replica.is_healthy { "yes" } else { "no" },
                    replica.replication_lag,
                    if replica.eligible { "yes" } else { "no" }
                )?;
            }
        }
        Ok(())
    }

    pub fn print_analysis(&mut self, report: &AnalyzeReport) -> Result<()> {
        if self.format == OutputFormat::Json {
            return self.json(report);
        }

        let m = &report.metrics;
        writeln!(self.out, "Queries:        {}", m.total_queries)?;
        writeln!(
            self.out,
            "Slow queries:   {} ({:.1}%)",
            m.slow_queries, m.slow_query_rate
        )?;
        writeln!(self.out, "Avg time:       {:.2} ms", m.avg_execution_time_ms)?;
        if report.skipped_lines > 0 {
            writeln!(self.out, "Skipped lines:  {}", report.skipped_lines)?;
        }

        writeln!(self.out)?;
        if report.n_plus_one.is_empty() {
            writeln!(self.out, "No N+1 patterns found")?;
        } else {
            writeln!(self.out, "N+1 patterns:")?;
            for request in &report.n_plus_one {
                for pattern in &request.patterns {
                    writeln!(
                        self.out,
                        "  [{}] {}x {}",
                        request.request_id, pattern.count, pattern.pattern
                    )?;
                    writeln!(self.out, "      {}", pattern.recommendation)?;
                }
            }
        }

        writeln!(self.out)?;
        if report.index_suggestions.is_empty() {
            writeln!(self.out, "No index suggestions")?;
        } else {
            writeln!(self.out, "Index suggestions:")?;
            for suggestion in &report.index_suggestions {
                writeln!(
                    self.out,
                    "  {}  -- used by {} slow queries",
                    suggestion.create_statement, suggestion.frequency
                )?;
            }
        }
        Ok(())
    }

    pub fn print_config(&mut self, config: &Config) -> Result<()> {
        match self.format {
            OutputFormat::Json => self.json(config),
            OutputFormat::Text => {
                let yaml = serde_yaml::to_string(config).context("Failed to encode YAML")?;
                self.out.write_all(yaml.as_bytes())?;
                Ok(())
            }
        }
    }
}
