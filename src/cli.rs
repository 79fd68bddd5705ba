//! Command-line interface definitions.
//!
//! Uses clap derive API for argument parsing.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::output::Format;

/// Idempotent event aggregator.
#[derive(Parser, Debug)]
#[command(name = "aggrtail")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Command to run
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose debug logging
    #[arg(long, global = true)]
    pub verbose: bool,

    /// Suppress all output except errors
    #[arg(long, global = true)]
    pub quiet: bool,
}

/// Available commands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the aggregator HTTP server and workers
    Serve(ServeArgs),

    /// Send synthetic load to a running aggregator and verify the counters
    Publish(PublishArgs),

    /// Read stored events straight from the database
    Query(QueryArgs),
}

/// Arguments for the `serve` command.
#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// Port to listen on
    #[arg(long, short = 'p', default_value = "8080")]
    pub port: u16,

    /// Host to bind to
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    /// SQLite database file
    #[arg(long, default_value = crate::aggregator::DEFAULT_DB_PATH)]
    pub db: PathBuf,

    /// Number of batch consumers
    #[arg(long, short = 'w', default_value = "2", value_parser = clap::value_parser!(u16).range(1..))]
    pub workers: u16,

    /// Maximum events per batch
    #[arg(long, default_value = "100", value_parser = clap::value_parser!(u32).range(1..))]
    pub batch_size: u32,

    /// Seconds to wait for workers on shutdown
    #[arg(long, default_value = "10")]
    pub shutdown_timeout: u64,
}

/// Arguments for the `publish` command.
#[derive(Parser, Debug)]
pub struct PublishArgs {
    /// Aggregator base URL
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    pub url: String,

    /// Total number of events to send
    #[arg(long, short = 'n', default_value = "5000")]
    pub total: usize,

    /// Share of events reusing an earlier id (0.0 to 1.0)
    #[arg(long, default_value = "0.2", value_parser = parse_ratio)]
    pub duplicate_ratio: f64,

    /// Events per HTTP request
    #[arg(long, default_value = "100")]
    pub batch_size: usize,

    /// Topic for generated events
    #[arg(long, default_value = "logs")]
    pub topic: String,

    /// Attempts per batch before giving up
    #[arg(long, default_value = "3")]
    pub retries: u32,

    /// Seconds to wait for the aggregator to become ready and to settle
    #[arg(long, default_value = "60")]
    pub wait_timeout: u64,
}

/// Arguments for the `query` command.
#[derive(Parser, Debug)]
pub struct QueryArgs {
    /// SQLite database file
    #[arg(long, default_value = crate::aggregator::DEFAULT_DB_PATH)]
    pub db: PathBuf,

    /// List events of this topic; without it, print per-topic counts
    #[arg(long, short = 't')]
    pub topic: Option<String>,

    /// Output format
    #[arg(long, short = 'f', default_value = "human", value_parser = parse_format)]
    pub format: Format,
}

/// Parse an output format from string.
fn parse_format(s: &str) -> Result<Format, String> {
    s.parse()
}

/// Parse a ratio in `0.0..=1.0`.
fn parse_ratio(s: &str) -> Result<f64, String> {
    let value: f64 = s.parse().map_err(|e| format!("invalid ratio '{s}': {e}"))?;
    if (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(format!("ratio must be between 0.0 and 1.0, got {value}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serve_defaults() {
        let cli = Cli::parse_from(["aggrtail", "serve"]);
        let Command::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(args.port, 8080);
        assert_eq!(args.workers, 2);
        assert_eq!(args.batch_size, 100);
        assert_eq!(args.db, PathBuf::from("data/aggregator.db"));
    }

    #[test]
    fn test_rejects_zero_workers() {
        assert!(Cli::try_parse_from(["aggrtail", "serve", "--workers", "0"]).is_err());
    }

    #[test]
    fn test_ratio_bounds() {
        assert!(parse_ratio("0.5").is_ok());
        assert!(parse_ratio("1.5").is_err());
        assert!(parse_ratio("abc").is_err());
    }
}
