//! aggrtail - Idempotent event aggregator.
//!
//! Accepts events over HTTP, deduplicates them by `(topic, event_id)`,
//! persists each unique event exactly once in SQLite, and reports live
//! counters.

use std::io;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::error;

mod aggregator;
mod cli;
mod errors;
mod models;
mod output;
mod publisher;
mod query;
mod queue;
mod server;
mod stats;
mod store;
mod worker;

use aggregator::AggregatorConfig;
use cli::{Cli, Command};
use worker::WorkerConfig;

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing based on verbosity
    init_tracing(cli.verbose, cli.quiet);

    match cli.command {
        Command::Serve(args) => cmd_serve(args),
        Command::Publish(args) => cmd_publish(&args),
        Command::Query(args) => cmd_query(args),
    }
}

/// Initialize tracing subscriber.
fn init_tracing(verbose: bool, quiet: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

/// Execute the `serve` command - run the pipeline behind the HTTP API.
fn cmd_serve(args: cli::ServeArgs) -> Result<()> {
    let config = server::ServerConfig {
        port: args.port,
        host: args.host,
        aggregator: AggregatorConfig {
            db_path: args.db,
            workers: WorkerConfig {
                workers: usize::from(args.workers),
                batch_size: args.batch_size as usize,
            },
            shutdown_timeout: Duration::from_secs(args.shutdown_timeout),
        },
    };

    tokio::runtime::Runtime::new()
        .context("failed to create tokio runtime")?
        .block_on(server::run_server(config))
}

/// Execute the `publish` command - synthetic load plus verification.
fn cmd_publish(args: &cli::PublishArgs) -> Result<()> {
    let config = publisher::PublisherConfig {
        base_url: args.url.clone(),
        total: args.total,
        duplicate_ratio: args.duplicate_ratio,
        batch_size: args.batch_size,
        topic: args.topic.clone(),
        retries: args.retries,
        wait_timeout: Duration::from_secs(args.wait_timeout),
        ..publisher::PublisherConfig::default()
    };

    let report = publisher::run(&config).context("publisher run failed")?;

    println!("\x1b[1m--- FINAL STATS ---\x1b[0m");
    println!("  Sent:               {}", report.sent);
    println!("  Send time:          {:.2}s", report.send_elapsed.as_secs_f64());
    println!("  Received:           {}", report.received);
    println!("  Unique processed:   {}", report.unique_processed);
    println!("  Duplicates dropped: {}", report.duplicate_dropped);
    println!("  Failed dropped:     {}", report.failed_dropped);
    println!("  Topics:             {:?}", report.topics);

    if !report.is_consistent() {
        anyhow::bail!(
            "counters do not match: expected {} unique / {} duplicates",
            report.expected_unique,
            report.expected_duplicates
        );
    }
    println!("\x1b[92mStatistics verified ✓\x1b[0m");
    Ok(())
}

/// Execute the `query` command - read the store directly.
fn cmd_query(args: cli::QueryArgs) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new().context("failed to create tokio runtime")?;

    runtime.block_on(async {
        if !args.db.exists() {
            anyhow::bail!("database not found: {}", args.db.display());
        }
        let store = store::DedupStore::open(&args.db)
            .await
            .with_context(|| format!("failed to open {}", args.db.display()))?;
        let query = query::QueryService::new(store.clone());

        let stdout = io::stdout();
        let mut handle = stdout.lock();
        match &args.topic {
            Some(topic) => {
                let records = query.list_by_topic(topic).await?;
                output::write_records(&mut handle, &records, args.format)?;
            }
            None => {
                let counts = query.counts_by_topic().await?;
                output::write_counts(&mut handle, &counts, args.format)?;
            }
        }

        store.close().await;
        Ok(())
    })
}
