use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use lookout_client::{HttpErrorClassifier, HttpSessionFactory, SourceCatalog};
use lookout_core::config::{ConfigSource, EnvSource, JsonFileSource, OrchestratorConfig};
use lookout_core::{Priority, Scheduler, TaskReport, TaskStatus};

#[derive(Parser)]
#[command(name = "lookout", version, about = "Resilient identifier lookups across many sources")]
struct Cli {
    /// JSON configuration file (scheduler settings plus `sources`)
    #[arg(short, long, global = true, env = "LOOKOUT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Look up identifiers on the configured sources
    Run {
        /// Identifiers to look up
        identifiers: Vec<String>,

        /// CSV file with one identifier per row
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// CSV column holding the identifiers (defaults to the first column)
        #[arg(long)]
        column: Option<String>,

        /// Endpoints to try, comma separated (defaults to every configured source)
        #[arg(short, long, value_delimiter = ',')]
        endpoints: Vec<String>,

        /// Priority of the batch: critical, high, medium or low
        #[arg(short, long, default_value = "medium")]
        priority: Priority,

        /// How long in-flight lookups may finish after Ctrl-C, in milliseconds
        #[arg(long, default_value_t = 10_000)]
        drain_timeout_ms: u64,

        /// Write results here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Include endpoint and pool statistics in the output
        #[arg(long, default_value_t = false)]
        stats: bool,

        /// User-Agent sent by every session
        #[arg(long, env = "LOOKOUT_USER_AGENT", default_value = "lookout/0.1")]
        user_agent: String,
    },

    /// Validate the configuration and list the configured sources
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("lookout=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    let catalog = match &cli.config {
        Some(path) => SourceCatalog::from_json_file(path).map_err(|e| anyhow::anyhow!(e))?,
        None => SourceCatalog::default(),
    };

    match cli.command {
        Commands::Run {
            identifiers,
            input,
            column,
            endpoints,
            priority,
            drain_timeout_ms,
            output,
            stats,
            user_agent,
        } => {
            let mut identifiers = identifiers;
            if let Some(path) = &input {
                identifiers.extend(read_identifiers(path, column.as_deref())?);
            }
            if identifiers.is_empty() {
                bail!("No identifiers given. Pass them as arguments or with --input.");
            }

            let endpoints = if endpoints.is_empty() {
                catalog.endpoints()
            } else {
                endpoints
            };
            if endpoints.is_empty() {
                bail!("No endpoints. Add `sources` to the config file or pass --endpoints.");
            }
            if let Some(missing) = endpoints.iter().find(|e| catalog.get(e).is_none()) {
                bail!("Endpoint '{missing}' has no source in the configuration");
            }

            let run = RunArgs {
                identifiers,
                endpoints,
                priority,
                drain_timeout: Duration::from_millis(drain_timeout_ms),
                output,
                stats,
                user_agent,
            };
            cmd_run(config, catalog, run).await?;
        }
        Commands::CheckConfig => cmd_check_config(&config, &catalog)?,
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<OrchestratorConfig> {
    let loaded = match path {
        Some(path) => JsonFileSource::new(path).load(),
        None => EnvSource.load(),
    };
    loaded.map_err(|e| anyhow::anyhow!(e)).context("Failed to load configuration")
}

/// Read identifiers from a CSV file, skipping blank cells.
fn read_identifiers(path: &Path, column: Option<&str>) -> Result<Vec<String>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open CSV file: {}", path.display()))?;

    let index = match column {
        Some(name) => reader
            .headers()
            .context("CSV file has no header row")?
            .iter()
            .position(|h| h.trim() == name)
            .with_context(|| format!("Column '{name}' not found in {}", path.display()))?,
        None => 0,
    };

    let mut identifiers = Vec::new();
    for record in reader.records() {
        let record = record.with_context(|| format!("Malformed row in {}", path.display()))?;
        if let Some(value) = record.get(index).map(str::trim).filter(|v| !v.is_empty()) {
            identifiers.push(value.to_string());
        }
    }
    Ok(identifiers)
}

struct RunArgs {
    identifiers: Vec<String>,
    endpoints: Vec<String>,
    priority: Priority,
    drain_timeout: Duration,
    output: Option<PathBuf>,
    stats: bool,
    user_agent: String,
}

async fn cmd_run(config: OrchestratorConfig, catalog: SourceCatalog, args: RunArgs) -> Result<()> {
    let factory = HttpSessionFactory::new()
        .with_user_agent(args.user_agent)
        .with_timeout(config.attempt_timeout);
    let scheduler = Scheduler::builder(config, factory, catalog, HttpErrorClassifier)
        .build()
        .map_err(|e| anyhow::anyhow!(e))?;

    let handle = scheduler
        .submit(args.identifiers, &args.endpoints, args.priority)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;
    let order = handle.identifiers().to_vec();

    tracing::info!(
        identifiers = order.len(),
        endpoints = args.endpoints.len(),
        "Lookups started"
    );

    let pending = scheduler.await_all(handle);
    tokio::pin!(pending);
    let mut results = tokio::select! {
        results = &mut pending => results,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Interrupted, shutting down");
            scheduler.shutdown(args.drain_timeout).await;
            pending.await
        }
    };

    let stats = args.stats.then(|| scheduler.stats());
    let report = scheduler.shutdown(args.drain_timeout).await;
    tracing::debug!(
        pending_cancelled = report.pending_cancelled,
        in_flight_aborted = report.in_flight_aborted,
        "Scheduler stopped"
    );

    let ordered: Vec<TaskReport> = order.iter().filter_map(|id| results.remove(id)).collect();
    log_summary(&ordered);

    let mut document = serde_json::json!({ "results": ordered });
    if let Some(stats) = stats {
        document["stats"] = serde_json::to_value(stats)?;
    }
    let rendered = serde_json::to_string_pretty(&document)?;

    match &args.output {
        Some(path) => {
            std::fs::write(path, rendered)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            tracing::info!(path = %path.display(), "Results written");
        }
        None => println!("{rendered}"),
    }

    Ok(())
}

fn log_summary(reports: &[TaskReport]) {
    let mut counts: HashMap<TaskStatus, usize> = HashMap::new();
    for report in reports {
        *counts.entry(report.status).or_default() += 1;
    }
    let count = |status| counts.get(&status).copied().unwrap_or(0);
    tracing::info!(
        succeeded = count(TaskStatus::Succeeded),
        exhausted = count(TaskStatus::Exhausted),
        cancelled = count(TaskStatus::Cancelled),
        cached = reports.iter().filter(|r| r.cached).count(),
        "Lookups finished"
    );
}

fn cmd_check_config(config: &OrchestratorConfig, catalog: &SourceCatalog) -> Result<()> {
    println!("Configuration OK");
    println!("  workers:           {}", config.workers);
    println!("  queue capacity:    {}", config.queue_capacity);
    println!("  lease timeout:     {} ms", config.lease_timeout.as_millis());
    println!("  attempt timeout:   {} ms", config.attempt_timeout.as_millis());
    println!("  max task attempts: {}", config.max_task_attempts);

    if catalog.is_empty() {
        println!("\nNo sources configured.");
        return Ok(());
    }

    println!("\nSources:");
    for endpoint in catalog.endpoints() {
        let kind = catalog.get(&endpoint).map(|s| s.kind()).unwrap_or("?");
        let settings = config.endpoints.get(&endpoint);
        let priority = settings
            .map(|e| e.priority)
            .unwrap_or(lookout_core::EndpointConfig::DEFAULT_PRIORITY);
        println!(
            "  {endpoint} ({kind}) group={} priority={priority} pool={}",
            config.group_for(&endpoint),
            config.pool.size_for(&config.group_for(&endpoint)),
        );
    }
    Ok(())
}
