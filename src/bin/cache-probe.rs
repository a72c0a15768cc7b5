//! # Cache Probe
//!
//! Operator tool for checking a cache deployment: health round trips, key lookups,
//! pattern purges, and lock acquisition against the configured quorum.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use resilient_cache::{
    init_structured_logging, load_settings_from, CacheRuntime, CacheSettings, HealthStatus,
    Tolerance,
};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "cache-probe")]
#[command(about = "Inspect and exercise a resilient cache deployment")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Configuration file path (default: config/cache.toml if present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Output format (table, json)
    #[arg(long, default_value = "table")]
    format: String,

    /// Subcommands
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Round-trip the cache and check the lock quorum
    Health,

    /// Show the effective configuration with credentials masked
    Config,

    /// Read a key and its remaining time-to-live
    Get {
        /// Key to read
        #[arg(short, long)]
        key: String,
    },

    /// Delete keys matching a glob pattern
    Purge {
        /// Glob pattern passed to the store's scan
        #[arg(short, long)]
        pattern: Option<String>,
        /// Delete every key that starts with this prefix
        #[arg(long, conflicts_with = "pattern")]
        prefix: Option<String>,
    },

    /// Acquire and release a distributed lock
    Lock {
        /// Resource name to lock
        #[arg(short, long)]
        resource: String,
        /// Lease in milliseconds
        #[arg(long, default_value = "5000")]
        lease_ms: u64,
        /// Hold the lock this long before releasing
        #[arg(long, default_value = "0")]
        hold_ms: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_structured_logging();

    let settings = load_settings_from(cli.config.as_deref())
        .context("failed to load cache configuration")?;
    let json = cli.format == "json";

    let runtime = CacheRuntime::from_settings(&settings);
    if !matches!(cli.command, Commands::Config) {
        // Degraded start is allowed; each command reports its own outcome.
        let _ = runtime.warm_up().await;
    }

    let result = run(&runtime, &settings, cli.command, json).await;
    runtime.shutdown().await;
    result
}

async fn run(
    runtime: &CacheRuntime,
    settings: &CacheSettings,
    command: Commands,
    json: bool,
) -> anyhow::Result<()> {
    match command {
        Commands::Health => {
            let report = runtime.health_check().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("status:      {:?}", report.status);
                println!("cache:       {:?}", report.cache);
                println!("lock:        {:?}", report.lock);
                println!("breaker:     {:?}", report.breaker_state);
                println!("operations:  {}", report.operations_completed);
                println!("container:   {}", report.container);
            }
            if report.status == HealthStatus::Unhealthy {
                bail!("cache deployment is unhealthy");
            }
        }
        Commands::Config => print_settings(settings, json)?,
        Commands::Get { key } => {
            let entry = runtime
                .cache()
                .get_with_ttl(&key, Tolerance::Strict)
                .await?;
            match entry {
                Some(entry) if json => println!("{}", serde_json::to_string_pretty(&entry)?),
                Some(entry) => {
                    println!("key:   {}", entry.key);
                    println!("value: {}", String::from_utf8_lossy(&entry.value));
                    match entry.ttl {
                        Some(ttl) => println!("ttl:   {}ms", ttl.as_millis()),
                        None => println!("ttl:   none"),
                    }
                }
                None => println!("(missing) {key}"),
            }
        }
        Commands::Purge { pattern, prefix } => {
            let deleted = match (pattern, prefix) {
                (_, Some(prefix)) => runtime.cache().delete_by_prefix(&prefix).await,
                (Some(pattern), None) => runtime.cache().delete_by_pattern(&pattern).await,
                (None, None) => bail!("either --pattern or --prefix is required"),
            };
            info!(deleted = deleted, "Purge finished");
            if json {
                println!("{}", serde_json::json!({ "deleted": deleted }));
            } else {
                println!("deleted: {deleted}");
            }
        }
        Commands::Lock {
            resource,
            lease_ms,
            hold_ms,
        } => {
            let handle = runtime
                .locks()
                .acquire(&resource, Some(Duration::from_millis(lease_ms)))
                .await?;
            let Some(handle) = handle else {
                bail!("lock '{resource}' is held by another owner");
            };
            println!(
                "acquired {} (token {}, valid for {}ms)",
                handle.resource(),
                handle.token(),
                handle.remaining_validity().as_millis()
            );
            if hold_ms > 0 {
                tokio::time::sleep(Duration::from_millis(hold_ms)).await;
            }
            let released = handle.release().await?;
            println!("released: {released}");
        }
    }
    Ok(())
}

fn print_settings(settings: &CacheSettings, json: bool) -> anyhow::Result<()> {
    settings.validate()?;
    let redacted = settings.redacted();
    if json {
        println!("{}", serde_json::to_string_pretty(&redacted)?);
    } else {
        println!("{redacted:#?}");
    }
    Ok(())
}
