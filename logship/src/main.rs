//! logship - inspect and drive the local telemetry queue
//!
//! This tool provides commands for:
//! - Showing queue contents and ingestion configuration
//! - Enqueuing a log by hand
//! - Flushing queued logs to the ingestion service
//! - Purging a group's logs and releasing abandoned batches
//!
//! Uses XDG base directories for file locations:
//! - Queue: $XDG_DATA_HOME/logship/queue.db (~/.local/share/logship/queue.db)
//! - Config: $XDG_CONFIG_HOME/logship/config.toml (~/.config/logship/config.toml)

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use logship_core::{logging, ChannelGroup, ChannelUnitConfiguration, Config, Log, LogStore};

#[derive(Parser)]
#[command(name = "logship")]
#[command(about = "Inspect and drive the local telemetry queue")]
#[command(version)]
struct Args {
    /// Log progress to stderr
    #[arg(short, long)]
    verbose: bool,

    /// Log to daily files in the state directory
    #[arg(long, conflicts_with = "verbose")]
    log_file: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show configuration and queued logs per group
    Status,

    /// Add a log to a group's queue
    Enqueue {
        /// Group to queue the log for
        group: String,

        /// Log type tag
        #[arg(short = 't', long = "type", default_value = "event")]
        log_type: String,

        /// Custom property as key=value (repeatable, order preserved)
        #[arg(short, long = "property", value_parser = parse_property)]
        properties: Vec<(String, String)>,

        /// JSON payload
        #[arg(short, long)]
        data: Option<String>,
    },

    /// Send queued logs now
    ///
    /// Takes over delivery for the queue: batches left claimed by another
    /// process are returned to pending first, so run it only while no host
    /// is delivering from this queue.
    Flush {
        /// Only flush this group
        #[arg(short, long)]
        group: Option<String>,

        /// Seconds to wait for deliveries to settle
        #[arg(short, long, default_value_t = 30)]
        wait_secs: u64,
    },

    /// Delete queued logs
    Purge {
        /// Group to purge
        #[arg(required_unless_present = "all")]
        group: Option<String>,

        /// Purge every group
        #[arg(long, conflicts_with = "group")]
        all: bool,
    },

    /// Return logs of abandoned batches to pending
    ///
    /// Only safe while no host is delivering from this queue.
    Release,
}

fn parse_property(s: &str) -> std::result::Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got {}", s))?;
    if key.is_empty() {
        return Err("property key must not be empty".to_string());
    }
    Ok((key.to_string(), value.to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    Config::ensure_xdg_env();

    // Load configuration
    let config = Config::load().context("failed to load configuration")?;

    let _log_guard = if args.verbose {
        Some(logging::init_stderr(&config.logging).context("failed to initialize logging")?)
    } else if args.log_file {
        Some(logging::init(&config.logging).context("failed to initialize logging")?)
    } else {
        None
    };

    match args.command {
        Command::Status => cmd_status(&config),
        Command::Enqueue {
            group,
            log_type,
            properties,
            data,
        } => cmd_enqueue(&config, &group, log_type, properties, data),
        Command::Flush { group, wait_secs } => cmd_flush(&config, group, wait_secs).await,
        Command::Purge { group, all } => cmd_purge(&config, group, all),
        Command::Release => cmd_release(&config),
    }
}

/// Open the queue without releasing claimed batches, which may belong to a
/// host delivering from the same file.
fn open_store(config: &Config) -> Result<LogStore> {
    let path = config.queue_path();
    let store = LogStore::open_shared(&path, config.storage.default_capacity)
        .with_context(|| format!("failed to open queue at {}", path.display()))?;
    for group in &config.groups {
        store.set_capacity(&group.group_id, group.storage_capacity);
    }
    Ok(store)
}

fn cmd_status(config: &Config) -> Result<()> {
    println!("logship Configuration");
    println!("=====================");
    println!();

    let ingestion = &config.ingestion;
    println!("Log URL:         {}{}", ingestion.log_url, ingestion.api_path);
    println!(
        "App Secret:      {}",
        match &ingestion.app_secret {
            Some(secret) => logging::redact(secret),
            None => "<not set>".to_string(),
        }
    );
    println!("Timeout:         {}s", ingestion.timeout_secs);
    println!("Retry Intervals: {:?}s", ingestion.retry_intervals_secs);
    println!("Max Retries:     {}", ingestion.max_retries);

    let store = open_store(config)?;
    if let Some(path) = store.path() {
        println!("Queue:           {}", path.display());
    }
    println!("Log File:        {}", logging::log_file_path().display());
    println!("Install ID:      {}", store.install_id()?);
    println!();

    let mut stats: BTreeMap<String, (usize, usize, Option<DateTime<Utc>>)> = config
        .groups
        .iter()
        .map(|g| (g.group_id.clone(), (0, 0, None)))
        .collect();
    for group in store.groups()? {
        stats.insert(group.group_id, (group.pending, group.claimed, group.oldest));
    }

    if stats.is_empty() {
        println!("No groups configured and no queued logs.");
        return Ok(());
    }

    println!(
        "{:<20} {:>8} {:>8} {:>10}  {}",
        "GROUP", "PENDING", "CLAIMED", "CAPACITY", "OLDEST"
    );
    for (group_id, (pending, claimed, oldest)) in &stats {
        println!(
            "{:<20} {:>8} {:>8} {:>10}  {}",
            group_id,
            pending,
            claimed,
            store.capacity(group_id),
            format_age(*oldest)
        );
    }

    Ok(())
}

fn cmd_enqueue(
    config: &Config,
    group: &str,
    log_type: String,
    properties: Vec<(String, String)>,
    data: Option<String>,
) -> Result<()> {
    let mut log = Log::new(log_type);
    for (key, value) in properties {
        log = log.with_property(key, value);
    }
    if let Some(data) = data {
        let value: serde_json::Value =
            serde_json::from_str(&data).context("--data is not valid JSON")?;
        log = log.with_data(value);
    }

    let store = open_store(config)?;
    let record_id = store
        .put(group, &log)
        .with_context(|| format!("failed to queue log for {}", group))?;

    println!(
        "Queued {} log for {} (record {}, {} pending)",
        log.log_type,
        group,
        record_id,
        store.count_pending(group)?
    );
    Ok(())
}

async fn cmd_flush(config: &Config, only: Option<String>, wait_secs: u64) -> Result<()> {
    let mut config = config.clone();

    // Queued groups without configuration are flushed with defaults
    {
        let store = open_store(&config)?;
        for stats in store.groups()? {
            if !config.groups.iter().any(|g| g.group_id == stats.group_id) {
                config
                    .groups
                    .push(ChannelUnitConfiguration::new(stats.group_id));
            }
        }
    }

    if let Some(only) = &only {
        if !config.groups.iter().any(|g| &g.group_id == only) {
            bail!("no queued logs or configuration for group {}", only);
        }
        config.groups.retain(|g| &g.group_id == only);
    }

    let group = ChannelGroup::from_config(&config, None).context("failed to start channel")?;
    let group_ids = group.group_ids();
    let queued = count_queued(&group, &group_ids)?;

    if queued == 0 {
        println!("Nothing to flush.");
        group.shutdown().await;
        return Ok(());
    }

    println!("Flushing {} log(s) across {} group(s)...", queued, group_ids.len());
    group.flush_all();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(wait_secs);
    let mut remaining = queued;
    while remaining > 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
        remaining = count_queued(&group, &group_ids)?;
        // Batches beyond the in-flight limit are claimed as slots free up
        group.flush_all();
    }

    group.shutdown().await;

    println!("Flush complete:");
    println!("  Left the queue:  {}", queued - remaining.min(queued));
    println!("  Still queued:    {}", remaining);
    if remaining > 0 {
        println!();
        println!("Some logs are still queued; run 'logship status' for details.");
    }

    Ok(())
}

fn count_queued(group: &ChannelGroup, group_ids: &[String]) -> Result<usize> {
    let mut total = 0;
    for group_id in group_ids {
        total += group.store().count_all(group_id)?;
    }
    Ok(total)
}

fn cmd_purge(config: &Config, group: Option<String>, all: bool) -> Result<()> {
    let store = open_store(config)?;

    let targets: Vec<String> = if all {
        store.groups()?.into_iter().map(|g| g.group_id).collect()
    } else {
        group.into_iter().collect()
    };

    let mut deleted = 0;
    for group_id in &targets {
        let count = store.delete_group(group_id)?;
        tracing::info!(group_id = %group_id, deleted = count, "Purged group");
        deleted += count;
    }

    println!("Deleted {} log(s) from {} group(s)", deleted, targets.len());
    Ok(())
}

fn cmd_release(config: &Config) -> Result<()> {
    let store = open_store(config)?;
    let released = store.release_orphaned()?;
    let pending: usize = store.groups()?.iter().map(|g| g.pending).sum();

    println!("Released {} log(s); {} pending", released, pending);
    Ok(())
}

/// Format a timestamp as relative age (e.g., "2m ago").
fn format_age(ts: Option<DateTime<Utc>>) -> String {
    let Some(ts) = ts else {
        return "-".to_string();
    };
    let age = Utc::now().signed_duration_since(ts);

    if age.num_seconds() < 60 {
        format!("{}s ago", age.num_seconds().max(0))
    } else if age.num_minutes() < 60 {
        format!("{}m ago", age.num_minutes())
    } else if age.num_hours() < 24 {
        format!("{}h ago", age.num_hours())
    } else {
        format!("{}d ago", age.num_days())
    }
}
