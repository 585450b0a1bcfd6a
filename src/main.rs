//! modbus-daq - Modbus acquisition service and history tool
//!
//! # Usage
//!
//! ```bash
//! # Acquire from the links in modbus_daq.toml
//! modbus-daq run
//!
//! # Same channels against in-process simulated devices
//! modbus-daq run --simulate
//!
//! # Inspect and prune stored history
//! modbus-daq query --last-hours 2 --slave 5
//! modbus-daq delete --from "2026-01-01 00:00:00" --to "2026-01-02 00:00:00"
//! ```
//!
//! # Environment Variables
//!
//! - `MODBUS_DAQ_CONFIG`: Path to the TOML config (default: ./modbus_daq.toml)
//! - `RUST_LOG`: Logging level (default: info)

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use modbus_daq::acquisition::simulated::SimDevice;
use modbus_daq::acquisition::transport::{Transport, TransportPolicy};
use modbus_daq::config::defaults;
use modbus_daq::storage::{group_by_address, RecordFilter};
use modbus_daq::{AcquisitionConfig, AcquisitionEngine, ChannelHealth, HistoryStore, SampleStore};

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "modbus-daq")]
#[command(about = "Modbus TCP/RTU data acquisition with embedded history")]
#[command(version)]
struct CliArgs {
    /// Config file (overrides MODBUS_DAQ_CONFIG and ./modbus_daq.toml)
    #[arg(long, global = true, env = "MODBUS_DAQ_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: SubCommand,
}

#[derive(clap::Subcommand, Debug)]
enum SubCommand {
    /// Start acquisition until Ctrl+C
    Run {
        /// Poll simulated devices instead of the configured links
        #[arg(long)]
        simulate: bool,
    },

    /// Print stored records for a time range
    Query {
        #[command(flatten)]
        range: RangeArgs,
        #[arg(long)]
        address: Option<u16>,
        /// Maximum number of records to print
        #[arg(long, default_value_t = defaults::HISTORY_QUERY_LIMIT)]
        limit: usize,
        /// Summarize per register address instead of listing records
        #[arg(long)]
        group: bool,
    },

    /// List distinct (slave, address, function) triples in storage
    Channels,

    /// Delete records by id or by time range
    Delete {
        /// Comma-separated record ids
        #[arg(long, value_delimiter = ',', conflicts_with_all = ["from", "to", "last_hours"])]
        ids: Vec<u64>,
        #[command(flatten)]
        range: RangeArgs,
        /// Commit the deletion; without this only the count is shown
        #[arg(long)]
        yes: bool,
    },

    /// Import or export register presets
    Presets {
        #[command(subcommand)]
        action: PresetAction,
    },
}

#[derive(clap::Args, Debug)]
struct RangeArgs {
    /// Range start, RFC 3339 or "YYYY-MM-DD HH:MM:SS" (UTC)
    #[arg(long)]
    from: Option<String>,
    /// Range end (default: now)
    #[arg(long)]
    to: Option<String>,
    /// Shorthand for --from <now - H hours> --to <now>
    #[arg(long, conflicts_with = "from")]
    last_hours: Option<u32>,
    #[arg(long)]
    slave: Option<u8>,
}

impl RangeArgs {
    fn resolve(&self) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
        let end = self
            .to
            .as_deref()
            .map(parse_time)
            .transpose()?
            .unwrap_or_else(Utc::now);
        let start = match (self.last_hours, self.from.as_deref()) {
            (Some(hours), _) => end - chrono::Duration::hours(i64::from(hours)),
            (None, Some(from)) => parse_time(from)?,
            (None, None) => bail!("a range needs --from or --last-hours"),
        };
        if start > end {
            bail!("range start {start} is after end {end}");
        }
        Ok((start, end))
    }
}

#[derive(clap::Subcommand, Debug)]
enum PresetAction {
    /// Write all register presets to a JSON file
    Export { file: PathBuf },
    /// Load register presets from a JSON file
    Import { file: PathBuf },
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .map(|naive| naive.and_utc())
        .with_context(|| format!("invalid timestamp '{s}'"))
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if args.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }

    let config = match &args.config {
        Some(path) => AcquisitionConfig::load_from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => AcquisitionConfig::load(),
    };

    match args.command {
        SubCommand::Run { simulate } => run(&config, simulate).await,
        SubCommand::Query {
            range,
            address,
            limit,
            group,
        } => query(&config, &range, address, limit, group),
        SubCommand::Channels => channels(&config),
        SubCommand::Delete { ids, range, yes } => delete(&config, ids, &range, yes),
        SubCommand::Presets { action } => presets(&config, action),
    }
}

fn open_history(config: &AcquisitionConfig) -> Result<HistoryStore> {
    HistoryStore::open(&config.storage.path)
        .with_context(|| format!("Failed to open history at {}", config.storage.path.display()))
}

// ============================================================================
// run
// ============================================================================

async fn run(config: &AcquisitionConfig, simulate: bool) -> Result<()> {
    if config.links.is_empty() {
        warn!("No links configured; nothing will be polled");
    }

    let history = match config.storage.flush_interval() {
        Some(_) => Some(open_history(config)?),
        None => None,
    };
    let store = history
        .clone()
        .map(|h| Arc::new(h) as Arc<dyn SampleStore>);

    let mut engine = if simulate {
        info!("Simulation mode: links are served by in-process devices");
        AcquisitionEngine::with_transports(config, store, |link| {
            let device = SimDevice::waveform();
            Transport::new(&link.name, device.driver(&link.name), TransportPolicy::from_link(link))
        })
    } else {
        AcquisitionEngine::new(config, store)
    }
    .context("Failed to build acquisition engine")?;

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received Ctrl+C, stopping acquisition");
        shutdown.cancel();
    });

    engine.start().context("Failed to start acquisition")?;

    let period = Duration::from_secs(defaults::STATUS_LOG_INTERVAL_SECS);
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => log_status(&engine),
        }
    }

    engine.stop().await.context("Acquisition did not stop cleanly")?;
    log_status(&engine);
    if let Some(history) = history {
        history.flush().context("Final history flush failed")?;
    }
    Ok(())
}

fn log_status(engine: &AcquisitionEngine) {
    let status = engine.status();
    for link in &status.links {
        let degraded = link
            .channels
            .iter()
            .filter(|c| c.health == ChannelHealth::Degraded)
            .count();
        info!(
            link = %link.name,
            endpoint = %link.endpoint,
            state = %link.connection,
            channels = link.channels.len(),
            degraded,
            "Link status"
        );
    }
    info!(
        pending = status.queue.pending,
        dropped = status.queue.dropped_total,
        rows_written = status.writer.as_ref().map_or(0, |w| w.rows_written),
        "Persistence status"
    );
}

// ============================================================================
// history commands
// ============================================================================

fn query(
    config: &AcquisitionConfig,
    range: &RangeArgs,
    address: Option<u16>,
    limit: usize,
    group: bool,
) -> Result<()> {
    let (start, end) = range.resolve()?;
    let history = open_history(config)?;
    let filter = RecordFilter::range(start, end)
        .slave(range.slave)
        .address(address)
        .limit((!group).then_some(limit));
    let records = history.query_filtered(&filter).context("Query failed")?;

    if group {
        for (address, points) in group_by_address(&records) {
            let (first, last) = (points.first(), points.last());
            println!(
                "address {address:>5}  points {:>7}  first {}  last {}",
                points.len(),
                first.map_or_else(String::new, |p| p.0.to_rfc3339()),
                last.map_or_else(String::new, |p| format!("{} = {}", p.0.to_rfc3339(), p.1)),
            );
        }
        return Ok(());
    }

    for r in &records {
        println!(
            "{:>8}  {}  slave {:>3}  addr {:>5}  {}  {} {}",
            r.id,
            r.timestamp.to_rfc3339(),
            r.slave_id,
            r.address,
            r.function_code.hex_label(),
            r.value,
            r.unit
        );
    }
    println!("{} record(s)", records.len());
    Ok(())
}

fn channels(config: &AcquisitionConfig) -> Result<()> {
    let history = open_history(config)?;
    for (slave, address, fc) in history.list_channels().context("Listing channels failed")? {
        println!("slave {slave:>3}  addr {address:>5}  {}", fc.hex_label());
    }
    Ok(())
}

fn delete(config: &AcquisitionConfig, ids: Vec<u64>, range: &RangeArgs, yes: bool) -> Result<()> {
    let history = open_history(config)?;
    let plan = if ids.is_empty() {
        let (start, end) = range.resolve()?;
        history.plan_delete_by_query(start, end, range.slave)?
    } else {
        history.plan_delete_by_ids(ids)?
    };

    if !yes {
        println!("{} record(s) would be deleted; re-run with --yes to commit", plan.len());
        return Ok(());
    }
    let removed = history.commit_deletion(plan).context("Deletion failed")?;
    history.flush()?;
    println!("{removed} record(s) deleted");
    Ok(())
}

fn presets(config: &AcquisitionConfig, action: PresetAction) -> Result<()> {
    let store = open_history(config)?.presets()?;
    match action {
        PresetAction::Export { file } => {
            let count = store
                .export_registers(&file)
                .with_context(|| format!("Failed to export presets to {}", file.display()))?;
            println!("{count} preset(s) exported to {}", file.display());
        }
        PresetAction::Import { file } => {
            let summary = store
                .import_registers(&file)
                .with_context(|| format!("Failed to import presets from {}", file.display()))?;
            println!("{} imported, {} failed", summary.imported, summary.failed);
        }
    }
    Ok(())
}
