//! PacketBuddy agent - network usage sampling with local storage and sync.
//!
//! Run with: `cargo run -p packetbuddy-service`

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;
use time::UtcOffset;
use tracing::{info, warn};

use packetbuddy_service::agent::{self, Agent};
use packetbuddy_service::maintenance::{MaintenanceSettings, run_maintenance};
use packetbuddy_service::state::share;
use packetbuddy_service::{Config, DeviceIdentity, ReplicationEngine, SyncSettings};
use packetbuddy_store::{StoreStats, UsageTotals};

/// PacketBuddy - network usage agent.
#[derive(Parser, Debug)]
#[command(name = "packetbuddy")]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Database path (overrides config).
    #[arg(short, long, global = true)]
    database: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the agent in the foreground (default behavior).
    Run,

    /// Show usage and storage statistics.
    Status {
        /// Print JSON instead of text.
        #[arg(long)]
        json: bool,
    },

    /// Push every unsynced sample to the remote database once.
    Sync,

    /// Apply retention to the local and remote databases.
    Cleanup {
        /// Shrink the remote database to the minimal retention window.
        #[arg(long)]
        aggressive: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Must be read before any other thread exists.
    let offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);

    init_logging(args.verbose)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(args, offset))
}

fn init_logging(verbose: bool) -> anyhow::Result<()> {
    let level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("packetbuddy_service={}", level).parse()?)
                .add_directive(format!("packetbuddy_store={}", level).parse()?)
                .add_directive(format!("packetbuddy_core={}", level).parse()?),
        )
        .init();
    Ok(())
}

async fn run(args: Args, offset: UtcOffset) -> anyhow::Result<()> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default().unwrap_or_else(|e| {
            warn!("Ignoring unreadable default config: {}", e);
            Config::default()
        }),
    };
    if let Some(db_path) = args.database {
        config.storage.path = db_path;
    }
    config.validate()?;

    match args.command {
        Some(Command::Run) | None => run_agent(&config, offset).await,
        Some(Command::Status { json }) => show_status(&config, offset, json).await,
        Some(Command::Sync) => sync_once(&config, offset).await,
        Some(Command::Cleanup { aggressive }) => cleanup(&config, offset, aggressive).await,
    }
}

async fn run_agent(config: &Config, offset: UtcOffset) -> anyhow::Result<()> {
    let agent = Agent::start(config, offset).await?;
    info!("Agent running, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;

    if let Some(Err(e)) = agent.shutdown().await {
        warn!("Unsynced samples remain for the next start: {}", e);
    }
    Ok(())
}

/// Open the store and, if sync is configured, an engine over it.
fn open(
    config: &Config,
    offset: UtcOffset,
) -> anyhow::Result<(packetbuddy_service::SharedStore, Option<ReplicationEngine>)> {
    let mut store = agent::open_store(config, offset)?;
    let identity = DeviceIdentity::load_or_create(DeviceIdentity::default_path())?;
    agent::register(&mut store, &identity)?;
    let store = share(store);

    let engine = agent::connect_remote(config).map(|remote| {
        ReplicationEngine::new(
            Arc::clone(&store),
            remote,
            identity,
            SyncSettings::from_config(config),
        )
    });
    Ok((store, engine))
}

#[derive(Debug, Serialize)]
struct StatusReport {
    device_id: String,
    today: UsageTotals,
    peak_speed: u64,
    lifetime: UsageTotals,
    stats: StoreStats,
    global_today: Option<UsageTotals>,
    global_lifetime: Option<UsageTotals>,
    device_count: Option<u64>,
}

async fn show_status(config: &Config, offset: UtcOffset, json: bool) -> anyhow::Result<()> {
    let (store, engine) = open(config, offset)?;

    let (device_id, today, lifetime, stats) = {
        let store = store.lock().await;
        (
            store.device_id()?.to_string(),
            store.today_usage()?,
            store.lifetime_usage()?,
            store.stats(config.storage.max_storage_mb)?,
        )
    };

    let mut report = StatusReport {
        device_id,
        today: UsageTotals::new(today.bytes_sent, today.bytes_received),
        peak_speed: today.peak_speed,
        lifetime,
        stats,
        global_today: None,
        global_lifetime: None,
        device_count: None,
    };

    if let Some(engine) = &engine {
        report.global_today = Some(engine.global_today_usage().await);
        report.global_lifetime = Some(engine.global_lifetime_usage().await);
        report.device_count = Some(engine.device_count().await);
        engine.close().await;
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Device:    {}", report.device_id);
    println!(
        "Today:     {} sent, {} received (peak {}/s)",
        format_bytes(report.today.bytes_sent),
        format_bytes(report.today.bytes_received),
        format_bytes(report.peak_speed)
    );
    println!(
        "Lifetime:  {} sent, {} received",
        format_bytes(report.lifetime.bytes_sent),
        format_bytes(report.lifetime.bytes_received)
    );
    println!(
        "Samples:   {} ({} unsynced)",
        report.stats.sample_count, report.stats.unsynced_count
    );
    println!(
        "Database:  {} ({:.1}% of {} MB)",
        format_bytes(report.stats.size_bytes),
        report.stats.usage_percent,
        config.storage.max_storage_mb
    );
    if let (Some(today), Some(lifetime), Some(devices)) = (
        report.global_today,
        report.global_lifetime,
        report.device_count,
    ) {
        println!(
            "All devices ({}): {} today, {} lifetime",
            devices,
            format_bytes(today.total()),
            format_bytes(lifetime.total())
        );
    }
    Ok(())
}

async fn sync_once(config: &Config, offset: UtcOffset) -> anyhow::Result<()> {
    let (_store, engine) = open(config, offset)?;
    let Some(engine) = engine else {
        anyhow::bail!("Sync is disabled or no remote database is configured");
    };

    let result = engine.sync_all().await;
    engine.close().await;
    let pushed = result?;
    println!("Synced {} sample(s)", pushed);
    Ok(())
}

async fn cleanup(config: &Config, offset: UtcOffset, aggressive: bool) -> anyhow::Result<()> {
    let (store, engine) = open(config, offset)?;

    if aggressive {
        let Some(engine) = &engine else {
            anyhow::bail!("Aggressive cleanup needs a remote database");
        };
        let result = engine.aggressive_cleanup().await;
        engine.close().await;
        let cleaned = result?;
        println!(
            "Removed {} remote sample(s), {} daily and {} monthly aggregate row(s)",
            cleaned.logs_deleted,
            cleaned.aggregates.daily_deleted,
            cleaned.aggregates.monthly_deleted
        );
        return Ok(());
    }

    let settings = MaintenanceSettings::from(&config.storage);
    let report = run_maintenance(&store, engine.as_ref(), &settings).await;
    if let Some(engine) = &engine {
        engine.close().await;
    }

    println!("{}", serde_json::to_string_pretty(&report)?);
    if report.has_failures(engine.is_some()) {
        anyhow::bail!("Some cleanup steps failed");
    }
    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}
