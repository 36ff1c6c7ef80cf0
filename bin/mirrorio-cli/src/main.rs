//! MirrorIO CLI - Admin Command Line Interface
//!
//! Assembles a RAID-1 array from file replicas described in a TOML config and
//! runs one administrative command against it.

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use mirrorio_common::{Config, SECTOR_SIZE, Sector};
use mirrorio_raid1::{
    FileReplica, MemoryTracker, MirrorArray, RegionTracker, ReplicaDevice, ReplicaSpec,
    ResyncKind, ResyncReport,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "mirrorio-cli")]
#[command(about = "MirrorIO RAID-1 Admin CLI")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/mirrorio/array.toml")]
    config: String,

    /// Replica paths (override the config file)
    #[arg(long)]
    replica: Vec<PathBuf>,

    /// Array name
    #[arg(long)]
    name: Option<String>,

    /// Skip the initial resync
    #[arg(long)]
    assume_clean: bool,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create sparse replica files
    Init {
        /// Replica size in sectors
        #[arg(long)]
        sectors: Sector,
    },
    /// Show array status
    Status,
    /// Read sectors and print them as hex
    Read {
        sector: Sector,
        #[arg(default_value = "1")]
        sectors: u64,
    },
    /// Write a repeated hex pattern
    Write {
        sector: Sector,
        sectors: u64,
        /// Hex bytes repeated over the range
        #[arg(long, default_value = "00")]
        pattern: String,
        /// Use the ordering primitive
        #[arg(long)]
        ordered: bool,
    },
    /// Resync replicas from the in-sync copy
    Resync,
    /// Rebuild replicas that are not in sync
    Recover,
    /// Compare replicas and count mismatches
    Check,
    /// Compare replicas and rewrite mismatches
    Repair,
    /// Fail a replica
    Fail {
        slot: usize,
    },
    /// Print metrics in Prometheus format
    Metrics,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Load config file if it exists
    let mut config: Config = if std::path::Path::new(&args.config).exists() {
        let config_str = std::fs::read_to_string(&args.config)
            .with_context(|| format!("failed to read {}", args.config))?;
        toml::from_str(&config_str).with_context(|| format!("failed to parse {}", args.config))?
    } else {
        Config::default()
    };

    // Merge CLI args with config file (CLI takes precedence)
    if !args.replica.is_empty() {
        config.replicas = args
            .replica
            .iter()
            .map(|path| mirrorio_common::config::ReplicaConfig {
                path: path.clone(),
                write_mostly: false,
                slot: None,
            })
            .collect();
    }
    if let Some(name) = args.name.clone() {
        config.array.name = name;
    }
    if args.assume_clean {
        config.array.assume_clean = true;
    }
    let log_level = if args.log_level != "warn" {
        args.log_level.clone()
    } else {
        config.logging.level.clone()
    };

    init_logging(&log_level, config.logging.json);

    config.validate().context("invalid configuration")?;
    if config.replicas.is_empty() {
        bail!("No replicas specified. Use --replica or configure in {}", args.config);
    }

    if let Commands::Init { sectors } = args.command {
        return init_replicas(&config, sectors);
    }

    let array = assemble(&config)?;
    let result = run(&array, args.command);
    array.shutdown();
    result
}

fn init_logging(level: &str, json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.to_string().into());
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn init_replicas(config: &Config, sectors: Sector) -> Result<()> {
    for replica in &config.replicas {
        if replica.path.exists() {
            bail!("{} already exists", replica.path.display());
        }
        FileReplica::create(&replica.path, sectors)
            .with_context(|| format!("failed to create {}", replica.path.display()))?;
        println!("created {} ({} sectors)", replica.path.display(), sectors);
    }
    Ok(())
}

fn assemble(config: &Config) -> Result<MirrorArray> {
    let mut specs = Vec::with_capacity(config.replicas.len());
    let mut smallest = Sector::MAX;
    for replica in &config.replicas {
        let device = FileReplica::open(&replica.path)
            .with_context(|| format!("failed to open {}", replica.path.display()))?;
        smallest = smallest.min(device.capacity());
        let mut spec = ReplicaSpec::new(Arc::new(device)).with_write_mostly(replica.write_mostly);
        if let Some(slot) = replica.slot {
            spec = spec.with_slot(slot);
        }
        specs.push(spec);
    }

    let size = config.array.size_sectors.unwrap_or(smallest);
    let tracker: Arc<dyn RegionTracker> = if config.array.assume_clean {
        Arc::new(MemoryTracker::new_clean(
            size,
            config.tracker.region_sectors,
            config.tracker.max_behind_writes,
        ))
    } else {
        // No persistent bitmap: every region is suspect until resynced
        Arc::new(MemoryTracker::new_dirty(
            size,
            config.tracker.region_sectors,
            config.tracker.max_behind_writes,
        ))
    };

    let array = MirrorArray::start(config.array.clone(), specs, tracker)
        .context("failed to assemble array")?;
    info!("Assembled {} ({} sectors)", array.name(), array.size());
    Ok(array)
}

fn run(array: &MirrorArray, command: Commands) -> Result<()> {
    match command {
        Commands::Init { .. } => bail!("init runs without an assembled array"),
        Commands::Status => {
            println!("{}", array.status());
            if array.needs_resync() {
                println!("      (resync needed)");
            }
        }
        Commands::Read { sector, sectors } => {
            let data = array
                .read(sector, sectors)
                .with_context(|| format!("read of {sectors} sectors at {sector} failed"))?;
            for (i, chunk) in data.chunks(32).enumerate() {
                println!("{:012x}: {}", sector * SECTOR_SIZE + (i * 32) as u64, hex::encode(chunk));
            }
        }
        Commands::Write {
            sector,
            sectors,
            pattern,
            ordered,
        } => {
            let pattern = hex::decode(&pattern).context("pattern is not valid hex")?;
            if pattern.is_empty() {
                bail!("pattern must not be empty");
            }
            let len = (sectors * SECTOR_SIZE) as usize;
            let data: Bytes = pattern.iter().copied().cycle().take(len).collect::<Vec<u8>>().into();
            let result = if ordered {
                array.write_ordered(sector, data)
            } else {
                array.write(sector, data)
            };
            result.with_context(|| format!("write of {sectors} sectors at {sector} failed"))?;
            println!("wrote {sectors} sectors at {sector}");
        }
        Commands::Resync => print_report(run_pass(array, ResyncKind::Resync)?),
        Commands::Recover => print_report(run_pass(array, ResyncKind::Recovery)?),
        Commands::Check => print_report(run_pass(array, ResyncKind::Check)?),
        Commands::Repair => print_report(run_pass(array, ResyncKind::Repair)?),
        Commands::Fail { slot } => {
            array
                .fail_replica(slot)
                .with_context(|| format!("failed to fail slot {slot}"))?;
            println!("{}", array.status());
        }
        Commands::Metrics => print!("{}", array.export_prometheus()),
    }
    Ok(())
}

fn run_pass(array: &MirrorArray, kind: ResyncKind) -> Result<ResyncReport> {
    array
        .start_resync(kind)
        .with_context(|| format!("failed to start {kind}"))?;
    array
        .wait_resync()
        .with_context(|| format!("{kind} thread exited without a report"))
}

fn print_report(report: ResyncReport) {
    if !report.completed {
        warn!("{} did not complete", report.kind);
    }
    println!(
        "{}: {} in {:?}, {} sectors synced, {} skipped, {} mismatched",
        report.kind,
        if report.completed { "done" } else { "interrupted" },
        report.elapsed,
        report.synced_sectors,
        report.skipped_sectors,
        report.mismatch_sectors
    );
}
