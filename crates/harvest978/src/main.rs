#![doc = include_str!("../readme.md")]

mod crl;
mod curator;
mod location;
mod raster;
mod store;
mod trigger;
mod vectors;

use anyhow::Context;
use clap::{Parser, Subcommand};
use rs978::clock::Clock;
use rs978::config::Settings;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};

use curator::Curator;
use location::LocationIndex;
use store::{SqliteStore, StoreError};
use trigger::TriggerSchedule;

#[derive(Debug, Parser)]
#[command(
    name = "harvest978",
    version,
    about = "Curate the rs978 FIS-B product stream into a current-state store"
)]
struct Options {
    /// Spool directory fed by the decode pipeline
    #[arg(long, default_value = "spool")]
    spool_dir: PathBuf,

    /// Directory receiving rendered PNGs and world files
    #[arg(long, default_value = "images")]
    image_dir: PathBuf,

    /// SQLite datastore path
    #[arg(long, default_value = "fisb.db")]
    db: PathBuf,

    /// Trickle sync file (absent in production)
    #[arg(long, default_value = "sync.fisb")]
    sync_file: PathBuf,

    /// Read-only location side store for enrichment
    #[arg(long)]
    location_db: Option<PathBuf>,

    /// Seconds between maintenance ticks
    #[arg(long, default_value = "10")]
    maint_interval: u64,

    /// Disable the expiration engine
    #[arg(long, default_value = "false")]
    no_expire: bool,

    /// Disable CRL status annotation
    #[arg(long, default_value = "false")]
    no_annotate_crl: bool,

    /// Remove reports a station no longer lists
    #[arg(long, default_value = "false")]
    immediate_crl_update: bool,

    /// Seconds of quiet before re-rendering imagery
    #[arg(long, default_value = "10")]
    image_quiet_seconds: u64,

    /// Sentinel rendering: 0 transparent, 1 debug colors, 2 configured
    #[arg(long, default_value = "0")]
    image_map_configuration: u8,

    /// Force TWGO expiration to a fixed TTL (test determinism)
    #[arg(long, default_value = "false")]
    bypass_smart_expiration: bool,

    /// Enrich weather products with station locations
    #[arg(long, default_value = "false")]
    location_wx: bool,

    /// Enrich PIREPs, with magnetic-to-true correction
    #[arg(long, default_value = "false")]
    location_pirep: bool,

    /// Enrich SUA records with their airspace polygons
    #[arg(long, default_value = "false")]
    location_sua: bool,

    /// Drop PIREPs whose base fix is unknown
    #[arg(long, default_value = "false")]
    drop_unmatched_pireps: bool,

    /// Backoff ceiling for transient datastore errors, in seconds
    #[arg(long, default_value = "60")]
    retry_db_conn_secs: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Normal ingest from the spool directory
    Run {
        /// Test mode: consume the Trickle sync file and this trigger
        /// group's scheduled dumps
        #[arg(long)]
        test: Option<u32>,

        /// Trigger list (test mode)
        #[arg(long, default_value = "triggers.csv")]
        triggers: PathBuf,

        /// Anchor dates per test group (test mode)
        #[arg(long, default_value = "start-dates.csv")]
        start_dates: PathBuf,

        /// Trigger dump output directory (test mode)
        #[arg(long, default_value = "trigger-dumps")]
        dump_dir: PathBuf,
    },
    /// Export current vector layers as CSV WKT on stdout
    DumpVectors,
    /// Force one maintenance tick and exit
    ExpireSweep,
}

impl Options {
    fn settings(&self) -> Settings {
        Settings {
            spool_dir: self.spool_dir.clone(),
            image_dir: self.image_dir.clone(),
            sync_file: self.sync_file.clone(),
            maint_interval_secs: self.maint_interval,
            expire_enabled: !self.no_expire,
            annotate_crl: !self.no_annotate_crl,
            immediate_crl_update: self.immediate_crl_update,
            image_quiet_seconds: self.image_quiet_seconds,
            image_map_configuration: self.image_map_configuration,
            bypass_smart_expiration: self.bypass_smart_expiration,
            location_wx: self.location_wx,
            location_pirep: self.location_pirep,
            location_sua: self.location_sua,
            save_unmatched_pireps: !self.drop_unmatched_pireps,
            retry_db_conn_secs: self.retry_db_conn_secs,
            ..Settings::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let options = Options::parse();
    let settings = options.settings();
    let store = SqliteStore::open(&options.db)
        .with_context(|| format!("opening store {}", options.db.display()))?;
    let clock = Clock::from_sync_file(&settings.sync_file)
        .context("reading sync file")?;

    let mut curator = Curator::new(settings, clock, store);
    if let Some(path) = &options.location_db {
        let index = LocationIndex::open(path).with_context(|| {
            format!("opening location store {}", path.display())
        })?;
        curator = curator.with_location(index);
    }
    curator.reload_rasters()?;

    match options.command {
        Command::Run {
            test,
            triggers,
            start_dates,
            dump_dir,
        } => {
            let schedule = match test {
                Some(group) => {
                    info!(group, "test mode: trigger schedule loaded");
                    TriggerSchedule::load(&triggers, &start_dates, group)?
                }
                None => TriggerSchedule::default(),
            };
            run(curator, schedule, dump_dir).await
        }
        Command::DumpVectors => {
            let mut stdout = std::io::stdout().lock();
            let rows = vectors::dump_vectors(&curator.store, &mut stdout)?;
            info!(rows, "vector layers exported");
            Ok(())
        }
        Command::ExpireSweep => {
            curator.maintenance()?;
            Ok(())
        }
    }
}

/// The ingest loop: spool, maintenance when due, trigger dumps at their
/// virtual times. On shutdown the spool is drained first, so a clean
/// stop always leaves it empty.
async fn run(
    mut curator: Curator<SqliteStore>,
    mut schedule: TriggerSchedule,
    dump_dir: PathBuf,
) -> anyhow::Result<()> {
    let mut backoff = Duration::from_secs(1);
    let ceiling = Duration::from_secs(curator.settings.retry_db_conn_secs);
    loop {
        let stop = tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(1)) => false,
            _ = tokio::signal::ctrl_c() => true,
        };

        match curator.ingest_spool() {
            Ok(_) => backoff = Duration::from_secs(1),
            Err(StoreError::Transient(message)) => {
                // Bounded exponential backoff, then try again
                warn!(%message, ?backoff, "transient store error");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(ceiling);
                continue;
            }
            Err(error @ StoreError::Permanent(_)) => {
                error!(%error, "datastore lost for good");
                return Err(error.into());
            }
        }

        if curator.maintenance_due() {
            curator.maintenance()?;
        }

        let now = curator.clock.now();
        for due in schedule.due(now) {
            trigger::fire(
                &curator.store,
                &curator.rasters,
                &curator.settings.image_dir,
                &dump_dir,
                &due,
            );
        }

        if stop {
            info!("draining spool before exit");
            curator.ingest_spool()?;
            return Ok(());
        }
    }
}
