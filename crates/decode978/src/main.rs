#![doc = include_str!("../readme.md")]

mod trickle;

use clap::{Parser, Subcommand};
use rs978::prelude::*;
use rs978::spool::SpoolWriter;
use std::path::PathBuf;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(
    name = "decode978",
    version,
    about = "Decode FIS-B capture lines into typed weather products"
)]
struct Options {
    /// Capture input file, `-` for stdin
    #[arg(short, long, default_value = "-")]
    input: String,

    /// Dump a copy of the raw capture lines (the archive writer)
    #[arg(short, long, default_value = None)]
    output: Option<PathBuf>,

    /// Write filtered products as curator spool files instead of stdout
    #[arg(long, default_value = None)]
    spool_dir: Option<PathBuf>,

    /// Stop after L0 and print packet records instead of products
    #[arg(long, default_value = "false")]
    packets: bool,

    /// Directory receiving the per-stage error files
    #[arg(long, default_value = ".")]
    errors_dir: PathBuf,

    /// Preserve reserved bit-fields verbatim in the output
    #[arg(long, default_value = "false")]
    detailed: bool,

    /// Decode trailing 4-bit DLAC remnants (legacy encoders)
    #[arg(long, default_value = "false")]
    legacy_dlac: bool,

    /// Emit per-station RSR reception products
    #[arg(long, default_value = "false")]
    rsr: bool,

    /// RSR sliding window, in seconds
    #[arg(long, default_value = "30")]
    rsr_window: u64,

    /// Seconds between RSR emissions
    #[arg(long, default_value = "10")]
    rsr_interval: u64,

    /// L3 refresh floor in seconds
    #[arg(long, default_value = "1800")]
    refresh_floor: u64,

    /// Let L3 deduplicate PIREPs like everything else
    #[arg(long, default_value = "false")]
    dedup_pireps: bool,

    /// Force TWGO expiration to a fixed TTL (test determinism)
    #[arg(long, default_value = "false")]
    bypass_smart_expiration: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Replay an archived capture against the clock, writing the sync
    /// file the curator's virtual time runs on
    Trickle {
        /// Archived capture file
        input: PathBuf,

        /// Sync file consumed by harvest978
        #[arg(long, default_value = "sync.fisb")]
        sync_file: PathBuf,

        /// Replay speed multiplier
        #[arg(long, default_value = "1.0")]
        speed: f64,
    },
}

impl Options {
    fn settings(&self) -> Settings {
        Settings {
            detailed: self.detailed,
            legacy_dlac: self.legacy_dlac,
            rsr_enabled: self.rsr,
            rsr_window_secs: self.rsr_window,
            rsr_interval_secs: self.rsr_interval,
            refresh_floor_secs: self.refresh_floor,
            always_forward_pireps: !self.dedup_pireps,
            bypass_smart_expiration: self.bypass_smart_expiration,
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
        .with_writer(std::io::stderr)
        .init();

    let options = Options::parse();

    if let Some(Command::Trickle {
        input,
        sync_file,
        speed,
    }) = options.command
    {
        return trickle::run(&input, &sync_file, speed).await;
    }

    let settings = options.settings();
    let (tx_lines, rx_lines) = mpsc::channel::<String>(100);
    let (tx_packets, mut rx_packets) = mpsc::channel::<PacketRecord>(100);
    let (tx_assembled, rx_assembled) = mpsc::channel::<Assembled>(100);
    let (tx_products, mut rx_products) = mpsc::channel::<Product>(100);

    // Stage workers: single-threaded against their own state, connected
    // by bounded queues so arrival order survives end to end
    let l0 = tokio::spawn(l0_stage(
        rx_lines,
        tx_packets,
        tx_products.clone(),
        settings.clone(),
        options.errors_dir.clone(),
    ));
    let mut stages = vec![l0];
    if options.packets {
        // Stop after L0: print packet records, drop the RSR stream
        stages.push(tokio::spawn(async move {
            while let Some(packet) = rx_packets.recv().await {
                println!(
                    "{}",
                    serde_json::to_string(&packet)
                        .expect("packets serialize")
                );
            }
            Ok::<(), anyhow::Error>(())
        }));
        drop(tx_products);
        stages.push(tokio::spawn(async move {
            while rx_products.recv().await.is_some() {}
            Ok::<(), anyhow::Error>(())
        }));
    } else {
        stages.push(tokio::spawn(l1_stage(
            rx_packets,
            tx_assembled,
            settings.clone(),
            options.errors_dir.clone(),
        )));
        stages.push(tokio::spawn(l2_stage(
            rx_assembled,
            tx_products,
            settings.clone(),
            options.errors_dir.clone(),
        )));
        stages.push(tokio::spawn(product_sink(
            rx_products,
            settings.clone(),
            options.spool_dir.clone(),
            options.errors_dir.clone(),
        )));
    }

    feed_lines(&options, tx_lines).await?;

    // Closing the source cascades a graceful drain through the stages
    for stage in stages {
        stage.await??;
    }
    Ok(())
}

/// The source: capture lines from stdin or a file, with an optional raw
/// archive copy
async fn feed_lines(
    options: &Options,
    tx_lines: mpsc::Sender<String>,
) -> anyhow::Result<()> {
    let mut archive = match &options.output {
        Some(path) => Some(
            fs::OpenOptions::new()
                .append(true)
                .create(true)
                .open(path)
                .await?,
        ),
        None => None,
    };
    let send = |line: String| {
        let tx_lines = tx_lines.clone();
        async move { tx_lines.send(line).await.is_ok() }
    };
    if options.input == "-" {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await? {
            if let Some(archive) = &mut archive {
                archive.write_all(line.as_bytes()).await?;
                archive.write_all(b"\n").await?;
            }
            if !send(line).await {
                break;
            }
        }
    } else {
        let file = fs::File::open(&options.input).await?;
        let mut lines = BufReader::new(file).lines();
        while let Some(line) = lines.next_line().await? {
            if let Some(archive) = &mut archive {
                archive.write_all(line.as_bytes()).await?;
                archive.write_all(b"\n").await?;
            }
            if !send(line).await {
                break;
            }
        }
    }
    Ok(())
}

async fn l0_stage(
    mut rx: mpsc::Receiver<String>,
    tx: mpsc::Sender<PacketRecord>,
    tx_products: mpsc::Sender<Product>,
    settings: Settings,
    errors_dir: PathBuf,
) -> anyhow::Result<()> {
    let mut sink = ErrorSink::open(&errors_dir, "l0")?;
    let mut registry = StationRegistry::new(settings.clone());
    let mut packets = 0u64;
    while let Some(line) = rx.recv().await {
        let capture = match parse_capture_line(&line) {
            Ok(ParsedLine::Fisb(capture)) => capture,
            Ok(ParsedLine::Downlink) => {
                sink.bump("uat_downlink");
                continue;
            }
            Err(error) => {
                sink.record(&error, &line);
                continue;
            }
        };
        let rcvd_time = capture.rcvd_time();
        match decode_packet(&capture, &settings, &mut sink) {
            Ok(packet) => {
                registry.observe(&packet.station, rcvd_time);
                packets += 1;
                if tx.send(packet).await.is_err() {
                    break;
                }
            }
            Err(error) => sink.record(&error, &line),
        }
        // The synthetic reception products skip L1/L2
        for product in registry.tick(rcvd_time) {
            if tx_products.send(product).await.is_err() {
                break;
            }
        }
    }
    info!(packets, errors = sink.total(), "L0 drained");
    Ok(())
}

async fn l1_stage(
    mut rx: mpsc::Receiver<PacketRecord>,
    tx: mpsc::Sender<Assembled>,
    settings: Settings,
    errors_dir: PathBuf,
) -> anyhow::Result<()> {
    let mut sink = ErrorSink::open(&errors_dir, "l1")?;
    let mut reassembler = Reassembler::new(settings);
    while let Some(packet) = rx.recv().await {
        for assembled in reassembler.ingest(&packet, &mut sink) {
            if tx.send(assembled).await.is_err() {
                return Ok(());
            }
        }
    }
    reassembler.drain(&mut sink);
    info!(errors = sink.total(), "L1 drained");
    Ok(())
}

async fn l2_stage(
    mut rx: mpsc::Receiver<Assembled>,
    tx: mpsc::Sender<Product>,
    settings: Settings,
    errors_dir: PathBuf,
) -> anyhow::Result<()> {
    let mut sink = ErrorSink::open(&errors_dir, "l2")?;
    let synthesizer = Synthesizer::new(settings);
    while let Some(assembled) = rx.recv().await {
        for product in synthesizer.synthesize(&assembled, &mut sink) {
            if tx.send(product).await.is_err() {
                return Ok(());
            }
        }
    }
    info!(errors = sink.total(), "L2 drained");
    Ok(())
}

/// L3 plus the output side: NDJSON on stdout, or curator spool files
async fn product_sink(
    mut rx: mpsc::Receiver<Product>,
    settings: Settings,
    spool_dir: Option<PathBuf>,
    errors_dir: PathBuf,
) -> anyhow::Result<()> {
    let mut sink = ErrorSink::open(&errors_dir, "l3")?;
    let mut filter = ChangeFilter::new(settings);
    let mut writer = match spool_dir {
        Some(dir) => Some(SpoolWriter::new(dir)?),
        None => None,
    };
    let mut forwarded = 0u64;
    let mut suppressed = 0u64;
    while let Some(product) = rx.recv().await {
        if !filter.admit(&product) {
            suppressed += 1;
            continue;
        }
        forwarded += 1;
        match &mut writer {
            Some(writer) => {
                if let Err(write_error) =
                    writer.write(&product, chrono::Utc::now())
                {
                    sink.bump("spool_write");
                    error!(%write_error, "spool write failed");
                }
            }
            None => println!(
                "{}",
                serde_json::to_string(&product)
                    .expect("products serialize")
            ),
        }
    }
    info!(forwarded, suppressed, "L3 drained");
    Ok(())
}
