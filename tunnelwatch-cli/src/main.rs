//! CLI for the tunnelwatch telemetry cache.
//!
//! Provides commands for simulating a feed with outages, watching a live
//! REST feed, and inspecting snapshot files.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;
use tunnelwatch::consolidate::{ConsolidationFn, downsample};
use tunnelwatch::ingest::Ingestor;
use tunnelwatch::source::{FeedSource, HttpPollFeed, MemoryFeed};
use tunnelwatch::{ChannelId, ConnectionState, Pipeline, PipelineConfig, RawSnapshot, Reading, SeriesStore, Subscription};

/// tunnelwatch — Real-time telemetry ingestion and windowed-series cache CLI.
#[derive(Parser)]
#[command(name = "tunnelwatch", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline over a synthetic in-memory feed with injected outages.
    Simulate {
        /// Number of tunnels to simulate.
        #[arg(long, default_value = "2")]
        channels: u32,

        /// Interval between synthetic readings per tunnel (e.g., "500ms", "1s").
        #[arg(long, default_value = "1s")]
        interval: String,

        /// How long to run.
        #[arg(long, default_value = "30s")]
        duration: String,

        /// Start an outage this often ("0s" disables outages).
        #[arg(long, default_value = "10s")]
        outage_every: String,

        /// Length of each outage.
        #[arg(long, default_value = "3s")]
        outage_length: String,

        /// Disable range queries, forcing snapshot reconciliation on reconnect.
        #[arg(long)]
        no_backfill: bool,

        /// Optional pipeline config file (JSON).
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Follow channels of a REST realtime database and print each change.
    Watch {
        /// Database base URL (e.g., `https://example.firebaseio.com`).
        base_url: String,

        /// Channels to follow.
        #[arg(long = "channel", default_value = "tunel1")]
        channels: Vec<String>,

        /// Poll interval.
        #[arg(long, default_value = "2s")]
        poll: String,

        /// Auth token appended as `auth=<token>`.
        #[arg(long)]
        auth: Option<String>,

        /// Optional pipeline config file (JSON).
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Parse a snapshot file and report what ingestion would keep.
    Inspect {
        /// Path to a JSON snapshot (`{ key: record, ... }`, an array, or `null`).
        file: PathBuf,

        /// Channel the snapshot belongs to.
        #[arg(long, default_value = "tunel1")]
        channel: String,

        /// Bucket width for the downsampled series.
        #[arg(long, default_value = "1m")]
        bucket: String,

        /// Aggregation used for each bucket.
        #[arg(long, default_value = "average")]
        consolidation: Consolidation,

        /// Output format.
        #[arg(long, default_value = "csv")]
        format: OutputFormat,
    },
}

/// Bucket aggregation.
#[derive(Clone, Copy, ValueEnum)]
enum Consolidation {
    /// Arithmetic mean.
    Average,
    /// Smallest value.
    Min,
    /// Largest value.
    Max,
    /// Newest value.
    Last,
}

impl From<Consolidation> for ConsolidationFn {
    fn from(c: Consolidation) -> Self {
        match c {
            Consolidation::Average => Self::Average,
            Consolidation::Min => Self::Min,
            Consolidation::Max => Self::Max,
            Consolidation::Last => Self::Last,
        }
    }
}

/// Output format for inspect results.
#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// Comma-separated values.
    Csv,
    /// JSON document.
    Json,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Simulate {
            channels,
            interval,
            duration,
            outage_every,
            outage_length,
            no_backfill,
            config,
        } => {
            cmd_simulate(SimulateArgs {
                channels,
                interval,
                duration,
                outage_every,
                outage_length,
                no_backfill,
                config,
            })
            .await
        }
        Commands::Watch {
            base_url,
            channels,
            poll,
            auth,
            config,
        } => cmd_watch(&base_url, &channels, &poll, auth, config.as_deref()).await,
        Commands::Inspect {
            file,
            channel,
            bucket,
            consolidation,
            format,
        } => cmd_inspect(&file, &channel, &bucket, consolidation.into(), &format),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

struct SimulateArgs {
    channels: u32,
    interval: String,
    duration: String,
    outage_every: String,
    outage_length: String,
    no_backfill: bool,
    config: Option<PathBuf>,
}

/// Implements `tunnelwatch simulate`.
async fn cmd_simulate(args: SimulateArgs) -> Result<(), Box<dyn std::error::Error>> {
    let interval = parse_duration(&args.interval)?;
    let duration = parse_duration(&args.duration)?;
    let outage_every = parse_duration(&args.outage_every)?;
    let outage_length = parse_duration(&args.outage_length)?;
    if interval.is_zero() {
        return Err("--interval must be positive".into());
    }

    let feed = if args.no_backfill {
        MemoryFeed::new()
    } else {
        MemoryFeed::new().with_range_queries()
    };
    let pipeline = Pipeline::new(load_config(args.config.as_deref())?, Arc::new(feed.clone()))?;

    let channels: Vec<ChannelId> = (1..=args.channels.max(1))
        .map(|i| ChannelId::new(format!("tunel{i}")))
        .collect::<Result<_, _>>()?;

    println!(
        "Simulating {} tunnel(s) for {}, one reading every {}",
        channels.len(),
        format_duration(duration),
        format_duration(interval)
    );
    println!();

    let mut tasks = Vec::new();
    for channel in &channels {
        tasks.push(tokio::spawn(print_updates(pipeline.subscribe(channel))));
        pipeline.connect(channel)?;
        if let Some(status) = pipeline.watch_status(channel) {
            tasks.push(tokio::spawn(print_transitions(channel.clone(), status)));
        }
    }

    tasks.push(tokio::spawn(generate_readings(feed.clone(), channels.clone(), interval)));
    if !outage_every.is_zero() {
        tasks.push(tokio::spawn(inject_outages(feed.clone(), outage_every, outage_length)));
    }

    tokio::select! {
        () = tokio::time::sleep(duration) => {}
        _ = tokio::signal::ctrl_c() => println!("Interrupted"),
    }

    for task in &tasks {
        task.abort();
    }

    println!();
    println!("Summary:");
    for channel in &channels {
        print_channel_summary(&pipeline, channel);
    }

    pipeline.shutdown().await;
    Ok(())
}

/// Implements `tunnelwatch watch`.
async fn cmd_watch(
    base_url: &str,
    channels: &[String],
    poll: &str,
    auth: Option<String>,
    config: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut feed = HttpPollFeed::new(base_url, parse_duration(poll)?)?;
    if let Some(token) = auth {
        feed = feed.with_auth_token(token);
    }
    println!("Watching {}", feed.description());

    let pipeline = Pipeline::new(load_config(config)?, Arc::new(feed))?;

    let mut tasks = Vec::new();
    for name in channels {
        let channel = ChannelId::new(name)?;
        tasks.push(tokio::spawn(print_updates(pipeline.subscribe(&channel))));
        pipeline.connect(&channel)?;
        if let Some(status) = pipeline.watch_status(&channel) {
            tasks.push(tokio::spawn(print_transitions(channel, status)));
        }
    }

    tokio::signal::ctrl_c().await?;
    for task in &tasks {
        task.abort();
    }

    pipeline.shutdown().await;
    Ok(())
}

/// Implements `tunnelwatch inspect`.
fn cmd_inspect(
    file: &Path,
    channel: &str,
    bucket: &str,
    consolidation_fn: ConsolidationFn,
    format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let bucket = parse_duration(bucket)?;
    let channel = ChannelId::new(channel)?;
    let bytes = std::fs::read(file)?;
    let snapshot = RawSnapshot::from_slice(&bytes)?;

    let ingestor = Ingestor::new(Arc::new(SeriesStore::new(Default::default())));
    let report = ingestor.ingest(&channel, &snapshot);
    let readings = ingestor.store().snapshot(&channel);
    let points = downsample(&readings, bucket, consolidation_fn);

    match format {
        OutputFormat::Csv => {
            println!("# file: {}", file.display());
            println!("# channel: {channel}");
            println!("# records: {}", snapshot.len());
            println!("# accepted: {}", report.accepted);
            println!("# rejected: {}", report.rejected.len());
            for rejection in &report.rejected {
                println!("#   {}: {}", rejection.key, rejection.error);
            }
            if let Some(latest) = ingestor.store().latest(&channel) {
                println!("# latest: {}", format_reading(&latest));
            }
            println!("bucket_start_ms,bucket_end_ms,count,temperature,humidity");
            for p in &points {
                println!("{},{},{},{:.2},{:.2}", p.start, p.end, p.count, p.temperature, p.humidity);
            }
        }
        OutputFormat::Json => {
            let rejected: Vec<serde_json::Value> = report
                .rejected
                .iter()
                .map(|r| serde_json::json!({ "key": r.key, "error": r.error.to_string() }))
                .collect();
            let doc = serde_json::json!({
                "channel": channel,
                "records": snapshot.len(),
                "accepted": report.accepted,
                "rejected": rejected,
                "latest": ingestor.store().latest(&channel),
                "buckets": points,
            });
            println!("{}", serde_json::to_string_pretty(&doc)?);
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<PipelineConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => {
            let config = PipelineConfig::load(path)?;
            tracing::info!(path = %path.display(), "loaded pipeline config");
            Ok(config)
        }
        None => Ok(PipelineConfig::default()),
    }
}

async fn print_updates(mut subscription: Subscription) {
    loop {
        match subscription.recv().await {
            Ok(update) => {
                let latest = update
                    .latest
                    .as_ref()
                    .map_or_else(|| "-".to_string(), format_reading);
                println!(
                    "{:<10} seq={:<5} +{} ~{} -{}  latest: {}",
                    update.channel,
                    update.seq,
                    update.added.len(),
                    update.updated.len(),
                    update.evicted.len(),
                    latest
                );
            }
            Err(e) => {
                println!("{:<10} subscription ended: {e}", subscription.channel());
                return;
            }
        }
    }
}

async fn print_transitions(
    channel: ChannelId,
    mut status: tokio::sync::watch::Receiver<tunnelwatch::ConnectionStatus>,
) {
    let mut last = status.borrow().state;
    while status.changed().await.is_ok() {
        let current = status.borrow_and_update().clone();
        if current.state == last && current.state != ConnectionState::Retrying {
            continue;
        }
        last = current.state;
        match current.state {
            ConnectionState::Retrying => println!(
                "{channel:<10} {:?} (attempt {}): {}",
                current.state,
                current.retry_count,
                current.last_error.as_deref().unwrap_or("-")
            ),
            ConnectionState::Failed => println!(
                "{channel:<10} FAILED after {} attempts, reconnect required",
                current.retry_count
            ),
            state => println!("{channel:<10} {state:?}"),
        }
    }
}

async fn generate_readings(feed: MemoryFeed, channels: Vec<ChannelId>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    let mut n: u64 = 0;
    loop {
        ticker.tick().await;
        n += 1;
        let now = now_millis();
        for (i, channel) in channels.iter().enumerate() {
            #[allow(clippy::cast_precision_loss)] // tick counts stay far below 2^52
            let phase = n as f64 / 20.0 + i as f64;
            let record = serde_json::json!({
                "humidity": format!("{:.1}", 55.0 + 10.0 * phase.cos()),
                "temperature": ((18.0 + 3.0 * phase.sin()) * 100.0).round() / 100.0,
                "timestamp": now,
                "tunnelId": i + 1,
            });
            feed.put(channel, &format!("-sim{n:08}"), record);
        }
    }
}

async fn inject_outages(feed: MemoryFeed, every: Duration, length: Duration) {
    loop {
        tokio::time::sleep(every).await;
        println!("--- outage for {} ---", format_duration(length));
        feed.set_available(false);
        tokio::time::sleep(length).await;
        feed.set_available(true);
        println!("--- feed restored ---");
    }
}

fn print_channel_summary(pipeline: &Pipeline, channel: &ChannelId) {
    let readings = pipeline.snapshot(channel);
    let state = pipeline
        .status(channel)
        .map_or_else(|| "-".to_string(), |s| format!("{:?}", s.state));
    let stats = pipeline.stats(channel).unwrap_or_default();

    println!("  {channel}");
    println!("    State:     {state}");
    println!("    Readings:  {}", readings.len());
    println!(
        "    Ingested:  {} snapshots, {} accepted, {} rejected",
        stats.snapshots, stats.accepted, stats.rejected
    );
    if let (Some(first), Some(last)) = (readings.first(), readings.last()) {
        println!(
            "    Span:      {}",
            format_duration(Duration::from_millis(last.timestamp() - first.timestamp()))
        );
        println!("    Latest:    {}", format_reading(last));
    }
}

fn format_reading(reading: &Reading) -> String {
    format!(
        "{:.2}°C {:.1}% @ {} [{}]",
        reading.temperature(),
        reading.humidity(),
        reading.timestamp(),
        reading.source_key()
    )
}

/// Parses a duration string like "250ms", "30s", "5m", "1h", "7d".
fn parse_duration(s: &str) -> Result<Duration, Box<dyn std::error::Error>> {
    let s = s.trim();
    if s.is_empty() {
        return Err("Empty duration string".into());
    }

    if let Some(ms) = s.strip_suffix("ms") {
        return Ok(Duration::from_millis(ms.parse()?));
    }

    let Some((split, _)) = s.char_indices().last() else {
        return Err("Empty duration string".into());
    };
    let (num_str, unit) = s.split_at(split);
    let num: u64 = num_str.parse()?;

    let scale = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86400,
        _ => return Err(format!("Unknown duration unit: '{unit}'. Use ms, s, m, h, or d.").into()),
    };
    let secs = num
        .checked_mul(scale)
        .ok_or_else(|| format!("Duration too large: '{s}'"))?;

    Ok(Duration::from_secs(secs))
}

/// Formats a duration in the largest whole unit.
fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if d.subsec_millis() != 0 || secs == 0 {
        format!("{}ms", d.as_millis())
    } else if secs >= 3600 && secs.is_multiple_of(3600) {
        format!("{}h", secs / 3600)
    } else if secs >= 60 && secs.is_multiple_of(60) {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}
