//! meister-history - command line access to a history directory
//!
//! Generates synthetic samples, runs the down sampling cascade, prints buckets
//! and exports samples as CSV.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use meister_history::config::{StorageArgs, StorageConfig};
use meister_history::downsampling::DownSamplingService;
use meister_history::export::export_to_file;
use meister_history::generator::{HistoryChunkGenerator, HistoryValueGenerators};
use meister_history::storage::cache::CachedHistoryStorage;
use meister_history::storage::file::FileHistoryStorage;
use meister_history::storage::serializer::{HistoryStorageSerializer, JsonHistoryStorageSerializer};
use meister_history::storage::{HistoryStorage, WritableHistoryStorage};
use meister_history::time_range::format_utc;
use meister_history::{
    HistoryBucketDescriptor, HistoryBucketRange, HistoryConfiguration, Millis, SamplingPeriod,
    TimeRange, TimeRanges,
};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Parser, Debug)]
#[command(name = "meister-history", version, about = "Time bucketed history storage")]
struct Cli {
    #[command(flatten)]
    storage: StorageArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write synthetic samples and down sample them
    Generate {
        /// Start (RFC 3339 or milliseconds since epoch)
        #[arg(long, value_parser = parse_timestamp)]
        from: Millis,
        /// End, exclusive
        #[arg(long, value_parser = parse_timestamp)]
        to: Millis,
        #[arg(long, value_parser = parse_sampling_period, default_value = "EveryHundredMillis")]
        period: SamplingPeriod,
        /// Number of decimal data series
        #[arg(long, default_value_t = 3)]
        series: usize,
        #[arg(long, default_value_t = 0)]
        enums: usize,
        #[arg(long, default_value_t = 0)]
        references: usize,
    },
    /// Write live samples until interrupted, down sampling in the background
    Record {
        #[arg(long, value_parser = parse_sampling_period, default_value = "EveryHundredMillis")]
        period: SamplingPeriod,
        #[arg(long, default_value_t = 3)]
        series: usize,
        /// Stop after this many seconds
        #[arg(long)]
        seconds: Option<u64>,
    },
    /// Print the bucket that contains the timestamp as JSON
    Get {
        #[arg(long, value_parser = parse_timestamp)]
        timestamp: Millis,
        #[arg(long, value_parser = parse_bucket_range)]
        range: HistoryBucketRange,
    },
    /// Export samples as CSV
    Export {
        #[arg(long, value_parser = parse_timestamp)]
        from: Millis,
        #[arg(long, value_parser = parse_timestamp)]
        to: Millis,
        #[arg(long, value_parser = parse_sampling_period)]
        period: SamplingPeriod,
        #[arg(long)]
        output: PathBuf,
    },
    /// Recalculate all ranges above the sampling period
    Downsample {
        #[arg(long, value_parser = parse_timestamp)]
        from: Millis,
        #[arg(long, value_parser = parse_timestamp)]
        to: Millis,
        #[arg(long, value_parser = parse_sampling_period, default_value = "EveryHundredMillis")]
        period: SamplingPeriod,
    },
    /// List the stored bucket files of a range
    List {
        #[arg(long, value_parser = parse_bucket_range)]
        range: HistoryBucketRange,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing for logging (respects RUST_LOG env var)
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = StorageConfig::load(&cli.storage).context("Failed to load configuration")?;
    let storage = Arc::new(
        config
            .open_storage()
            .with_context(|| format!("Failed to open storage at {:?}", config.base_dir))?,
    );

    let result = match cli.command {
        Command::Generate {
            from,
            to,
            period,
            series,
            enums,
            references,
        } => generate(&storage, from, to, period, (series, enums, references)),
        Command::Record {
            period,
            series,
            seconds,
        } => record(&storage, &config, period, series, seconds).await,
        Command::Get { timestamp, range } => get(&storage, timestamp, range),
        Command::Export {
            from,
            to,
            period,
            output,
        } => export(&storage, &config, from, to, period, output),
        Command::Downsample { from, to, period } => downsample(&storage, from, to, period),
        Command::List { range } => list(&storage, range),
    };

    storage.dispose();
    result
}

fn generate(
    storage: &Arc<FileHistoryStorage>,
    from: Millis,
    to: Millis,
    period: SamplingPeriod,
    (series, enums, references): (usize, usize, usize),
) -> Result<()> {
    if to <= from {
        bail!("--to must be after --from");
    }

    let service = DownSamplingService::new(Arc::clone(storage));
    let generator = chunk_generator(period, series, enums, references)?;

    let mut stored = 0;
    for window in bucket_windows(from, to, period) {
        if let Some(chunk) = generator.for_time_range(window)? {
            stored += storage
                .store_chunk(&chunk, period)
                .with_context(|| format!("Failed to store samples at {}", format_utc(window.start)))?
                .len();
        }
        // Nobody polls the pending updates here
        storage.get_updates();
    }

    let jobs = service.flush().context("Down sampling failed")?;
    println!(
        "Stored {} buckets between {} and {}, {} down sampling jobs",
        stored,
        format_utc(from),
        format_utc(to),
        jobs
    );
    Ok(())
}

/// Splits `[from, to)` into spans of one bucket each, which keeps the chunks small
fn bucket_windows(from: Millis, to: Millis, period: SamplingPeriod) -> Vec<TimeRange> {
    let window = period.to_bucket_range().distance();
    let mut windows = Vec::new();
    let mut start = from;
    while start < to {
        let end = (start + window).min(to);
        windows.push(TimeRange::new(start, end));
        start = end;
    }
    windows
}

async fn record(
    storage: &Arc<FileHistoryStorage>,
    config: &StorageConfig,
    period: SamplingPeriod,
    series: usize,
    seconds: Option<u64>,
) -> Result<()> {
    let service = storage
        .schedule_down_sampling(config.down_sampling_delay)
        .context("Failed to schedule down sampling")?;
    let mut generator = chunk_generator(period, series, 0, 0)?;

    let tick = Duration::from_millis(period.distance().max(100.0) as u64);
    let mut interval_timer = tokio::time::interval(tick);
    let deadline = tokio::time::sleep(seconds.map_or(Duration::MAX, Duration::from_secs));
    tokio::pin!(deadline);

    info!("Recording {} data series every {}", series, period);
    let mut samples = 0;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = &mut deadline => break,
            _ = interval_timer.tick() => {
                if let Some(chunk) = generator.next(now_millis())? {
                    samples += chunk.timestamps_count();
                    storage.store_chunk(&chunk, period).context("Failed to store samples")?;
                }
                let updates = storage.get_updates();
                debug!("{} buckets updated", updates.len());
            }
        }
    }

    let jobs = service.flush().context("Down sampling failed")?;
    println!("Recorded {} samples, {} final down sampling jobs", samples, jobs);
    Ok(())
}

fn get(storage: &Arc<FileHistoryStorage>, timestamp: Millis, range: HistoryBucketRange) -> Result<()> {
    let descriptor = HistoryBucketDescriptor::for_timestamp(timestamp, range);
    let Some(bucket) = storage
        .get(&descriptor)
        .with_context(|| format!("Failed to read {}", descriptor))?
    else {
        println!("No bucket stored for {}", descriptor);
        return Ok(());
    };

    let mut stdout = std::io::stdout().lock();
    JsonHistoryStorageSerializer.serialize(&bucket, &mut stdout)?;
    writeln!(stdout)?;
    Ok(())
}

fn export(
    storage: &Arc<FileHistoryStorage>,
    config: &StorageConfig,
    from: Millis,
    to: Millis,
    period: SamplingPeriod,
    output: PathBuf,
) -> Result<()> {
    println!("Exporting samples to: {}", output.display());
    let cached = CachedHistoryStorage::new(Arc::clone(storage), config.cache_capacity);
    let rows = export_to_file(&cached, from, to, period, &output)
        .with_context(|| format!("Failed to export to {:?}", output))?;

    debug!("Cache: {:?}", cached.cache_stats());
    println!("Exported {} samples", rows);
    Ok(())
}

fn downsample(storage: &Arc<FileHistoryStorage>, from: Millis, to: Millis, period: SamplingPeriod) -> Result<()> {
    let Some(upper) = period.to_bucket_range().upper() else {
        bail!("Nothing to down sample above {}", period);
    };

    let service = DownSamplingService::new(Arc::clone(storage));
    let mut jobs = service
        .recalculate(&TimeRanges::of(TimeRange::new(from, to)), upper)
        .with_context(|| format!("Failed to recalculate {}", upper))?;
    jobs += service.flush().context("Down sampling failed")?;

    println!("Ran {} down sampling jobs", jobs);
    Ok(())
}

fn list(storage: &Arc<FileHistoryStorage>, range: HistoryBucketRange) -> Result<()> {
    let files = storage
        .stored_files(range)
        .with_context(|| format!("Failed to list {}", range))?;
    for file in &files {
        let relative = file.strip_prefix(storage.base_dir()).unwrap_or(file);
        println!("{}", relative.display());
    }
    println!("{} buckets", files.len());
    Ok(())
}

fn chunk_generator(
    period: SamplingPeriod,
    decimal: usize,
    enums: usize,
    references: usize,
) -> Result<HistoryChunkGenerator> {
    let configuration = HistoryConfiguration::default_with_counts(decimal, enums, references);
    let generators = HistoryValueGenerators::demo(&configuration, period);
    Ok(HistoryChunkGenerator::new(configuration, period, generators)?)
}

fn now_millis() -> Millis {
    Utc::now().timestamp_millis() as Millis
}

/// Milliseconds since epoch or an RFC 3339 date
fn parse_timestamp(s: &str) -> Result<Millis, String> {
    if let Ok(millis) = s.parse::<Millis>() {
        return Ok(millis);
    }
    DateTime::parse_from_rfc3339(s)
        .map(|datetime| datetime.timestamp_millis() as Millis)
        .map_err(|e| format!("Invalid timestamp '{}': {}", s, e))
}

fn parse_sampling_period(s: &str) -> Result<SamplingPeriod, String> {
    SamplingPeriod::from_name(s).ok_or_else(|| format!("Unknown sampling period '{}'", s))
}

fn parse_bucket_range(s: &str) -> Result<HistoryBucketRange, String> {
    HistoryBucketRange::from_name(s).ok_or_else(|| format!("Unknown bucket range '{}'", s))
}
