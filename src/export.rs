//! CSV export of stored samples

use crate::chunk::{
    DecimalDataSeriesIndex, EnumDataSeriesIndex, HistoryChunk, HistoryEnumSet,
    ReferenceEntryDataSeriesIndex, TimestampIndex,
};
use crate::descriptor::HistoryBucketDescriptor;
use crate::error::{HistoryError, Result};
use crate::range::{Millis, SamplingPeriod};
use crate::schema::{HistoryConfiguration, HistoryEnum};
use crate::storage::HistoryStorage;
use crate::time_range::format_utc;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Upper bound for the number of buckets read by one export
pub const MAX_EXPORTED_BUCKETS: usize = 100_000;

/// Writes all samples within `[start, end)` of the sampling period as CSV.
///
/// The columns follow the configuration of the first bucket found. Buckets
/// with another configuration are skipped. Returns the number of rows.
pub fn export_to_csv<S, W>(
    storage: &S,
    start: Millis,
    end: Millis,
    sampling_period: SamplingPeriod,
    writer: W,
) -> Result<usize>
where
    S: HistoryStorage + ?Sized,
    W: Write,
{
    let mut writer = BufWriter::new(writer);
    let descriptors = HistoryBucketDescriptor::for_range(
        start,
        end,
        sampling_period.to_bucket_range(),
        false,
        MAX_EXPORTED_BUCKETS,
    )?;

    let mut configuration: Option<HistoryConfiguration> = None;
    let mut rows = 0;

    for descriptor in &descriptors {
        let Some(bucket) = storage.get(descriptor)? else {
            continue;
        };
        let chunk = bucket.chunk();

        match &configuration {
            None => {
                write_header(&mut writer, chunk.configuration()).map_err(io_error)?;
                configuration = Some(chunk.configuration().clone());
            }
            Some(configuration) if configuration != chunk.configuration() => {
                warn!("Skipping {} with a different configuration", descriptor);
                continue;
            }
            Some(_) => {}
        }

        for row in 0..chunk.timestamps_count() {
            let timestamp = chunk.timestamp(TimestampIndex(row));
            if timestamp < start || timestamp >= end {
                continue;
            }
            write_row(&mut writer, chunk, TimestampIndex(row)).map_err(io_error)?;
            rows += 1;
        }
    }

    writer.flush().map_err(io_error)?;
    info!(
        "Exported {} samples between {} and {}",
        rows,
        format_utc(start),
        format_utc(end)
    );
    Ok(rows)
}

/// Creates the file and exports into it
pub fn export_to_file<S>(
    storage: &S,
    start: Millis,
    end: Millis,
    sampling_period: SamplingPeriod,
    output_path: &Path,
) -> Result<usize>
where
    S: HistoryStorage + ?Sized,
{
    let file = File::create(output_path).map_err(|e| HistoryError::io(output_path, e))?;
    export_to_csv(storage, start, end, sampling_period, file).map_err(|e| e.at(output_path))
}

fn io_error(source: std::io::Error) -> HistoryError {
    HistoryError::io(PathBuf::new(), source)
}

fn write_header(writer: &mut impl Write, configuration: &HistoryConfiguration) -> std::io::Result<()> {
    let names = configuration
        .decimal_data_series()
        .iter()
        .map(|series| series.name.as_str())
        .chain(configuration.enum_data_series().iter().map(|series| series.name.as_str()))
        .chain(
            configuration
                .reference_entry_data_series()
                .iter()
                .map(|series| series.name.as_str()),
        )
        .map(escape)
        .collect::<Vec<_>>();

    if names.is_empty() {
        writeln!(writer, "timestamp,datetime")
    } else {
        writeln!(writer, "timestamp,datetime,{}", names.join(","))
    }
}

fn write_row(writer: &mut impl Write, chunk: &HistoryChunk, row: TimestampIndex) -> std::io::Result<()> {
    let timestamp = chunk.timestamp(row);
    let configuration = chunk.configuration();
    let mut cells = vec![timestamp.to_string(), format_utc(timestamp)];

    for series in 0..chunk.decimal_data_series_count() {
        cells.push(opt_to_csv(chunk.decimal_value(DecimalDataSeriesIndex(series), row)));
    }

    for (series, definition) in configuration.enum_data_series().iter().enumerate() {
        let value = chunk.enum_value(EnumDataSeriesIndex(series), row);
        cells.push(enum_to_csv(value, &definition.history_enum));
    }

    for series in 0..chunk.reference_entry_data_series_count() {
        let id = chunk.reference_entry_id(ReferenceEntryDataSeriesIndex(series), row);
        cells.push(opt_to_csv(id.map(|id| id.0)));
    }

    writeln!(writer, "{}", cells.join(","))
}

fn opt_to_csv<T: ToString>(opt: Option<T>) -> String {
    opt.map(|v| v.to_string()).unwrap_or_default()
}

/// All active keys, separated by `|`. Unknown ordinals are written as numbers.
fn enum_to_csv(value: Option<HistoryEnumSet>, history_enum: &HistoryEnum) -> String {
    let Some(set) = value else {
        return String::new();
    };
    let keys = set
        .ordinals()
        .map(|ordinal| {
            history_enum
                .key_of(ordinal.0)
                .map(str::to_string)
                .unwrap_or_else(|| ordinal.0.to_string())
        })
        .collect::<Vec<_>>();
    escape(&keys.join("|"))
}

fn escape(cell: &str) -> String {
    if cell.contains([',', '"', '\n']) {
        format!("\"{}\"", cell.replace('"', "\"\""))
    } else {
        cell.to_string()
    }
}
