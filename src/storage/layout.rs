//! Mapping between descriptors and bucket files
//!
//! Layout: `{base}/{RangeName}/{calendar dirs}/{leaf}{extension}`, e.g.
//! `OneMinute/2014/08/03/10/03.json` for the minute starting at 10:03 UTC.
//! The calendar fields are taken from the bucket start in UTC.

use crate::descriptor::HistoryBucketDescriptor;
use crate::error::{HistoryError, Result};
use crate::range::{HistoryBucketRange, LayoutGranularity, Millis};
use chrono::{DateTime, Datelike, NaiveDate, Timelike};
use std::path::{Path, PathBuf};

/// year, month, day, hour, minute, second, millisecond
const FIELD_COUNT: usize = 7;
const FIELD_WIDTHS: [usize; FIELD_COUNT] = [4, 2, 2, 2, 2, 2, 3];

/// Which calendar fields form the directories and the leaf name
fn split(granularity: LayoutGranularity) -> (usize, usize) {
    match granularity {
        LayoutGranularity::Second => (6, 7),
        LayoutGranularity::Minute => (5, 6),
        LayoutGranularity::Hour => (4, 5),
        LayoutGranularity::Day => (3, 4),
        LayoutGranularity::Month => (2, 3),
        // 30 day buckets may start twice within a month and 360 day buckets twice within a year
        LayoutGranularity::Year => (1, 3),
        LayoutGranularity::Range => (0, 3),
    }
}

fn calendar_fields(timestamp: Millis) -> Result<[i64; FIELD_COUNT]> {
    let datetime = DateTime::from_timestamp_millis(timestamp.floor() as i64).ok_or_else(|| {
        HistoryError::InvalidDescriptor(format!("timestamp {timestamp} out of calendar range"))
    })?;

    Ok([
        datetime.year() as i64,
        datetime.month() as i64,
        datetime.day() as i64,
        datetime.hour() as i64,
        datetime.minute() as i64,
        datetime.second() as i64,
        datetime.timestamp_subsec_millis() as i64,
    ])
}

fn format_field(index: usize, value: i64) -> String {
    let width = FIELD_WIDTHS[index];
    if value < 0 {
        format!("-{:0width$}", -value)
    } else {
        format!("{:0width$}", value)
    }
}

/// Directory that contains the file of the bucket
pub fn bucket_directory(base_dir: &Path, descriptor: &HistoryBucketDescriptor) -> Result<PathBuf> {
    let range = descriptor.bucket_range();
    let fields = calendar_fields(descriptor.start())?;
    let (directories, _) = split(range.layout_granularity());

    let mut path = base_dir.join(range.name());
    for (index, value) in fields.iter().take(directories).enumerate() {
        path.push(format_field(index, *value));
    }
    Ok(path)
}

/// Name of the bucket file, e.g. `03.json`
pub fn bucket_file_name(descriptor: &HistoryBucketDescriptor, extension: &str) -> Result<String> {
    let fields = calendar_fields(descriptor.start())?;
    let (directories, end) = split(descriptor.bucket_range().layout_granularity());

    let name = (directories..end)
        .map(|index| format_field(index, fields[index]))
        .collect::<Vec<_>>()
        .join("-");
    Ok(format!("{name}{extension}"))
}

/// Full path of the bucket file
pub fn bucket_file(
    base_dir: &Path,
    descriptor: &HistoryBucketDescriptor,
    extension: &str,
) -> Result<PathBuf> {
    Ok(bucket_directory(base_dir, descriptor)?.join(bucket_file_name(descriptor, extension)?))
}

/// Parses the descriptor from the path of a bucket file of the given range.
///
/// Returns `None` for paths that do not follow the layout.
pub fn parse_bucket_file(
    base_dir: &Path,
    path: &Path,
    range: HistoryBucketRange,
) -> Option<HistoryBucketDescriptor> {
    let relative = path.strip_prefix(base_dir.join(range.name())).ok()?;
    let (directories, end) = split(range.layout_granularity());

    let components: Vec<&str> = relative
        .components()
        .map(|component| component.as_os_str().to_str())
        .collect::<Option<_>>()?;
    let (file_name, directory_names) = components.split_last()?;
    if directory_names.len() != directories {
        return None;
    }

    // [year, month, day, hour, minute, second, millis]
    let mut fields: [i64; FIELD_COUNT] = [1970, 1, 1, 0, 0, 0, 0];
    for (index, name) in directory_names.iter().enumerate() {
        fields[index] = name.parse().ok()?;
    }

    let stem = file_name.split('.').next()?;
    let (negative, stem) = match stem.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, stem),
    };
    let parts: Vec<&str> = stem.split('-').collect();
    if parts.len() != end - directories {
        return None;
    }
    for (offset, part) in parts.iter().enumerate() {
        fields[directories + offset] = part.parse().ok()?;
    }
    if negative {
        fields[directories] = -fields[directories];
    }

    let start = NaiveDate::from_ymd_opt(
        i32::try_from(fields[0]).ok()?,
        u32::try_from(fields[1]).ok()?,
        u32::try_from(fields[2]).ok()?,
    )?
    .and_hms_milli_opt(
        u32::try_from(fields[3]).ok()?,
        u32::try_from(fields[4]).ok()?,
        u32::try_from(fields[5]).ok()?,
        u32::try_from(fields[6]).ok()?,
    )?
    .and_utc()
    .timestamp_millis() as Millis;

    HistoryBucketDescriptor::for_start(start, range).ok()
}
