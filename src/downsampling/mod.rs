//! Down sampling
//!
//! Every bucket range (except the smallest) is calculated from the buckets of
//! the next finer range. Each sample slot of the coarser bucket combines all
//! child samples that fall into it:
//!
//! - decimals: average, min and max of the present values
//! - enums: union of the sets and the ordinal that was active most of the time
//! - reference entries: most-of-the-time id, number of different ids, union of the statuses
//!
//! Slots without any child sample stay empty. Nothing is interpolated.

mod calculator;
mod counter;
mod service;

pub use calculator::DownSamplingCalculator;
pub use counter::{EnumOrdinalCounter, ReferenceEntryCounter};
pub(crate) use service::scheduling_handle;
pub use service::{
    create_jobs, DownSamplingDirtyRangesCollector, DownSamplingJob, DownSamplingService,
    RefreshRange,
};

use crate::bucket::HistoryBucket;
use crate::chunk::{
    DecimalDataSeriesIndex, DecimalValues, EnumDataSeriesIndex, EnumValues, HistoryChunk,
    HistoryValues, RecordingType, ReferenceEntryDataSeriesIndex, ReferenceEntryValues,
    TimestampIndex,
};
use crate::descriptor::HistoryBucketDescriptor;
use crate::error::{HistoryError, Result};
use crate::range::Millis;
use crate::schema::HistoryConfiguration;
use crate::time_range::format_utc;
use tracing::debug;

/// The timestamps of a down sampled bucket: the centre of every slot
pub fn target_timestamps(descriptor: &HistoryBucketDescriptor) -> Vec<Millis> {
    let range = descriptor.bucket_range();
    let start = descriptor.start();
    (0..range.entries_count())
        .map(|slot| start + (slot as f64 + 0.5) * range.duration())
        .collect()
}

/// The slot of the descriptor that contains the timestamp
fn slot_index(descriptor: &HistoryBucketDescriptor, timestamp: Millis) -> usize {
    let range = descriptor.bucket_range();
    let slot = ((timestamp - descriptor.start()) / range.duration()).floor().max(0.0) as usize;
    slot.min(range.entries_count() - 1)
}

/// Calculates the down sampled bucket for `descriptor` from its child buckets.
///
/// The children must be buckets of the next finer range within the descriptor,
/// sorted by start. Children with a different configuration than the last
/// (most recent) child are skipped.
pub fn calculate_down_sampled(
    descriptor: &HistoryBucketDescriptor,
    children: &[HistoryBucket],
) -> Result<HistoryBucket> {
    let last = children.last().ok_or_else(|| {
        HistoryError::InvalidChunk(format!("at least one child bucket required for {descriptor}"))
    })?;
    check_children(descriptor, children)?;

    let configuration = last.chunk().shared_configuration();
    let mut calculator = DownSamplingCalculator::for_chunk(last.chunk());
    let mut output = DownSampledValues::new(&configuration, descriptor.bucket_range().entries_count());
    let mut current_slot: Option<usize> = None;

    for child in children {
        let chunk = child.chunk();
        if chunk.configuration() != configuration.as_ref() {
            debug!("Skipping {} for down sampling - configuration changed", child.descriptor());
            continue;
        }

        for (row, timestamp) in chunk.timestamps().iter().enumerate() {
            let slot = slot_index(descriptor, *timestamp);
            if let Some(current) = current_slot {
                if current != slot {
                    output.set(current, &calculator);
                    calculator.reset();
                }
            }
            current_slot = Some(slot);
            calculator.add_row(chunk, TimestampIndex(row));
        }
    }

    if let Some(current) = current_slot {
        output.set(current, &calculator);
    }

    let chunk = HistoryChunk::new(
        configuration,
        target_timestamps(descriptor),
        output.into_values(),
        RecordingType::Calculated,
    )?;
    HistoryBucket::new(*descriptor, chunk)
}

fn check_children(descriptor: &HistoryBucketDescriptor, children: &[HistoryBucket]) -> Result<()> {
    for child in children {
        if child.descriptor().parent().as_ref() != Some(descriptor) {
            return Err(HistoryError::InvalidChunk(format!(
                "{} is not a child of {}",
                child.descriptor(),
                descriptor
            )));
        }
    }

    for (index, pair) in children.windows(2).enumerate() {
        if pair[0].end() > pair[1].start() {
            return Err(HistoryError::InvalidChunk(format!(
                "children must be sorted: child {} ends at {} but child {} starts at {}",
                index,
                format_utc(pair[0].end()),
                index + 1,
                format_utc(pair[1].start())
            )));
        }
    }
    Ok(())
}

/// The columns of a down sampled chunk, every slot starts without value
struct DownSampledValues {
    decimal_count: usize,
    enum_count: usize,
    reference_entry_count: usize,
    values: HistoryValues,
}

impl DownSampledValues {
    fn new(configuration: &HistoryConfiguration, entries: usize) -> Self {
        let decimal_count = configuration.decimal_data_series_count();
        let enum_count = configuration.enum_data_series_count();
        let reference_entry_count = configuration.reference_entry_data_series_count();

        let decimals = entries * decimal_count;
        let enums = entries * enum_count;
        let references = entries * reference_entry_count;

        Self {
            decimal_count,
            enum_count,
            reference_entry_count,
            values: HistoryValues {
                decimal: DecimalValues {
                    values: vec![None; decimals],
                    min: Some(vec![None; decimals]),
                    max: Some(vec![None; decimals]),
                },
                enums: EnumValues {
                    values: vec![None; enums],
                    most_of_the_time: Some(vec![None; enums]),
                },
                reference_entries: ReferenceEntryValues {
                    ids: vec![None; references],
                    different_ids_counts: Some(vec![None; references]),
                    statuses: vec![None; references],
                },
            },
        }
    }

    fn set(&mut self, slot: usize, calculator: &DownSamplingCalculator) {
        let decimal = &mut self.values.decimal;
        for series in 0..self.decimal_count {
            let cell = slot * self.decimal_count + series;
            let index = DecimalDataSeriesIndex(series);
            decimal.values[cell] = calculator.average(index);
            if let Some(min) = decimal.min.as_mut() {
                min[cell] = calculator.min(index);
            }
            if let Some(max) = decimal.max.as_mut() {
                max[cell] = calculator.max(index);
            }
        }

        let enums = &mut self.values.enums;
        for series in 0..self.enum_count {
            let cell = slot * self.enum_count + series;
            let index = EnumDataSeriesIndex(series);
            enums.values[cell] = calculator.enum_union(index);
            if let Some(most_of_the_time) = enums.most_of_the_time.as_mut() {
                most_of_the_time[cell] = calculator.enum_most_of_the_time(index);
            }
        }

        let references = &mut self.values.reference_entries;
        for series in 0..self.reference_entry_count {
            let cell = slot * self.reference_entry_count + series;
            let index = ReferenceEntryDataSeriesIndex(series);
            references.ids[cell] = calculator.reference_entry_most_of_the_time(index);
            references.statuses[cell] = calculator.reference_entry_statuses(index);
            if let Some(counts) = references.different_ids_counts.as_mut() {
                counts[cell] = calculator.reference_entry_different_ids_count(index);
            }
        }
    }

    fn into_values(self) -> HistoryValues {
        self.values
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{
        HistoryChunkBuilder, HistoryEnumOrdinal, HistoryEnumSet, ReferenceEntryId,
    };
    use crate::range::HistoryBucketRange;
    use crate::schema::{DataSeriesId, HistoryEnum, HistoryUnit};
    use std::sync::Arc;

    const SERIES: DecimalDataSeriesIndex = DecimalDataSeriesIndex(0);

    fn decimal_configuration() -> Arc<HistoryConfiguration> {
        Arc::new(HistoryConfiguration::only_decimals(&[10], &["Temperature"]).unwrap())
    }

    /// A full HundredMillis bucket, the value is the timestamp
    fn hundred_millis_bucket(configuration: &Arc<HistoryConfiguration>, start: Millis) -> HistoryBucket {
        let descriptor = HistoryBucketDescriptor::for_start(start, HistoryBucketRange::HundredMillis).unwrap();
        let mut builder = HistoryChunkBuilder::new(Arc::clone(configuration));
        for offset in 0..100 {
            let timestamp = start + offset as f64;
            builder.add_decimal_values(timestamp, &[timestamp]);
        }
        HistoryBucket::new(descriptor, builder.build().unwrap()).unwrap()
    }

    #[test]
    fn test_target_timestamps() {
        let descriptor = HistoryBucketDescriptor::for_timestamp(5_000.0, HistoryBucketRange::FiveSeconds);
        let timestamps = target_timestamps(&descriptor);
        assert_eq!(timestamps.len(), 500);
        assert_eq!(timestamps[0], 5_005.0);
        assert_eq!(timestamps[499], 9_995.0);
    }

    #[test]
    fn test_down_sample_full_children() {
        let configuration = decimal_configuration();
        let parent = HistoryBucketDescriptor::for_timestamp(0.0, HistoryBucketRange::FiveSeconds);
        let children: Vec<_> = parent
            .children()
            .iter()
            .map(|child| hundred_millis_bucket(&configuration, child.start()))
            .collect();
        assert_eq!(children.len(), 50);

        let bucket = calculate_down_sampled(&parent, &children).unwrap();
        let chunk = bucket.chunk();
        assert_eq!(chunk.timestamps_count(), 500);
        assert_eq!(chunk.recording_type(), RecordingType::Calculated);

        // Slot i covers the timestamps 10 * i .. 10 * i + 9
        for slot in [0, 1, 250, 499] {
            let row = TimestampIndex(slot);
            let first = slot as f64 * 10.0;
            assert_eq!(chunk.decimal_value(SERIES, row), Some(first + 4.5));
            assert_eq!(chunk.decimal_min(SERIES, row), Some(first));
            assert_eq!(chunk.decimal_max(SERIES, row), Some(first + 9.0));
        }
    }

    #[test]
    fn test_partial_children_leave_gaps() {
        let configuration = decimal_configuration();
        let parent = HistoryBucketDescriptor::for_timestamp(0.0, HistoryBucketRange::FiveSeconds);
        // Only the first half of the children
        let children: Vec<_> = parent
            .children()
            .iter()
            .take(25)
            .map(|child| hundred_millis_bucket(&configuration, child.start()))
            .collect();

        let bucket = calculate_down_sampled(&parent, &children).unwrap();
        let values = bucket.chunk().decimal_values_of(SERIES);
        assert_eq!(values.len(), 500);
        assert!(values[..250].iter().all(Option::is_some));
        assert!(values[250..].iter().all(Option::is_none));
        assert_eq!(bucket.chunk().decimal_min(SERIES, TimestampIndex(300)), None);
    }

    #[test]
    fn test_missing_samples_within_slot() {
        let configuration = decimal_configuration();
        let parent = HistoryBucketDescriptor::for_timestamp(0.0, HistoryBucketRange::FiveSeconds);
        let child = HistoryBucketDescriptor::for_timestamp(0.0, HistoryBucketRange::HundredMillis);

        let mut builder = HistoryChunkBuilder::new(configuration);
        builder.add_decimal_values(0.0, &[1.0]);
        builder.add_decimal_values(1.0, &[f64::NAN]);
        builder.add_decimal_values(2.0, &[3.0]);
        builder.add_decimal_values(10.0, &[f64::NAN]);
        let children = vec![HistoryBucket::new(child, builder.build().unwrap()).unwrap()];

        let bucket = calculate_down_sampled(&parent, &children).unwrap();
        assert_eq!(bucket.chunk().decimal_value(SERIES, TimestampIndex(0)), Some(2.0));
        // A slot with only missing samples has no value
        assert_eq!(bucket.chunk().decimal_value(SERIES, TimestampIndex(1)), None);
    }

    #[test]
    fn test_down_sample_enums_and_reference_entries() {
        let configuration = Arc::new(
            HistoryConfiguration::builder()
                .decimal_data_series(DataSeriesId(1), "Speed", HistoryUnit("m/s".into()))
                .enum_data_series(DataSeriesId(2), "State", HistoryEnum::new("State", &["Off", "On", "Error"]))
                .reference_entry_data_series(DataSeriesId(3), "Order", Some(HistoryEnum::active()))
                .build()
                .unwrap(),
        );
        let parent = HistoryBucketDescriptor::for_timestamp(0.0, HistoryBucketRange::FiveSeconds);
        let child = HistoryBucketDescriptor::for_timestamp(0.0, HistoryBucketRange::HundredMillis);

        let mut builder = HistoryChunkBuilder::new(Arc::clone(&configuration));
        for offset in 0..10 {
            let state = if offset < 7 { 1 } else { 2 };
            let order = if offset < 4 { 100 } else { 200 };
            builder.add_values(
                offset as f64,
                &[Some(offset as f64)],
                &[Some(HistoryEnumSet::for_ordinal(HistoryEnumOrdinal(state)))],
                &[Some(ReferenceEntryId(order))],
                &[Some(HistoryEnumSet(1 << (offset % 2)))],
            );
        }
        let children = vec![HistoryBucket::new(child, builder.build().unwrap()).unwrap()];

        let bucket = calculate_down_sampled(&parent, &children).unwrap();
        let chunk = bucket.chunk();
        let row = TimestampIndex(0);

        let state = EnumDataSeriesIndex(0);
        assert_eq!(chunk.enum_value(state, row), Some(HistoryEnumSet(0b110)));
        assert_eq!(chunk.enum_most_of_the_time(state, row), Some(HistoryEnumOrdinal(1)));

        let order = ReferenceEntryDataSeriesIndex(0);
        assert_eq!(chunk.reference_entry_id(order, row), Some(ReferenceEntryId(200)));
        assert_eq!(chunk.reference_entry_different_ids_count(order, row), Some(2));
        assert_eq!(chunk.reference_entry_status(order, row), Some(HistoryEnumSet(0b11)));

        assert_eq!(chunk.enum_value(state, TimestampIndex(1)), None);
        assert_eq!(chunk.reference_entry_id(order, TimestampIndex(1)), None);
    }

    #[test]
    fn test_down_sample_calculated_children() {
        let configuration = decimal_configuration();
        let minute = HistoryBucketDescriptor::for_timestamp(0.0, HistoryBucketRange::OneMinute);

        let five_seconds: Vec<_> = minute
            .children()
            .iter()
            .map(|parent| {
                let children: Vec<_> = parent
                    .children()
                    .iter()
                    .map(|child| hundred_millis_bucket(&configuration, child.start()))
                    .collect();
                calculate_down_sampled(parent, &children).unwrap()
            })
            .collect();

        let bucket = calculate_down_sampled(&minute, &five_seconds).unwrap();
        let chunk = bucket.chunk();
        assert_eq!(chunk.timestamps_count(), 600);

        // Slot i covers the timestamps 100 * i .. 100 * i + 99
        for slot in [0, 42, 599] {
            let row = TimestampIndex(slot);
            let first = slot as f64 * 100.0;
            let average = chunk.decimal_value(SERIES, row).unwrap();
            assert!((average - (first + 49.5)).abs() < 1e-9, "{average}");
            assert_eq!(chunk.decimal_min(SERIES, row), Some(first));
            assert_eq!(chunk.decimal_max(SERIES, row), Some(first + 99.0));
        }
    }

    #[test]
    fn test_rejects_invalid_children() {
        let configuration = decimal_configuration();
        let parent = HistoryBucketDescriptor::for_timestamp(0.0, HistoryBucketRange::FiveSeconds);

        assert!(calculate_down_sampled(&parent, &[]).is_err());

        // Outside of the parent
        let outside = hundred_millis_bucket(&configuration, 5_000.0);
        assert!(matches!(
            calculate_down_sampled(&parent, &[outside]),
            Err(HistoryError::InvalidChunk(_))
        ));

        // Unsorted
        let first = hundred_millis_bucket(&configuration, 0.0);
        let second = hundred_millis_bucket(&configuration, 100.0);
        assert!(calculate_down_sampled(&parent, &[second.clone(), first.clone()]).is_err());
        assert!(calculate_down_sampled(&parent, &[first.clone(), first]).is_err());

        // Wrong range
        let minute = HistoryBucketDescriptor::for_timestamp(0.0, HistoryBucketRange::OneMinute);
        assert!(calculate_down_sampled(&minute, &[second]).is_err());
    }

    #[test]
    fn test_skips_children_with_other_configuration() {
        let parent = HistoryBucketDescriptor::for_timestamp(0.0, HistoryBucketRange::FiveSeconds);
        let old = hundred_millis_bucket(
            &Arc::new(HistoryConfiguration::only_decimals(&[99], &["Old"]).unwrap()),
            0.0,
        );
        let new = hundred_millis_bucket(&decimal_configuration(), 100.0);

        let bucket = calculate_down_sampled(&parent, &[old, new]).unwrap();
        assert_eq!(bucket.chunk().configuration(), decimal_configuration().as_ref());
        assert_eq!(bucket.chunk().decimal_value(SERIES, TimestampIndex(0)), None);
        assert_eq!(bucket.chunk().decimal_value(SERIES, TimestampIndex(10)), Some(104.5));
    }
}
