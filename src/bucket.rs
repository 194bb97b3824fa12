//! Buckets and update notifications

use crate::chunk::{BestTimestampIndex, DecimalDataSeriesIndex, HistoryChunk, TimestampIndex};
use crate::descriptor::HistoryBucketDescriptor;
use crate::error::{HistoryError, Result};
use crate::range::{HistoryBucketRange, Millis, SamplingPeriod};
use crate::time_range::{TimeRange, TimeRanges};
use serde::{Deserialize, Serialize};

/// The samples of one bucket
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryBucket {
    descriptor: HistoryBucketDescriptor,
    chunk: HistoryChunk,
}

impl HistoryBucket {
    /// Creates a bucket.
    ///
    /// All timestamps of the chunk must be within the descriptor and the chunk
    /// may not hold more samples than the bucket range has slots.
    pub fn new(descriptor: HistoryBucketDescriptor, chunk: HistoryChunk) -> Result<Self> {
        let entries_count = descriptor.bucket_range().entries_count();
        if chunk.timestamps_count() > entries_count {
            return Err(HistoryError::InvalidChunk(format!(
                "{descriptor} holds at most {entries_count} samples but got {}",
                chunk.timestamps_count()
            )));
        }

        if let (Some(first), Some(last)) = (chunk.first_timestamp(), chunk.last_timestamp()) {
            if !descriptor.contains(first) || !descriptor.contains(last) {
                return Err(HistoryError::InvalidChunk(format!(
                    "timestamps {first} - {last} are not within {descriptor}"
                )));
            }
        }

        Ok(Self { descriptor, chunk })
    }

    pub fn descriptor(&self) -> &HistoryBucketDescriptor {
        &self.descriptor
    }

    pub fn chunk(&self) -> &HistoryChunk {
        &self.chunk
    }

    pub fn into_chunk(self) -> HistoryChunk {
        self.chunk
    }

    pub fn start(&self) -> Millis {
        self.descriptor.start()
    }

    pub fn end(&self) -> Millis {
        self.descriptor.end()
    }

    pub fn bucket_range(&self) -> HistoryBucketRange {
        self.descriptor.bucket_range()
    }

    pub fn sampling_period(&self) -> SamplingPeriod {
        self.descriptor.bucket_range().sampling_period()
    }

    pub fn time_range(&self) -> TimeRange {
        self.descriptor.time_range()
    }

    pub fn overlaps(&self, range: &TimeRange) -> bool {
        self.time_range().overlaps(range)
    }

    pub fn contains(&self, timestamp: Millis) -> bool {
        self.descriptor.contains(timestamp)
    }
}

/// Describes what has changed after a store or delete
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryUpdateInfo {
    pub sampling_period: SamplingPeriod,
    pub updated_time_ranges: TimeRanges,
}

impl HistoryUpdateInfo {
    pub fn new(sampling_period: SamplingPeriod, updated_time_ranges: TimeRanges) -> Self {
        Self {
            sampling_period,
            updated_time_ranges,
        }
    }

    /// The whole span of the bucket has changed
    pub fn from_descriptor(descriptor: &HistoryBucketDescriptor) -> Self {
        Self::new(
            descriptor.bucket_range().sampling_period(),
            TimeRanges::of(descriptor.time_range()),
        )
    }

    /// The span between the first and the last timestamp of the chunk (plus one sample) has changed
    pub fn from_chunk(chunk: &HistoryChunk, sampling_period: SamplingPeriod) -> Self {
        let ranges = match (chunk.first_timestamp(), chunk.last_timestamp()) {
            (Some(first), Some(last)) => {
                TimeRanges::of(TimeRange::new(first, last + sampling_period.distance()))
            }
            _ => TimeRanges::new(),
        };
        Self::new(sampling_period, ranges)
    }
}

/// Returns the decimal value at (or just before) the timestamp.
///
/// Values older than one sampling distance are not returned. The buckets must be sorted.
pub fn find_decimal_value_at(
    buckets: &[HistoryBucket],
    series: DecimalDataSeriesIndex,
    timestamp: Millis,
) -> Option<f64> {
    let bucket = buckets.iter().find(|bucket| bucket.contains(timestamp))?;
    let chunk = bucket.chunk();
    let row = match chunk.best_timestamp_index_for(timestamp) {
        BestTimestampIndex::Found(row) => row,
        BestTimestampIndex::NotFound(0) => return None,
        BestTimestampIndex::NotFound(insertion) => TimestampIndex(insertion - 1),
    };

    if timestamp - chunk.timestamp(row) > bucket.sampling_period().distance() {
        return None;
    }
    chunk.decimal_value(series, row)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::HistoryChunkBuilder;
    use crate::schema::HistoryConfiguration;

    fn chunk(timestamps: &[Millis]) -> HistoryChunk {
        let configuration = HistoryConfiguration::only_decimals(&[10], &["a"]).unwrap();
        let mut builder = HistoryChunkBuilder::new(configuration);
        for timestamp in timestamps {
            builder.add_decimal_values(*timestamp, &[*timestamp * 2.0]);
        }
        builder.build().unwrap()
    }

    #[test]
    fn test_rejects_timestamps_outside() {
        let descriptor =
            HistoryBucketDescriptor::for_timestamp(0.0, HistoryBucketRange::HundredMillis);
        assert!(HistoryBucket::new(descriptor, chunk(&[0.0, 99.0])).is_ok());
        assert!(HistoryBucket::new(descriptor, chunk(&[0.0, 100.0])).is_err());
        assert!(HistoryBucket::new(descriptor, chunk(&[-1.0, 50.0])).is_err());
    }

    #[test]
    fn test_rejects_too_many_samples() {
        let descriptor =
            HistoryBucketDescriptor::for_timestamp(0.0, HistoryBucketRange::HundredMillis);
        let timestamps: Vec<Millis> = (0..100).map(|i| i as f64 * 0.5).collect();
        assert!(HistoryBucket::new(descriptor, chunk(&timestamps)).is_ok());

        let timestamps: Vec<Millis> = (0..101).map(|i| i as f64 * 0.5).collect();
        assert!(matches!(
            HistoryBucket::new(descriptor, chunk(&timestamps)),
            Err(HistoryError::InvalidChunk(_))
        ));
    }

    #[test]
    fn test_update_info() {
        let descriptor =
            HistoryBucketDescriptor::for_timestamp(5_000.0, HistoryBucketRange::FiveSeconds);
        let info = HistoryUpdateInfo::from_descriptor(&descriptor);
        assert_eq!(info.sampling_period, SamplingPeriod::EveryTenMillis);
        assert_eq!(info.updated_time_ranges.span(), 5_000.0);

        let info = HistoryUpdateInfo::from_chunk(&chunk(&[10.0, 20.0]), SamplingPeriod::EveryMillisecond);
        let ranges: Vec<_> = info.updated_time_ranges.iter().copied().collect();
        assert_eq!(ranges, vec![TimeRange::new(10.0, 21.0)]);
    }

    #[test]
    fn test_find_decimal_value_at() {
        let descriptor =
            HistoryBucketDescriptor::for_timestamp(0.0, HistoryBucketRange::HundredMillis);
        let buckets = vec![HistoryBucket::new(descriptor, chunk(&[10.0, 11.0, 20.0])).unwrap()];
        let series = DecimalDataSeriesIndex(0);

        assert_eq!(find_decimal_value_at(&buckets, series, 11.0), Some(22.0));
        assert_eq!(find_decimal_value_at(&buckets, series, 11.5), Some(22.0));
        assert_eq!(find_decimal_value_at(&buckets, series, 15.0), None);
        assert_eq!(find_decimal_value_at(&buckets, series, 5.0), None);
        assert_eq!(find_decimal_value_at(&buckets, series, 500.0), None);
    }
}
