//! Identification of history buckets

use crate::chunk::HistoryChunk;
use crate::error::{HistoryError, Result};
use crate::range::{HistoryBucketRange, Millis, SamplingPeriod};
use crate::time_range::{format_utc, TimeRange};
use std::fmt;

/// Default upper bound for the number of descriptors returned by [`HistoryBucketDescriptor::for_range`]
pub const MAX_SUPPORTED_DESCRIPTORS_COUNT: usize = 100;

/// Identifies one history bucket: a bucket range and the index of the bucket.
///
/// The start is always aligned: `start == index * bucket_range.distance()`.
/// Descriptors of the same range never overlap and tile the time axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HistoryBucketDescriptor {
    bucket_range: HistoryBucketRange,
    index: i64,
}

impl HistoryBucketDescriptor {
    /// Returns the descriptor of the bucket that contains the timestamp
    pub fn for_timestamp(timestamp: Millis, bucket_range: HistoryBucketRange) -> Self {
        Self {
            bucket_range,
            index: bucket_range.calculate_index(timestamp),
        }
    }

    pub fn for_timestamp_with_period(timestamp: Millis, sampling_period: SamplingPeriod) -> Self {
        Self::for_timestamp(timestamp, sampling_period.to_bucket_range())
    }

    /// Creates the descriptor for an exact bucket start
    pub fn for_start(start: Millis, bucket_range: HistoryBucketRange) -> Result<Self> {
        let descriptor = Self::for_timestamp(start, bucket_range);
        if descriptor.start() != start {
            return Err(HistoryError::InvalidDescriptor(format!(
                "start {} is not aligned for {}, expected {}",
                format_utc(start),
                bucket_range,
                format_utc(descriptor.start())
            )));
        }
        Ok(descriptor)
    }

    pub fn for_index(index: i64, bucket_range: HistoryBucketRange) -> Self {
        Self {
            bucket_range,
            index,
        }
    }

    /// Returns the descriptors that cover `[start, end)`.
    ///
    /// If `include_end` is set, the descriptor starting exactly at `end` is added, too.
    /// Fails if more than `max_descriptors` descriptors would be returned.
    pub fn for_range(
        start: Millis,
        end: Millis,
        bucket_range: HistoryBucketRange,
        include_end: bool,
        max_descriptors: usize,
    ) -> Result<Vec<Self>> {
        let first = Self::for_timestamp(start, bucket_range);
        let estimated = ((end - first.start()) / bucket_range.distance()).ceil().max(0.0) as usize;
        if estimated > max_descriptors {
            return Err(HistoryError::InvalidDescriptor(format!(
                "requested range too big: up to {max_descriptors} buckets supported but {estimated} required ({} - {}, {bucket_range})",
                format_utc(start),
                format_utc(end),
            )));
        }

        let mut descriptors = Vec::with_capacity(estimated + 1);
        let mut descriptor = first;
        while descriptor.start() < end || (include_end && descriptor.start() == end) {
            descriptors.push(descriptor);
            descriptor = descriptor.next(1);
        }
        Ok(descriptors)
    }

    /// Returns all descriptors the timestamps of the chunk fall into
    pub fn from_chunk(chunk: &HistoryChunk, sampling_period: SamplingPeriod) -> Vec<Self> {
        let bucket_range = sampling_period.to_bucket_range();
        let mut descriptors: Vec<Self> = Vec::new();

        for &timestamp in chunk.timestamps() {
            if descriptors
                .last()
                .is_some_and(|current| current.contains(timestamp))
            {
                continue;
            }
            descriptors.push(Self::for_timestamp(timestamp, bucket_range));
        }

        descriptors
    }

    pub fn bucket_range(&self) -> HistoryBucketRange {
        self.bucket_range
    }

    pub fn index(&self) -> i64 {
        self.index
    }

    /// Start of the bucket (inclusive)
    pub fn start(&self) -> Millis {
        self.bucket_range.calculate_start_for_index(self.index)
    }

    /// End of the bucket (exclusive)
    pub fn end(&self) -> Millis {
        self.bucket_range.calculate_start_for_index(self.index + 1)
    }

    pub fn center(&self) -> Millis {
        (self.start() + self.end()) / 2.0
    }

    pub fn time_range(&self) -> TimeRange {
        TimeRange::new(self.start(), self.end())
    }

    pub fn contains(&self, timestamp: Millis) -> bool {
        self.start() <= timestamp && timestamp < self.end()
    }

    /// The descriptor `distance` buckets later
    pub fn next(&self, distance: i64) -> Self {
        Self::for_index(self.index + distance, self.bucket_range)
    }

    /// The descriptor `distance` buckets earlier
    pub fn previous(&self, distance: i64) -> Self {
        Self::for_index(self.index - distance, self.bucket_range)
    }

    /// Number of buckets between this and `other` (both of the same range)
    pub fn distance_to(&self, other: &HistoryBucketDescriptor) -> Result<i64> {
        if self.bucket_range != other.bucket_range {
            return Err(HistoryError::InvalidDescriptor(format!(
                "same bucket ranges required, got {} and {}",
                self.bucket_range, other.bucket_range
            )));
        }
        Ok(other.index - self.index)
    }

    /// The descriptors of the next finer range that tile this bucket.
    ///
    /// Empty for the smallest range.
    pub fn children(&self) -> Vec<Self> {
        let Some(lower) = self.bucket_range.lower() else {
            return Vec::new();
        };

        let count = (self.bucket_range.distance() / lower.distance()).round() as i64;
        let first = Self::for_timestamp(self.start(), lower);
        (0..count).map(|offset| first.next(offset)).collect()
    }

    /// The bucket of the next coarser range that contains this bucket
    pub fn parent(&self) -> Option<Self> {
        self.bucket_range
            .upper()
            .map(|upper| Self::for_timestamp(self.start(), upper))
    }
}

impl fmt::Display for HistoryBucketDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{} - {})",
            self.bucket_range,
            format_utc(self.start()),
            format_utc(self.end())
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alignment() {
        let timestamps = [
            -1_000_000_123.0,
            -1.0,
            0.0,
            1.0,
            99.0,
            100.0,
            1_592_751_600_000.0,
            1_407_060_214_313.253,
        ];

        for range in HistoryBucketRange::ALL {
            for timestamp in timestamps {
                let descriptor = HistoryBucketDescriptor::for_timestamp(timestamp, range);
                assert_eq!(descriptor.start().rem_euclid(range.distance()), 0.0);
                assert!(descriptor.start() <= timestamp, "{descriptor} / {timestamp}");
                assert!(timestamp < descriptor.end(), "{descriptor} / {timestamp}");
            }
        }
    }

    #[test]
    fn test_children_tile_parent() {
        let timestamp = 1_407_060_214_313.253;

        for range in HistoryBucketRange::ALL.into_iter().skip(1) {
            let descriptor = HistoryBucketDescriptor::for_timestamp(timestamp, range);
            let children = descriptor.children();

            assert!(!children.is_empty());
            assert_eq!(children[0].start(), descriptor.start());
            assert_eq!(children[children.len() - 1].end(), descriptor.end());
            for pair in children.windows(2) {
                assert_eq!(pair[0].end(), pair[1].start());
            }
            for child in &children {
                assert_eq!(child.parent(), Some(descriptor));
            }
        }
    }

    #[test]
    fn test_children_count() {
        let descriptor =
            HistoryBucketDescriptor::for_timestamp(0.0, HistoryBucketRange::OneMinute);
        assert_eq!(descriptor.children().len(), 12);

        let smallest =
            HistoryBucketDescriptor::for_timestamp(0.0, HistoryBucketRange::HundredMillis);
        assert!(smallest.children().is_empty());
        assert_eq!(
            smallest.parent().map(|parent| parent.bucket_range()),
            Some(HistoryBucketRange::FiveSeconds)
        );

        let greatest = HistoryBucketDescriptor::for_timestamp(0.0, HistoryBucketRange::greatest());
        assert_eq!(greatest.parent(), None);
    }

    #[test]
    fn test_for_start() {
        assert!(HistoryBucketDescriptor::for_start(5_000.0, HistoryBucketRange::FiveSeconds).is_ok());
        assert!(matches!(
            HistoryBucketDescriptor::for_start(5_001.0, HistoryBucketRange::FiveSeconds),
            Err(HistoryError::InvalidDescriptor(_))
        ));
    }

    #[test]
    fn test_for_range() {
        let range = HistoryBucketRange::HundredMillis;
        let descriptors =
            HistoryBucketDescriptor::for_range(50.0, 300.0, range, false, 100).unwrap();
        let starts: Vec<_> = descriptors.iter().map(|d| d.start()).collect();
        assert_eq!(starts, vec![0.0, 100.0, 200.0]);

        let with_end = HistoryBucketDescriptor::for_range(50.0, 300.0, range, true, 100).unwrap();
        assert_eq!(with_end.len(), 4);

        assert!(HistoryBucketDescriptor::for_range(0.0, 1_000_000.0, range, false, 100).is_err());
    }

    #[test]
    fn test_next_previous_distance() {
        let descriptor =
            HistoryBucketDescriptor::for_timestamp(10_000.0, HistoryBucketRange::FiveSeconds);
        assert_eq!(descriptor.next(1).start(), 15_000.0);
        assert_eq!(descriptor.previous(2).start(), 0.0);
        assert_eq!(descriptor.distance_to(&descriptor.next(3)).unwrap(), 3);
        assert!(descriptor
            .distance_to(&HistoryBucketDescriptor::for_timestamp(0.0, HistoryBucketRange::OneDay))
            .is_err());
    }

    #[test]
    fn test_equality_by_range_and_start() {
        let a = HistoryBucketDescriptor::for_timestamp(100.0, HistoryBucketRange::HundredMillis);
        let b = HistoryBucketDescriptor::for_timestamp(199.0, HistoryBucketRange::HundredMillis);
        let c = HistoryBucketDescriptor::for_timestamp(100.0, HistoryBucketRange::FiveSeconds);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
