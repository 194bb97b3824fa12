//! Time ranges in milliseconds

use crate::range::Millis;
use chrono::{DateTime, SecondsFormat};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A span of time: start inclusive, end exclusive
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: Millis,
    pub end: Millis,
}

impl TimeRange {
    pub fn new(start: Millis, end: Millis) -> Self {
        Self { start, end }
    }

    pub fn span(&self) -> Millis {
        self.end - self.start
    }

    pub fn contains(&self, timestamp: Millis) -> bool {
        self.start <= timestamp && timestamp < self.end
    }

    /// Returns true if `[start, end)` lies completely within this range
    pub fn contains_range(&self, start: Millis, end: Millis) -> bool {
        self.start <= start && end <= self.end
    }

    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Clamps this range to `[start, end)`
    pub fn fit_within(&self, start: Millis, end: Millis) -> TimeRange {
        TimeRange::new(self.start.max(start), self.end.min(end))
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} - {})", format_utc(self.start), format_utc(self.end))
    }
}

/// Sorted, non-overlapping time ranges
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeRanges {
    ranges: Vec<TimeRange>,
}

impl TimeRanges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn of(range: TimeRange) -> Self {
        let mut ranges = Self::new();
        ranges.add(range);
        ranges
    }

    /// Adds a range, merging it with every range it touches
    pub fn add(&mut self, range: TimeRange) {
        let mut merged = range;
        self.ranges.retain(|existing| {
            if existing.start <= merged.end && merged.start <= existing.end {
                merged.start = merged.start.min(existing.start);
                merged.end = merged.end.max(existing.end);
                false
            } else {
                true
            }
        });

        let position = self
            .ranges
            .partition_point(|existing| existing.start < merged.start);
        self.ranges.insert(position, merged);
    }

    pub fn add_all(&mut self, other: &TimeRanges) {
        for range in &other.ranges {
            self.add(*range);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TimeRange> {
        self.ranges.iter()
    }

    /// Sum of the spans of all ranges
    pub fn span(&self) -> Millis {
        self.ranges.iter().map(TimeRange::span).sum()
    }
}

impl<'a> IntoIterator for &'a TimeRanges {
    type Item = &'a TimeRange;
    type IntoIter = std::slice::Iter<'a, TimeRange>;

    fn into_iter(self) -> Self::IntoIter {
        self.ranges.iter()
    }
}

/// Formats a timestamp as ISO8601 in UTC
pub fn format_utc(millis: Millis) -> String {
    if !millis.is_finite() {
        return format!("{millis}");
    }
    match DateTime::from_timestamp_millis(millis.floor() as i64) {
        Some(datetime) => datetime.to_rfc3339_opts(SecondsFormat::Millis, true),
        None => format!("{millis}ms"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains_is_half_open() {
        let range = TimeRange::new(10.0, 20.0);
        assert!(range.contains(10.0));
        assert!(range.contains(19.999));
        assert!(!range.contains(20.0));
        assert!(range.contains_range(10.0, 20.0));
        assert!(!range.contains_range(9.0, 20.0));
    }

    #[test]
    fn test_ranges_merge() {
        let mut ranges = TimeRanges::new();
        ranges.add(TimeRange::new(50.0, 60.0));
        ranges.add(TimeRange::new(0.0, 10.0));
        ranges.add(TimeRange::new(10.0, 20.0));
        ranges.add(TimeRange::new(100.0, 110.0));

        let collected: Vec<_> = ranges.iter().copied().collect();
        assert_eq!(
            collected,
            vec![
                TimeRange::new(0.0, 20.0),
                TimeRange::new(50.0, 60.0),
                TimeRange::new(100.0, 110.0),
            ]
        );
        assert_eq!(ranges.span(), 40.0);

        ranges.add(TimeRange::new(15.0, 105.0));
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges.span(), 110.0);
    }

    #[test]
    fn test_format_utc() {
        assert_eq!(format_utc(1_407_060_214_313.0), "2014-08-03T10:03:34.313Z");
        assert_eq!(format_utc(-1.0), "1969-12-31T23:59:59.999Z");
    }
}
