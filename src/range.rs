//! Bucket ranges and sampling periods
//!
//! The hierarchy is fixed: every [`HistoryBucketRange`] stores a fixed number of
//! samples, spaced by its [`SamplingPeriod`]. Ranges are aligned relative to
//! 1970-01-01 UTC and do not follow the calendar (a "year" is 360 days).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Milliseconds since 1970-01-01 UTC
pub type Millis = f64;

const SECOND: Millis = 1_000.0;
const MINUTE: Millis = 60.0 * SECOND;
const HOUR: Millis = 60.0 * MINUTE;
const DAY: Millis = 24.0 * HOUR;

/// The distance between two samples
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SamplingPeriod {
    EveryMillisecond,
    EveryTenMillis,
    EveryHundredMillis,
    EverySecond,
    EveryTenSeconds,
    EveryMinute,
    EveryTenMinutes,
    EveryHour,
    Every6Hours,
    Every24Hours,
    Every5Days,
    Every30Days,
    Every90Days,
    Every360Days,
}

impl SamplingPeriod {
    /// All sampling periods, finest first
    pub const ALL: [SamplingPeriod; 14] = [
        SamplingPeriod::EveryMillisecond,
        SamplingPeriod::EveryTenMillis,
        SamplingPeriod::EveryHundredMillis,
        SamplingPeriod::EverySecond,
        SamplingPeriod::EveryTenSeconds,
        SamplingPeriod::EveryMinute,
        SamplingPeriod::EveryTenMinutes,
        SamplingPeriod::EveryHour,
        SamplingPeriod::Every6Hours,
        SamplingPeriod::Every24Hours,
        SamplingPeriod::Every5Days,
        SamplingPeriod::Every30Days,
        SamplingPeriod::Every90Days,
        SamplingPeriod::Every360Days,
    ];

    /// Distance between two samples in milliseconds
    pub fn distance(self) -> Millis {
        match self {
            SamplingPeriod::EveryMillisecond => 1.0,
            SamplingPeriod::EveryTenMillis => 10.0,
            SamplingPeriod::EveryHundredMillis => 100.0,
            SamplingPeriod::EverySecond => SECOND,
            SamplingPeriod::EveryTenSeconds => 10.0 * SECOND,
            SamplingPeriod::EveryMinute => MINUTE,
            SamplingPeriod::EveryTenMinutes => 10.0 * MINUTE,
            SamplingPeriod::EveryHour => HOUR,
            SamplingPeriod::Every6Hours => 6.0 * HOUR,
            SamplingPeriod::Every24Hours => DAY,
            SamplingPeriod::Every5Days => 5.0 * DAY,
            SamplingPeriod::Every30Days => 30.0 * DAY,
            SamplingPeriod::Every90Days => 90.0 * DAY,
            SamplingPeriod::Every360Days => 360.0 * DAY,
        }
    }

    /// The bucket range that stores samples with this period
    pub fn to_bucket_range(self) -> HistoryBucketRange {
        HistoryBucketRange::find(self)
    }

    /// Parses the variant name (`EveryTenMillis`, ...), case-insensitive
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|period| format!("{period:?}").eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for SamplingPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Resolution tier of the history.
///
/// Ordered from the finest ([`HistoryBucketRange::HundredMillis`]) to the coarsest range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HistoryBucketRange {
    HundredMillis,
    FiveSeconds,
    OneMinute,
    TenMinutes,
    OneHour,
    SixHours,
    /// 24 hours
    OneDay,
    /// Starts on a thursday (UTC) - 1970-01-01 has been a thursday
    ThirtyDays,
    /// 90 days, not aligned with the calendar
    OneQuarter,
    /// 360 days
    OneYear,
    FiveYears,
    ThirtyYears,
    NinetyYears,
    SevenHundredTwentyYears,
}

impl HistoryBucketRange {
    /// All ranges, finest first
    pub const ALL: [HistoryBucketRange; 14] = [
        HistoryBucketRange::HundredMillis,
        HistoryBucketRange::FiveSeconds,
        HistoryBucketRange::OneMinute,
        HistoryBucketRange::TenMinutes,
        HistoryBucketRange::OneHour,
        HistoryBucketRange::SixHours,
        HistoryBucketRange::OneDay,
        HistoryBucketRange::ThirtyDays,
        HistoryBucketRange::OneQuarter,
        HistoryBucketRange::OneYear,
        HistoryBucketRange::FiveYears,
        HistoryBucketRange::ThirtyYears,
        HistoryBucketRange::NinetyYears,
        HistoryBucketRange::SevenHundredTwentyYears,
    ];

    /// All ranges, finest first
    pub fn all() -> impl Iterator<Item = HistoryBucketRange> {
        Self::ALL.into_iter()
    }

    pub fn smallest() -> Self {
        HistoryBucketRange::HundredMillis
    }

    pub fn greatest() -> Self {
        HistoryBucketRange::SevenHundredTwentyYears
    }

    /// Returns the range that stores samples with the given period
    pub fn find(sampling_period: SamplingPeriod) -> Self {
        match sampling_period {
            SamplingPeriod::EveryMillisecond => HistoryBucketRange::HundredMillis,
            SamplingPeriod::EveryTenMillis => HistoryBucketRange::FiveSeconds,
            SamplingPeriod::EveryHundredMillis => HistoryBucketRange::OneMinute,
            SamplingPeriod::EverySecond => HistoryBucketRange::TenMinutes,
            SamplingPeriod::EveryTenSeconds => HistoryBucketRange::OneHour,
            SamplingPeriod::EveryMinute => HistoryBucketRange::SixHours,
            SamplingPeriod::EveryTenMinutes => HistoryBucketRange::OneDay,
            SamplingPeriod::EveryHour => HistoryBucketRange::ThirtyDays,
            SamplingPeriod::Every6Hours => HistoryBucketRange::OneQuarter,
            SamplingPeriod::Every24Hours => HistoryBucketRange::OneYear,
            SamplingPeriod::Every5Days => HistoryBucketRange::FiveYears,
            SamplingPeriod::Every30Days => HistoryBucketRange::ThirtyYears,
            SamplingPeriod::Every90Days => HistoryBucketRange::NinetyYears,
            SamplingPeriod::Every360Days => HistoryBucketRange::SevenHundredTwentyYears,
        }
    }

    /// Returns the range whose sample slot is exactly `duration` milliseconds long
    pub fn for_duration(duration: Millis) -> Option<Self> {
        Self::ALL.into_iter().find(|range| range.duration() == duration)
    }

    pub fn sampling_period(self) -> SamplingPeriod {
        match self {
            HistoryBucketRange::HundredMillis => SamplingPeriod::EveryMillisecond,
            HistoryBucketRange::FiveSeconds => SamplingPeriod::EveryTenMillis,
            HistoryBucketRange::OneMinute => SamplingPeriod::EveryHundredMillis,
            HistoryBucketRange::TenMinutes => SamplingPeriod::EverySecond,
            HistoryBucketRange::OneHour => SamplingPeriod::EveryTenSeconds,
            HistoryBucketRange::SixHours => SamplingPeriod::EveryMinute,
            HistoryBucketRange::OneDay => SamplingPeriod::EveryTenMinutes,
            HistoryBucketRange::ThirtyDays => SamplingPeriod::EveryHour,
            HistoryBucketRange::OneQuarter => SamplingPeriod::Every6Hours,
            HistoryBucketRange::OneYear => SamplingPeriod::Every24Hours,
            HistoryBucketRange::FiveYears => SamplingPeriod::Every5Days,
            HistoryBucketRange::ThirtyYears => SamplingPeriod::Every30Days,
            HistoryBucketRange::NinetyYears => SamplingPeriod::Every90Days,
            HistoryBucketRange::SevenHundredTwentyYears => SamplingPeriod::Every360Days,
        }
    }

    /// Number of sample slots within one bucket
    pub fn entries_count(self) -> usize {
        match self {
            HistoryBucketRange::HundredMillis => 100,
            HistoryBucketRange::FiveSeconds => 500,
            HistoryBucketRange::OneMinute => 600,
            HistoryBucketRange::TenMinutes => 600,
            HistoryBucketRange::OneHour => 360,
            HistoryBucketRange::SixHours => 360,
            HistoryBucketRange::OneDay => 6 * 24,
            HistoryBucketRange::ThirtyDays => 24 * 30,
            HistoryBucketRange::OneQuarter => 4 * 90,
            HistoryBucketRange::OneYear => 360,
            HistoryBucketRange::FiveYears => 72 * 5,
            HistoryBucketRange::ThirtyYears => 12 * 30,
            HistoryBucketRange::NinetyYears => 4 * 90,
            HistoryBucketRange::SevenHundredTwentyYears => 720,
        }
    }

    /// Length of one sample slot in milliseconds
    pub fn duration(self) -> Millis {
        self.sampling_period().distance()
    }

    /// Length of one bucket in milliseconds (`duration * entries_count`)
    pub fn distance(self) -> Millis {
        self.duration() * self.entries_count() as f64
    }

    fn position(self) -> usize {
        self as usize
    }

    /// The next finer range, `None` for the smallest range
    pub fn lower(self) -> Option<Self> {
        self.position()
            .checked_sub(1)
            .map(|index| Self::ALL[index])
    }

    /// The next coarser range, `None` for the greatest range
    pub fn upper(self) -> Option<Self> {
        Self::ALL.get(self.position() + 1).copied()
    }

    /// How many slots of the lower range are combined into one slot of this range.
    ///
    /// `None` for the smallest range - it has nothing to down sample from.
    pub fn down_sampling_factor(self) -> Option<usize> {
        self.lower()
            .map(|lower| (self.duration() / lower.duration()).round() as usize)
    }

    /// Index of the bucket that contains the timestamp (floor semantics)
    pub fn calculate_index(self, timestamp: Millis) -> i64 {
        (timestamp / self.distance()).floor() as i64
    }

    /// Start of the bucket that contains the timestamp
    pub fn calculate_start(self, timestamp: Millis) -> Millis {
        self.calculate_start_for_index(self.calculate_index(timestamp))
    }

    pub fn calculate_start_for_index(self, index: i64) -> Millis {
        index as f64 * self.distance()
    }

    /// The calendar unit that groups the bucket files of this range into directories.
    ///
    /// The unit is also the unit of the leaf file name, one level finer than the directory.
    pub fn layout_granularity(self) -> LayoutGranularity {
        match self {
            HistoryBucketRange::HundredMillis => LayoutGranularity::Second,
            HistoryBucketRange::FiveSeconds => LayoutGranularity::Minute,
            HistoryBucketRange::OneMinute | HistoryBucketRange::TenMinutes => {
                LayoutGranularity::Hour
            }
            HistoryBucketRange::OneHour | HistoryBucketRange::SixHours => LayoutGranularity::Day,
            HistoryBucketRange::OneDay => LayoutGranularity::Month,
            HistoryBucketRange::ThirtyDays | HistoryBucketRange::OneQuarter => {
                LayoutGranularity::Year
            }
            HistoryBucketRange::OneYear
            | HistoryBucketRange::FiveYears
            | HistoryBucketRange::ThirtyYears
            | HistoryBucketRange::NinetyYears
            | HistoryBucketRange::SevenHundredTwentyYears => LayoutGranularity::Range,
        }
    }

    /// Parses the variant name (`OneMinute`, ...), case-insensitive
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|range| range.name().eq_ignore_ascii_case(name))
    }

    /// The name used for the directory of this range
    pub fn name(self) -> &'static str {
        match self {
            HistoryBucketRange::HundredMillis => "HundredMillis",
            HistoryBucketRange::FiveSeconds => "FiveSeconds",
            HistoryBucketRange::OneMinute => "OneMinute",
            HistoryBucketRange::TenMinutes => "TenMinutes",
            HistoryBucketRange::OneHour => "OneHour",
            HistoryBucketRange::SixHours => "SixHours",
            HistoryBucketRange::OneDay => "OneDay",
            HistoryBucketRange::ThirtyDays => "ThirtyDays",
            HistoryBucketRange::OneQuarter => "OneQuarter",
            HistoryBucketRange::OneYear => "OneYear",
            HistoryBucketRange::FiveYears => "FiveYears",
            HistoryBucketRange::ThirtyYears => "ThirtyYears",
            HistoryBucketRange::NinetyYears => "NinetyYears",
            HistoryBucketRange::SevenHundredTwentyYears => "SevenHundredTwentyYears",
        }
    }
}

impl fmt::Display for HistoryBucketRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Deepest calendar directory used for the bucket files of a range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutGranularity {
    /// `y/m/d/h/min/sec`, file named by the millisecond of the second
    Second,
    /// `y/m/d/h/min`, file named by the second
    Minute,
    /// `y/m/d/h`, file named by the minute
    Hour,
    /// `y/m/d`, file named by the hour
    Day,
    /// `y/m`, file named by the day of month
    Month,
    /// `y`, file named by the month
    Year,
    /// Only the range directory, file named by the year
    Range,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distances() {
        assert_eq!(HistoryBucketRange::HundredMillis.distance(), 100.0);
        assert_eq!(HistoryBucketRange::FiveSeconds.distance(), 5_000.0);
        assert_eq!(HistoryBucketRange::OneMinute.distance(), 60_000.0);
        assert_eq!(HistoryBucketRange::OneDay.distance(), DAY);
        assert_eq!(HistoryBucketRange::ThirtyDays.distance(), 30.0 * DAY);
        assert_eq!(HistoryBucketRange::OneYear.distance(), 360.0 * DAY);
        assert_eq!(
            HistoryBucketRange::SevenHundredTwentyYears.distance(),
            720.0 * 360.0 * DAY
        );
    }

    #[test]
    fn test_hierarchy_alignment() {
        for range in HistoryBucketRange::ALL {
            let Some(lower) = range.lower() else {
                assert_eq!(range, HistoryBucketRange::smallest());
                continue;
            };

            let buckets = range.distance() / lower.distance();
            assert_eq!(buckets.fract(), 0.0, "{range} is not tiled by {lower}");

            let slots = range.duration() / lower.duration();
            assert_eq!(slots.fract(), 0.0, "{range} slot is not a multiple of {lower}");
            assert_eq!(range.down_sampling_factor(), Some(slots as usize));
        }
    }

    #[test]
    fn test_upper_lower() {
        assert_eq!(HistoryBucketRange::HundredMillis.lower(), None);
        assert_eq!(
            HistoryBucketRange::HundredMillis.upper(),
            Some(HistoryBucketRange::FiveSeconds)
        );
        assert_eq!(
            HistoryBucketRange::OneMinute.lower(),
            Some(HistoryBucketRange::FiveSeconds)
        );
        assert_eq!(HistoryBucketRange::greatest().upper(), None);
        assert!(HistoryBucketRange::HundredMillis < HistoryBucketRange::OneDay);
    }

    #[test]
    fn test_find_round_trip() {
        for period in SamplingPeriod::ALL {
            assert_eq!(period.to_bucket_range().sampling_period(), period);
        }
        assert_eq!(
            HistoryBucketRange::for_duration(100.0),
            Some(HistoryBucketRange::OneMinute)
        );
        assert_eq!(HistoryBucketRange::for_duration(7.0), None);
    }

    #[test]
    fn test_calculate_start_floors_negative() {
        let range = HistoryBucketRange::FiveSeconds;
        assert_eq!(range.calculate_start(0.0), 0.0);
        assert_eq!(range.calculate_start(4_999.0), 0.0);
        assert_eq!(range.calculate_start(-1.0), -5_000.0);
        assert_eq!(range.calculate_index(-5_000.0), -1);
        assert_eq!(range.calculate_index(-5_001.0), -2);
    }

    #[test]
    fn test_from_name() {
        assert_eq!(
            HistoryBucketRange::from_name("oneminute"),
            Some(HistoryBucketRange::OneMinute)
        );
        assert_eq!(
            SamplingPeriod::from_name("EveryTenMillis"),
            Some(SamplingPeriod::EveryTenMillis)
        );
        assert_eq!(SamplingPeriod::from_name("nope"), None);
    }
}
