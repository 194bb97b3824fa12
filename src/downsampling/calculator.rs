//! Reduces the samples of one slot to a single down sampled sample

use super::counter::{EnumOrdinalCounter, ReferenceEntryCounter};
use crate::chunk::{
    DecimalDataSeriesIndex, EnumDataSeriesIndex, HistoryChunk, HistoryEnumOrdinal, HistoryEnumSet,
    ReferenceEntryDataSeriesIndex, ReferenceEntryId, TimestampIndex,
};

/// Running average, min and max of one decimal data series
#[derive(Debug, Clone, Copy, Default)]
struct DecimalAccumulator {
    average: f64,
    min: f64,
    max: f64,
    /// Number of present values. Missing values are ignored.
    count: usize,
}

impl DecimalAccumulator {
    fn add(&mut self, value: f64, min: f64, max: f64) {
        if self.count == 0 {
            self.average = value;
            self.min = min;
            self.max = max;
        } else {
            self.average += (value - self.average) / (self.count + 1) as f64;
            self.min = self.min.min(min);
            self.max = self.max.max(max);
        }
        self.count += 1;
    }
}

#[derive(Debug, Clone, Default)]
struct EnumAccumulator {
    union: Option<HistoryEnumSet>,
    ordinals: EnumOrdinalCounter,
}

#[derive(Debug, Clone, Default)]
struct ReferenceEntryAccumulator {
    counter: ReferenceEntryCounter,
    statuses: Option<HistoryEnumSet>,
}

/// Collects the samples of one slot of the down sampled bucket.
///
/// Add all samples that fall into the slot, read the results, then [`DownSamplingCalculator::reset`]
/// before the next slot.
///
/// A sample that is missing or not available yet is `None` and does not count. A slot
/// without any present sample yields `None`.
#[derive(Debug, Clone)]
pub struct DownSamplingCalculator {
    decimals: Vec<DecimalAccumulator>,
    enums: Vec<EnumAccumulator>,
    reference_entries: Vec<ReferenceEntryAccumulator>,
}

impl DownSamplingCalculator {
    pub fn new(decimal_count: usize, enum_count: usize, reference_entry_count: usize) -> Self {
        Self {
            decimals: vec![DecimalAccumulator::default(); decimal_count],
            enums: vec![EnumAccumulator::default(); enum_count],
            reference_entries: vec![ReferenceEntryAccumulator::default(); reference_entry_count],
        }
    }

    /// Creates a calculator for the data series of the chunk
    pub fn for_chunk(chunk: &HistoryChunk) -> Self {
        Self::new(
            chunk.decimal_data_series_count(),
            chunk.enum_data_series_count(),
            chunk.reference_entry_data_series_count(),
        )
    }

    /// Adds a decimal sample. The min and max of the sample equal the value for measured samples.
    pub fn add_decimal(
        &mut self,
        series: DecimalDataSeriesIndex,
        value: Option<f64>,
        min: Option<f64>,
        max: Option<f64>,
    ) {
        let Some(value) = value else {
            return;
        };
        self.decimals[series.0].add(value, min.unwrap_or(value), max.unwrap_or(value));
    }

    pub fn add_enum(&mut self, series: EnumDataSeriesIndex, value: Option<HistoryEnumSet>) {
        let Some(value) = value else {
            return;
        };
        let accumulator = &mut self.enums[series.0];
        accumulator.union = Some(accumulator.union.unwrap_or_default().union(value));
        accumulator.ordinals.add(value);
    }

    /// Adds a reference entry sample. `different_ids_count` is `Some` for down sampled sources.
    pub fn add_reference_entry(
        &mut self,
        series: ReferenceEntryDataSeriesIndex,
        id: Option<ReferenceEntryId>,
        different_ids_count: Option<u32>,
        status: Option<HistoryEnumSet>,
    ) {
        let accumulator = &mut self.reference_entries[series.0];
        if let Some(id) = id {
            accumulator.counter.add(id, different_ids_count);
        }
        if let Some(status) = status {
            accumulator.statuses = Some(accumulator.statuses.unwrap_or_default().union(status));
        }
    }

    /// Adds all values of one row of the chunk
    pub fn add_row(&mut self, chunk: &HistoryChunk, row: TimestampIndex) {
        let values = chunk.values();

        for series in (0..self.decimals.len()).map(DecimalDataSeriesIndex) {
            self.add_decimal(
                series,
                chunk.decimal_value(series, row),
                chunk.decimal_min(series, row),
                chunk.decimal_max(series, row),
            );
        }

        for series in (0..self.enums.len()).map(EnumDataSeriesIndex) {
            self.add_enum(series, chunk.enum_value(series, row));
        }

        let calculated_source = values.reference_entries.different_ids_counts.is_some();
        for series in (0..self.reference_entries.len()).map(ReferenceEntryDataSeriesIndex) {
            let different_ids_count = if calculated_source {
                chunk.reference_entry_different_ids_count(series, row)
            } else {
                None
            };
            self.add_reference_entry(
                series,
                chunk.reference_entry_id(series, row),
                different_ids_count,
                chunk.reference_entry_status(series, row),
            );
        }
    }

    /// The average of the present values, `None` if there are none
    pub fn average(&self, series: DecimalDataSeriesIndex) -> Option<f64> {
        let accumulator = &self.decimals[series.0];
        (accumulator.count > 0).then_some(accumulator.average)
    }

    pub fn min(&self, series: DecimalDataSeriesIndex) -> Option<f64> {
        let accumulator = &self.decimals[series.0];
        (accumulator.count > 0).then_some(accumulator.min)
    }

    pub fn max(&self, series: DecimalDataSeriesIndex) -> Option<f64> {
        let accumulator = &self.decimals[series.0];
        (accumulator.count > 0).then_some(accumulator.max)
    }

    /// Number of present values that went into the average
    pub fn decimal_count(&self, series: DecimalDataSeriesIndex) -> usize {
        self.decimals[series.0].count
    }

    /// The union of all enum sets within the slot
    pub fn enum_union(&self, series: EnumDataSeriesIndex) -> Option<HistoryEnumSet> {
        self.enums[series.0].union
    }

    pub fn enum_most_of_the_time(&self, series: EnumDataSeriesIndex) -> Option<HistoryEnumOrdinal> {
        self.enums[series.0].ordinals.winner()
    }

    pub fn reference_entry_most_of_the_time(
        &self,
        series: ReferenceEntryDataSeriesIndex,
    ) -> Option<ReferenceEntryId> {
        self.reference_entries[series.0]
            .counter
            .winner_most_of_the_time()
    }

    pub fn reference_entry_different_ids_count(
        &self,
        series: ReferenceEntryDataSeriesIndex,
    ) -> Option<u32> {
        self.reference_entries[series.0].counter.different_ids_count()
    }

    /// The union of all statuses within the slot
    pub fn reference_entry_statuses(&self, series: ReferenceEntryDataSeriesIndex) -> Option<HistoryEnumSet> {
        self.reference_entries[series.0].statuses
    }

    /// Clears all accumulated values
    pub fn reset(&mut self) {
        self.decimals.fill(DecimalAccumulator::default());
        for accumulator in &mut self.enums {
            accumulator.union = None;
            accumulator.ordinals.reset();
        }
        for accumulator in &mut self.reference_entries {
            accumulator.counter.reset();
            accumulator.statuses = None;
        }
    }
}
