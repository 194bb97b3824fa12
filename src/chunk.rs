//! Columnar sample data
//!
//! A [`HistoryChunk`] holds the samples of any number of timestamps. Values are
//! stored row-major per value kind: the value of data series `ds` at timestamp
//! index `ts` lives at `ts * data_series_count + ds`.
//!
//! A missing sample is `None` and is serialized as JSON `null`.

use crate::error::{HistoryError, Result};
use crate::range::Millis;
use crate::schema::{DataSeriesId, HistoryConfiguration};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

/// Column of a decimal data series within a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DecimalDataSeriesIndex(pub usize);

/// Column of an enum data series within a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EnumDataSeriesIndex(pub usize);

/// Column of a reference entry data series within a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReferenceEntryDataSeriesIndex(pub usize);

/// Row of a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimestampIndex(pub usize);

/// Ordinal of an enum option
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HistoryEnumOrdinal(pub u16);

/// Bit set of enum ordinals.
///
/// Down sampled enum values contain every ordinal that has been active within the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HistoryEnumSet(pub u32);

impl HistoryEnumSet {
    /// Highest ordinal that fits into the set
    pub const MAX_ORDINAL: u16 = 31;

    /// The set containing only `ordinal`. An ordinal above [`Self::MAX_ORDINAL`] gives the empty set.
    pub fn for_ordinal(ordinal: HistoryEnumOrdinal) -> Self {
        match 1u32.checked_shl(u32::from(ordinal.0)) {
            Some(bit) => Self(bit),
            None => {
                warn!("Enum ordinal {} does not fit into a set, dropped", ordinal.0);
                Self::default()
            }
        }
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, ordinal: HistoryEnumOrdinal) -> bool {
        ordinal.0 <= Self::MAX_ORDINAL && self.0 & (1 << ordinal.0) != 0
    }

    pub fn union(self, other: HistoryEnumSet) -> Self {
        Self(self.0 | other.0)
    }

    /// The lowest ordinal in the set
    pub fn first(self) -> Option<HistoryEnumOrdinal> {
        if self.is_empty() {
            return None;
        }
        Some(HistoryEnumOrdinal(self.0.trailing_zeros() as u16))
    }

    pub fn ordinals(self) -> impl Iterator<Item = HistoryEnumOrdinal> {
        (0..=Self::MAX_ORDINAL)
            .map(HistoryEnumOrdinal)
            .filter(move |ordinal| self.contains(*ordinal))
    }
}

/// Id of an entry referenced by a reference entry data series
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReferenceEntryId(pub u32);

/// How the values of a chunk have been created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum RecordingType {
    /// Recorded samples
    #[default]
    Measured,
    /// Down sampled from finer buckets. Carries min/max and most-of-the-time columns.
    Calculated,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DecimalValues {
    pub values: Vec<Option<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<Vec<Option<f64>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<Vec<Option<f64>>>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnumValues {
    pub values: Vec<Option<HistoryEnumSet>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub most_of_the_time: Option<Vec<Option<HistoryEnumOrdinal>>>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceEntryValues {
    pub ids: Vec<Option<ReferenceEntryId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub different_ids_counts: Option<Vec<Option<u32>>>,
    pub statuses: Vec<Option<HistoryEnumSet>>,
}

/// All value columns of a chunk
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryValues {
    pub decimal: DecimalValues,
    pub enums: EnumValues,
    pub reference_entries: ReferenceEntryValues,
}

impl HistoryValues {
    /// Empty columns, with the optional columns that are present in either `self` or `other`
    fn empty_like(&self, other: &HistoryValues) -> Self {
        fn column<T>(a: &Option<Vec<T>>, b: &Option<Vec<T>>) -> Option<Vec<T>> {
            (a.is_some() || b.is_some()).then(Vec::new)
        }

        HistoryValues {
            decimal: DecimalValues {
                values: Vec::new(),
                min: column(&self.decimal.min, &other.decimal.min),
                max: column(&self.decimal.max, &other.decimal.max),
            },
            enums: EnumValues {
                values: Vec::new(),
                most_of_the_time: column(
                    &self.enums.most_of_the_time,
                    &other.enums.most_of_the_time,
                ),
            },
            reference_entries: ReferenceEntryValues {
                ids: Vec::new(),
                different_ids_counts: column(
                    &self.reference_entries.different_ids_counts,
                    &other.reference_entries.different_ids_counts,
                ),
                statuses: Vec::new(),
            },
        }
    }

    /// Appends one row of `source`. Optional columns missing in `source` are derived from the values.
    fn push_row(&mut self, source: &HistoryValues, row: usize, counts: SeriesCounts) {
        let decimal = row * counts.decimal..(row + 1) * counts.decimal;
        let source_decimal = &source.decimal;
        self.decimal
            .values
            .extend_from_slice(&source_decimal.values[decimal.clone()]);
        if let Some(min) = self.decimal.min.as_mut() {
            let from = source_decimal.min.as_ref().unwrap_or(&source_decimal.values);
            min.extend_from_slice(&from[decimal.clone()]);
        }
        if let Some(max) = self.decimal.max.as_mut() {
            let from = source_decimal.max.as_ref().unwrap_or(&source_decimal.values);
            max.extend_from_slice(&from[decimal]);
        }

        let enums = row * counts.enums..(row + 1) * counts.enums;
        self.enums
            .values
            .extend_from_slice(&source.enums.values[enums.clone()]);
        if let Some(most_of_the_time) = self.enums.most_of_the_time.as_mut() {
            match &source.enums.most_of_the_time {
                Some(from) => most_of_the_time.extend_from_slice(&from[enums]),
                None => most_of_the_time.extend(
                    source.enums.values[enums]
                        .iter()
                        .map(|value| value.and_then(HistoryEnumSet::first)),
                ),
            }
        }

        let references = row * counts.reference_entries..(row + 1) * counts.reference_entries;
        let source_references = &source.reference_entries;
        self.reference_entries
            .ids
            .extend_from_slice(&source_references.ids[references.clone()]);
        self.reference_entries
            .statuses
            .extend_from_slice(&source_references.statuses[references.clone()]);
        if let Some(counts) = self.reference_entries.different_ids_counts.as_mut() {
            match &source_references.different_ids_counts {
                Some(from) => counts.extend_from_slice(&from[references]),
                None => counts.extend(
                    source_references.ids[references]
                        .iter()
                        .map(|id| id.map(|_| 1)),
                ),
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct SeriesCounts {
    decimal: usize,
    enums: usize,
    reference_entries: usize,
}

impl SeriesCounts {
    fn of(configuration: &HistoryConfiguration) -> Self {
        Self {
            decimal: configuration.decimal_data_series_count(),
            enums: configuration.enum_data_series_count(),
            reference_entries: configuration.reference_entry_data_series_count(),
        }
    }
}

/// Result of [`HistoryChunk::best_timestamp_index_for`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BestTimestampIndex {
    /// The timestamp exists in the chunk
    Found(TimestampIndex),
    /// The timestamp does not exist, contains the index it would be inserted at
    NotFound(usize),
}

/// Immutable sample data for any number of timestamps
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryChunk {
    configuration: Arc<HistoryConfiguration>,
    timestamps: Vec<Millis>,
    values: HistoryValues,
    recording_type: RecordingType,
}

impl HistoryChunk {
    /// Creates a chunk and checks its invariants.
    ///
    /// Timestamps must be finite and strictly increasing; every column must hold
    /// `timestamps × data series count` cells. Decimal values must be finite, a
    /// missing value is `None`.
    pub fn new(
        configuration: impl Into<Arc<HistoryConfiguration>>,
        timestamps: Vec<Millis>,
        values: HistoryValues,
        recording_type: RecordingType,
    ) -> Result<Self> {
        let configuration = configuration.into();

        if let Some(timestamp) = timestamps.iter().find(|timestamp| !timestamp.is_finite()) {
            return Err(HistoryError::InvalidChunk(format!(
                "timestamp {timestamp} is not finite"
            )));
        }
        if let Some(pair) = timestamps.windows(2).find(|pair| pair[0] >= pair[1]) {
            return Err(HistoryError::InvalidChunk(format!(
                "timestamps not strictly increasing: {} >= {}",
                pair[0], pair[1]
            )));
        }

        check_finite("decimal values", &values.decimal.values)?;
        for (column, cells) in [("decimal min", &values.decimal.min), ("decimal max", &values.decimal.max)] {
            if let Some(cells) = cells {
                check_finite(column, cells)?;
            }
        }

        let rows = timestamps.len();
        let counts = SeriesCounts::of(&configuration);
        check_len("decimal values", values.decimal.values.len(), rows * counts.decimal)?;
        check_optional_len("decimal min", &values.decimal.min, rows * counts.decimal)?;
        check_optional_len("decimal max", &values.decimal.max, rows * counts.decimal)?;
        check_len("enum values", values.enums.values.len(), rows * counts.enums)?;
        check_optional_len(
            "enum most of the time",
            &values.enums.most_of_the_time,
            rows * counts.enums,
        )?;
        let references = rows * counts.reference_entries;
        check_len("reference entry ids", values.reference_entries.ids.len(), references)?;
        check_len(
            "reference entry statuses",
            values.reference_entries.statuses.len(),
            references,
        )?;
        check_optional_len(
            "reference entry different ids counts",
            &values.reference_entries.different_ids_counts,
            references,
        )?;

        Ok(Self {
            configuration,
            timestamps,
            values,
            recording_type,
        })
    }

    /// A chunk without any timestamps
    pub fn empty(configuration: impl Into<Arc<HistoryConfiguration>>) -> Self {
        Self {
            configuration: configuration.into(),
            timestamps: Vec::new(),
            values: HistoryValues::default(),
            recording_type: RecordingType::Measured,
        }
    }

    pub fn configuration(&self) -> &HistoryConfiguration {
        &self.configuration
    }

    pub fn shared_configuration(&self) -> Arc<HistoryConfiguration> {
        Arc::clone(&self.configuration)
    }

    pub fn timestamps(&self) -> &[Millis] {
        &self.timestamps
    }

    pub fn values(&self) -> &HistoryValues {
        &self.values
    }

    pub fn recording_type(&self) -> RecordingType {
        self.recording_type
    }

    pub fn timestamps_count(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn first_timestamp(&self) -> Option<Millis> {
        self.timestamps.first().copied()
    }

    pub fn last_timestamp(&self) -> Option<Millis> {
        self.timestamps.last().copied()
    }

    pub fn timestamp(&self, index: TimestampIndex) -> Millis {
        self.timestamps[index.0]
    }

    pub fn decimal_data_series_count(&self) -> usize {
        self.configuration.decimal_data_series_count()
    }

    pub fn enum_data_series_count(&self) -> usize {
        self.configuration.enum_data_series_count()
    }

    pub fn reference_entry_data_series_count(&self) -> usize {
        self.configuration.reference_entry_data_series_count()
    }

    pub fn decimal_index_of(&self, id: DataSeriesId) -> Option<DecimalDataSeriesIndex> {
        self.configuration
            .decimal_index_of(id)
            .map(DecimalDataSeriesIndex)
    }

    pub fn enum_index_of(&self, id: DataSeriesId) -> Option<EnumDataSeriesIndex> {
        self.configuration.enum_index_of(id).map(EnumDataSeriesIndex)
    }

    pub fn reference_entry_index_of(&self, id: DataSeriesId) -> Option<ReferenceEntryDataSeriesIndex> {
        self.configuration
            .reference_entry_index_of(id)
            .map(ReferenceEntryDataSeriesIndex)
    }

    fn decimal_cell(&self, series: DecimalDataSeriesIndex, row: TimestampIndex) -> usize {
        row.0 * self.decimal_data_series_count() + series.0
    }

    fn enum_cell(&self, series: EnumDataSeriesIndex, row: TimestampIndex) -> usize {
        row.0 * self.enum_data_series_count() + series.0
    }

    fn reference_entry_cell(&self, series: ReferenceEntryDataSeriesIndex, row: TimestampIndex) -> usize {
        row.0 * self.reference_entry_data_series_count() + series.0
    }

    /// The decimal value, `None` if there is no value
    pub fn decimal_value(&self, series: DecimalDataSeriesIndex, row: TimestampIndex) -> Option<f64> {
        self.values.decimal.values[self.decimal_cell(series, row)]
    }

    /// The minimum within the sample slot. Falls back to the value for measured chunks.
    pub fn decimal_min(&self, series: DecimalDataSeriesIndex, row: TimestampIndex) -> Option<f64> {
        let cell = self.decimal_cell(series, row);
        self.values
            .decimal
            .min
            .as_ref()
            .unwrap_or(&self.values.decimal.values)[cell]
    }

    /// The maximum within the sample slot. Falls back to the value for measured chunks.
    pub fn decimal_max(&self, series: DecimalDataSeriesIndex, row: TimestampIndex) -> Option<f64> {
        let cell = self.decimal_cell(series, row);
        self.values
            .decimal
            .max
            .as_ref()
            .unwrap_or(&self.values.decimal.values)[cell]
    }

    /// All values of one decimal data series, one per timestamp
    pub fn decimal_values_of(&self, series: DecimalDataSeriesIndex) -> Vec<Option<f64>> {
        (0..self.timestamps_count())
            .map(|row| self.decimal_value(series, TimestampIndex(row)))
            .collect()
    }

    pub fn enum_value(&self, series: EnumDataSeriesIndex, row: TimestampIndex) -> Option<HistoryEnumSet> {
        self.values.enums.values[self.enum_cell(series, row)]
    }

    /// The ordinal that has been active for the longest time within the slot
    pub fn enum_most_of_the_time(
        &self,
        series: EnumDataSeriesIndex,
        row: TimestampIndex,
    ) -> Option<HistoryEnumOrdinal> {
        let cell = self.enum_cell(series, row);
        match &self.values.enums.most_of_the_time {
            Some(most_of_the_time) => most_of_the_time[cell],
            None => self.values.enums.values[cell].and_then(HistoryEnumSet::first),
        }
    }

    pub fn reference_entry_id(
        &self,
        series: ReferenceEntryDataSeriesIndex,
        row: TimestampIndex,
    ) -> Option<ReferenceEntryId> {
        self.values.reference_entries.ids[self.reference_entry_cell(series, row)]
    }

    pub fn reference_entry_status(
        &self,
        series: ReferenceEntryDataSeriesIndex,
        row: TimestampIndex,
    ) -> Option<HistoryEnumSet> {
        self.values.reference_entries.statuses[self.reference_entry_cell(series, row)]
    }

    /// How many different ids have been seen within the slot.
    ///
    /// Measured chunks count one for every present id.
    pub fn reference_entry_different_ids_count(
        &self,
        series: ReferenceEntryDataSeriesIndex,
        row: TimestampIndex,
    ) -> Option<u32> {
        let cell = self.reference_entry_cell(series, row);
        match &self.values.reference_entries.different_ids_counts {
            Some(counts) => counts[cell],
            None => self.values.reference_entries.ids[cell].map(|_| 1),
        }
    }

    /// Binary search for the timestamp
    pub fn best_timestamp_index_for(&self, timestamp: Millis) -> BestTimestampIndex {
        match self
            .timestamps
            .binary_search_by(|candidate| candidate.total_cmp(&timestamp))
        {
            Ok(index) => BestTimestampIndex::Found(TimestampIndex(index)),
            Err(insertion) => BestTimestampIndex::NotFound(insertion),
        }
    }

    /// Returns the rows with timestamps within `[start, end)`
    pub fn range(&self, start: Millis, end: Millis) -> HistoryChunk {
        let first = self.timestamps.partition_point(|timestamp| *timestamp < start);
        let last = self.timestamps.partition_point(|timestamp| *timestamp < end);
        self.select_rows(first..last.max(first))
    }

    fn select_rows(&self, rows: std::ops::Range<usize>) -> HistoryChunk {
        let counts = SeriesCounts::of(&self.configuration);
        let mut values = self.values.empty_like(&self.values);
        for row in rows.clone() {
            values.push_row(&self.values, row, counts);
        }

        HistoryChunk {
            configuration: Arc::clone(&self.configuration),
            timestamps: self.timestamps[rows].to_vec(),
            values,
            recording_type: self.recording_type,
        }
    }

    /// Merges the samples of both chunks, rows of `other` replace rows with identical timestamps
    pub fn merge(&self, other: &HistoryChunk) -> Result<HistoryChunk> {
        if self.configuration != other.configuration {
            return Err(HistoryError::InvalidChunk(
                "cannot merge chunks with different configurations".to_string(),
            ));
        }
        if self.is_empty() {
            return Ok(other.clone());
        }
        if other.is_empty() {
            return Ok(self.clone());
        }

        let counts = SeriesCounts::of(&self.configuration);
        let mut timestamps = Vec::with_capacity(self.timestamps_count() + other.timestamps_count());
        let mut values = self.values.empty_like(&other.values);

        let (mut mine, mut theirs) = (0, 0);
        while mine < self.timestamps.len() || theirs < other.timestamps.len() {
            let next_mine = self.timestamps.get(mine).copied();
            let next_theirs = other.timestamps.get(theirs).copied();

            match (next_mine, next_theirs) {
                (Some(a), Some(b)) if a < b => {
                    timestamps.push(a);
                    values.push_row(&self.values, mine, counts);
                    mine += 1;
                }
                (Some(a), Some(b)) if a == b => {
                    timestamps.push(b);
                    values.push_row(&other.values, theirs, counts);
                    mine += 1;
                    theirs += 1;
                }
                (_, Some(b)) => {
                    timestamps.push(b);
                    values.push_row(&other.values, theirs, counts);
                    theirs += 1;
                }
                (Some(a), None) => {
                    timestamps.push(a);
                    values.push_row(&self.values, mine, counts);
                    mine += 1;
                }
                (None, None) => break,
            }
        }

        let recording_type = if self.recording_type == RecordingType::Calculated
            || other.recording_type == RecordingType::Calculated
        {
            RecordingType::Calculated
        } else {
            RecordingType::Measured
        };

        HistoryChunk::new(Arc::clone(&self.configuration), timestamps, values, recording_type)
    }
}

fn check_len(column: &str, actual: usize, expected: usize) -> Result<()> {
    if actual != expected {
        return Err(HistoryError::InvalidChunk(format!(
            "{column}: expected {expected} cells but got {actual}"
        )));
    }
    Ok(())
}

/// JSON has no representation for NaN and infinity
fn check_finite(column: &str, cells: &[Option<f64>]) -> Result<()> {
    match cells.iter().flatten().find(|value| !value.is_finite()) {
        Some(value) => Err(HistoryError::InvalidChunk(format!(
            "{column} contain the non-finite value {value}"
        ))),
        None => Ok(()),
    }
}

fn check_optional_len<T>(column: &str, values: &Option<Vec<T>>, expected: usize) -> Result<()> {
    match values {
        Some(values) => check_len(column, values.len(), expected),
        None => Ok(()),
    }
}

/// Appends measured rows and creates a [`HistoryChunk`]
#[derive(Debug)]
pub struct HistoryChunkBuilder {
    configuration: Arc<HistoryConfiguration>,
    timestamps: Vec<Millis>,
    values: HistoryValues,
    invalid_row: Option<String>,
}

impl HistoryChunkBuilder {
    pub fn new(configuration: impl Into<Arc<HistoryConfiguration>>) -> Self {
        Self {
            configuration: configuration.into(),
            timestamps: Vec::new(),
            values: HistoryValues::default(),
            invalid_row: None,
        }
    }

    fn check_row(&mut self, timestamp: Millis, column: &str, actual: usize, expected: usize) {
        if actual != expected && self.invalid_row.is_none() {
            self.invalid_row = Some(format!(
                "row at {timestamp}: expected {expected} {column} but got {actual}"
            ));
        }
    }

    /// Adds a row of decimal values. NaN and infinity are stored as no value, all other kinds get no value.
    pub fn add_decimal_values(&mut self, timestamp: Millis, values: &[f64]) -> &mut Self {
        let decimal: Vec<Option<f64>> = values
            .iter()
            .map(|value| value.is_finite().then_some(*value))
            .collect();
        let enums = vec![None; self.configuration.enum_data_series_count()];
        let references = self.configuration.reference_entry_data_series_count();
        self.add_values(
            timestamp,
            &decimal,
            &enums,
            &vec![None; references],
            &vec![None; references],
        )
    }

    /// Adds a complete row. Non-finite decimal values are stored as no value.
    pub fn add_values(
        &mut self,
        timestamp: Millis,
        decimal: &[Option<f64>],
        enums: &[Option<HistoryEnumSet>],
        reference_entry_ids: &[Option<ReferenceEntryId>],
        reference_entry_statuses: &[Option<HistoryEnumSet>],
    ) -> &mut Self {
        let counts = SeriesCounts::of(&self.configuration);
        self.check_row(timestamp, "decimal values", decimal.len(), counts.decimal);
        self.check_row(timestamp, "enum values", enums.len(), counts.enums);
        self.check_row(
            timestamp,
            "reference entry ids",
            reference_entry_ids.len(),
            counts.reference_entries,
        );
        self.check_row(
            timestamp,
            "reference entry statuses",
            reference_entry_statuses.len(),
            counts.reference_entries,
        );

        self.timestamps.push(timestamp);
        self.values.decimal.values.extend(
            decimal
                .iter()
                .map(|value| value.filter(|value| value.is_finite())),
        );
        self.values.enums.values.extend_from_slice(enums);
        self.values
            .reference_entries
            .ids
            .extend_from_slice(reference_entry_ids);
        self.values
            .reference_entries
            .statuses
            .extend_from_slice(reference_entry_statuses);
        self
    }

    pub fn timestamps_count(&self) -> usize {
        self.timestamps.len()
    }

    pub fn build(self) -> Result<HistoryChunk> {
        if let Some(message) = self.invalid_row {
            return Err(HistoryError::InvalidChunk(message));
        }
        HistoryChunk::new(
            self.configuration,
            self.timestamps,
            self.values,
            RecordingType::Measured,
        )
    }
}
