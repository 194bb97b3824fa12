//! Synthetic data for demos and tests
//!
//! Every data series gets its own generator. The [`HistoryChunkGenerator`]
//! calls them for each timestamp and assembles the rows into a [`HistoryChunk`].

use crate::chunk::{HistoryChunk, HistoryChunkBuilder, HistoryEnumOrdinal, HistoryEnumSet, ReferenceEntryId};
use crate::error::{HistoryError, Result};
use crate::range::{Millis, SamplingPeriod};
use crate::schema::HistoryConfiguration;
use crate::time_range::TimeRange;
use rand::Rng;
use std::f64::consts::TAU;
use std::sync::Arc;

/// Creates a decimal value for a timestamp
pub trait DecimalValueGenerator: Send + Sync {
    fn generate(&self, timestamp: Millis) -> f64;
}

impl<F> DecimalValueGenerator for F
where
    F: Fn(Millis) -> f64 + Send + Sync,
{
    fn generate(&self, timestamp: Millis) -> f64 {
        self(timestamp)
    }
}

/// Always returns the same value
pub fn constant(value: f64) -> Box<dyn DecimalValueGenerator> {
    Box::new(move |_: Millis| value)
}

/// Sawtooth from `min` to `max`, restarting every `period` milliseconds
pub fn linear(min: f64, max: f64, period: Millis) -> Box<dyn DecimalValueGenerator> {
    Box::new(move |timestamp: Millis| {
        let progress = timestamp.rem_euclid(period) / period;
        min + (max - min) * progress
    })
}

/// Sine wave between `min` and `max` with the given period in milliseconds
pub fn sine(min: f64, max: f64, period: Millis) -> Box<dyn DecimalValueGenerator> {
    let center = (min + max) / 2.0;
    let amplitude = (max - min) / 2.0;
    Box::new(move |timestamp: Millis| center + amplitude * (TAU * timestamp / period).sin())
}

/// Uniformly distributed values within `[min, max)`
pub fn random(min: f64, max: f64) -> Box<dyn DecimalValueGenerator> {
    Box::new(RandomGenerator { min, max })
}

struct RandomGenerator {
    min: f64,
    max: f64,
}

impl DecimalValueGenerator for RandomGenerator {
    fn generate(&self, _timestamp: Millis) -> f64 {
        if self.max <= self.min {
            return self.min;
        }
        rand::rng().random_range(self.min..self.max)
    }
}

/// Multiplies the values of another generator and adds an offset
pub struct ScaledGenerator {
    inner: Box<dyn DecimalValueGenerator>,
    factor: f64,
    offset: f64,
}

impl ScaledGenerator {
    pub fn new(inner: Box<dyn DecimalValueGenerator>, factor: f64, offset: f64) -> Self {
        Self { inner, factor, offset }
    }
}

impl DecimalValueGenerator for ScaledGenerator {
    fn generate(&self, timestamp: Millis) -> f64 {
        self.inner.generate(timestamp) * self.factor + self.offset
    }
}

/// Creates an enum value for a timestamp
pub trait EnumValueGenerator: Send + Sync {
    fn generate(&self, timestamp: Millis) -> HistoryEnumSet;
}

/// Switches between the ordinals 0 and 1 every `period` milliseconds
pub struct AlternatingEnumGenerator {
    period: Millis,
}

impl AlternatingEnumGenerator {
    pub fn new(period: Millis) -> Self {
        Self { period }
    }
}

impl EnumValueGenerator for AlternatingEnumGenerator {
    fn generate(&self, timestamp: Millis) -> HistoryEnumSet {
        let ordinal = (timestamp / self.period).floor().rem_euclid(2.0) as u16;
        HistoryEnumSet::for_ordinal(HistoryEnumOrdinal(ordinal))
    }
}

/// Creates a reference entry id and its status for a timestamp
pub trait ReferenceEntryGenerator: Send + Sync {
    fn generate(&self, timestamp: Millis) -> (ReferenceEntryId, HistoryEnumSet);
}

/// A new id every `step` milliseconds. The status alternates with the id.
pub struct IncreasingReferenceEntryGenerator {
    step: Millis,
}

impl IncreasingReferenceEntryGenerator {
    pub fn new(step: Millis) -> Self {
        Self { step }
    }
}

impl ReferenceEntryGenerator for IncreasingReferenceEntryGenerator {
    fn generate(&self, timestamp: Millis) -> (ReferenceEntryId, HistoryEnumSet) {
        let id = (timestamp / self.step).floor().rem_euclid(u32::MAX as f64) as u32;
        let status = HistoryEnumSet::for_ordinal(HistoryEnumOrdinal((id % 2) as u16));
        (ReferenceEntryId(id), status)
    }
}

/// One generator per data series, in column order
#[derive(Default)]
pub struct HistoryValueGenerators {
    pub decimal: Vec<Box<dyn DecimalValueGenerator>>,
    pub enums: Vec<Box<dyn EnumValueGenerator>>,
    pub reference_entries: Vec<Box<dyn ReferenceEntryGenerator>>,
}

impl HistoryValueGenerators {
    /// Sine waves with growing periods, alternating enums and increasing reference entries
    pub fn demo(configuration: &HistoryConfiguration, sampling_period: SamplingPeriod) -> Self {
        let base = sampling_period.distance() * 100.0;
        Self {
            decimal: (0..configuration.decimal_data_series_count())
                .map(|index| sine(-10.0 * (index + 1) as f64, 10.0 * (index + 1) as f64, base * (index + 1) as f64))
                .collect(),
            enums: (0..configuration.enum_data_series_count())
                .map(|index| {
                    Box::new(AlternatingEnumGenerator::new(base * (index + 1) as f64))
                        as Box<dyn EnumValueGenerator>
                })
                .collect(),
            reference_entries: (0..configuration.reference_entry_data_series_count())
                .map(|index| {
                    Box::new(IncreasingReferenceEntryGenerator::new(base * (index + 1) as f64 / 4.0))
                        as Box<dyn ReferenceEntryGenerator>
                })
                .collect(),
        }
    }
}

/// Creates chunks with one sample per sampling distance
pub struct HistoryChunkGenerator {
    configuration: Arc<HistoryConfiguration>,
    sampling_period: SamplingPeriod,
    generators: HistoryValueGenerators,
    last_created_timestamp: Option<Millis>,
}

impl HistoryChunkGenerator {
    /// Fails if the number of generators does not match the data series of the configuration
    pub fn new(
        configuration: impl Into<Arc<HistoryConfiguration>>,
        sampling_period: SamplingPeriod,
        generators: HistoryValueGenerators,
    ) -> Result<Self> {
        let configuration = configuration.into();
        check_count("decimal", generators.decimal.len(), configuration.decimal_data_series_count())?;
        check_count("enum", generators.enums.len(), configuration.enum_data_series_count())?;
        check_count(
            "reference entry",
            generators.reference_entries.len(),
            configuration.reference_entry_data_series_count(),
        )?;

        Ok(Self {
            configuration,
            sampling_period,
            generators,
            last_created_timestamp: None,
        })
    }

    pub fn configuration(&self) -> &HistoryConfiguration {
        &self.configuration
    }

    pub fn sampling_period(&self) -> SamplingPeriod {
        self.sampling_period
    }

    /// The timestamp of the last sample created by [`HistoryChunkGenerator::next`]
    pub fn last_created_timestamp(&self) -> Option<Millis> {
        self.last_created_timestamp
    }

    /// Samples from `range.start` (inclusive) to `range.end` (exclusive).
    ///
    /// Returns `None` if the range holds no sample or there are no data series.
    pub fn for_time_range(&self, range: TimeRange) -> Result<Option<HistoryChunk>> {
        let distance = self.sampling_period.distance();
        let count = ((range.end - range.start) / distance).ceil().max(0.0) as usize;
        let timestamps: Vec<Millis> = (0..count)
            .map(|index| range.start + index as f64 * distance)
            .collect();
        self.generate(&timestamps)
    }

    /// Samples after the last created timestamp up to `until` (inclusive).
    ///
    /// The first call creates a single sample at `until`.
    pub fn next(&mut self, until: Millis) -> Result<Option<HistoryChunk>> {
        let timestamps = match self.last_created_timestamp {
            None => vec![until],
            Some(last) => {
                let distance = self.sampling_period.distance();
                let mut timestamps = Vec::new();
                let mut timestamp = last + distance;
                while timestamp <= until {
                    timestamps.push(timestamp);
                    timestamp += distance;
                }
                timestamps
            }
        };

        let chunk = self.generate(&timestamps)?;
        if let Some(chunk) = &chunk {
            self.last_created_timestamp = chunk.last_timestamp();
        }
        Ok(chunk)
    }

    /// One row for each timestamp
    pub fn generate(&self, timestamps: &[Millis]) -> Result<Option<HistoryChunk>> {
        if timestamps.is_empty() || self.configuration.total_data_series_count() == 0 {
            return Ok(None);
        }

        let mut builder = HistoryChunkBuilder::new(Arc::clone(&self.configuration));
        for &timestamp in timestamps {
            let decimal: Vec<Option<f64>> = self
                .generators
                .decimal
                .iter()
                .map(|generator| Some(generator.generate(timestamp)))
                .collect();
            let enums: Vec<Option<HistoryEnumSet>> = self
                .generators
                .enums
                .iter()
                .map(|generator| Some(generator.generate(timestamp)))
                .collect();
            let (ids, statuses): (Vec<_>, Vec<_>) = self
                .generators
                .reference_entries
                .iter()
                .map(|generator| {
                    let (id, status) = generator.generate(timestamp);
                    (Some(id), Some(status))
                })
                .unzip();

            builder.add_values(timestamp, &decimal, &enums, &ids, &statuses);
        }
        builder.build().map(Some)
    }
}

fn check_count(kind: &str, actual: usize, expected: usize) -> Result<()> {
    if actual != expected {
        return Err(HistoryError::InvalidConfig(format!(
            "got {actual} {kind} generators but the configuration has {expected} {kind} data series"
        )));
    }
    Ok(())
}
