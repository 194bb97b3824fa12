//! Data series configuration of a history
//!
//! The configuration is stored within every bucket. Readers use it to find the
//! column of a data series by its id.

use crate::error::{HistoryError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Identifies a data series within one value kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataSeriesId(pub i32);

impl fmt::Display for DataSeriesId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unit of a decimal data series (e.g. "°C")
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HistoryUnit(pub String);

impl HistoryUnit {
    pub fn none() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEnumOption {
    pub ordinal: u16,
    pub key: String,
}

/// The possible values of an enum data series
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEnum {
    pub name: String,
    pub options: Vec<HistoryEnumOption>,
}

impl HistoryEnum {
    pub fn new(name: impl Into<String>, keys: &[&str]) -> Self {
        Self {
            name: name.into(),
            options: keys
                .iter()
                .enumerate()
                .map(|(ordinal, key)| HistoryEnumOption {
                    ordinal: ordinal as u16,
                    key: key.to_string(),
                })
                .collect(),
        }
    }

    /// false = 0, true = 1
    pub fn boolean() -> Self {
        Self::new("Boolean", &["false", "true"])
    }

    pub fn active() -> Self {
        Self::new("Active", &["Inactive", "Active"])
    }

    pub fn key_of(&self, ordinal: u16) -> Option<&str> {
        self.options
            .iter()
            .find(|option| option.ordinal == ordinal)
            .map(|option| option.key.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecimalDataSeries {
    pub id: DataSeriesId,
    pub name: String,
    #[serde(default)]
    pub unit: HistoryUnit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnumDataSeries {
    pub id: DataSeriesId,
    pub name: String,
    pub history_enum: HistoryEnum,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceEntryDataSeries {
    pub id: DataSeriesId,
    pub name: String,
    /// Describes the status stored next to each reference entry id
    #[serde(default)]
    pub status_enum: Option<HistoryEnum>,
}

/// Describes all data series of a history, grouped by value kind.
///
/// Ids are unique within one kind. The order of the series defines the column index.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryConfiguration {
    decimal: Vec<DecimalDataSeries>,
    enums: Vec<EnumDataSeries>,
    reference_entries: Vec<ReferenceEntryDataSeries>,
}

impl HistoryConfiguration {
    pub fn builder() -> HistoryConfigurationBuilder {
        HistoryConfigurationBuilder::default()
    }

    /// A configuration without any data series
    pub fn empty() -> Self {
        Self::default()
    }

    /// Decimal data series only, without units
    pub fn only_decimals(ids: &[i32], names: &[&str]) -> Result<Self> {
        if ids.len() != names.len() {
            return Err(HistoryError::InvalidChunk(format!(
                "got {} ids but {} names",
                ids.len(),
                names.len()
            )));
        }

        let mut builder = Self::builder();
        for (id, name) in ids.iter().zip(names) {
            builder = builder.decimal_data_series(DataSeriesId(*id), *name, HistoryUnit::none());
        }
        builder.build()
    }

    /// Creates a configuration with generated names.
    ///
    /// Decimal ids start at 10, enum ids at 100 and reference entry ids at 1000.
    pub fn default_with_counts(
        decimal_count: usize,
        enum_count: usize,
        reference_entry_count: usize,
    ) -> Self {
        let decimal = (0..decimal_count)
            .map(|index| DecimalDataSeries {
                id: DataSeriesId(10 + index as i32),
                name: format!("Decimal {index}"),
                unit: HistoryUnit("m".to_string()),
            })
            .collect();
        let enums = (0..enum_count)
            .map(|index| EnumDataSeries {
                id: DataSeriesId(100 + index as i32),
                name: format!("Enum {index}"),
                history_enum: HistoryEnum::active(),
            })
            .collect();
        let reference_entries = (0..reference_entry_count)
            .map(|index| ReferenceEntryDataSeries {
                id: DataSeriesId(1000 + index as i32),
                name: format!("Reference {index}"),
                status_enum: Some(HistoryEnum::active()),
            })
            .collect();

        Self {
            decimal,
            enums,
            reference_entries,
        }
    }

    pub fn decimal_data_series_count(&self) -> usize {
        self.decimal.len()
    }

    pub fn enum_data_series_count(&self) -> usize {
        self.enums.len()
    }

    pub fn reference_entry_data_series_count(&self) -> usize {
        self.reference_entries.len()
    }

    pub fn total_data_series_count(&self) -> usize {
        self.decimal.len() + self.enums.len() + self.reference_entries.len()
    }

    pub fn decimal_data_series(&self) -> &[DecimalDataSeries] {
        &self.decimal
    }

    pub fn enum_data_series(&self) -> &[EnumDataSeries] {
        &self.enums
    }

    pub fn reference_entry_data_series(&self) -> &[ReferenceEntryDataSeries] {
        &self.reference_entries
    }

    pub fn decimal_index_of(&self, id: DataSeriesId) -> Option<usize> {
        self.decimal.iter().position(|series| series.id == id)
    }

    pub fn enum_index_of(&self, id: DataSeriesId) -> Option<usize> {
        self.enums.iter().position(|series| series.id == id)
    }

    pub fn reference_entry_index_of(&self, id: DataSeriesId) -> Option<usize> {
        self.reference_entries
            .iter()
            .position(|series| series.id == id)
    }

    /// Checks that the ids are unique within each kind
    pub fn validate(&self) -> Result<()> {
        check_unique("decimal", self.decimal.iter().map(|series| series.id))?;
        check_unique("enum", self.enums.iter().map(|series| series.id))?;
        check_unique(
            "reference entry",
            self.reference_entries.iter().map(|series| series.id),
        )
    }
}

fn check_unique(kind: &str, ids: impl Iterator<Item = DataSeriesId>) -> Result<()> {
    let mut seen = HashSet::new();
    for id in ids {
        if !seen.insert(id) {
            return Err(HistoryError::InvalidChunk(format!(
                "duplicate {kind} data series id {id}"
            )));
        }
    }
    Ok(())
}

#[derive(Debug, Default)]
pub struct HistoryConfigurationBuilder {
    configuration: HistoryConfiguration,
}

impl HistoryConfigurationBuilder {
    pub fn decimal_data_series(
        mut self,
        id: DataSeriesId,
        name: impl Into<String>,
        unit: HistoryUnit,
    ) -> Self {
        self.configuration.decimal.push(DecimalDataSeries {
            id,
            name: name.into(),
            unit,
        });
        self
    }

    pub fn enum_data_series(
        mut self,
        id: DataSeriesId,
        name: impl Into<String>,
        history_enum: HistoryEnum,
    ) -> Self {
        self.configuration.enums.push(EnumDataSeries {
            id,
            name: name.into(),
            history_enum,
        });
        self
    }

    pub fn reference_entry_data_series(
        mut self,
        id: DataSeriesId,
        name: impl Into<String>,
        status_enum: Option<HistoryEnum>,
    ) -> Self {
        self.configuration
            .reference_entries
            .push(ReferenceEntryDataSeries {
                id,
                name: name.into(),
                status_enum,
            });
        self
    }

    pub fn build(self) -> Result<HistoryConfiguration> {
        self.configuration.validate()?;
        Ok(self.configuration)
    }
}
