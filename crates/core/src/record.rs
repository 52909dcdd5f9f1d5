use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::amount::FlowAmount;

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// Whether a flow amount was reported by the source or estimated by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    #[default]
    Measured,
    Estimated,
}

/// One quantified flow observation.
///
/// `helper_flow` and `flow_amount_ratio` are stage-scoped intermediates; they
/// are cleared by [`FlowRecord::clear_intermediates`] once a stage finalizes
/// its output amounts.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FlowRecord {
    pub location: String,
    pub activity_produced_by: Option<String>,
    pub activity_consumed_by: Option<String>,
    pub sector_produced_by: Option<String>,
    pub sector_consumed_by: Option<String>,
    pub sector_source_name: String,
    pub flow_name: String,
    pub compartment: Option<String>,
    pub flow_amount: FlowAmount,
    pub unit: String,
    pub year: i32,
    pub data_reliability: Option<f64>,
    pub data_collection: Option<f64>,
    #[serde(default)]
    pub disaggregate_flag: bool,
    #[serde(default)]
    pub provenance: Provenance,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub helper_flow: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_amount_ratio: Option<f64>,
    /// Additional named dimensions (e.g. allocation merge columns).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

impl FlowRecord {
    pub fn sector(&self, col: SectorColumn) -> Option<&str> {
        match col {
            SectorColumn::ProducedBy => self.sector_produced_by.as_deref(),
            SectorColumn::ConsumedBy => self.sector_consumed_by.as_deref(),
        }
        .filter(|s| !s.is_empty())
    }

    pub fn set_sector(&mut self, col: SectorColumn, code: Option<String>) {
        match col {
            SectorColumn::ProducedBy => self.sector_produced_by = code,
            SectorColumn::ConsumedBy => self.sector_consumed_by = code,
        }
    }

    /// Copy of this record with the sector in `col` replaced.
    pub fn with_sector(&self, col: SectorColumn, code: &str) -> Self {
        let mut rec = self.clone();
        rec.set_sector(col, Some(code.to_string()));
        rec
    }

    pub fn activity(&self, col: SectorColumn) -> Option<&str> {
        match col {
            SectorColumn::ProducedBy => self.activity_produced_by.as_deref(),
            SectorColumn::ConsumedBy => self.activity_consumed_by.as_deref(),
        }
    }

    /// True when either activity field names `name`.
    pub fn has_activity(&self, name: &str) -> bool {
        self.activity_produced_by.as_deref() == Some(name)
            || self.activity_consumed_by.as_deref() == Some(name)
    }

    pub fn clear_intermediates(&mut self) {
        self.helper_flow = None;
        self.flow_amount_ratio = None;
    }

    /// Value of a grouping dimension, `None` when the record has no value.
    pub fn field(&self, field: &GroupField) -> Option<&str> {
        match field {
            GroupField::Location => Some(self.location.as_str()),
            GroupField::FlowName => Some(self.flow_name.as_str()),
            GroupField::Unit => Some(self.unit.as_str()),
            GroupField::Compartment => self.compartment.as_deref(),
            GroupField::ActivityProducedBy => self.activity_produced_by.as_deref(),
            GroupField::ActivityConsumedBy => self.activity_consumed_by.as_deref(),
            GroupField::SectorProducedBy => self.sector_produced_by.as_deref(),
            GroupField::SectorConsumedBy => self.sector_consumed_by.as_deref(),
            GroupField::SectorSourceName => Some(self.sector_source_name.as_str()),
            GroupField::Year => None,
            GroupField::DisaggregateFlag => None,
            GroupField::Extra(name) => self.extra.get(name).map(String::as_str),
        }
    }

    /// Grouping key over `fields`. Year and the flag are rendered as text.
    pub fn key(&self, fields: &[GroupField]) -> GroupKey {
        GroupKey(
            fields
                .iter()
                .map(|f| match f {
                    GroupField::Year => Some(self.year.to_string()),
                    GroupField::DisaggregateFlag => Some(self.disaggregate_flag.to_string()),
                    other => self.field(other).map(str::to_string),
                })
                .collect(),
        )
    }
}

// ---------------------------------------------------------------------------
// Sector column
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SectorColumn {
    ProducedBy,
    ConsumedBy,
}

impl SectorColumn {
    /// The sector column that carries values for this table.
    ///
    /// `SectorProducedBy` unless every row leaves it empty.
    pub fn primary(records: &[FlowRecord]) -> Self {
        if records.iter().all(|r| r.sector(Self::ProducedBy).is_none()) {
            Self::ConsumedBy
        } else {
            Self::ProducedBy
        }
    }

    pub fn other(&self) -> Self {
        match self {
            Self::ProducedBy => Self::ConsumedBy,
            Self::ConsumedBy => Self::ProducedBy,
        }
    }

    pub fn field(&self) -> GroupField {
        match self {
            Self::ProducedBy => GroupField::SectorProducedBy,
            Self::ConsumedBy => GroupField::SectorConsumedBy,
        }
    }
}

// ---------------------------------------------------------------------------
// Grouping
// ---------------------------------------------------------------------------

/// A column a group-by or join can key on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupField {
    Location,
    FlowName,
    Unit,
    Year,
    Compartment,
    ActivityProducedBy,
    ActivityConsumedBy,
    SectorProducedBy,
    SectorConsumedBy,
    SectorSourceName,
    DisaggregateFlag,
    Extra(String),
}

impl GroupField {
    /// Every non-sector, non-amount descriptive field.
    pub fn descriptive() -> Vec<GroupField> {
        vec![
            Self::Location,
            Self::FlowName,
            Self::Unit,
            Self::Year,
            Self::Compartment,
            Self::ActivityProducedBy,
            Self::ActivityConsumedBy,
            Self::SectorSourceName,
        ]
    }

    /// Parse a configuration column name (`"Location"`, `"FlowName"`, ...).
    ///
    /// Unknown names address `FlowRecord::extra`.
    pub fn from_column_name(name: &str) -> Self {
        match name {
            "Location" => Self::Location,
            "FlowName" => Self::FlowName,
            "Unit" => Self::Unit,
            "Year" => Self::Year,
            "Compartment" => Self::Compartment,
            "ActivityProducedBy" => Self::ActivityProducedBy,
            "ActivityConsumedBy" => Self::ActivityConsumedBy,
            "SectorProducedBy" => Self::SectorProducedBy,
            "SectorConsumedBy" => Self::SectorConsumedBy,
            "SectorSourceName" => Self::SectorSourceName,
            "disaggregate_flag" => Self::DisaggregateFlag,
            other => Self::Extra(other.to_string()),
        }
    }
}

/// Values of a record under a set of [`GroupField`]s.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupKey(pub Vec<Option<String>>);

impl std::fmt::Display for GroupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<&str> = self.0.iter().map(|v| v.as_deref().unwrap_or("-")).collect();
        write!(f, "{}", parts.join("/"))
    }
}
