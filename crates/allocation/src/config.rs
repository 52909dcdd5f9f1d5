use serde::Deserialize;

use sectorflow_core::Geoscale;

use crate::error::AllocError;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Raw method file as written by users. Compile it with
/// [`crate::plan::AllocationPlan::from_toml`]; nothing here is validated.
#[derive(Debug, Clone, Deserialize)]
pub struct MethodConfig {
    pub name: String,
    /// Depth rank sector-resolved output is pushed down to.
    #[serde(default = "default_target_sector_level")]
    pub target_sector_level: u8,
    #[serde(default)]
    pub activity_sets: Vec<ActivitySetConfig>,
}

fn default_target_sector_level() -> u8 {
    6
}

// ---------------------------------------------------------------------------
// Activity set
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ActivitySetConfig {
    pub name: String,
    /// Activity names whose rows belong to this set.
    pub names: Vec<String>,
    /// Geoscale of the primary rows.
    #[serde(default = "default_geoscale")]
    pub geographic_scale: Geoscale,
    /// Extra columns the primary and secondary tables are joined on.
    #[serde(default)]
    pub allocation_merge_columns: Vec<String>,
    /// Stages applied in order; each one's output feeds the next.
    #[serde(default)]
    pub stages: Vec<StageConfig>,
}

fn default_geoscale() -> Geoscale {
    Geoscale::National
}

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct StageConfig {
    /// Registry name: `multiplication`, `proportional`, ...
    pub method: String,
    #[serde(default)]
    pub allocation_source: Option<String>,
    /// Secondary year; defaults to the partition year.
    #[serde(default)]
    pub year: Option<i32>,
    /// Geoscale the secondary is loaded at.
    #[serde(default = "default_geoscale")]
    pub geographic_scale: Geoscale,
    /// Keep only secondary rows with one of these flow names.
    #[serde(default)]
    pub flow: Vec<String>,
    #[serde(default)]
    pub compartment: Vec<String>,
    /// Secondary sectors (and their descendants) to exclude.
    #[serde(default)]
    pub drop_sectors: Vec<String>,
    /// Primary sectors a disaggregation stage resolves; empty means all.
    #[serde(default)]
    pub include_sectors: Vec<String>,
    /// Estimate suppressed secondary children from their parent's remainder.
    #[serde(default)]
    pub estimate_suppressed: bool,
    /// Registered source-specific function for pluggable methods.
    #[serde(default)]
    pub function: Option<String>,
    /// Stage resolved first; its output becomes this stage's secondary.
    #[serde(default)]
    pub allocation_method: Option<Box<StageConfig>>,
}

// ---------------------------------------------------------------------------
// Parse
// ---------------------------------------------------------------------------

impl MethodConfig {
    pub fn from_toml(input: &str) -> Result<Self, AllocError> {
        toml::from_str(input).map_err(|e| AllocError::ConfigParse(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
