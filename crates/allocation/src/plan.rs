//! Compiled allocation plan.
//!
//! [`AllocationPlan::from_toml`] parses a method file, resolves every method
//! and function name, and validates the stage tree. A plan that compiles
//! never fails on a name lookup at run time.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde::Serialize;

use sectorflow_core::sector::TOP_RANK;
use sectorflow_core::{FlowRecord, Geoscale, GroupField};

use crate::config::{ActivitySetConfig, MethodConfig, StageConfig};
use crate::error::{AllocError, Result};
use crate::merge::{SecondaryKind, SecondaryTable};

/// Nested stages deeper than this are rejected.
pub const MAX_STAGE_DEPTH: usize = 8;

// ---------------------------------------------------------------------------
// Method registry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationMethod {
    Multiplication,
    Proportional,
    ProportionalFlagged,
    WeightedAvg,
    Disaggregation,
    Scaled,
    Direct,
}

impl AllocationMethod {
    pub const ALL: [AllocationMethod; 7] = [
        Self::Multiplication,
        Self::Proportional,
        Self::ProportionalFlagged,
        Self::WeightedAvg,
        Self::Disaggregation,
        Self::Scaled,
        Self::Direct,
    ];

    /// Resolve a configured method name. `-` and `_` are interchangeable.
    pub fn from_name(name: &str) -> Option<Self> {
        let normalized = name.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL.into_iter().find(|m| m.as_str() == normalized)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Multiplication => "multiplication",
            Self::Proportional => "proportional",
            Self::ProportionalFlagged => "proportional_flagged",
            Self::WeightedAvg => "weighted_avg",
            Self::Disaggregation => "disaggregation",
            Self::Scaled => "scaled",
            Self::Direct => "direct",
        }
    }

    /// Every method but `direct` reads a secondary table.
    pub fn needs_source(&self) -> bool {
        !matches!(self, Self::Direct)
    }

    /// Methods whose arithmetic lives in a registered function.
    pub fn needs_function(&self) -> bool {
        matches!(self, Self::WeightedAvg | Self::Scaled)
    }

    /// How this method reads its secondary table's FlowAmount.
    pub fn secondary_kind(&self) -> SecondaryKind {
        match self {
            Self::Multiplication => SecondaryKind::Rates,
            _ => SecondaryKind::Weights,
        }
    }
}

impl fmt::Display for AllocationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Pluggable functions
// ---------------------------------------------------------------------------

/// Source-specific allocation step, for methods the generic engine cannot
/// express (`weighted_avg`, `scaled`, custom `disaggregation`).
pub trait AllocationFunction: Send + Sync {
    fn allocate(
        &self,
        primary: &[FlowRecord],
        secondary: &SecondaryTable,
        stage: &Stage,
    ) -> Result<Vec<FlowRecord>>;
}

impl<F> AllocationFunction for F
where
    F: Fn(&[FlowRecord], &SecondaryTable, &Stage) -> Result<Vec<FlowRecord>> + Send + Sync,
{
    fn allocate(
        &self,
        primary: &[FlowRecord],
        secondary: &SecondaryTable,
        stage: &Stage,
    ) -> Result<Vec<FlowRecord>> {
        self(primary, secondary, stage)
    }
}

/// Named [`AllocationFunction`]s available to method files.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: FxHashMap<String, Arc<dyn AllocationFunction>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, function: F) -> &mut Self
    where
        F: AllocationFunction + 'static,
    {
        self.functions.insert(name.into(), Arc::new(function));
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn AllocationFunction>> {
        self.functions.get(name).cloned()
    }

    pub fn names(&self) -> BTreeSet<&str> {
        self.functions.keys().map(String::as_str).collect()
    }
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("functions", &self.names())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Compiled tree
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Stage {
    pub method: AllocationMethod,
    pub source: Option<String>,
    pub year: Option<i32>,
    pub geoscale: Geoscale,
    pub flows: Vec<String>,
    pub compartments: Vec<String>,
    pub drop_sectors: Vec<String>,
    pub include_sectors: Vec<String>,
    pub estimate_suppressed: bool,
    pub function_name: Option<String>,
    pub function: Option<Arc<dyn AllocationFunction>>,
    /// Resolved before this stage; its output is this stage's secondary.
    pub nested: Option<Box<Stage>>,
}

impl Stage {
    /// Number of stages in this chain, counting `self`.
    pub fn depth(&self) -> usize {
        1 + self.nested.as_ref().map_or(0, |n| n.depth())
    }

    pub fn label(&self) -> String {
        match &self.source {
            Some(source) => format!("{} ({source} at {} level)", self.method, self.geoscale),
            None => self.method.to_string(),
        }
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("method", &self.method)
            .field("source", &self.source)
            .field("year", &self.year)
            .field("geoscale", &self.geoscale)
            .field("function", &self.function_name)
            .field("nested", &self.nested)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct ActivitySet {
    pub name: String,
    pub names: Vec<String>,
    pub geoscale: Geoscale,
    pub merge_fields: Vec<GroupField>,
    pub stages: Vec<Stage>,
}

impl ActivitySet {
    /// Records whose produced-by or consumed-by activity is in this set.
    /// A record naming the set in both fields is taken once.
    pub fn select(&self, records: &[FlowRecord]) -> Vec<FlowRecord> {
        records
            .iter()
            .filter(|r| self.names.iter().any(|n| r.has_activity(n)))
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct AllocationPlan {
    pub name: String,
    pub target_rank: u8,
    pub activity_sets: Vec<ActivitySet>,
}

// ---------------------------------------------------------------------------
// Compile + Validate
// ---------------------------------------------------------------------------

impl AllocationPlan {
    pub fn from_toml(input: &str, registry: &FunctionRegistry) -> Result<Self> {
        let config = MethodConfig::from_toml(input)?;
        Self::compile(&config, registry)
    }

    pub fn compile(config: &MethodConfig, registry: &FunctionRegistry) -> Result<Self> {
        if config.name.trim().is_empty() {
            return Err(AllocError::ConfigValidation("method name is empty".into()));
        }
        if config.target_sector_level < TOP_RANK {
            return Err(AllocError::ConfigValidation(format!(
                "target_sector_level must be at least {TOP_RANK}, got {}",
                config.target_sector_level
            )));
        }

        // Unknown method names are reported before anything else.
        for set in &config.activity_sets {
            for stage in &set.stages {
                check_method_names(&set.name, stage)?;
            }
        }

        let mut seen = BTreeSet::new();
        let mut activity_sets = Vec::with_capacity(config.activity_sets.len());
        for set in &config.activity_sets {
            if !seen.insert(set.name.as_str()) {
                return Err(AllocError::ConfigValidation(format!(
                    "duplicate activity set '{}'",
                    set.name
                )));
            }
            activity_sets.push(compile_activity_set(set, registry)?);
        }

        Ok(Self {
            name: config.name.clone(),
            target_rank: config.target_sector_level,
            activity_sets,
        })
    }

    pub fn activity_set(&self, name: &str) -> Option<&ActivitySet> {
        self.activity_sets.iter().find(|s| s.name == name)
    }
}

fn check_method_names(set: &str, stage: &StageConfig) -> Result<()> {
    if AllocationMethod::from_name(&stage.method).is_none() {
        return Err(AllocError::AmbiguousAllocationMethod {
            activity_set: set.to_string(),
            method: stage.method.clone(),
        });
    }
    match &stage.allocation_method {
        Some(inner) => check_method_names(set, inner),
        None => Ok(()),
    }
}

fn compile_activity_set(set: &ActivitySetConfig, registry: &FunctionRegistry) -> Result<ActivitySet> {
    if set.name.trim().is_empty() {
        return Err(AllocError::ConfigValidation("activity set with empty name".into()));
    }
    if set.names.is_empty() {
        return Err(AllocError::ConfigValidation(format!(
            "activity set '{}' lists no activities",
            set.name
        )));
    }
    if set.stages.is_empty() {
        return Err(AllocError::ConfigValidation(format!(
            "activity set '{}' has no stages",
            set.name
        )));
    }

    let stages = set
        .stages
        .iter()
        .map(|s| compile_stage(&set.name, s, registry, 1))
        .collect::<Result<Vec<_>>>()?;

    Ok(ActivitySet {
        name: set.name.clone(),
        names: set.names.clone(),
        geoscale: set.geographic_scale,
        merge_fields: set
            .allocation_merge_columns
            .iter()
            .map(|c| GroupField::from_column_name(c))
            .collect(),
        stages,
    })
}

fn compile_stage(
    set: &str,
    config: &StageConfig,
    registry: &FunctionRegistry,
    depth: usize,
) -> Result<Stage> {
    if depth > MAX_STAGE_DEPTH {
        return Err(AllocError::ConfigValidation(format!(
            "activity set '{set}': stages nested deeper than {MAX_STAGE_DEPTH}"
        )));
    }
    let method = AllocationMethod::from_name(&config.method).ok_or_else(|| {
        AllocError::AmbiguousAllocationMethod {
            activity_set: set.to_string(),
            method: config.method.clone(),
        }
    })?;

    if method.needs_source() && config.allocation_source.is_none() {
        return Err(AllocError::ConfigValidation(format!(
            "activity set '{set}': {method} stage needs an allocation_source"
        )));
    }
    if !method.needs_source() && config.allocation_method.is_some() {
        return Err(AllocError::ConfigValidation(format!(
            "activity set '{set}': {method} stage reads no secondary and cannot nest a stage"
        )));
    }
    if method.needs_function() && config.function.is_none() {
        return Err(AllocError::ConfigValidation(format!(
            "activity set '{set}': {method} stage needs a function"
        )));
    }

    let function = match &config.function {
        Some(name) => Some(registry.get(name).ok_or_else(|| AllocError::UnknownFunction {
            activity_set: set.to_string(),
            name: name.clone(),
        })?),
        None => None,
    };

    let nested = match &config.allocation_method {
        Some(inner) => Some(Box::new(compile_stage(set, inner, registry, depth + 1)?)),
        None => None,
    };

    Ok(Stage {
        method,
        source: config.allocation_source.clone(),
        year: config.year,
        geoscale: config.geographic_scale,
        flows: config.flow.clone(),
        compartments: config.compartment.clone(),
        drop_sectors: config.drop_sectors.clone(),
        include_sectors: config.include_sectors.clone(),
        estimate_suppressed: config.estimate_suppressed,
        function_name: config.function.clone(),
        function,
        nested,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
