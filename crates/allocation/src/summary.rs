use std::collections::BTreeMap;

use serde::Serialize;

use crate::model::PartitionOutcome;

// ---------------------------------------------------------------------------
// Diagnostics
// ---------------------------------------------------------------------------

/// A recoverable data-quality event. Processing continues past every one of
/// these; they are surfaced in the run summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Diagnostic {
    /// No secondary weight for any candidate sector of an activity; the flow
    /// was split evenly.
    MissingWeightData { location: String, activity: String, children: usize },
    /// A finer-grained match had no value and the national value was used.
    NationalFallback { location: String, sector: String },
    /// Rows dropped by a cross-geoscale join.
    DataLossOnMerge {
        rows_before: usize,
        rows_after: usize,
        keys: Vec<String>,
    },
    /// Parent amounts pushed down to unobserved children by equal split.
    EqualAllocation { rank: u8, rows: usize },
    /// Suppressed children estimated from the parent remainder.
    SuppressedEstimated { location: String, parent: String, children: usize },
    /// Sibling ratios at one depth do not sum to one.
    RatioOutOfTolerance { group: String, rank: u8, sum: f64 },
    /// Suppressed amounts carried through a stage untouched.
    SuppressedPassThrough { rows: usize },
}

impl Diagnostic {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MissingWeightData { .. } => "missing_weight_data",
            Self::NationalFallback { .. } => "national_fallback",
            Self::DataLossOnMerge { .. } => "data_loss_on_merge",
            Self::EqualAllocation { .. } => "equal_allocation",
            Self::SuppressedEstimated { .. } => "suppressed_estimated",
            Self::RatioOutOfTolerance { .. } => "ratio_out_of_tolerance",
            Self::SuppressedPassThrough { .. } => "suppressed_pass_through",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Diagnostics {
    pub entries: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn push(&mut self, d: Diagnostic) {
        self.entries.push(d);
    }

    pub fn extend(&mut self, other: Diagnostics) {
        self.entries.extend(other.entries);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.entries.iter()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.entries.iter().filter(|d| d.kind() == kind).count()
    }

    pub fn counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for d in &self.entries {
            *counts.entry(d.kind().to_string()).or_insert(0) += 1;
        }
        counts
    }
}

// ---------------------------------------------------------------------------
// Run summary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct PartitionFailure {
    pub partition: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DegradedPartition {
    pub partition: String,
    pub counts: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub partitions: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub rows_in: usize,
    pub rows_out: usize,
    pub failures: Vec<PartitionFailure>,
    pub degraded: Vec<DegradedPartition>,
    pub diagnostic_counts: BTreeMap<String, usize>,
}

impl RunSummary {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Compute summary statistics from per-partition outcomes.
pub fn compute_summary(outcomes: &[PartitionOutcome]) -> RunSummary {
    let mut summary = RunSummary {
        partitions: outcomes.len(),
        succeeded: 0,
        failed: 0,
        rows_in: 0,
        rows_out: 0,
        failures: Vec::new(),
        degraded: Vec::new(),
        diagnostic_counts: BTreeMap::new(),
    };

    for outcome in outcomes {
        summary.rows_in += outcome.rows_in;
        match &outcome.result {
            Ok(output) => {
                summary.succeeded += 1;
                summary.rows_out += output.records.len();
                if !output.diagnostics.is_empty() {
                    let counts = output.diagnostics.counts();
                    for (kind, n) in &counts {
                        *summary.diagnostic_counts.entry(kind.clone()).or_insert(0) += n;
                    }
                    summary.degraded.push(DegradedPartition {
                        partition: outcome.label(),
                        counts,
                    });
                }
            }
            Err(e) => {
                summary.failed += 1;
                summary.failures.push(PartitionFailure {
                    partition: outcome.label(),
                    error: e.to_string(),
                });
            }
        }
    }

    summary
}
