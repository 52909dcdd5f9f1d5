use serde::Serialize;

use sectorflow_core::FlowRecord;

use crate::error::AllocError;
use crate::summary::{Diagnostics, RunSummary};

// ---------------------------------------------------------------------------
// Input
// ---------------------------------------------------------------------------

/// One independent unit of work: a source's records for one activity set
/// and year. Partitions share no mutable state.
#[derive(Debug, Clone)]
pub struct Partition {
    pub source: String,
    pub activity_set: String,
    pub year: i32,
    /// Activity-tagged records with candidate sectors attached.
    pub records: Vec<FlowRecord>,
}

impl Partition {
    pub fn label(&self) -> String {
        format!("{}/{}/{}", self.source, self.activity_set, self.year)
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PartitionOutput {
    pub records: Vec<FlowRecord>,
    pub diagnostics: Diagnostics,
}

#[derive(Debug)]
pub struct PartitionOutcome {
    pub source: String,
    pub activity_set: String,
    pub year: i32,
    pub rows_in: usize,
    pub result: Result<PartitionOutput, AllocError>,
}

impl PartitionOutcome {
    pub fn label(&self) -> String {
        format!("{}/{}/{}", self.source, self.activity_set, self.year)
    }
}

#[derive(Debug)]
pub struct RunResult {
    pub meta: RunMeta,
    pub summary: RunSummary,
    pub outcomes: Vec<PartitionOutcome>,
}

impl RunResult {
    /// Records of every successful partition, in partition order.
    pub fn records(&self) -> impl Iterator<Item = &FlowRecord> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().ok())
            .flat_map(|o| o.records.iter())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunMeta {
    pub method_name: String,
    pub engine_version: String,
    pub run_at: String,
}
