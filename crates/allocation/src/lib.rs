//! `sectorflow-allocation`: Sector allocation and disaggregation engine.
//!
//! Pure engine crate: receives activity-tagged flow records with candidate
//! sectors attached, returns sector-resolved records. Secondary weighting
//! data arrives through [`SecondarySource`]; no file IO happens here.

pub mod aggregate;
pub mod config;
pub mod context;
pub mod equalize;
pub mod error;
pub mod merge;
pub mod methods;
pub mod model;
pub mod pipeline;
pub mod plan;
pub mod ratio;
pub mod source;
pub mod summary;

pub use context::EngineContext;
pub use error::AllocError;
pub use model::{Partition, PartitionOutcome, PartitionOutput, RunResult};
pub use pipeline::{run, run_partition};
pub use plan::{AllocationFunction, AllocationMethod, AllocationPlan, FunctionRegistry, Stage};
pub use source::{InMemorySource, SecondarySource, SourceCache};
pub use summary::{Diagnostic, Diagnostics, RunSummary};
