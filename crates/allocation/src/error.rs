use thiserror::Error;

use sectorflow_core::Geoscale;

/// Fatal errors. Recoverable data-quality events are recorded as
/// [`crate::summary::Diagnostic`]s instead.
#[derive(Debug, Error)]
pub enum AllocError {
    /// TOML parse / deserialization error.
    #[error("config parse error: {0}")]
    ConfigParse(String),

    /// Config validation error (empty activity set, misplaced method, etc.).
    #[error("config validation error: {0}")]
    ConfigValidation(String),

    /// A stage names a method that is not in the registry.
    #[error("activity set '{activity_set}': unknown allocation method '{method}'")]
    AmbiguousAllocationMethod { activity_set: String, method: String },

    /// A stage names a source-specific function nobody registered.
    #[error("activity set '{activity_set}': no allocation function registered as '{name}'")]
    UnknownFunction { activity_set: String, name: String },

    /// Primary and secondary quantities are not comparable.
    #[error("unit mismatch in {method} stage: primary {primary:?}, secondary {secondary:?}")]
    UnitMismatch {
        method: String,
        primary: Vec<String>,
        secondary: Vec<String>,
    },

    /// A required column is absent from an input table.
    #[error("missing column '{column}' in {table}")]
    MissingColumn { table: String, column: String },

    /// The secondary source could not be loaded.
    #[error("cannot load {source_name} {year} at {geoscale} level: {message}")]
    SourceLoad {
        source_name: String,
        year: i32,
        geoscale: Geoscale,
        message: String,
    },

    /// A pluggable allocation function reported a failure.
    #[error("allocation function '{name}' failed: {message}")]
    FunctionFailed { name: String, message: String },

    /// A worker thread died before reporting its partition.
    #[error("partition '{0}' panicked")]
    PartitionPanicked(String),
}

pub type Result<T> = std::result::Result<T, AllocError>;
