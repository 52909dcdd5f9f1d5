use thiserror::Error;

/// Errors reading or writing tables.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// A column every row needs is absent from the header.
    #[error("missing column '{0}'")]
    MissingColumn(String),

    /// A cell could not be parsed. `line` is 1-based and counts the header.
    #[error("line {line}, column '{column}': {message}")]
    Parse {
        line: u64,
        column: String,
        message: String,
    },

    /// Header row unusable (e.g. crosswalk columns without a rank suffix).
    #[error("bad header: {0}")]
    Header(String),
}

pub type Result<T> = std::result::Result<T, LoadError>;
