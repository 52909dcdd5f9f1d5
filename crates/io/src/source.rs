use std::path::{Path, PathBuf};

use sectorflow_allocation::{AllocError, SecondarySource};
use sectorflow_core::{FlowRecord, Geoscale};

use crate::error::LoadError;
use crate::flows::read_flow_records_path;

/// Secondary tables stored as `<root>/<source>_<year>.csv`.
#[derive(Debug, Clone)]
pub struct CsvSourceDir {
    root: PathBuf,
}

impl CsvSourceDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, source: &str, year: i32) -> PathBuf {
        self.root.join(format!("{source}_{year}.csv"))
    }
}

impl SecondarySource for CsvSourceDir {
    fn load(&self, source: &str, year: i32) -> Result<Vec<FlowRecord>, AllocError> {
        let path = self.path_for(source, year);
        read_flow_records_path(&path).map_err(|e| match e {
            LoadError::MissingColumn(column) => AllocError::MissingColumn {
                table: path.display().to_string(),
                column,
            },
            // The cache fills in the requested geoscale.
            other => AllocError::SourceLoad {
                source_name: source.to_string(),
                year,
                geoscale: Geoscale::National,
                message: format!("{}: {other}", path.display()),
            },
        })
    }
}
