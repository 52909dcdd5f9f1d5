//! CSV adapters for the allocation engine.
//!
//! Flow tables and sector length crosswalks are read from and written to
//! CSV. [`CsvSourceDir`] serves secondary weighting tables from a directory.

pub mod crosswalk;
pub mod error;
pub mod flows;
pub mod source;

pub use crosswalk::{read_sector_length_crosswalk, read_sector_length_crosswalk_path};
pub use error::{LoadError, Result};
pub use flows::{read_flow_records, read_flow_records_path, write_flow_records, write_flow_records_path};
pub use source::CsvSourceDir;
