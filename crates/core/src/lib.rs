//! `sectorflow-core`: Flow records, geoscales and the sector hierarchy.
//!
//! Plain data types shared by the allocation engine and the IO adapters.

pub mod amount;
pub mod geo;
pub mod record;
pub mod sector;

pub use amount::{FlowAmount, WITHDRAWN_KEYWORD};
pub use geo::{Geoscale, US_FIPS};
pub use record::{FlowRecord, GroupField, GroupKey, Provenance, SectorColumn};
pub use sector::SectorLengthCrosswalk;
