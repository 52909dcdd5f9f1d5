use std::sync::Arc;

use rustc_hash::FxHashSet;

use sectorflow_core::{SectorLengthCrosswalk, US_FIPS};

/// Tolerance for "ratios sum to one" checks.
pub const DEFAULT_RATIO_TOLERANCE: f64 = 1e-6;

/// Immutable reference data handed to every engine component.
#[derive(Debug, Clone)]
pub struct EngineContext {
    pub crosswalk: Arc<SectorLengthCrosswalk>,
    /// Codes from another classification used in place of NAICS; these are
    /// self-weighted when merged against a secondary table.
    pub alternate_codes: FxHashSet<String>,
    pub national_location: String,
    pub ratio_tolerance: f64,
}

impl EngineContext {
    pub fn new(crosswalk: SectorLengthCrosswalk) -> Self {
        Self {
            crosswalk: Arc::new(crosswalk),
            alternate_codes: FxHashSet::default(),
            national_location: US_FIPS.to_string(),
            ratio_tolerance: DEFAULT_RATIO_TOLERANCE,
        }
    }

    pub fn with_alternate_codes<I, S>(mut self, codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.alternate_codes = codes.into_iter().map(Into::into).collect();
        self
    }

    pub fn is_alternate_code(&self, code: &str) -> bool {
        self.alternate_codes.contains(code)
    }

    pub fn is_national(&self, location: &str) -> bool {
        location == self.national_location
    }
}
