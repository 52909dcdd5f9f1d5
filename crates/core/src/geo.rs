use serde::{Deserialize, Serialize};

/// FIPS code for the United States as a whole.
pub const US_FIPS: &str = "00000";

/// Spatial resolution of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Geoscale {
    National,
    State,
    County,
}

impl Geoscale {
    /// Classify a location code.
    ///
    /// `"00000"` and non-numeric (ISO country) codes are national, a 5-digit
    /// FIPS ending in `000` is a state, anything else is a county. Bare
    /// 2-digit state codes count as states.
    pub fn of_location(location: &str) -> Self {
        if location == US_FIPS || !location.chars().all(|c| c.is_ascii_digit()) {
            return Self::National;
        }
        if location.len() <= 2 || location.ends_with("000") {
            Self::State
        } else {
            Self::County
        }
    }

    /// True when `self` is strictly finer-grained than `other`.
    pub fn is_finer_than(&self, other: Geoscale) -> bool {
        *self > other
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::National => "national",
            Self::State => "state",
            Self::County => "county",
        }
    }
}

impl std::fmt::Display for Geoscale {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Geoscale {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "national" => Ok(Self::National),
            "state" => Ok(Self::State),
            "county" => Ok(Self::County),
            other => Err(format!("unknown geoscale '{other}'")),
        }
    }
}

/// Two-digit state prefix of a FIPS code.
pub fn state_prefix(location: &str) -> &str {
    location.get(..2).unwrap_or(location)
}

/// Re-express `location` at a coarser geoscale.
///
/// Returns the input unchanged when `to` is not coarser than the location.
pub fn rollup_location(location: &str, to: Geoscale) -> String {
    let from = Geoscale::of_location(location);
    if !from.is_finer_than(to) {
        return location.to_string();
    }
    match to {
        Geoscale::National => US_FIPS.to_string(),
        Geoscale::State => format!("{}000", state_prefix(location)),
        Geoscale::County => location.to_string(),
    }
}
