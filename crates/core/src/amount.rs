use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Keyword sources use for withheld/confidential values.
pub const WITHDRAWN_KEYWORD: &str = "withdrawn";

/// A flow quantity, or the sentinel for a value the source withheld.
///
/// Suppressed amounts survive every arithmetic step unchanged. They are only
/// replaced by explicit estimation (see the equalizer in the allocation crate).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FlowAmount {
    Value(f64),
    Suppressed,
}

impl FlowAmount {
    pub fn value(&self) -> Option<f64> {
        match self {
            Self::Value(v) => Some(*v),
            Self::Suppressed => None,
        }
    }

    pub fn is_suppressed(&self) -> bool {
        matches!(self, Self::Suppressed)
    }

    /// Multiply by a factor. Suppressed stays suppressed.
    pub fn scale(self, factor: f64) -> Self {
        match self {
            Self::Value(v) => Self::Value(v * factor),
            Self::Suppressed => Self::Suppressed,
        }
    }

    /// Divide evenly into `n` parts. `n == 0` leaves the amount untouched.
    pub fn split(self, n: usize) -> Self {
        if n == 0 {
            return self;
        }
        self.scale(1.0 / n as f64)
    }

    /// Sum amounts, skipping suppressed members.
    ///
    /// Returns `Suppressed` only when there is at least one member and every
    /// member is suppressed; an empty iterator sums to zero.
    pub fn sum<I>(amounts: I) -> Self
    where
        I: IntoIterator<Item = FlowAmount>,
    {
        let mut total = 0.0;
        let mut any_value = false;
        let mut any_suppressed = false;
        for a in amounts {
            match a {
                Self::Value(v) => {
                    total += v;
                    any_value = true;
                }
                Self::Suppressed => any_suppressed = true,
            }
        }
        if any_suppressed && !any_value {
            Self::Suppressed
        } else {
            Self::Value(total)
        }
    }
}

impl Default for FlowAmount {
    fn default() -> Self {
        Self::Value(0.0)
    }
}

impl From<f64> for FlowAmount {
    fn from(v: f64) -> Self {
        Self::Value(v)
    }
}

impl fmt::Display for FlowAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(v) => write!(f, "{v}"),
            Self::Suppressed => f.write_str(WITHDRAWN_KEYWORD),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseAmountError(pub String);

impl fmt::Display for ParseAmountError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cannot parse flow amount '{}'", self.0)
    }
}

impl std::error::Error for ParseAmountError {}

impl FromStr for FlowAmount {
    type Err = ParseAmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case(WITHDRAWN_KEYWORD) {
            return Ok(Self::Suppressed);
        }
        trimmed
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .map(Self::Value)
            .ok_or_else(|| ParseAmountError(s.to_string()))
    }
}

impl Serialize for FlowAmount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Value(v) => serializer.serialize_f64(*v),
            Self::Suppressed => serializer.serialize_str(WITHDRAWN_KEYWORD),
        }
    }
}

impl<'de> Deserialize<'de> for FlowAmount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Num(f64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Num(v) => Ok(Self::Value(v)),
            Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}
