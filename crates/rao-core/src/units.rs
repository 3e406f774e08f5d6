//! Physical units and branch sides.
//!
//! Flow values are stored internally in megawatts. Thresholds may be
//! declared in amperes, so every flow constraint carries a nominal voltage
//! used to convert between the two:
//!
//! ```text
//!   I [A] = P [MW] * 1000 / (sqrt(3) * V [kV])
//! ```
//!
//! # Usage
//!
//! ```
//! use rao_core::units::{convert_flow, Unit};
//!
//! let amps = convert_flow(100.0, Unit::Megawatt, Unit::Ampere, 400.0).unwrap();
//! assert!((amps - 144.3375).abs() < 1e-3);
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{RaoError, RaoResult};

/// Unit in which a threshold, a margin or a cost is expressed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Unit {
    #[default]
    Megawatt,
    Ampere,
    Degree,
    Kilovolt,
    /// Percentage of the branch's maximum admissible flow
    PercentImax,
    /// Dimensionless tap position
    Tap,
}

impl Unit {
    /// Whether a flow value can be expressed in this unit.
    pub fn is_flow_unit(self) -> bool {
        matches!(self, Unit::Megawatt | Unit::Ampere)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Unit::Megawatt => "MW",
            Unit::Ampere => "A",
            Unit::Degree => "°",
            Unit::Kilovolt => "kV",
            Unit::PercentImax => "%Imax",
            Unit::Tap => "tap",
        }
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Unit {
    type Err = RaoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mw" | "megawatt" => Ok(Unit::Megawatt),
            "a" | "ampere" => Ok(Unit::Ampere),
            "deg" | "degree" => Ok(Unit::Degree),
            "kv" | "kilovolt" => Ok(Unit::Kilovolt),
            "%imax" | "percent_imax" => Ok(Unit::PercentImax),
            "tap" => Ok(Unit::Tap),
            _ => Err(RaoError::Parse(format!("Unknown unit: {s}"))),
        }
    }
}

/// Monitored side of a branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    One,
    Two,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::One => write!(f, "side 1"),
            Side::Two => write!(f, "side 2"),
        }
    }
}

#[inline]
fn amperes_per_megawatt(nominal_voltage_kv: f64) -> f64 {
    1000.0 / (3f64.sqrt() * nominal_voltage_kv)
}

/// Convert a flow between megawatts and amperes.
///
/// Converting a unit to itself is the identity. Any other pair (or a
/// non-positive nominal voltage when one is needed) is a validation error.
pub fn convert_flow(value: f64, from: Unit, to: Unit, nominal_voltage_kv: f64) -> RaoResult<f64> {
    if from == to {
        return Ok(value);
    }
    if nominal_voltage_kv.is_nan() || nominal_voltage_kv <= 0.0 {
        return Err(RaoError::Validation(format!(
            "cannot convert {from} to {to} with nominal voltage {nominal_voltage_kv} kV"
        )));
    }
    match (from, to) {
        (Unit::Megawatt, Unit::Ampere) => Ok(value * amperes_per_megawatt(nominal_voltage_kv)),
        (Unit::Ampere, Unit::Megawatt) => Ok(value / amperes_per_megawatt(nominal_voltage_kv)),
        _ => Err(RaoError::Validation(format!("cannot convert a flow from {from} to {to}"))),
    }
}
