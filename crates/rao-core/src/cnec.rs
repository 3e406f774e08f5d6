//! Monitored flow constraints.
//!
//! A [`FlowCnec`] belongs to exactly one operating state. It is *optimized*
//! when its margin drives the functional cost, and *monitored* (MNEC) when
//! it may only degrade within a tolerance. A cnec can be both.
//!
//! Thresholds are declared per side in MW or A and are reduced by the
//! reliability margin (always given in MW):
//!
//! ```text
//!   lower + rm  <=  flow  <=  upper - rm
//!   margin = min(upper - rm - flow, flow - lower - rm)
//! ```

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::{RaoError, RaoResult};
use crate::units::{convert_flow, Side, Unit};
use crate::{ContingencyId, CnecId, StateId};

/// A flow threshold on one side of a branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchThreshold {
    pub side: Side,
    pub unit: Unit,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

/// Loop-flow limit carried by cross-border cnecs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LoopFlowThreshold {
    pub value: f64,
    pub unit: Unit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowCnec {
    pub id: CnecId,
    pub network_element: String,
    pub state: StateId,
    pub contingency: Option<ContingencyId>,
    pub operator: Option<String>,
    pub optimized: bool,
    pub monitored: bool,
    /// Reliability margin, MW
    pub reliability_margin: f64,
    pub nominal_voltage_kv: f64,
    pub thresholds: Vec<BranchThreshold>,
    pub loop_flow_threshold: Option<LoopFlowThreshold>,
}

impl FlowCnec {
    pub fn new(id: impl Into<CnecId>, state: StateId) -> Self {
        let id = id.into();
        Self {
            network_element: id.as_str().to_string(),
            id,
            state,
            contingency: None,
            operator: None,
            optimized: false,
            monitored: false,
            reliability_margin: 0.0,
            nominal_voltage_kv: 400.0,
            thresholds: Vec::new(),
            loop_flow_threshold: None,
        }
    }

    pub fn with_network_element(mut self, element: impl Into<String>) -> Self {
        self.network_element = element.into();
        self
    }

    pub fn with_contingency(mut self, contingency: impl Into<ContingencyId>) -> Self {
        self.contingency = Some(contingency.into());
        self
    }

    pub fn with_operator(mut self, operator: impl Into<String>) -> Self {
        self.operator = Some(operator.into());
        self
    }

    pub fn optimized(mut self) -> Self {
        self.optimized = true;
        self
    }

    pub fn monitored(mut self) -> Self {
        self.monitored = true;
        self
    }

    pub fn with_reliability_margin(mut self, rm_mw: f64) -> Self {
        self.reliability_margin = rm_mw;
        self
    }

    pub fn with_nominal_voltage(mut self, kv: f64) -> Self {
        self.nominal_voltage_kv = kv;
        self
    }

    pub fn with_threshold(mut self, side: Side, unit: Unit, min: Option<f64>, max: Option<f64>) -> Self {
        self.thresholds.push(BranchThreshold { side, unit, min, max });
        self
    }

    pub fn with_loop_flow_threshold(mut self, value: f64, unit: Unit) -> Self {
        self.loop_flow_threshold = Some(LoopFlowThreshold { value, unit });
        self
    }

    /// Checks that every threshold can be expressed in both MW and A.
    pub fn validate(&self) -> RaoResult<()> {
        if self.thresholds.is_empty() {
            return Err(RaoError::Validation(format!("cnec '{}' has no threshold", self.id)));
        }
        for threshold in &self.thresholds {
            if !threshold.unit.is_flow_unit() {
                return Err(RaoError::Validation(format!(
                    "cnec '{}' has a threshold in {}, only MW and A are supported",
                    self.id, threshold.unit
                )));
            }
            if let (Some(min), Some(max)) = (threshold.min, threshold.max) {
                if min > max {
                    return Err(RaoError::Validation(format!(
                        "cnec '{}' has min threshold {min} above max threshold {max} on {}",
                        self.id, threshold.side
                    )));
                }
            }
        }
        if let Some(lf) = &self.loop_flow_threshold {
            if !lf.unit.is_flow_unit() {
                return Err(RaoError::Validation(format!(
                    "cnec '{}' has a loop-flow threshold in {}",
                    self.id, lf.unit
                )));
            }
        }
        convert_flow(1.0, Unit::Megawatt, Unit::Ampere, self.nominal_voltage_kv)
            .map(|_| ())
            .map_err(|e| RaoError::Validation(format!("cnec '{}': {e}", self.id)))
    }

    /// Converts a flow value for this cnec; NaN when the conversion is impossible.
    pub fn convert(&self, value: f64, from: Unit, to: Unit) -> f64 {
        convert_flow(value, from, to, self.nominal_voltage_kv).unwrap_or(f64::NAN)
    }

    /// Sides carrying at least one threshold, in order.
    pub fn sides(&self) -> Vec<Side> {
        self.thresholds
            .iter()
            .map(|t| t.side)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Tightest upper bound on `side`, reliability margin deducted.
    pub fn upper_bound(&self, side: Side, unit: Unit) -> Option<f64> {
        let rm = self.convert(self.reliability_margin, Unit::Megawatt, unit);
        self.thresholds
            .iter()
            .filter(|t| t.side == side)
            .filter_map(|t| t.max.map(|max| self.convert(max, t.unit, unit)))
            .reduce(f64::min)
            .map(|bound| bound - rm)
    }

    /// Tightest lower bound on `side`, reliability margin deducted.
    pub fn lower_bound(&self, side: Side, unit: Unit) -> Option<f64> {
        let rm = self.convert(self.reliability_margin, Unit::Megawatt, unit);
        self.thresholds
            .iter()
            .filter(|t| t.side == side)
            .filter_map(|t| t.min.map(|min| self.convert(min, t.unit, unit)))
            .reduce(f64::max)
            .map(|bound| bound + rm)
    }

    /// Margin for a flow already expressed in `unit`.
    ///
    /// `+inf` when the side is unbounded in both directions.
    pub fn margin_for_flow(&self, flow: f64, side: Side, unit: Unit) -> f64 {
        let upper = self
            .upper_bound(side, unit)
            .map_or(f64::INFINITY, |upper| upper - flow);
        let lower = self
            .lower_bound(side, unit)
            .map_or(f64::INFINITY, |lower| flow - lower);
        if flow.is_nan() {
            return f64::NAN;
        }
        upper.min(lower)
    }

    /// Largest absolute bound over all sides.
    pub fn largest_threshold(&self, unit: Unit) -> f64 {
        self.sides()
            .into_iter()
            .flat_map(|side| [self.upper_bound(side, unit), self.lower_bound(side, unit)])
            .flatten()
            .map(f64::abs)
            .fold(0.0, f64::max)
    }

    /// Loop-flow threshold expressed in `unit`.
    pub fn loop_flow_threshold(&self, unit: Unit) -> Option<f64> {
        self.loop_flow_threshold
            .map(|lf| self.convert(lf.value, lf.unit, unit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cnec() -> FlowCnec {
        FlowCnec::new("cnec", StateId::new("preventive"))
            .with_threshold(Side::One, Unit::Megawatt, Some(-500.0), Some(1000.0))
            .with_threshold(Side::One, Unit::Megawatt, None, Some(800.0))
            .with_threshold(Side::Two, Unit::Ampere, Some(-1500.0), Some(1500.0))
            .with_reliability_margin(10.0)
            .with_nominal_voltage(400.0)
    }

    #[test]
    fn test_tightest_bounds_minus_reliability_margin() {
        let cnec = cnec();
        assert_eq!(cnec.upper_bound(Side::One, Unit::Megawatt), Some(790.0));
        assert_eq!(cnec.lower_bound(Side::One, Unit::Megawatt), Some(-490.0));
    }

    #[test]
    fn test_margin_takes_closest_bound() {
        let cnec = cnec();
        assert!((cnec.margin_for_flow(700.0, Side::One, Unit::Megawatt) - 90.0).abs() < 1e-9);
        assert!((cnec.margin_for_flow(-450.0, Side::One, Unit::Megawatt) - 40.0).abs() < 1e-9);
        assert!(cnec.margin_for_flow(f64::NAN, Side::One, Unit::Megawatt).is_nan());
    }

    #[test]
    fn test_ampere_threshold_converted_to_megawatt() {
        let cnec = cnec();
        let upper = cnec.upper_bound(Side::Two, Unit::Megawatt).unwrap();
        // 1500 A at 400 kV is ~1039.23 MW, minus 10 MW reliability margin
        assert!((upper - 1029.23).abs() < 1e-2);
        assert_eq!(cnec.sides(), vec![Side::One, Side::Two]);
    }

    #[test]
    fn test_unbounded_side_has_infinite_margin() {
        let cnec = FlowCnec::new("c", StateId::new("s")).with_threshold(Side::One, Unit::Megawatt, None, Some(10.0));
        assert_eq!(cnec.margin_for_flow(5.0, Side::Two, Unit::Megawatt), f64::INFINITY);
    }

    #[test]
    fn test_validate_rejects_inverted_threshold() {
        let cnec = FlowCnec::new("bad", StateId::new("s")).with_threshold(Side::One, Unit::Megawatt, Some(10.0), Some(-10.0));
        let err = cnec.validate().unwrap_err();
        assert!(err.to_string().contains("bad"));
    }
}
