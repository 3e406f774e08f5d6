//! Margin of a flow constraint for a given flow result.
//!
//! [`BasicMarginEvaluator`] and [`RelativeMarginEvaluator`] compute the
//! physical margin. The two decorators return `+inf` for cnecs that should
//! not drive the optimization, and delegate otherwise:
//!
//! - [`MarginDecreaseUnoptimizedCnecs`]: cnecs of operators without curative
//!   actions, as long as their margin does not decrease;
//! - [`PstLimitationUnoptimizedCnecs`]: cnecs a dedicated PST can still
//!   secure with its remaining range.

use std::collections::{BTreeMap, BTreeSet};

use rao_core::{
    CnecId, FlowCnec, FlowResult, Perimeter, RangeAction, RangeActionActivationResult, RangeActionId, RaoError,
    RaoResult, SensitivityResult, Side, Unit,
};

/// Relative tolerance on the pre-perimeter margin of unoptimized cnecs.
const MARGIN_DECREASE_TOLERANCE: f64 = 1e-4;

/// Margin of one cnec.
///
/// NaN flows give NaN margins; a side without threshold gives `+inf`.
pub trait MarginEvaluator {
    fn margin_on_side(
        &self,
        flow: &FlowResult,
        activation: &RangeActionActivationResult,
        cnec: &FlowCnec,
        side: Side,
        unit: Unit,
    ) -> f64;

    /// Worst margin over the cnec's sides.
    fn margin(
        &self,
        flow: &FlowResult,
        activation: &RangeActionActivationResult,
        cnec: &FlowCnec,
        unit: Unit,
    ) -> f64 {
        let mut worst = f64::INFINITY;
        for side in cnec.sides() {
            let margin = self.margin_on_side(flow, activation, cnec, side, unit);
            if margin.is_nan() {
                return f64::NAN;
            }
            worst = worst.min(margin);
        }
        worst
    }
}

/// Threshold minus flow.
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicMarginEvaluator;

impl MarginEvaluator for BasicMarginEvaluator {
    fn margin_on_side(
        &self,
        flow: &FlowResult,
        _activation: &RangeActionActivationResult,
        cnec: &FlowCnec,
        side: Side,
        unit: Unit,
    ) -> f64 {
        cnec.margin_for_flow(flow.flow(cnec, side, unit), side, unit)
    }
}

/// Positive margins divided by the zonal PTDF sum.
#[derive(Debug, Clone, Copy)]
pub struct RelativeMarginEvaluator {
    pub ptdf_sum_lower_bound: f64,
}

impl MarginEvaluator for RelativeMarginEvaluator {
    fn margin_on_side(
        &self,
        flow: &FlowResult,
        activation: &RangeActionActivationResult,
        cnec: &FlowCnec,
        side: Side,
        unit: Unit,
    ) -> f64 {
        let margin = BasicMarginEvaluator.margin_on_side(flow, activation, cnec, side, unit);
        if margin > 0.0 {
            margin / flow.ptdf_zonal_sum(&cnec.id, side).max(self.ptdf_sum_lower_bound)
        } else {
            margin
        }
    }
}

/// Ignores cnecs of some operators while their margin does not decrease.
pub struct MarginDecreaseUnoptimizedCnecs<'a> {
    inner: Box<dyn MarginEvaluator + 'a>,
    operators: BTreeSet<String>,
    pre_perimeter_flow: &'a FlowResult,
}

impl<'a> MarginDecreaseUnoptimizedCnecs<'a> {
    pub fn new(
        inner: Box<dyn MarginEvaluator + 'a>,
        operators: BTreeSet<String>,
        pre_perimeter_flow: &'a FlowResult,
    ) -> Self {
        Self {
            inner,
            operators,
            pre_perimeter_flow,
        }
    }
}

impl MarginEvaluator for MarginDecreaseUnoptimizedCnecs<'_> {
    fn margin_on_side(
        &self,
        flow: &FlowResult,
        activation: &RangeActionActivationResult,
        cnec: &FlowCnec,
        side: Side,
        unit: Unit,
    ) -> f64 {
        let margin = self.inner.margin_on_side(flow, activation, cnec, side, unit);
        let unoptimized = cnec
            .operator
            .as_ref()
            .is_some_and(|operator| self.operators.contains(operator));
        if !unoptimized {
            return margin;
        }
        let pre_perimeter = self.inner.margin_on_side(self.pre_perimeter_flow, activation, cnec, side, unit);
        if margin > pre_perimeter - MARGIN_DECREASE_TOLERANCE * pre_perimeter.abs() {
            f64::INFINITY
        } else {
            margin
        }
    }
}

/// Ignores cnecs that their PST can still secure.
pub struct PstLimitationUnoptimizedCnecs<'a> {
    inner: Box<dyn MarginEvaluator + 'a>,
    psts: BTreeMap<CnecId, &'a RangeAction>,
    sensitivity: &'a SensitivityResult,
}

impl<'a> PstLimitationUnoptimizedCnecs<'a> {
    /// Fails when a cnec or PST of `pairs` is not in the perimeter.
    pub fn new(
        inner: Box<dyn MarginEvaluator + 'a>,
        pairs: &BTreeMap<CnecId, RangeActionId>,
        perimeter: &'a Perimeter,
        sensitivity: &'a SensitivityResult,
    ) -> RaoResult<Self> {
        let mut psts = BTreeMap::new();
        for (cnec, pst) in pairs {
            if perimeter.cnec(cnec.as_str()).is_none() {
                return Err(RaoError::Validation(format!("cnec '{cnec}' is not in the perimeter")));
            }
            let range_action = perimeter
                .range_action(pst)
                .filter(|ra| ra.is_pst())
                .ok_or_else(|| {
                    RaoError::Validation(format!("range action '{pst}' securing cnec '{cnec}' is not a PST"))
                })?;
            psts.insert(cnec.clone(), range_action);
        }
        Ok(Self {
            inner,
            psts,
            sensitivity,
        })
    }

    /// Whether moving the PST within its range can bring the flow inside
    /// both thresholds.
    fn can_secure(
        &self,
        flow: &FlowResult,
        activation: &RangeActionActivationResult,
        cnec: &FlowCnec,
        side: Side,
        pst: &RangeAction,
    ) -> bool {
        let current_flow = flow.flow(cnec, side, Unit::Megawatt);
        let Some(current) = activation.optimized_setpoint(&pst.id, &cnec.state) else {
            return false;
        };
        let sensitivity = self.sensitivity.sensitivity_mw(&cnec.id, side, &pst.id);
        let (min, max) = (pst.min_admissible_setpoint(), pst.max_admissible_setpoint());
        let upper_margin = cnec
            .upper_bound(side, Unit::Megawatt)
            .map_or(f64::INFINITY, |upper| upper - current_flow);
        let lower_margin = cnec
            .lower_bound(side, Unit::Megawatt)
            .map_or(f64::INFINITY, |lower| current_flow - lower);
        let (above, below) = if sensitivity >= 0.0 {
            (
                sensitivity * (current - min) + upper_margin,
                sensitivity * (max - current) + lower_margin,
            )
        } else {
            (
                sensitivity * (current - max) + upper_margin,
                sensitivity * (min - current) + lower_margin,
            )
        };
        above >= 0.0 && below >= 0.0
    }
}

impl MarginEvaluator for PstLimitationUnoptimizedCnecs<'_> {
    fn margin_on_side(
        &self,
        flow: &FlowResult,
        activation: &RangeActionActivationResult,
        cnec: &FlowCnec,
        side: Side,
        unit: Unit,
    ) -> f64 {
        match self.psts.get(&cnec.id) {
            Some(pst) if self.can_secure(flow, activation, cnec, side, pst) => f64::INFINITY,
            _ => self.inner.margin_on_side(flow, activation, cnec, side, unit),
        }
    }
}
