//! Cost evaluators: flow result and activation in, scalar cost out.
//!
//! Every evaluator is a pure function of its [`CostInput`]. The objective
//! combines one functional evaluator with any number of virtual (penalty)
//! evaluators:
//!
//! | Evaluator | Name | Role |
//! |-----------|------|------|
//! | [`MinMarginEvaluator`] | `min-margin` | functional |
//! | [`RemedialActionCostEvaluator`] | `remedial-action-cost` | functional in cost mode |
//! | [`MinMarginViolationEvaluator`] | `min-margin-violation-evaluator` | virtual, cost mode |
//! | [`LoopFlowViolationEvaluator`] | `loop-flow-cost` | virtual |
//! | [`MnecViolationEvaluator`] | `mnec-cost` | virtual |
//! | [`SensitivityFailureOvercostEvaluator`] | `sensitivity-failure-cost` | virtual |

use std::cmp::Ordering;
use std::collections::BTreeSet;

use rao_core::{
    CnecId, ComputationStatus, ContingencyId, FlowCnec, FlowResult, NetworkActionsResult, Perimeter,
    RangeActionActivationResult, Unit,
};

use crate::margin::MarginEvaluator;

mod loop_flow;
mod min_margin;
mod min_margin_violation;
mod mnec;
mod remedial_action_cost;
mod sensitivity_failure;

pub use loop_flow::LoopFlowViolationEvaluator;
pub use min_margin::MinMarginEvaluator;
pub use min_margin_violation::MinMarginViolationEvaluator;
pub use mnec::MnecViolationEvaluator;
pub use remedial_action_cost::RemedialActionCostEvaluator;
pub use sensitivity_failure::SensitivityFailureOvercostEvaluator;

/// A cost and the elements responsible for it, most costly first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Cost {
    pub value: f64,
    pub limiting: Vec<CnecId>,
}

impl Cost {
    pub fn zero() -> Self {
        Self::default()
    }

    pub fn new(value: f64, limiting: Vec<CnecId>) -> Self {
        Self { value, limiting }
    }
}

/// The situation being evaluated.
#[derive(Debug, Clone, Copy)]
pub struct CostInput<'a> {
    pub flow: &'a FlowResult,
    pub activation: &'a RangeActionActivationResult,
    pub network_actions: &'a NetworkActionsResult,
}

pub trait CostEvaluator {
    fn name(&self) -> &'static str;

    /// Cost of `input`, ignoring elements of `excluded` contingencies.
    fn compute_cost(&self, input: &CostInput<'_>, excluded: &BTreeSet<ContingencyId>) -> Cost;
}

/// Whether `cnec` belongs to one of the `excluded` contingencies.
pub(crate) fn is_excluded(cnec: &FlowCnec, excluded: &BTreeSet<ContingencyId>) -> bool {
    cnec.contingency
        .as_ref()
        .is_some_and(|contingency| excluded.contains(contingency))
}

/// Ascending order with NaN last.
pub(crate) fn worst_first(a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => a.total_cmp(&b),
    }
}

/// Optimized cnecs with their margin, worst first.
///
/// Cnecs of excluded contingencies and of states whose computation failed
/// are left out.
pub(crate) fn ranked_margins<'p>(
    perimeter: &'p Perimeter,
    margins: &dyn MarginEvaluator,
    input: &CostInput<'_>,
    unit: Unit,
    excluded: &BTreeSet<ContingencyId>,
) -> Vec<(&'p FlowCnec, f64)> {
    let mut ranked = perimeter
        .optimized_cnecs()
        .filter(|cnec| !is_excluded(cnec, excluded))
        .filter(|cnec| input.flow.computation_status_for(&cnec.state) != ComputationStatus::Failure)
        .map(|cnec| (cnec, margins.margin(input.flow, input.activation, cnec, unit)))
        .collect::<Vec<_>>();
    ranked.sort_by(|(_, a), (_, b)| worst_first(*a, *b));
    ranked
}

/// Largest threshold among optimized cnecs, the finite stand-in for an
/// unbounded worst margin.
pub(crate) fn largest_threshold(perimeter: &Perimeter, unit: Unit, excluded: &BTreeSet<ContingencyId>) -> f64 {
    perimeter
        .optimized_cnecs()
        .filter(|cnec| !is_excluded(cnec, excluded))
        .map(|cnec| cnec.largest_threshold(unit))
        .fold(0.0, f64::max)
}

#[cfg(test)]
pub(crate) mod test_support {
    //! A curative perimeter with two contingencies.

    use rao_core::{FlowCnec, Perimeter, PstTapTable, RangeAction, Side, State, Unit};

    pub fn preventive() -> State {
        State::preventive("preventive")
    }

    pub fn co1() -> State {
        State::curative("co1-curative", "co1")
    }

    pub fn co2() -> State {
        State::curative("co2-curative", "co2")
    }

    pub fn cnec(id: &str, state: &State) -> FlowCnec {
        let cnec = FlowCnec::new(id, state.id.clone())
            .with_operator("FR")
            .with_threshold(Side::One, Unit::Megawatt, Some(-100.0), Some(100.0))
            .optimized();
        match &state.contingency {
            Some(co) => cnec.with_contingency(co.clone()),
            None => cnec,
        }
    }

    pub fn pst() -> RangeAction {
        RangeAction::pst("pst", PstTapTable::linear(-16, 16, -6.4, 0.4).unwrap())
            .with_activation_cost(10.0)
            .with_variation_costs(2.0, 3.0)
    }

    pub fn perimeter() -> Perimeter {
        Perimeter::new(vec![preventive(), co1(), co2()])
            .with_cnec(cnec("cnec-n", &preventive()))
            .with_cnec(cnec("cnec-co1", &co1()))
            .with_cnec(cnec("cnec-co2", &co2()))
            .with_range_action(&preventive().id, pst())
    }
}
