use std::collections::BTreeSet;

use rao_core::ContingencyId;

use super::{Cost, CostEvaluator, CostInput, MinMarginEvaluator};
use crate::linear::fillers::MARGIN_PENALTY_COEFFICIENT;

/// Penalizes a negative worst margin in cost mode, so that overloads always
/// dominate activation costs.
pub struct MinMarginViolationEvaluator<'a> {
    min_margin: MinMarginEvaluator<'a>,
}

impl<'a> MinMarginViolationEvaluator<'a> {
    pub fn new(min_margin: MinMarginEvaluator<'a>) -> Self {
        Self { min_margin }
    }
}

impl CostEvaluator for MinMarginViolationEvaluator<'_> {
    fn name(&self) -> &'static str {
        "min-margin-violation-evaluator"
    }

    fn compute_cost(&self, input: &CostInput<'_>, excluded: &BTreeSet<ContingencyId>) -> Cost {
        match self.min_margin.worst_margin(input, excluded) {
            (Some(worst), limiting) if worst < 0.0 => Cost::new(MARGIN_PENALTY_COEFFICIENT * -worst, limiting),
            _ => Cost::zero(),
        }
    }
}
