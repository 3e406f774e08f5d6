use std::collections::BTreeSet;

use rao_core::{ContingencyId, FlowCnec, FlowResult, Perimeter, Unit};

use super::{is_excluded, Cost, CostEvaluator, CostInput};
use crate::config::MnecParameters;

/// Monitored elements losing more than the acceptable margin decrease.
///
/// The tolerance only matters for elements that were already at or beyond
/// their limit: `deficit = max(0, min(0, initial − decrease) − current)`.
pub struct MnecViolationEvaluator<'a> {
    perimeter: &'a Perimeter,
    initial_flow: &'a FlowResult,
    parameters: MnecParameters,
    unit: Unit,
}

impl<'a> MnecViolationEvaluator<'a> {
    pub fn new(
        perimeter: &'a Perimeter,
        initial_flow: &'a FlowResult,
        parameters: MnecParameters,
        unit: Unit,
    ) -> Self {
        Self {
            perimeter,
            initial_flow,
            parameters,
            unit,
        }
    }

    fn deficit(&self, flow: &FlowResult, cnec: &FlowCnec) -> f64 {
        let initial = self.initial_flow.margin(cnec, self.unit);
        let current = flow.margin(cnec, self.unit);
        if initial.is_nan() || current.is_nan() {
            return 0.0;
        }
        let floor = (initial - self.parameters.acceptable_margin_decrease).min(0.0);
        (floor - current).max(0.0)
    }
}

impl CostEvaluator for MnecViolationEvaluator<'_> {
    fn name(&self) -> &'static str {
        "mnec-cost"
    }

    fn compute_cost(&self, input: &CostInput<'_>, excluded: &BTreeSet<ContingencyId>) -> Cost {
        let mut deficits = self
            .perimeter
            .monitored_cnecs()
            .filter(|cnec| !is_excluded(cnec, excluded))
            .map(|cnec| (cnec, self.deficit(input.flow, cnec)))
            .filter(|(_, deficit)| *deficit > 0.0)
            .collect::<Vec<_>>();
        deficits.sort_by(|(_, a), (_, b)| b.total_cmp(a));
        let total: f64 = deficits.iter().map(|(_, deficit)| deficit).sum();
        Cost::new(
            self.parameters.violation_cost * total,
            deficits.into_iter().map(|(cnec, _)| cnec.id.clone()).collect(),
        )
    }
}
