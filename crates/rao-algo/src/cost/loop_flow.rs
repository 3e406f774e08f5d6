use std::collections::BTreeSet;

use rao_core::{ContingencyId, FlowCnec, FlowResult, Perimeter, Unit};

use super::{is_excluded, Cost, CostEvaluator, CostInput};
use crate::config::LoopFlowParameters;

/// Loop flows beyond `max(threshold, |initial| + acceptable increase)`.
pub struct LoopFlowViolationEvaluator<'a> {
    perimeter: &'a Perimeter,
    initial_flow: &'a FlowResult,
    parameters: LoopFlowParameters,
}

impl<'a> LoopFlowViolationEvaluator<'a> {
    pub fn new(perimeter: &'a Perimeter, initial_flow: &'a FlowResult, parameters: LoopFlowParameters) -> Self {
        Self {
            perimeter,
            initial_flow,
            parameters,
        }
    }

    /// Excess loop flow of one cnec in MW, summed over its sides.
    fn excess(&self, flow: &FlowResult, cnec: &FlowCnec) -> f64 {
        let Some(threshold) = cnec.loop_flow_threshold(Unit::Megawatt) else {
            return 0.0;
        };
        cnec.sides()
            .into_iter()
            .filter_map(|side| {
                let loop_flow = flow.loop_flow(cnec, side, Unit::Megawatt)?;
                let initial = self
                    .initial_flow
                    .loop_flow(cnec, side, Unit::Megawatt)
                    .unwrap_or(0.0);
                let limit = threshold.max(initial.abs() + self.parameters.acceptable_increase);
                Some((loop_flow.abs() - limit).max(0.0))
            })
            .sum()
    }
}

impl CostEvaluator for LoopFlowViolationEvaluator<'_> {
    fn name(&self) -> &'static str {
        "loop-flow-cost"
    }

    fn compute_cost(&self, input: &CostInput<'_>, excluded: &BTreeSet<ContingencyId>) -> Cost {
        if self.parameters.violation_cost == 0.0 {
            return Cost::zero();
        }
        let mut excesses = self
            .perimeter
            .loop_flow_cnecs()
            .filter(|cnec| !is_excluded(cnec, excluded))
            .map(|cnec| (cnec, self.excess(input.flow, cnec)))
            .filter(|(_, excess)| *excess > 0.0)
            .collect::<Vec<_>>();
        excesses.sort_by(|(_, a), (_, b)| b.total_cmp(a));
        let total: f64 = excesses.iter().map(|(_, excess)| excess).sum();
        Cost::new(
            self.parameters.violation_cost * total,
            excesses.into_iter().map(|(cnec, _)| cnec.id.clone()).collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rao_core::{NetworkActionsResult, Side, State};

    fn border_cnec(id: &str) -> FlowCnec {
        FlowCnec::new(id, State::preventive("preventive").id)
            .with_threshold(Side::One, Unit::Megawatt, Some(-1000.0), Some(1000.0))
            .with_loop_flow_threshold(100.0, Unit::Megawatt)
            .optimized()
    }

    #[test]
    fn test_excess_over_initial_loop_flow() {
        let perimeter = Perimeter::new(vec![State::preventive("preventive")])
            .with_cnec(border_cnec("fr-be"))
            .with_cnec(border_cnec("fr-de"));
        // initial loop flows: 150 and 20 MW
        let initial = FlowResult::new()
            .with_flow("fr-be".into(), Side::One, 250.0)
            .with_commercial_flow("fr-be".into(), Side::One, 100.0)
            .with_flow("fr-de".into(), Side::One, 70.0)
            .with_commercial_flow("fr-de".into(), Side::One, 50.0);
        let parameters = LoopFlowParameters {
            acceptable_increase: 10.0,
            violation_cost: 2.0,
            constraint_adjustment_coefficient: 0.0,
        };
        let evaluator = LoopFlowViolationEvaluator::new(&perimeter, &initial, parameters.clone());

        // loop flows 175 (limit 160) and -130 (limit 100)
        let current = FlowResult::new()
            .with_flow("fr-be".into(), Side::One, 275.0)
            .with_commercial_flow("fr-be".into(), Side::One, 100.0)
            .with_flow("fr-de".into(), Side::One, -80.0)
            .with_commercial_flow("fr-de".into(), Side::One, 50.0);
        let activation = perimeter.initial_activation();
        let network_actions = NetworkActionsResult::default();
        let input = CostInput {
            flow: &current,
            activation: &activation,
            network_actions: &network_actions,
        };
        let cost = evaluator.compute_cost(&input, &BTreeSet::new());
        assert!((cost.value - 2.0 * (15.0 + 30.0)).abs() < 1e-9);
        assert_eq!(cost.limiting[0].as_str(), "fr-de");

        let free = LoopFlowViolationEvaluator::new(
            &perimeter,
            &initial,
            LoopFlowParameters {
                violation_cost: 0.0,
                ..parameters
            },
        );
        assert_eq!(free.compute_cost(&input, &BTreeSet::new()), Cost::zero());
    }
}
