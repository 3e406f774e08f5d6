use std::collections::BTreeSet;

use rao_core::{ComputationStatus, ContingencyId, Perimeter};
use tracing::info;

use super::{Cost, CostEvaluator, CostInput};

/// Fixed overcost when the computation failed globally or for one of the
/// perimeter's states.
pub struct SensitivityFailureOvercostEvaluator<'a> {
    perimeter: &'a Perimeter,
    overcost: f64,
}

impl<'a> SensitivityFailureOvercostEvaluator<'a> {
    pub fn new(perimeter: &'a Perimeter, overcost: f64) -> Self {
        Self { perimeter, overcost }
    }
}

impl CostEvaluator for SensitivityFailureOvercostEvaluator<'_> {
    fn name(&self) -> &'static str {
        "sensitivity-failure-cost"
    }

    fn compute_cost(&self, input: &CostInput<'_>, excluded: &BTreeSet<ContingencyId>) -> Cost {
        if input.flow.computation_status() == ComputationStatus::Failure {
            info!(overcost = self.overcost, "sensitivity computation failed");
            return Cost::new(self.overcost, Vec::new());
        }
        let failed = self
            .perimeter
            .states()
            .iter()
            .filter(|state| !state.contingency.as_ref().is_some_and(|co| excluded.contains(co)))
            .find(|state| input.flow.computation_status_for(&state.id) == ComputationStatus::Failure);
        match failed {
            Some(state) => {
                info!(state = %state.id, overcost = self.overcost, "sensitivity computation failed for state");
                Cost::new(self.overcost, Vec::new())
            }
            None => Cost::zero(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rao_core::{FlowResult, NetworkActionsResult, State};

    #[test]
    fn test_overcost_on_relevant_state_failure() {
        let co1 = State::curative("co1-curative", "co1");
        let perimeter = Perimeter::new(vec![State::preventive("preventive"), co1.clone()]);
        let evaluator = SensitivityFailureOvercostEvaluator::new(&perimeter, 10_000.0);
        let activation = perimeter.initial_activation();
        let network_actions = NetworkActionsResult::default();
        let cost = |flow: &FlowResult, excluded: &BTreeSet<ContingencyId>| {
            let input = CostInput {
                flow,
                activation: &activation,
                network_actions: &network_actions,
            };
            evaluator.compute_cost(&input, excluded).value
        };
        let none = BTreeSet::new();

        assert_eq!(cost(&FlowResult::new(), &none), 0.0);
        assert_eq!(cost(&FlowResult::new().with_status(ComputationStatus::Failure), &none), 10_000.0);

        let co1_failed = FlowResult::new().with_state_status(co1.id.clone(), ComputationStatus::Failure);
        assert_eq!(cost(&co1_failed, &none), 10_000.0);
        assert_eq!(cost(&co1_failed, &BTreeSet::from([ContingencyId::new("co1")])), 0.0);
        // a state outside the perimeter is irrelevant
        let other = FlowResult::new().with_state_status("co9-curative".into(), ComputationStatus::Failure);
        assert_eq!(cost(&other, &none), 0.0);
    }
}
