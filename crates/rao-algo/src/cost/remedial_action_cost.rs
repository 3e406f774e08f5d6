use std::collections::BTreeSet;

use rao_core::{ContingencyId, Perimeter, RangeAction, StateId, Unit};
use tracing::warn;

use super::{ranked_margins, Cost, CostEvaluator, CostInput};
use crate::margin::MarginEvaluator;

/// Activation and variation costs of the chosen remedial actions.
///
/// Variations are measured against the preceding state, in taps for PSTs.
/// Limiting elements are the optimized cnecs, worst first.
pub struct RemedialActionCostEvaluator<'a> {
    perimeter: &'a Perimeter,
    margins: Box<dyn MarginEvaluator + 'a>,
    unit: Unit,
}

impl<'a> RemedialActionCostEvaluator<'a> {
    pub fn new(perimeter: &'a Perimeter, margins: Box<dyn MarginEvaluator + 'a>, unit: Unit) -> Self {
        Self {
            perimeter,
            margins,
            unit,
        }
    }

    fn range_action_cost(&self, input: &CostInput<'_>, range_action: &RangeAction, state: &StateId) -> f64 {
        let activation = input.activation;
        let (Some(previous), Some(current)) = (
            activation.previous_setpoint(&range_action.id, state),
            activation.optimized_setpoint(&range_action.id, state),
        ) else {
            return 0.0;
        };
        let variation = match range_action.tap_table() {
            Some(taps) => f64::from(taps.closest_tap(current) - taps.closest_tap(previous)),
            None => current - previous,
        };
        let rate = if variation > 0.0 {
            range_action.variation_cost_up
        } else {
            range_action.variation_cost_down
        };
        range_action.activation_cost + rate * variation.abs()
    }
}

impl CostEvaluator for RemedialActionCostEvaluator<'_> {
    fn name(&self) -> &'static str {
        "remedial-action-cost"
    }

    fn compute_cost(&self, input: &CostInput<'_>, excluded: &BTreeSet<ContingencyId>) -> Cost {
        let mut total = 0.0;
        for state in self.perimeter.states() {
            if state.contingency.as_ref().is_some_and(|co| excluded.contains(co)) {
                continue;
            }
            for id in input.activation.activated_range_actions(&state.id) {
                match self.perimeter.range_action(&id) {
                    Some(range_action) => total += self.range_action_cost(input, range_action, &state.id),
                    None => warn!(range_action = %id, state = %state.id, "activated range action not in perimeter"),
                }
            }
        }
        for id in input.network_actions.activated() {
            match self.perimeter.network_action(id) {
                Some(network_action) => total += network_action.activation_cost,
                None => warn!(network_action = %id, "activated network action not in perimeter"),
            }
        }
        let limiting = ranked_margins(self.perimeter, self.margins.as_ref(), input, self.unit, excluded)
            .into_iter()
            .map(|(cnec, _)| cnec.id.clone())
            .collect();
        Cost::new(total, limiting)
    }
}
