use std::collections::BTreeSet;

use rao_core::{CnecId, ContingencyId, Perimeter, Unit};

use super::{largest_threshold, ranked_margins, Cost, CostEvaluator, CostInput};
use crate::margin::MarginEvaluator;

/// `−(worst margin)` over optimized cnecs.
///
/// Without any eligible cnec, or when every cnec is neutralized, the cost
/// is `−(largest threshold)` so that virtual costs stay visible.
pub struct MinMarginEvaluator<'a> {
    perimeter: &'a Perimeter,
    margins: Box<dyn MarginEvaluator + 'a>,
    unit: Unit,
}

impl<'a> MinMarginEvaluator<'a> {
    pub fn new(perimeter: &'a Perimeter, margins: Box<dyn MarginEvaluator + 'a>, unit: Unit) -> Self {
        Self {
            perimeter,
            margins,
            unit,
        }
    }

    /// Worst margin, `None` when nothing constrains the perimeter.
    pub(crate) fn worst_margin(
        &self,
        input: &CostInput<'_>,
        excluded: &BTreeSet<ContingencyId>,
    ) -> (Option<f64>, Vec<CnecId>) {
        let ranked = ranked_margins(self.perimeter, self.margins.as_ref(), input, self.unit, excluded);
        let worst = ranked
            .first()
            .map(|(_, margin)| *margin)
            .filter(|margin| !margin.is_nan() && *margin != f64::INFINITY);
        (worst, ranked.into_iter().map(|(cnec, _)| cnec.id.clone()).collect())
    }
}

impl CostEvaluator for MinMarginEvaluator<'_> {
    fn name(&self) -> &'static str {
        "min-margin"
    }

    fn compute_cost(&self, input: &CostInput<'_>, excluded: &BTreeSet<ContingencyId>) -> Cost {
        let (worst, limiting) = self.worst_margin(input, excluded);
        let value = match worst {
            Some(margin) => -margin,
            None => -largest_threshold(self.perimeter, self.unit, excluded),
        };
        Cost::new(value, limiting)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cost::test_support::*;
    use crate::margin::{BasicMarginEvaluator, MarginDecreaseUnoptimizedCnecs};
    use rao_core::{FlowResult, NetworkActionsResult, Side};

    fn flows(n: f64, co1: f64, co2: f64) -> FlowResult {
        FlowResult::new()
            .with_flow("cnec-n".into(), Side::One, n)
            .with_flow("cnec-co1".into(), Side::One, co1)
            .with_flow("cnec-co2".into(), Side::One, co2)
    }

    #[test]
    fn test_cost_is_opposite_of_worst_margin() {
        let perimeter = perimeter();
        let evaluator = MinMarginEvaluator::new(&perimeter, Box::new(BasicMarginEvaluator), Unit::Megawatt);
        let flow = flows(50.0, 120.0, -80.0);
        let activation = perimeter.initial_activation();
        let network_actions = NetworkActionsResult::default();
        let input = CostInput {
            flow: &flow,
            activation: &activation,
            network_actions: &network_actions,
        };

        let cost = evaluator.compute_cost(&input, &BTreeSet::new());
        assert!((cost.value - 20.0).abs() < 1e-9);
        assert_eq!(cost.limiting[0].as_str(), "cnec-co1");

        let excluded = BTreeSet::from([ContingencyId::new("co1")]);
        let cost = evaluator.compute_cost(&input, &excluded);
        assert!((cost.value + 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_neutralized_perimeter_falls_back_to_threshold() {
        let perimeter = perimeter();
        let pre_perimeter = flows(150.0, 150.0, 150.0);
        let margins = MarginDecreaseUnoptimizedCnecs::new(
            Box::new(BasicMarginEvaluator),
            BTreeSet::from(["FR".to_string()]),
            &pre_perimeter,
        );
        let evaluator = MinMarginEvaluator::new(&perimeter, Box::new(margins), Unit::Megawatt);
        let flow = flows(140.0, 140.0, 140.0);
        let activation = perimeter.initial_activation();
        let network_actions = NetworkActionsResult::default();
        let input = CostInput {
            flow: &flow,
            activation: &activation,
            network_actions: &network_actions,
        };
        let cost = evaluator.compute_cost(&input, &BTreeSet::new());
        assert!((cost.value + 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_no_eligible_cnec_falls_back_to_threshold() {
        let activation = perimeter().initial_activation();
        let network_actions = NetworkActionsResult::default();

        // every optimized cnec sits in a state whose computation failed
        let perimeter = Perimeter::new(vec![preventive(), co1()]).with_cnec(cnec("cnec-co1", &co1()));
        let flow = flows(0.0, 150.0, 0.0).with_state_status(co1().id, rao_core::ComputationStatus::Failure);
        let input = CostInput {
            flow: &flow,
            activation: &activation,
            network_actions: &network_actions,
        };
        let evaluator = MinMarginEvaluator::new(&perimeter, Box::new(BasicMarginEvaluator), Unit::Megawatt);
        let cost = evaluator.compute_cost(&input, &BTreeSet::new());
        assert!((cost.value + 100.0).abs() < 1e-9);
        assert!(cost.limiting.is_empty());

        // its contingency is excluded
        let cost = evaluator.compute_cost(&input, &BTreeSet::from([ContingencyId::new("co1")]));
        assert_eq!(cost.value, 0.0);
        assert!(cost.limiting.is_empty());

        // only monitored elements
        let monitored = rao_core::FlowCnec::new("mnec", preventive().id)
            .with_threshold(Side::One, Unit::Megawatt, Some(-100.0), Some(100.0))
            .monitored();
        let perimeter = Perimeter::new(vec![preventive()]).with_cnec(monitored);
        let flow = FlowResult::new().with_flow("mnec".into(), Side::One, 180.0);
        let input = CostInput {
            flow: &flow,
            activation: &activation,
            network_actions: &network_actions,
        };
        let evaluator = MinMarginEvaluator::new(&perimeter, Box::new(BasicMarginEvaluator), Unit::Megawatt);
        let cost = evaluator.compute_cost(&input, &BTreeSet::new());
        assert_eq!(cost.value, 0.0);
        assert!(cost.limiting.is_empty());
    }
}
