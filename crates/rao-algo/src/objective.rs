//! Objective function: one functional cost plus penalty (virtual) costs.
//!
//! An [`UnevaluatedObjective`] only holds the evaluators. Evaluating it on a
//! situation gives an [`EvaluatedObjective`], which keeps the situation so
//! that it can be re-evaluated without some contingencies.
//!
//! ```text
//! UnevaluatedObjective ──evaluate──▶ EvaluatedObjective ──exclude_contingencies──▶ EvaluatedObjective
//! ```

use std::collections::{BTreeMap, BTreeSet};

use rao_core::{CnecId, ContingencyId, RaoResult, SensitivityResult};

use crate::cost::{
    Cost, CostEvaluator, CostInput, LoopFlowViolationEvaluator, MinMarginEvaluator, MinMarginViolationEvaluator,
    MnecViolationEvaluator, RemedialActionCostEvaluator, SensitivityFailureOvercostEvaluator,
};
use crate::linear::fillers::{unoptimized_cnec_rule, FillerContext, UnoptimizedCnecRule};
use crate::margin::{
    BasicMarginEvaluator, MarginDecreaseUnoptimizedCnecs, MarginEvaluator, PstLimitationUnoptimizedCnecs,
    RelativeMarginEvaluator,
};

/// Costs of one evaluation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectiveCosts {
    pub functional: Cost,
    pub virtual_costs: BTreeMap<String, Cost>,
}

impl ObjectiveCosts {
    pub fn functional_cost(&self) -> f64 {
        self.functional.value
    }

    /// Cost of the virtual evaluator `name`, `None` if it is not wired.
    pub fn virtual_cost(&self, name: &str) -> Option<f64> {
        self.virtual_costs.get(name).map(|cost| cost.value)
    }

    pub fn total_virtual_cost(&self) -> f64 {
        self.virtual_costs.values().map(|cost| cost.value).sum()
    }

    pub fn total_cost(&self) -> f64 {
        self.functional_cost() + self.total_virtual_cost()
    }
}

/// Evaluators making up the objective.
pub struct UnevaluatedObjective<'a> {
    functional: Box<dyn CostEvaluator + 'a>,
    virtuals: Vec<Box<dyn CostEvaluator + 'a>>,
}

impl<'a> UnevaluatedObjective<'a> {
    pub fn new(functional: Box<dyn CostEvaluator + 'a>, virtuals: Vec<Box<dyn CostEvaluator + 'a>>) -> Self {
        Self { functional, virtuals }
    }

    /// Objective used before any remedial action is tried: the functional
    /// cost and the sensitivity-failure overcost.
    ///
    /// In cost mode the functional cost is paired with the min-margin
    /// violation penalty.
    pub fn build_for_initial_sensitivity_computation(
        context: FillerContext<'a>,
        sensitivity: &'a SensitivityResult,
    ) -> RaoResult<Self> {
        let mut objective = Self::functional_only(context, sensitivity)?;
        objective.virtuals.push(Box::new(SensitivityFailureOvercostEvaluator::new(
            context.perimeter,
            context.parameters.sensitivity_failure_overcost,
        )));
        Ok(objective)
    }

    /// Full objective: functional cost, then the MNEC and loop-flow
    /// penalties when configured, then the sensitivity-failure overcost.
    pub fn build(context: FillerContext<'a>, sensitivity: &'a SensitivityResult) -> RaoResult<Self> {
        let parameters = context.parameters;
        let mut objective = Self::functional_only(context, sensitivity)?;
        if let Some(mnec) = &parameters.mnec {
            objective.virtuals.push(Box::new(MnecViolationEvaluator::new(
                context.perimeter,
                context.initial_flow,
                mnec.clone(),
                parameters.objective.unit,
            )));
        }
        if let Some(loop_flow) = &parameters.loop_flow {
            objective.virtuals.push(Box::new(LoopFlowViolationEvaluator::new(
                context.perimeter,
                context.initial_flow,
                loop_flow.clone(),
            )));
        }
        objective.virtuals.push(Box::new(SensitivityFailureOvercostEvaluator::new(
            context.perimeter,
            parameters.sensitivity_failure_overcost,
        )));
        Ok(objective)
    }

    fn functional_only(context: FillerContext<'a>, sensitivity: &'a SensitivityResult) -> RaoResult<Self> {
        let unit = context.parameters.objective.unit;
        if context.parameters.objective.kind.is_cost_optimization() {
            let functional = RemedialActionCostEvaluator::new(
                context.perimeter,
                margin_evaluator(context, sensitivity)?,
                unit,
            );
            let violation = MinMarginViolationEvaluator::new(MinMarginEvaluator::new(
                context.perimeter,
                margin_evaluator(context, sensitivity)?,
                unit,
            ));
            Ok(Self::new(Box::new(functional), vec![Box::new(violation)]))
        } else {
            let functional = MinMarginEvaluator::new(context.perimeter, margin_evaluator(context, sensitivity)?, unit);
            Ok(Self::new(Box::new(functional), Vec::new()))
        }
    }

    pub fn functional_name(&self) -> &'static str {
        self.functional.name()
    }

    pub fn virtual_names(&self) -> Vec<&'static str> {
        self.virtuals.iter().map(|evaluator| evaluator.name()).collect()
    }

    fn compute(&self, input: &CostInput<'_>, excluded: &BTreeSet<ContingencyId>) -> ObjectiveCosts {
        ObjectiveCosts {
            functional: self.functional.compute_cost(input, excluded),
            virtual_costs: self
                .virtuals
                .iter()
                .map(|evaluator| (evaluator.name().to_string(), evaluator.compute_cost(input, excluded)))
                .collect(),
        }
    }

    pub fn evaluate<'i>(&self, input: CostInput<'i>) -> EvaluatedObjective<'_, 'i> {
        let excluded = BTreeSet::new();
        let costs = self.compute(&input, &excluded);
        EvaluatedObjective {
            objective: self,
            input,
            excluded,
            costs,
        }
    }
}

/// Margin evaluator matching the objective kind, wrapped by the
/// unoptimized-cnec rule of the perimeter, if any.
pub fn margin_evaluator<'a>(
    context: FillerContext<'a>,
    sensitivity: &'a SensitivityResult,
) -> RaoResult<Box<dyn MarginEvaluator + 'a>> {
    let parameters = context.parameters;
    let base: Box<dyn MarginEvaluator + 'a> = if parameters.objective.kind.is_relative() {
        Box::new(RelativeMarginEvaluator {
            ptdf_sum_lower_bound: parameters.relative_margins.ptdf_sum_lower_bound,
        })
    } else {
        Box::new(BasicMarginEvaluator)
    };
    let decorated: Box<dyn MarginEvaluator + 'a> = match unoptimized_cnec_rule(parameters, context.perimeter) {
        Some(UnoptimizedCnecRule::MarginDecrease(operators)) => Box::new(MarginDecreaseUnoptimizedCnecs::new(
            base,
            operators,
            context.pre_perimeter_flow,
        )),
        Some(UnoptimizedCnecRule::PstLimitation(pairs)) => Box::new(PstLimitationUnoptimizedCnecs::new(
            base,
            &pairs,
            context.perimeter,
            sensitivity,
        )?),
        None => base,
    };
    Ok(decorated)
}

/// Costs of one situation, with the situation kept for re-evaluation.
pub struct EvaluatedObjective<'o, 'i> {
    objective: &'o UnevaluatedObjective<'o>,
    input: CostInput<'i>,
    excluded: BTreeSet<ContingencyId>,
    costs: ObjectiveCosts,
}

impl<'o, 'i> EvaluatedObjective<'o, 'i> {
    pub fn costs(&self) -> &ObjectiveCosts {
        &self.costs
    }

    pub fn into_costs(self) -> ObjectiveCosts {
        self.costs
    }

    pub fn functional_cost(&self) -> f64 {
        self.costs.functional_cost()
    }

    pub fn virtual_cost(&self, name: &str) -> Option<f64> {
        self.costs.virtual_cost(name)
    }

    pub fn virtual_cost_names(&self) -> impl Iterator<Item = &str> {
        self.costs.virtual_costs.keys().map(String::as_str)
    }

    pub fn total_cost(&self) -> f64 {
        self.costs.total_cost()
    }

    pub fn excluded_contingencies(&self) -> &BTreeSet<ContingencyId> {
        &self.excluded
    }

    /// At most `n` elements driving the functional cost, worst first.
    pub fn most_limiting_elements(&self, n: usize) -> &[CnecId] {
        let limiting = &self.costs.functional.limiting;
        &limiting[..n.min(limiting.len())]
    }

    /// At most `n` elements driving the virtual cost `name`, costliest first.
    pub fn costly_elements(&self, name: &str, n: usize) -> &[CnecId] {
        match self.costs.virtual_costs.get(name) {
            Some(cost) => &cost.limiting[..n.min(cost.limiting.len())],
            None => &[],
        }
    }

    /// Re-evaluates the situation without the elements of `contingencies`,
    /// on top of those already excluded.
    pub fn exclude_contingencies(mut self, contingencies: &BTreeSet<ContingencyId>) -> Self {
        self.excluded.extend(contingencies.iter().cloned());
        self.costs = self.objective.compute(&self.input, &self.excluded);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MnecParameters, ObjectiveKind, RaoParameters};
    use crate::cost::test_support::{cnec, co1, co2, perimeter, preventive};
    use rao_core::{ComputationStatus, FlowResult, NetworkActionsResult, Side};

    fn context<'a>(
        perimeter: &'a rao_core::Perimeter,
        parameters: &'a RaoParameters,
        flows: &'a FlowResult,
    ) -> FillerContext<'a> {
        FillerContext {
            perimeter,
            parameters,
            initial_flow: flows,
            pre_perimeter_flow: flows,
        }
    }

    #[test]
    fn test_initial_objective_wires_failure_overcost_only() {
        let perimeter = perimeter();
        let mut parameters = RaoParameters::default();
        parameters.mnec = Some(MnecParameters::default());
        let flows = FlowResult::new();
        let sensitivity = SensitivityResult::new();
        let context = context(&perimeter, &parameters, &flows);

        let initial = UnevaluatedObjective::build_for_initial_sensitivity_computation(context, &sensitivity).unwrap();
        assert_eq!(initial.functional_name(), "min-margin");
        assert_eq!(initial.virtual_names(), vec!["sensitivity-failure-cost"]);

        let full = UnevaluatedObjective::build(context, &sensitivity).unwrap();
        assert_eq!(full.virtual_names(), vec!["mnec-cost", "sensitivity-failure-cost"]);
    }

    #[test]
    fn test_cost_mode_pairs_activation_cost_with_violation_penalty() {
        let perimeter = perimeter();
        let mut parameters = RaoParameters::default();
        parameters.objective.kind = ObjectiveKind::MinCost;
        let flows = FlowResult::new();
        let sensitivity = SensitivityResult::new();
        let objective = UnevaluatedObjective::build(context(&perimeter, &parameters, &flows), &sensitivity).unwrap();
        assert_eq!(objective.functional_name(), "remedial-action-cost");
        assert_eq!(
            objective.virtual_names(),
            vec!["min-margin-violation-evaluator", "sensitivity-failure-cost"]
        );
    }

    #[test]
    fn test_total_is_functional_plus_virtual() {
        let perimeter = perimeter();
        let parameters = RaoParameters::default();
        let flows = FlowResult::new();
        let sensitivity = SensitivityResult::new();
        let objective = UnevaluatedObjective::build(context(&perimeter, &parameters, &flows), &sensitivity).unwrap();

        let flow = FlowResult::new()
            .with_flow(cnec("cnec-n", &preventive()).id, Side::One, 40.0)
            .with_flow(cnec("cnec-co1", &co1()).id, Side::One, 130.0)
            .with_flow("cnec-co2".into(), Side::One, 100.0)
            .with_state_status(co2().id, ComputationStatus::Failure);
        let activation = perimeter.initial_activation();
        let network_actions = NetworkActionsResult::default();
        let evaluated = objective.evaluate(CostInput {
            flow: &flow,
            activation: &activation,
            network_actions: &network_actions,
        });
        assert!((evaluated.functional_cost() - 30.0).abs() < 1e-9);
        assert_eq!(evaluated.virtual_cost("sensitivity-failure-cost"), Some(10_000.0));
        assert!((evaluated.total_cost() - 10_030.0).abs() < 1e-9);
        assert_eq!(evaluated.most_limiting_elements(1)[0].as_str(), "cnec-co1");
        // cnecs of the failed state are left out
        assert_eq!(evaluated.most_limiting_elements(10).len(), 2);
    }

    #[test]
    fn test_excluding_contingencies_reevaluates() {
        let perimeter = perimeter();
        let parameters = RaoParameters::default();
        let flows = FlowResult::new();
        let sensitivity = SensitivityResult::new();
        let objective = UnevaluatedObjective::build(context(&perimeter, &parameters, &flows), &sensitivity).unwrap();

        let flow = FlowResult::new()
            .with_flow("cnec-n".into(), Side::One, 40.0)
            .with_flow("cnec-co1".into(), Side::One, 130.0)
            .with_flow("cnec-co2".into(), Side::One, 100.0);
        let activation = perimeter.initial_activation();
        let network_actions = NetworkActionsResult::default();
        let evaluated = objective
            .evaluate(CostInput {
                flow: &flow,
                activation: &activation,
                network_actions: &network_actions,
            })
            .exclude_contingencies(&BTreeSet::from([ContingencyId::new("co1")]));
        assert!(evaluated.functional_cost().abs() < 1e-9);
        assert_eq!(evaluated.most_limiting_elements(1)[0].as_str(), "cnec-co2");
        assert_eq!(evaluated.excluded_contingencies().len(), 1);
    }
}
