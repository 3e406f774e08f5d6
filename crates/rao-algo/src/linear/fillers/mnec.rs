//! Soft limits on monitored elements (MNECs).
//!
//! A monitored element may not lose more than the acceptable decrease with
//! respect to its initial flow, or go beyond its threshold if that is
//! looser. Any excess is carried by a penalized violation variable.

use rao_core::{RaoResult, Unit};

use super::{megawatt_per_unit, FillerContext, ProblemFiller};
use crate::config::MnecParameters;
use crate::linear::model::{Bound, ConstraintKey, LpModel, VarKey};
use crate::linear::LinearizationPoint;

pub struct MnecFiller<'a> {
    context: FillerContext<'a>,
    parameters: MnecParameters,
}

impl<'a> MnecFiller<'a> {
    pub fn new(context: FillerContext<'a>, parameters: MnecParameters) -> Self {
        Self { context, parameters }
    }
}

impl ProblemFiller for MnecFiller<'_> {
    fn name(&self) -> &'static str {
        "mnec"
    }

    fn fill(&mut self, model: &mut LpModel, _point: &LinearizationPoint) -> RaoResult<()> {
        let unit = self.context.parameters.objective.unit;
        let adjustment = self.parameters.constraint_adjustment_coefficient;
        for cnec in self.context.perimeter.monitored_cnecs() {
            let sides = cnec.sides();
            let cost_per_side = self.parameters.violation_cost / sides.len().max(1) as f64;
            for side in sides {
                let flow = VarKey::Flow(cnec.id.clone(), side);
                let initial = self.context.initial_flow.flow(cnec, side, Unit::Megawatt);
                if initial.is_nan() || !model.has_variable(&flow) {
                    continue;
                }
                let conv = megawatt_per_unit(cnec, unit);
                let decrease = self.parameters.acceptable_margin_decrease * conv;
                let violation = VarKey::MnecViolation(cnec.id.clone(), side);
                model.add_variable(violation.clone(), 0.0, f64::INFINITY)?;

                if let Some(upper) = cnec.upper_bound(side, Unit::Megawatt) {
                    let limit = upper.max(initial + decrease) - adjustment;
                    model
                        .add_constraint(
                            ConstraintKey::MnecFlow(cnec.id.clone(), side, Bound::Upper),
                            f64::NEG_INFINITY,
                            limit,
                        )?
                        .set_coefficient(flow.clone(), 1.0)
                        .set_coefficient(violation.clone(), -conv);
                }
                if let Some(lower) = cnec.lower_bound(side, Unit::Megawatt) {
                    let limit = lower.min(initial - decrease) + adjustment;
                    model
                        .add_constraint(
                            ConstraintKey::MnecFlow(cnec.id.clone(), side, Bound::Lower),
                            limit,
                            f64::INFINITY,
                        )?
                        .set_coefficient(flow, 1.0)
                        .set_coefficient(violation.clone(), conv);
                }
                model.add_objective_coefficient(violation, cost_per_side);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RaoParameters;
    use crate::linear::fillers::test_support::{context, preventive, pst};
    use crate::linear::fillers::CoreFiller;
    use rao_core::{FlowCnec, FlowResult, Perimeter, SensitivityResult, Side};

    fn mnec() -> FlowCnec {
        FlowCnec::new("mnec", preventive().id)
            .with_threshold(Side::One, Unit::Megawatt, Some(-100.0), Some(100.0))
            .monitored()
    }

    fn filled(initial_flow: f64) -> LpModel {
        let state = preventive();
        let perimeter = Perimeter::new(vec![state.clone()])
            .with_cnec(mnec())
            .with_range_action(&state.id, pst());
        let parameters = RaoParameters::default();
        let initial = FlowResult::new().with_flow(mnec().id, Side::One, initial_flow);
        let point = LinearizationPoint {
            flow: initial.clone(),
            sensitivity: SensitivityResult::new(),
            activation: perimeter.initial_activation(),
        };
        let context = context(&perimeter, &parameters, &initial);
        let mut model = LpModel::new();
        CoreFiller::new(context, false, false).fill(&mut model, &point).unwrap();
        MnecFiller::new(
            context,
            MnecParameters {
                acceptable_margin_decrease: 50.0,
                violation_cost: 10.0,
                constraint_adjustment_coefficient: 1.0,
            },
        )
        .fill(&mut model, &point)
        .unwrap();
        model
    }

    #[test]
    fn test_threshold_kept_when_initial_margin_is_large() {
        let model = filled(20.0);
        let upper = model
            .constraint(&ConstraintKey::MnecFlow(mnec().id, Side::One, Bound::Upper))
            .unwrap();
        assert_eq!(upper.ub, 99.0);
        let lower = model
            .constraint(&ConstraintKey::MnecFlow(mnec().id, Side::One, Bound::Lower))
            .unwrap();
        assert_eq!(lower.lb, -99.0);
        assert_eq!(
            model.objective_coefficient(&VarKey::MnecViolation(mnec().id, Side::One)),
            10.0
        );
    }

    #[test]
    fn test_limit_follows_initial_flow_when_already_overloaded() {
        let model = filled(130.0);
        let upper = model
            .constraint(&ConstraintKey::MnecFlow(mnec().id, Side::One, Bound::Upper))
            .unwrap();
        // 130 + 50 − 1
        assert_eq!(upper.ub, 179.0);
        assert_eq!(upper.coefficient(&VarKey::MnecViolation(mnec().id, Side::One)), -1.0);
    }
}
