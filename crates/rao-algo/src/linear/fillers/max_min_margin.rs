//! Objective fillers built on the worst margin of optimized cnecs.
//!
//! Margins are expressed in the objective unit; flows stay in MW, hence the
//! `conv` (MW per objective unit) factor on the margin variables.

use rao_core::{FlowCnec, RaoResult, Side, Unit};

use super::{megawatt_per_unit, FillerContext, ProblemFiller};
use crate::linear::model::{Bound, ConstraintKey, LpModel, VarKey};
use crate::linear::LinearizationPoint;

/// Cost per unit of negative margin in cost-optimization mode.
pub const MARGIN_PENALTY_COEFFICIENT: f64 = 1000.0;

/// Optimized cnec sides present in the model, with their MW bounds.
fn optimized_sides<'p>(
    context: &FillerContext<'p>,
    model: &LpModel,
) -> Vec<(&'p FlowCnec, Side, Option<f64>, Option<f64>)> {
    context
        .perimeter
        .optimized_cnecs()
        .flat_map(|cnec| cnec.sides().into_iter().map(move |side| (cnec, side)))
        .filter(|(cnec, side)| model.has_variable(&VarKey::Flow(cnec.id.clone(), *side)))
        .map(|(cnec, side)| {
            (
                cnec,
                side,
                cnec.upper_bound(side, Unit::Megawatt),
                cnec.lower_bound(side, Unit::Megawatt),
            )
        })
        .collect()
}

fn highest_threshold(context: &FillerContext<'_>, unit: Unit) -> f64 {
    context
        .perimeter
        .optimized_cnecs()
        .map(|cnec| cnec.largest_threshold(unit))
        .fold(0.0, f64::max)
}

/// Adds `F ± conv·margin` constraints for every optimized side.
///
/// `sign` is +1 when the variable is a margin (maximized) and −1 when it is
/// a violation (minimized).
fn add_margin_constraints(
    context: &FillerContext<'_>,
    model: &mut LpModel,
    variable: &VarKey,
    sign: f64,
    key: fn(rao_core::CnecId, Side, Bound) -> ConstraintKey,
) -> RaoResult<()> {
    let unit = context.parameters.objective.unit;
    for (cnec, side, upper, lower) in optimized_sides(context, model) {
        let flow = VarKey::Flow(cnec.id.clone(), side);
        let conv = megawatt_per_unit(cnec, unit);
        if let Some(upper) = upper {
            model
                .add_constraint(key(cnec.id.clone(), side, Bound::Upper), f64::NEG_INFINITY, upper)?
                .set_coefficient(flow.clone(), 1.0)
                .set_coefficient(variable.clone(), sign * conv);
        }
        if let Some(lower) = lower {
            model
                .add_constraint(key(cnec.id.clone(), side, Bound::Lower), lower, f64::INFINITY)?
                .set_coefficient(flow, 1.0)
                .set_coefficient(variable.clone(), -sign * conv);
        }
    }
    Ok(())
}

/// Maximizes the smallest absolute margin.
pub struct MaxMinMarginFiller<'a> {
    context: FillerContext<'a>,
}

impl<'a> MaxMinMarginFiller<'a> {
    pub fn new(context: FillerContext<'a>) -> Self {
        Self { context }
    }
}

impl ProblemFiller for MaxMinMarginFiller<'_> {
    fn name(&self) -> &'static str {
        "max-min-margin"
    }

    fn fill(&mut self, model: &mut LpModel, _point: &LinearizationPoint) -> RaoResult<()> {
        // nothing to maximize: pin the margin instead of leaving it unbounded
        let upper = if optimized_sides(&self.context, model).is_empty() {
            0.0
        } else {
            f64::INFINITY
        };
        model.add_variable(VarKey::MinMargin, f64::NEG_INFINITY, upper)?;
        add_margin_constraints(&self.context, model, &VarKey::MinMargin, 1.0, ConstraintKey::MinMargin)?;
        model.set_objective_coefficient(VarKey::MinMargin, -1.0);
        Ok(())
    }
}

/// Maximizes the smallest margin, positive margins divided by their PTDF sum.
///
/// A sign binary `b` selects the regime: with `b = 0` the worst margin is
/// negative and carried by `MM`; with `b = 1` it is positive and carried by
/// the relative variable `MRM`.
pub struct MaxMinRelativeMarginFiller<'a> {
    context: FillerContext<'a>,
}

impl<'a> MaxMinRelativeMarginFiller<'a> {
    pub fn new(context: FillerContext<'a>) -> Self {
        Self { context }
    }
}

impl ProblemFiller for MaxMinRelativeMarginFiller<'_> {
    fn name(&self) -> &'static str {
        "max-min-relative-margin"
    }

    fn fill(&mut self, model: &mut LpModel, point: &LinearizationPoint) -> RaoResult<()> {
        let unit = self.context.parameters.objective.unit;
        let ptdf_lower_bound = self.context.parameters.relative_margins.ptdf_sum_lower_bound;
        let highest = highest_threshold(&self.context, unit);
        let max_negative = 10.0 * highest;
        let max_positive = max_negative / ptdf_lower_bound;

        model.add_variable(VarKey::MinMargin, -max_negative, 0.0)?;
        model.add_variable(VarKey::MinRelativeMargin, 0.0, max_positive)?;
        model.add_binary_variable(VarKey::MinRelativeMarginSign)?;

        model
            .add_constraint(ConstraintKey::MinMarginSign, -max_negative, f64::INFINITY)?
            .set_coefficient(VarKey::MinMargin, 1.0)
            .set_coefficient(VarKey::MinRelativeMarginSign, -max_negative);
        model
            .add_constraint(ConstraintKey::RelativeMarginSign, f64::NEG_INFINITY, 0.0)?
            .set_coefficient(VarKey::MinRelativeMargin, 1.0)
            .set_coefficient(VarKey::MinRelativeMarginSign, -max_positive);

        add_margin_constraints(&self.context, model, &VarKey::MinMargin, 1.0, ConstraintKey::MinMargin)?;

        for (cnec, side, upper, lower) in optimized_sides(&self.context, model) {
            let flow = VarKey::Flow(cnec.id.clone(), side);
            let conv = megawatt_per_unit(cnec, unit);
            let ptdf = point.flow.ptdf_zonal_sum(&cnec.id, side).max(ptdf_lower_bound);
            // with b = 0, MM >= -max_negative already bounds the flow this far
            let big_m = max_negative * conv;
            if let Some(upper) = upper {
                model
                    .add_constraint(
                        ConstraintKey::MinRelativeMargin(cnec.id.clone(), side, Bound::Upper),
                        f64::NEG_INFINITY,
                        upper + big_m,
                    )?
                    .set_coefficient(flow.clone(), 1.0)
                    .set_coefficient(VarKey::MinRelativeMargin, ptdf * conv)
                    .set_coefficient(VarKey::MinRelativeMarginSign, big_m);
            }
            if let Some(lower) = lower {
                model
                    .add_constraint(
                        ConstraintKey::MinRelativeMargin(cnec.id.clone(), side, Bound::Lower),
                        lower - big_m,
                        f64::INFINITY,
                    )?
                    .set_coefficient(flow, 1.0)
                    .set_coefficient(VarKey::MinRelativeMargin, -ptdf * conv)
                    .set_coefficient(VarKey::MinRelativeMarginSign, -big_m);
            }
        }

        model.set_objective_coefficient(VarKey::MinMargin, -1.0);
        model.set_objective_coefficient(VarKey::MinRelativeMargin, -1.0);
        Ok(())
    }
}

/// Penalizes the worst negative margin (cost optimization).
pub struct MinMarginViolationFiller<'a> {
    context: FillerContext<'a>,
}

impl<'a> MinMarginViolationFiller<'a> {
    pub fn new(context: FillerContext<'a>) -> Self {
        Self { context }
    }
}

impl ProblemFiller for MinMarginViolationFiller<'_> {
    fn name(&self) -> &'static str {
        "min-margin-violation"
    }

    fn fill(&mut self, model: &mut LpModel, _point: &LinearizationPoint) -> RaoResult<()> {
        model.add_variable(VarKey::MinMarginViolation, 0.0, f64::INFINITY)?;
        add_margin_constraints(
            &self.context,
            model,
            &VarKey::MinMarginViolation,
            -1.0,
            ConstraintKey::MinMarginViolation,
        )?;
        model.set_objective_coefficient(VarKey::MinMarginViolation, MARGIN_PENALTY_COEFFICIENT);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ObjectiveKind, RaoParameters};
    use crate::linear::fillers::test_support::{cnec, context, perimeter, point};
    use crate::linear::fillers::CoreFiller;
    use crate::linear::solver::solve;
    use rao_core::FlowResult;

    fn filled(parameters: &RaoParameters, objective: &mut dyn ProblemFiller) -> LpModel {
        let perimeter = perimeter();
        let flows = FlowResult::new();
        let point = point(&perimeter, 120.0, -5.0);
        let mut model = LpModel::new();
        CoreFiller::new(context(&perimeter, parameters, &flows), false, false)
            .fill(&mut model, &point)
            .unwrap();
        objective.fill(&mut model, &point).unwrap();
        model
    }

    #[test]
    fn test_max_min_margin_constraints() {
        let perimeter = perimeter();
        let parameters = RaoParameters::default();
        let flows = FlowResult::new();
        let mut filler = MaxMinMarginFiller::new(context(&perimeter, &parameters, &flows));
        let model = filled(&parameters, &mut filler);

        let upper = model
            .constraint(&ConstraintKey::MinMargin(cnec().id, Side::One, Bound::Upper))
            .unwrap();
        assert_eq!(upper.ub, 100.0);
        assert_eq!(upper.coefficient(&VarKey::MinMargin), 1.0);
        let lower = model
            .constraint(&ConstraintKey::MinMargin(cnec().id, Side::One, Bound::Lower))
            .unwrap();
        assert_eq!(lower.lb, -100.0);
        assert_eq!(lower.coefficient(&VarKey::MinMargin), -1.0);
        assert_eq!(model.objective_coefficient(&VarKey::MinMargin), -1.0);
    }

    #[test]
    fn test_max_min_margin_solution_relieves_overload() {
        let perimeter = perimeter();
        let parameters = RaoParameters::default();
        let flows = FlowResult::new();
        let mut filler = MaxMinMarginFiller::new(context(&perimeter, &parameters, &flows));
        let model = filled(&parameters, &mut filler);

        // F = 120 − 5·S, S ≤ 6.4: the best margin is reached at F = 88
        let solution = solve(&model, &parameters.solver).unwrap();
        let margin = solution.value(&VarKey::MinMargin).unwrap();
        assert!((margin - 12.0).abs() < 1e-3, "margin {margin}");
    }

    #[test]
    fn test_relative_margin_uses_sign_binary() {
        let perimeter = perimeter();
        let mut parameters = RaoParameters::default();
        parameters.objective.kind = ObjectiveKind::MaxMinRelativeMargin;
        let flows = FlowResult::new();
        let mut filler = MaxMinRelativeMarginFiller::new(context(&perimeter, &parameters, &flows));
        let model = filled(&parameters, &mut filler);

        assert!(model.has_integer_variables());
        let relative = model
            .constraint(&ConstraintKey::MinRelativeMargin(cnec().id, Side::One, Bound::Upper))
            .unwrap();
        // no PTDF sum reported: 1.0
        assert_eq!(relative.coefficient(&VarKey::MinRelativeMargin), 1.0);
        assert_eq!(relative.coefficient(&VarKey::MinRelativeMarginSign), 1000.0);
        assert_eq!(relative.ub, 1100.0);
    }

    #[test]
    fn test_violation_penalized_in_cost_mode() {
        let perimeter = perimeter();
        let mut parameters = RaoParameters::default();
        parameters.objective.kind = ObjectiveKind::MinCost;
        let flows = FlowResult::new();
        let mut filler = MinMarginViolationFiller::new(context(&perimeter, &parameters, &flows));
        let model = filled(&parameters, &mut filler);

        let upper = model
            .constraint(&ConstraintKey::MinMarginViolation(cnec().id, Side::One, Bound::Upper))
            .unwrap();
        assert_eq!(upper.coefficient(&VarKey::MinMarginViolation), -1.0);
        assert_eq!(
            model.objective_coefficient(&VarKey::MinMarginViolation),
            MARGIN_PENALTY_COEFFICIENT
        );
        let solution = solve(&model, &parameters.solver).unwrap();
        assert!(solution.value(&VarKey::MinMarginViolation).unwrap().abs() < 1e-6);
    }
}
