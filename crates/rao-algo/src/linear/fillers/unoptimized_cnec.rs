//! Binaries taking cnecs out of the worst-margin definition.
//!
//! `OptimizeCnec[c,s] = 0` removes the side from the min-margin constraints.
//! The binary may only be 0 when:
//! - its margin does not decrease below the pre-perimeter margin
//!   ([`UnoptimizedCnecRule::MarginDecrease`]), or
//! - the PST in series still has enough range to absorb the overload
//!   ([`UnoptimizedCnecRule::PstLimitation`]).

use std::collections::{BTreeMap, BTreeSet};

use rao_core::{CnecId, FlowCnec, RangeActionId, RaoError, RaoResult, Side, Unit};

use super::{acting_state, highest_threshold_mw, FillerContext, ProblemFiller};
use crate::linear::model::{Bound, ConstraintKey, LpModel, VarKey};
use crate::linear::LinearizationPoint;

/// Which cnecs may be left out of the worst margin, and when.
#[derive(Debug, Clone, PartialEq)]
pub enum UnoptimizedCnecRule {
    /// Cnecs of these operators count only when their margin decreases
    MarginDecrease(BTreeSet<String>),
    /// Cnecs secured by a PST count only once the PST range is exhausted
    PstLimitation(BTreeMap<CnecId, RangeActionId>),
}

pub struct UnoptimizedCnecFiller<'a> {
    context: FillerContext<'a>,
    rule: UnoptimizedCnecRule,
    highest_threshold: f64,
}

impl<'a> UnoptimizedCnecFiller<'a> {
    /// Fails when a PST-secured cnec refers to an unknown cnec or PST.
    pub fn new(context: FillerContext<'a>, rule: UnoptimizedCnecRule) -> RaoResult<Self> {
        if let UnoptimizedCnecRule::PstLimitation(pairs) = &rule {
            for (cnec, pst) in pairs {
                if context.perimeter.cnec(cnec.as_str()).is_none() {
                    return Err(RaoError::Validation(format!(
                        "cnec '{cnec}' secured by PST '{pst}' is not in the perimeter"
                    )));
                }
                if !context.perimeter.range_action(pst).is_some_and(|ra| ra.is_pst()) {
                    return Err(RaoError::Validation(format!(
                        "range action '{pst}' securing cnec '{cnec}' is not a PST of the perimeter"
                    )));
                }
            }
        }
        Ok(Self {
            highest_threshold: highest_threshold_mw(context.perimeter),
            context,
            rule,
        })
    }

    fn eligible_cnecs(&self, model: &LpModel) -> Vec<(&'a FlowCnec, Side)> {
        let perimeter = self.context.perimeter;
        let cnecs: Vec<&FlowCnec> = match &self.rule {
            UnoptimizedCnecRule::MarginDecrease(operators) => perimeter
                .optimized_cnecs()
                .filter(|cnec| cnec.operator.as_ref().is_some_and(|op| operators.contains(op)))
                .collect(),
            UnoptimizedCnecRule::PstLimitation(pairs) => perimeter
                .optimized_cnecs()
                .filter(|cnec| pairs.contains_key(&cnec.id))
                .collect(),
        };
        cnecs
            .into_iter()
            .flat_map(|cnec| cnec.sides().into_iter().map(move |side| (cnec, side)))
            .filter(|(cnec, side)| model.has_variable(&VarKey::Flow(cnec.id.clone(), *side)))
            .collect()
    }

    /// The margin may not fall below its pre-perimeter value unless the cnec is optimized.
    fn add_margin_decrease_constraints(&self, model: &mut LpModel, cnec: &FlowCnec, side: Side) -> RaoResult<()> {
        let pre_perimeter_flow = self.context.pre_perimeter_flow.flow(cnec, side, Unit::Megawatt);
        let pre_perimeter_margin = cnec.margin_for_flow(pre_perimeter_flow, side, Unit::Megawatt);
        if !pre_perimeter_margin.is_finite() {
            return Ok(());
        }
        let big_m = 20.0 * self.highest_threshold;
        let flow = VarKey::Flow(cnec.id.clone(), side);
        let binary = VarKey::OptimizeCnec(cnec.id.clone(), side);
        if let Some(upper) = cnec.upper_bound(side, Unit::Megawatt) {
            model
                .add_constraint(
                    ConstraintKey::MarginDecrease(cnec.id.clone(), side, Bound::Upper),
                    f64::NEG_INFINITY,
                    upper - pre_perimeter_margin,
                )?
                .set_coefficient(flow.clone(), 1.0)
                .set_coefficient(binary.clone(), -big_m);
        }
        if let Some(lower) = cnec.lower_bound(side, Unit::Megawatt) {
            model
                .add_constraint(
                    ConstraintKey::MarginDecrease(cnec.id.clone(), side, Bound::Lower),
                    lower + pre_perimeter_margin,
                    f64::INFINITY,
                )?
                .set_coefficient(flow, 1.0)
                .set_coefficient(binary, big_m);
        }
        Ok(())
    }

    /// The flow, once the PST is pushed to the end of its range, must be secure
    /// unless the cnec is optimized.
    fn add_pst_constraints(
        &self,
        model: &mut LpModel,
        point: &LinearizationPoint,
        cnec: &FlowCnec,
        side: Side,
        pst: &RangeActionId,
    ) -> RaoResult<()> {
        let perimeter = self.context.perimeter;
        let Some(range_action) = perimeter.range_action(pst) else {
            return Ok(());
        };
        let Some(state) = acting_state(perimeter, &cnec.state, pst) else {
            return Ok(());
        };
        let setpoint = VarKey::Setpoint(pst.clone(), state.id.clone());
        let bounds = *model.variable(&setpoint)?;
        let raw = point.sensitivity.sensitivity_mw(&cnec.id, side, pst);
        let threshold = self
            .context
            .parameters
            .range_actions
            .sensitivity_threshold(range_action.action_kind());
        let sensitivity = if raw.abs() >= threshold { raw } else { 0.0 };

        let big_m = 20.0 * self.highest_threshold;
        let flow = VarKey::Flow(cnec.id.clone(), side);
        let binary = VarKey::OptimizeCnec(cnec.id.clone(), side);
        if let Some(upper) = cnec.upper_bound(side, Unit::Megawatt) {
            let reachable = if sensitivity >= 0.0 { bounds.lb } else { bounds.ub };
            model
                .add_constraint(
                    ConstraintKey::PstSecured(cnec.id.clone(), side, Bound::Upper),
                    f64::NEG_INFINITY,
                    upper - reachable * sensitivity,
                )?
                .set_coefficient(flow.clone(), 1.0)
                .set_coefficient(setpoint.clone(), -sensitivity)
                .set_coefficient(binary.clone(), -big_m);
        }
        if let Some(lower) = cnec.lower_bound(side, Unit::Megawatt) {
            let reachable = if sensitivity >= 0.0 { bounds.ub } else { bounds.lb };
            model
                .add_constraint(
                    ConstraintKey::PstSecured(cnec.id.clone(), side, Bound::Lower),
                    lower - reachable * sensitivity,
                    f64::INFINITY,
                )?
                .set_coefficient(flow, 1.0)
                .set_coefficient(setpoint, -sensitivity)
                .set_coefficient(binary, big_m);
        }
        Ok(())
    }

    /// Relaxes the worst-margin constraints of a side when its binary is 0.
    fn relax_min_margin_constraints(&self, model: &mut LpModel, cnec: &FlowCnec, side: Side) -> RaoResult<()> {
        let big_m = 2.0 * self.highest_threshold;
        let binary = VarKey::OptimizeCnec(cnec.id.clone(), side);
        for bound in [Bound::Upper, Bound::Lower] {
            let keys = [
                ConstraintKey::MinMargin(cnec.id.clone(), side, bound),
                ConstraintKey::MinRelativeMargin(cnec.id.clone(), side, bound),
                ConstraintKey::MinMarginViolation(cnec.id.clone(), side, bound),
            ];
            for key in &keys {
                if !model.has_constraint(key) {
                    continue;
                }
                let constraint = model.constraint_mut(key)?;
                match bound {
                    Bound::Upper => {
                        let ub = constraint.ub + big_m;
                        let lb = constraint.lb;
                        constraint.add_coefficient(binary.clone(), big_m).set_bounds(lb, ub);
                    }
                    Bound::Lower => {
                        let lb = constraint.lb - big_m;
                        let ub = constraint.ub;
                        constraint.add_coefficient(binary.clone(), -big_m).set_bounds(lb, ub);
                    }
                }
            }
        }
        Ok(())
    }
}

impl ProblemFiller for UnoptimizedCnecFiller<'_> {
    fn name(&self) -> &'static str {
        "unoptimized-cnec"
    }

    fn fill(&mut self, model: &mut LpModel, point: &LinearizationPoint) -> RaoResult<()> {
        for (cnec, side) in self.eligible_cnecs(model) {
            model.add_binary_variable(VarKey::OptimizeCnec(cnec.id.clone(), side))?;
            match &self.rule {
                UnoptimizedCnecRule::MarginDecrease(_) => self.add_margin_decrease_constraints(model, cnec, side)?,
                UnoptimizedCnecRule::PstLimitation(pairs) => {
                    if let Some(pst) = pairs.get(&cnec.id) {
                        self.add_pst_constraints(model, point, cnec, side, pst)?;
                    }
                }
            }
            self.relax_min_margin_constraints(model, cnec, side)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RaoParameters;
    use crate::linear::fillers::test_support::{cnec, context, perimeter, point, pst};
    use crate::linear::fillers::{CoreFiller, MaxMinMarginFiller};
    use rao_core::FlowResult;

    fn filled(rule: UnoptimizedCnecRule, pre_perimeter_flow: f64) -> LpModel {
        let perimeter = perimeter();
        let parameters = RaoParameters::default();
        let flows = FlowResult::new().with_flow(cnec().id, Side::One, pre_perimeter_flow);
        let context = context(&perimeter, &parameters, &flows);
        let point = point(&perimeter, 120.0, -5.0);
        let mut model = LpModel::new();
        CoreFiller::new(context, false, false).fill(&mut model, &point).unwrap();
        MaxMinMarginFiller::new(context).fill(&mut model, &point).unwrap();
        UnoptimizedCnecFiller::new(context, rule)
            .unwrap()
            .fill(&mut model, &point)
            .unwrap();
        model
    }

    #[test]
    fn test_margin_decrease_rule() {
        let model = filled(UnoptimizedCnecRule::MarginDecrease(BTreeSet::from(["FR".to_string()])), 70.0);
        let binary = VarKey::OptimizeCnec(cnec().id, Side::One);

        // pre-perimeter margin 30: F − 2000·b ≤ 100 − 30
        let decrease = model
            .constraint(&ConstraintKey::MarginDecrease(cnec().id, Side::One, Bound::Upper))
            .unwrap();
        assert_eq!(decrease.ub, 70.0);
        assert_eq!(decrease.coefficient(&binary), -2000.0);

        let min_margin = model
            .constraint(&ConstraintKey::MinMargin(cnec().id, Side::One, Bound::Upper))
            .unwrap();
        assert_eq!(min_margin.ub, 300.0);
        assert_eq!(min_margin.coefficient(&binary), 200.0);
        let min_margin = model
            .constraint(&ConstraintKey::MinMargin(cnec().id, Side::One, Bound::Lower))
            .unwrap();
        assert_eq!(min_margin.lb, -300.0);
        assert_eq!(min_margin.coefficient(&binary), -200.0);
    }

    #[test]
    fn test_relaxation_only_touches_existing_constraints() {
        let model = filled(UnoptimizedCnecRule::MarginDecrease(BTreeSet::from(["FR".to_string()])), 70.0);
        let binary = VarKey::OptimizeCnec(cnec().id, Side::One);
        for bound in [Bound::Upper, Bound::Lower] {
            assert!(!model.has_constraint(&ConstraintKey::MinRelativeMargin(cnec().id, Side::One, bound)));
            assert!(!model.has_constraint(&ConstraintKey::MinMarginViolation(cnec().id, Side::One, bound)));
            let min_margin = model
                .constraint(&ConstraintKey::MinMargin(cnec().id, Side::One, bound))
                .unwrap();
            assert_ne!(min_margin.coefficient(&binary), 0.0);
        }
    }

    #[test]
    fn test_other_operators_untouched() {
        let model = filled(UnoptimizedCnecRule::MarginDecrease(BTreeSet::from(["BE".to_string()])), 70.0);
        assert!(!model.has_variable(&VarKey::OptimizeCnec(cnec().id, Side::One)));
    }

    #[test]
    fn test_pst_limitation_rule() {
        let pairs = BTreeMap::from([(cnec().id, pst().id)]);
        let model = filled(UnoptimizedCnecRule::PstLimitation(pairs), 70.0);
        let upper = model
            .constraint(&ConstraintKey::PstSecured(cnec().id, Side::One, Bound::Upper))
            .unwrap();
        // sensitivity −5 < 0: the PST relieves the upper bound at its maximum set-point
        let max_setpoint = 6.4 + crate::linear::fillers::SETPOINT_BOUND_TOLERANCE;
        assert!((upper.ub - (100.0 + max_setpoint * 5.0)).abs() < 1e-9);
        assert_eq!(upper.coefficient(&VarKey::Setpoint(pst().id, crate::linear::fillers::test_support::preventive().id)), 5.0);
    }

    #[test]
    fn test_unknown_pst_rejected() {
        let perimeter = perimeter();
        let parameters = RaoParameters::default();
        let flows = FlowResult::new();
        let pairs = BTreeMap::from([(cnec().id, RangeActionId::new("missing"))]);
        let err = UnoptimizedCnecFiller::new(context(&perimeter, &parameters, &flows), UnoptimizedCnecRule::PstLimitation(pairs))
            .err()
            .unwrap();
        assert!(err.to_string().contains("missing"));
    }
}
